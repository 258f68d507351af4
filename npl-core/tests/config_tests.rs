use npl_core::{AgentConfig, LogLevel, PortRangeConfig};

#[test]
fn round_trips_through_toml() {
    let config = AgentConfig {
        port_range: PortRangeConfig::new(61000, 62000).unwrap(),
        log_level: LogLevel::Debug,
        log_file: None,
    };

    let path = std::env::temp_dir().join(format!("npl-agent-test-{}.toml", std::process::id()));
    let path_str = path.to_str().unwrap();

    config.save_to_file(path_str).unwrap();
    let loaded = AgentConfig::load_from_file(path_str).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.port_range, config.port_range);
    assert_eq!(loaded.log_level, config.log_level);
}

#[test]
fn round_trips_through_json() {
    let config = AgentConfig {
        port_range: PortRangeConfig::new(40000, 40100).unwrap(),
        log_level: LogLevel::Warn,
        log_file: Some(std::path::PathBuf::from("/var/log/npl-agent.log")),
    };

    let path = std::env::temp_dir().join(format!("npl-agent-test-{}.json", std::process::id()));
    let path_str = path.to_str().unwrap();

    config.save_to_file(path_str).unwrap();
    let loaded = AgentConfig::load_from_file(path_str).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.port_range, config.port_range);
    assert_eq!(loaded.log_file, config.log_file);
}

#[test]
fn rejects_an_unsupported_extension() {
    assert!(AgentConfig::load_from_file("/tmp/agent.yaml").is_err());
}
