use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use npl_core::{NplError, PortRangeConfig, Protocol};
use npl_portcache::driver::InMemoryRuleDriver;
use npl_portcache::opener::StdPortOpener;
use npl_portcache::reservation::PosixReservation;
use npl_portcache::table::PortTable;

fn ip(n: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
}

// A range unlikely to be bound by anything else on the test host; these
// tests reserve real OS sockets through `StdPortOpener`, unlike the
// in-crate unit tests which use a fake opener.
fn table(start: u16, end: u16) -> PortTable {
    PortTable::new(
        PortRangeConfig::new(start, end).unwrap(),
        Arc::new(InMemoryRuleDriver::new()),
        Arc::new(StdPortOpener::new()),
        Arc::new(PosixReservation),
    )
}

// Invariant 3: every node port in use lies in [StartPort, EndPort].
#[tokio::test]
async fn every_allocated_port_lies_within_the_configured_range() {
    let t = table(61100, 61103);
    for i in 0..4u8 {
        let port = t.add_rule(ip(i), 1000 + i as u16, Protocol::Tcp).await.unwrap();
        assert!((61100..=61103).contains(&port));
    }
    assert!(matches!(
        t.add_rule(ip(99), 1, Protocol::Tcp).await.unwrap_err(),
        NplError::NoFreePort { .. }
    ));
}

// Invariant 5 / round-trip law: the cursor lands on (last-successful-port + 1)
// mod the range, so a reclaimed port is reused last, not first.
#[tokio::test]
async fn cursor_advances_past_a_reclaimed_port_before_reusing_it() {
    let t = table(61110, 61112);
    let first = t.add_rule(ip(1), 1, Protocol::Tcp).await.unwrap();
    assert_eq!(first, 61110);
    t.delete_rule(ip(1), 1, Protocol::Tcp).await.unwrap();

    let second = t.add_rule(ip(2), 2, Protocol::Tcp).await.unwrap();
    assert_eq!(second, 61111, "cursor must not immediately reuse the port it just reclaimed");

    let third = t.add_rule(ip(3), 3, Protocol::Tcp).await.unwrap();
    assert_eq!(third, 61112);

    // Range exhausted except for the reclaimed 61110, which wraps back around.
    let fourth = t.add_rule(ip(4), 4, Protocol::Tcp).await.unwrap();
    assert_eq!(fourth, 61110);
}

// Invariant 6: idempotent delete on a non-existent endpoint never reaches the driver.
#[tokio::test]
async fn delete_on_unknown_endpoint_does_not_touch_the_driver() {
    let driver = Arc::new(InMemoryRuleDriver::new());
    let t = PortTable::new(
        PortRangeConfig::new(61120, 61125).unwrap(),
        driver.clone(),
        Arc::new(StdPortOpener::new()),
        Arc::new(PosixReservation),
    );
    t.delete_rule(ip(1), 1, Protocol::Tcp).await.unwrap();
    assert!(driver.snapshot().await.is_empty());
}

// Invariant 1/2: both indices agree, and an entry with no InUse slot never lingers.
#[tokio::test]
async fn entry_disappears_once_its_last_in_use_slot_clears() {
    let t = table(61130, 61135);
    t.add_rule(ip(1), 1, Protocol::Tcp).await.unwrap();
    t.add_rule(ip(1), 1, Protocol::Udp).await.unwrap();
    assert!(t.get_entry(ip(1), 1).await.is_some());

    t.delete_rule(ip(1), 1, Protocol::Tcp).await.unwrap();
    assert!(t.get_entry(ip(1), 1).await.is_some(), "UDP slot is still InUse");

    t.delete_rule(ip(1), 1, Protocol::Udp).await.unwrap();
    assert!(t.get_entry(ip(1), 1).await.is_none());
    assert!(!t.rule_exists(ip(1), 1, Protocol::Tcp).await);
}
