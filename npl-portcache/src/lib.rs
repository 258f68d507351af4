pub mod driver;
pub mod entry;
pub mod opener;
pub mod reservation;
pub mod restore;
pub mod slot;
pub mod table;

pub use driver::{InMemoryRuleDriver, PodNodePort, RuleDriver};
pub use entry::{NodePortEntry, NodePortEntrySnapshot};
pub use opener::{PortOpener, PortReservation, StdPortOpener};
pub use reservation::{PosixReservation, ReservationStrategy, WindowsReservation};
pub use slot::{ProtocolSlot, SlotState};
pub use table::PortTable;
