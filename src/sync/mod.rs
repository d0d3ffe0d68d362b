//! Locking primitives shared by the store, the event layer and contexts.

mod monitor;
mod monitor_table;

pub use monitor::{LockMode, Monitor, MonitorReadGuard, MonitorSet, MonitorWriteGuard};
pub use monitor_table::{AddrGuard, AddrLockSet, MonitorTable};
