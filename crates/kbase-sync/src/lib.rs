//! Failover between Primary and Fallback stores, and on-demand atomic
//! replication from one to the other.
pub mod manager;
pub mod monitor;
pub mod state;

pub use manager::SyncManager;
pub use monitor::FailoverMonitor;
pub use state::SyncStateHandle;
