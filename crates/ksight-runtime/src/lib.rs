//! Multi-cluster informer runtime: Cluster Connection (C5), Watch Worker
//! (C4) and the Informer Manager (C6) façade.

mod cluster;
mod error;
mod manager;
mod watch_worker;

pub use cluster::ClusterStatus;
pub use error::ClusterError;
pub use manager::{ClusterSummary, Manager, ManagerConfig};
pub use watch_worker::EventHandler;

pub use ksight_core::{ClusterId, Event, EventType, Gvr, SensitivityPolicy, Value};
