//! Core RDMA stream engine for a point-to-point file transfer service.
//!
//! This crate implements the hard part of the system: the pinned-buffer
//! pool, the send/receive work-request pipeline, the RDMA
//! connection-bring-up state machine, the flow-control handshake between
//! sender and receiver, and the per-connection lifecycle. The desktop UI,
//! file browsing, and local settings beyond the storage directory are
//! external collaborators, not part of this crate.

pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod pool;
pub mod progress;
pub mod server;
pub mod wire;

pub use config::Config;
pub use connection::{Role, StreamControl};
pub use device::{DeviceContext, PoolBudget};
pub use error::{Result, RftpError};
pub use progress::{channel as progress_channel, CancelToken, Progress, ProgressHandle};
