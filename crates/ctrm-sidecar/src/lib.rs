//! Sidecar control server (spec §4.7): host process that owns the VM and
//! brokers vsock dialing and process streams for the container helper.

pub mod fd;
mod gate;
pub mod handler;
pub mod server;
pub mod session;
pub mod vm;

pub mod error;

pub use error::{Error, Result};
pub use vm::{LoopbackHost, VirtualizationHost};
