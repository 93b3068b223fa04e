//! Process-bridging and request/response messaging between a host process
//! and the worker processes it spawns.
//!
//! This crate provides:
//! - Duplex message channels with paired endpoints
//! - The wire protocol spoken across the process boundary
//! - Host-side worker supervision with pre-ready buffering
//! - Uniform dispatch over sync and async handlers
//! - Token-based request/response correlation

pub mod channel;
pub mod config;
pub mod correlate;
pub mod dispatch;
pub mod error;
pub mod module;
pub mod protocol;
pub mod queue;
pub mod supervisor;

pub use channel::{pair, Endpoint};
pub use config::{SpawnOptions, SupervisorConfig};
pub use correlate::CorrelationBus;
pub use dispatch::{dispatch, Handler, HandlerKind, HandlerResult};
pub use error::{Error, Result};
pub use module::{Module, PortHook, ENTRY_SYMBOL};
pub use protocol::{Frame, Message};
pub use queue::{OverflowPolicy, SendQueue};
pub use supervisor::{Supervisor, WorkerHandle};
