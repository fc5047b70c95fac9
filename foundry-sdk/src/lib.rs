//! foundry-sdk: protocol types and broker client shared by every foundry process.
//!
//! The broker (`foundry-server`) is the single source of truth. The coordinator,
//! role-workers and supervisor (`foundry-bots`) only ever talk to it through
//! the JSON-over-HTTP protocol defined here.

pub mod client;
pub mod event;
pub mod id;
pub mod paths;
pub mod protocol;
pub mod structure;

pub use client::{BrokerApi, BrokerClient, ClientError};
pub use protocol::{Metrics, Report, Role, Subtask, TaskState};
pub use structure::{Node, ProjectStructure};
