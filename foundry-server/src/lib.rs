//! foundry-server: the task broker.
//!
//! Owns the per-role subtask queues and the status ledger, and is the only
//! process that writes to the project repository. Coordinator, workers and
//! supervisor reconcile against it over HTTP.

pub mod broker;
pub mod config;
pub mod db;
pub mod repo;
pub mod server;
pub mod web;
