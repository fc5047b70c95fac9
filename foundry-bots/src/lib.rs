//! foundry-bots: the clients of the foundry broker.
//!
//! - [`coordinator`]: turns a project structure into subtasks and drives them
//!   to completion under a concurrency budget
//! - [`worker`]: pulls subtasks for one role, generates content, reports back
//! - [`supervisor`]: plans the structure and watches the pipeline
//!
//! Text generation sits behind [`llm::Generator`]; [`config`] wires backends
//! into per-role fallback chains.

pub mod config;
pub mod coordinator;
pub mod llm;
pub mod supervisor;
pub mod ticker;
pub mod worker;

#[cfg(test)]
mod testing;
