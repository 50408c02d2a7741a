//! Asynchronous enrichment pipeline.
//!
//! Workers claim jobs from the queue, pick an execution plan for the job's
//! backend, and hand the job to the [`Orchestrator`], which runs the stages
//! locally or through the [`RemoteDelegate`] and persists the result.

mod execution;
mod orchestrator;
mod remote;
mod sink;
mod workers;


pub use orchestrator::Orchestrator;
pub use remote::RemoteDelegate;
