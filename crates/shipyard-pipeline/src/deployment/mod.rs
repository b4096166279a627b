//! Deployment orchestration.
//!
//! The [`Orchestrator`] admits deployments against the organization quota,
//! runs each one through the stage pipeline on its own task, and is the only
//! writer of the run's record.

mod orchestrator;
mod record;

pub use orchestrator::{Collaborators, Orchestrator, PipelineOptions};
