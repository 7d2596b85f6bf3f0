//! gitops-launch: resumable, checkpointed bootstrap of a GitOps-managed
//! Kubernetes cluster.

pub mod adapters;
pub mod bootstrap;
pub mod commands;
pub mod config;
pub mod error;
pub mod orchestrator;

pub use error::{Error, Result};
