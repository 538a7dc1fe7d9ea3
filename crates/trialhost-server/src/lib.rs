//! HTTP server for trialhost.
//!
//! This crate exposes the provisioning orchestrator over HTTP:
//!
//! - Subdomain availability checks
//! - Provisioning jobs that run in the background, with per-stage progress
//! - Deprovisioning of finished trials
//! - Health and readiness checks
//!
//! # Quick Start
//!
//! ```ignore
//! use trialhost_server::{AppState, ServerConfig, TrialServer};
//! use trialhost_core::Provisioner;
//!
//! let provisioner = Provisioner::new(config.provisioner, backends);
//! let state = AppState::new(provisioner, Some("api-token".into()));
//!
//! TrialServer::new(state, ServerConfig::default()).run().await?;
//! ```

pub mod auth;
pub mod handler;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use server::{ServerConfig, ServerError, TestHandle, TrialServer};
pub use state::{AppState, Job, JobStatus};
