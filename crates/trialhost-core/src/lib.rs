//! Provisioning orchestrator for trialhost.
//!
//! This crate sequences the external systems a trial environment needs:
//! - [`IdentifierPool`] / [`PoolAllocator`]: Instance identifiers from a bounded pool
//! - [`EdgeNetwork`]: Tunnel, ingress and DNS on the edge network
//! - [`MetadataStore`]: Per-instance configuration documents
//! - [`Hypervisor`]: Clone, start, stop and destroy instances
//! - [`ReadinessProber`]: Bounded wait for the public URL
//! - [`Provisioner`]: The workflow itself, with rollback on failure
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Provisioner                        │
//! │  - Stage machine (Validating … Succeeded)               │
//! │  - CompensationStack, unwound on failure                │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Backends                          │
//! │  IdentifierPool  EdgeNetwork  MetadataStore             │
//! │  Hypervisor      Probe                                  │
//! │  (HTTP clients in production, SimulatedCloud in tests)  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod compensation;
pub mod edge;
pub mod lifecycle;
pub mod metadata;
pub mod orchestrator;
pub mod readiness;
pub mod retry;
pub mod sim;

pub use allocator::{IdentifierPool, PoolAllocator};
pub use compensation::{Compensation, CompensationStack};
pub use edge::EdgeNetwork;
pub use lifecycle::Hypervisor;
pub use metadata::MetadataStore;
pub use orchestrator::{Backends, ProgressFn, Provisioner};
pub use readiness::{Probe, ReadinessProber, ReadinessReport};
pub use retry::RetryPolicy;
pub use sim::{Operation, SimulatedCloud};
