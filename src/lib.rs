//! productflow: coordination service for multi-stage data pipelines.
//!
//! Products are named, stateful artifacts linked by role-labelled
//! dependencies. Workers ask the coordinator for the next product whose
//! dependencies are satisfied, heartbeat while they work on it, and report
//! the outcome; products whose worker goes silent are reaped.

// Core infrastructure modules
pub mod core;
pub mod config;
pub mod model;
pub mod telemetry;

// Coordination engine
pub mod store;     // Durable products and edges
pub mod resolver;  // Which products may run
pub mod scheduler; // Atomic claiming
pub mod liveness;  // Heartbeats and reaping
pub mod notify;    // Wakeup hints

// Service surface
pub mod api;
pub mod coordinator;
pub mod worker;

// Re-exports for convenience
pub use crate::core::errors::{CoordError, ErrorKind, Result};
pub use api::{
    AddDependency, ApiError, ApiResult, ClaimNext, ClaimOutcome, CoordinatorApi, CreateProduct,
    ProductRecord, UpdateProduct,
};
pub use config::{
    CoordinatorConfig, CoordinatorConfigBuilder, LivenessConfig, ReapPolicy, ResolverConfig,
    RoleMatch, SchedulerConfig, StoreConfig, WorkerConfig,
};
pub use coordinator::Coordinator;
pub use liveness::{LivenessMonitor, ReapStats, Reaper};
pub use model::{events, Dependency, Product, ProductFields, ProductId, ProductState, Transition, DEFAULT_ROLE};
pub use notify::{Notifier, Wakeup};
pub use resolver::DependencyResolver;
pub use scheduler::{ClaimScheduler, ClaimStats};
pub use store::{ProductStore, UpstreamLink};
pub use worker::{job_fn, FnJob, Job, Worker, WorkerHandle};
