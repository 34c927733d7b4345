// ============================================================================
// shardstrap: idempotent bootstrap of a sharded document-store cluster
// ============================================================================

pub mod core;
pub mod topology;
pub mod plan;
pub mod client;
pub mod guard;
pub mod executor;
pub mod report;
pub mod orchestrator;
pub mod settings;
pub mod telemetry;

// Re-export main types for convenience
pub use core::{BootError, Result};
pub use topology::{
    IndexDirection, IndexOptions, IndexSpec, KeyPattern, MemberSpec, ReplicaSetSpec,
    ShardRegistration, ShardedCollectionSpec, ShardedDatabaseSpec, Topology,
};
pub use plan::{BootstrapPlan, Dependency, PlannedStep, Stage, StepAction, StepId};

// Re-export control plane API
pub use client::{
    ControlPlane, ControlPlaneError, HttpControlPlane, InMemoryControlPlane, Operation,
};

// ============================================================================
// Orchestration API
// ============================================================================

pub use guard::{GuardPolicy, IdempotencyGuard, ProbeVerdict};
pub use executor::StepExecutor;
pub use report::{FailureKind, FailureReason, RunReport, RunState, StepOutcome, StepRecord};
pub use orchestrator::{
    BootstrapOrchestrator, CancellationHandle, CancellationSignal, StepObserver, StepPhase,
    TracingObserver,
};
pub use settings::BootstrapSettings;
pub use telemetry::{LogFormat, init_tracing};
