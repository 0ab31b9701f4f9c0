//! Model catalog, workload classification, and role resolution.

pub mod classify;
pub mod registry;
pub mod resolver;

pub use classify::{
    classify_plan, classify_text, fuse, plan_text, Classification, Complexity, SemanticClassifier,
    WorkloadSize,
};
pub use registry::{
    builtin_catalog, AvailabilitySource, Category, CommandAvailability, ModelRegistry, ModelSpec,
    SizeClass, StaticAvailability,
};
pub use resolver::{requirement, ModelResolver, Requirement, Role, RoleTable};
