use thiserror::Error;

/// Reasons a plan is rejected before any step runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan contains no steps")]
    Empty,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("dependency not found: step '{step}' depends on '{missing_dep}'")]
    DependencyNotFound { step: String, missing_dep: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("circular dependency detected among steps: {}", .0.join(", "))]
    CircularDependency(Vec<String>),

    #[error("plan could not be parsed: {0}")]
    Parse(String),
}
