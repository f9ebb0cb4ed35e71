use thiserror::Error;

/// The closed error taxonomy from spec §7. Component-boundary functions
/// return `Result<T, CoreError>`; the server binary collapses this into
/// `anyhow::Error` at the outermost level the way the teacher's
/// `main.rs` does.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed plan, unknown operation, cyclic or dangling dependency.
    /// Rejected at admission; no execution is created.
    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    /// Handler-side schema validation of a provider's options failed.
    /// Fatal for the job.
    #[error("parameter validation failed: {0}")]
    ParamValidation(String),

    /// The resolver found a dependency reference whose result shape it
    /// cannot substitute from (neither `outputs[]` nor legacy `url`).
    #[error("dependency '{dep_id}' has no substitutable output for {sentinel}")]
    DependencyShape { dep_id: String, sentinel: String },

    /// The resolver found a sentinel referencing an unknown or
    /// non-completed dependency id.
    #[error("dependency '{0}' is unknown or not completed")]
    DependencyMissing(String),

    /// The provider returned failure or timed out.
    #[error("provider error: {0}")]
    Provider(String),

    /// Queue/store/storage transient failure. Retried by the queue up to
    /// its configured limit; surfaces as this variant once exhausted.
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// Unhandled exception in a handler. The job fails; detail is logged
    /// but not surfaced to the caller beyond this message.
    #[error("handler bug: {0}")]
    HandlerBug(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Maps this error onto the JobNode.error text written by workers and
    /// gateways. `HandlerBug` deliberately loses detail (see §7
    /// "stack is logged but not surfaced").
    pub fn job_error_message(&self) -> String {
        match self {
            CoreError::HandlerBug(_) => "internal handler error".to_string(),
            other => other.to_string(),
        }
    }
}
