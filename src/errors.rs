//! Failure classes raised by the engines.
//!
//! Both types travel inside `anyhow::Error`; callers that need to tell them
//! apart walk the cause chain with [`precondition_failure`] or
//! [`transition_failure`].

/// The caller asked for something the current remote state cannot satisfy:
/// a missing or non-root request, a corrupt chain family, an unknown data tier,
/// a sequence without conditions. Never retried.
#[derive(Debug)]
pub struct PreconditionError {
    pub subject: String,
    pub reason: String,
}

impl PreconditionError {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}

impl std::error::Error for PreconditionError {}

/// A mutation reached the service and came back with a falsy `results`.
#[derive(Debug)]
pub struct TransitionError {
    pub prepid: String,
    pub operation: &'static str,
    pub details: String,
}

impl TransitionError {
    pub fn new(prepid: &str, operation: &'static str, details: impl Into<String>) -> Self {
        Self {
            prepid: prepid.to_string(),
            operation,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed for {}: {}",
            self.operation, self.prepid, self.details
        )
    }
}

impl std::error::Error for TransitionError {}

pub fn precondition_failure(err: &anyhow::Error) -> Option<&PreconditionError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PreconditionError>())
}

pub fn transition_failure(err: &anyhow::Error) -> Option<&TransitionError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TransitionError>())
}
