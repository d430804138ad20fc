//! Outcomes of an await run other than success.
//!
//! `Cancelled`, `Timeout` and `Initialization` always carry the last observed
//! object: callers use it to report "created but not ready" instead of a hard
//! failure.

use converge_kubehub::ClientError;
use kube::core::DynamicObject;
use kube::ResourceExt;

fn name_of(obj: &DynamicObject) -> String {
    obj.name_any()
}

#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    #[error("Resource operation was cancelled for '{}'", name_of(.object))]
    Cancelled { object: Box<DynamicObject>, sub_errors: Vec<String> },

    #[error("'{}' timed out waiting to be Ready", name_of(.object))]
    Timeout { object: Box<DynamicObject>, sub_errors: Vec<String> },

    #[error("Resource '{}' was created but failed to initialize", name_of(.object))]
    Initialization { object: Box<DynamicObject>, sub_errors: Vec<String> },

    /// Preview only: the target namespace does not exist yet.
    #[error("namespace does not exist for '{}'", name_of(.object))]
    Namespace { object: Box<DynamicObject> },

    #[error("timed out polling for '{name}'")]
    PollTimeout { name: String, sub_errors: Vec<String> },

    #[error("Resource operation was cancelled for '{name}'")]
    PollCancelled { name: String },

    #[error("{0}")]
    Failed(String),

    /// Client errors pass through untouched so callers can still detect 404.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl AwaitError {
    pub fn cancelled(object: DynamicObject, sub_errors: Vec<String>) -> Self {
        AwaitError::Cancelled { object: Box::new(object), sub_errors }
    }

    pub fn timeout(object: DynamicObject, sub_errors: Vec<String>) -> Self {
        AwaitError::Timeout { object: Box::new(object), sub_errors }
    }

    pub fn initialization(object: DynamicObject, sub_errors: Vec<String>) -> Self {
        AwaitError::Initialization { object: Box::new(object), sub_errors }
    }

    pub fn namespace(object: DynamicObject) -> Self {
        AwaitError::Namespace { object: Box::new(object) }
    }

    /// Last observed object, for partial-failure reporting.
    pub fn object(&self) -> Option<&DynamicObject> {
        match self {
            AwaitError::Cancelled { object, .. }
            | AwaitError::Timeout { object, .. }
            | AwaitError::Initialization { object, .. }
            | AwaitError::Namespace { object } => Some(object),
            _ => None,
        }
    }

    pub fn sub_errors(&self) -> &[String] {
        match self {
            AwaitError::Cancelled { sub_errors, .. }
            | AwaitError::Timeout { sub_errors, .. }
            | AwaitError::Initialization { sub_errors, .. }
            | AwaitError::PollTimeout { sub_errors, .. } => sub_errors,
            _ => &[],
        }
    }

    /// The resource exists but never became ready.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            AwaitError::Cancelled { .. } | AwaitError::Timeout { .. } | AwaitError::Initialization { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AwaitError::Client(e) if e.is_not_found())
    }

    /// Multi-line rendering with sub-errors, as shown to users.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        for e in self.sub_errors() {
            out.push_str("\n    * ");
            out.push_str(e);
        }
        out
    }
}
