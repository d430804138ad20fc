use converge_core::CoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    NotFound(String),
    /// The kind is not (or no longer) served by the cluster.
    #[error("no matches for kind {0}")]
    NoMatch(String),
    #[error("namespace {0:?} not found")]
    NamespaceNotFound(String),
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("{0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_) | ClientError::NamespaceNotFound(_))
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, ClientError::NoMatch(_))
    }

    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, ClientError::NamespaceNotFound(_))
    }

    /// Conflict on create: the object already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::Api { code: 409, reason, .. } if reason == "AlreadyExists")
    }
}

/// The apiserver reports a missing namespace as `namespaces "<name>" not found`.
fn missing_namespace(message: &str) -> Option<String> {
    let rest = message.strip_prefix("namespaces \"")?;
    let (name, tail) = rest.split_once('"')?;
    tail.trim().eq("not found").then(|| name.to_string())
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => match missing_namespace(&ae.message) {
                Some(ns) => ClientError::NamespaceNotFound(ns),
                None => ClientError::NotFound(ae.message),
            },
            kube::Error::Api(ae) => ClientError::Api { code: ae.code, reason: ae.reason, message: ae.message },
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<CoreError> for ClientError {
    fn from(e: CoreError) -> Self {
        ClientError::Transport(e.to_string())
    }
}
