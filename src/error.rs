//! Error types for the HSDP provider.
//!
//! Every handler returns [`ProviderError`]. Upstream HTTP failures carry their
//! status code so callers can ask for the [`HttpTaxon`] instead of matching on
//! raw numbers.

use thiserror::Error;

use crate::schema::Diagnostic;

/// How an upstream HTTP status is treated by the reconciliation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpTaxon {
    /// 401/403: refresh the token once, then retry.
    Auth,
    /// 404/410: the object no longer exists.
    Gone,
    /// 409: object already exists; adopt it or fail.
    Conflict,
    /// 429 and 5xx: retried inside the executor.
    Transient,
    /// Any other 4xx.
    Permanent,
}

impl HttpTaxon {
    /// Classify an HTTP status code.
    pub fn of(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            404 | 410 => Self::Gone,
            409 => Self::Conflict,
            429 | 500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }
}

/// Errors that can occur while reconciling resources.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credentials needed to build a client were not configured.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Authentication against the identity service failed.
    #[error("authentication failed (status {status}): {detail}")]
    AuthFailed {
        /// Upstream status, 0 when no response was received.
        status: u16,
        /// Upstream body or transport message.
        detail: String,
    },

    /// The parent organization could not be resolved.
    #[error("missing parent organization: {0}")]
    MissingParentOrg(String),

    /// The server returned an object whose identity differs from the stored one.
    #[error("instance id mismatch: expected {expected}, got {actual}")]
    InstanceIdMismatch {
        /// Identifier stored by the host.
        expected: String,
        /// Identifier returned by the server.
        actual: String,
    },

    /// Operation not implemented by the upstream service.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Deleting a resource failed.
    #[error("delete failed for {kind}: {detail}")]
    DeleteFailed {
        /// The resource kind, e.g. `iam_org`.
        kind: String,
        /// What went wrong.
        detail: String,
    },

    /// The upstream response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The upstream service answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The request never produced a response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timed out.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The operation was cancelled by the host.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation failed due to current state (precondition not met).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Invalid request from the host.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Status of the resource endpoint's response, if any.
    ///
    /// Token endpoint failures are not included: a 404 from the identity
    /// service says nothing about the object being managed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status of the token endpoint's response when authentication failed.
    pub fn auth_status(&self) -> Option<u16> {
        match self {
            Self::AuthFailed { status, .. } if *status != 0 => Some(*status),
            _ => None,
        }
    }

    /// HTTP taxon of this error, if it came from an upstream response.
    pub fn taxon(&self) -> Option<HttpTaxon> {
        self.status().map(HttpTaxon::of)
    }

    /// True for 404/410 responses.
    pub fn is_gone(&self) -> bool {
        self.taxon() == Some(HttpTaxon::Gone)
    }

    /// True for responses the executor would have retried.
    pub fn is_transient(&self) -> bool {
        self.taxon() == Some(HttpTaxon::Transient)
    }

    /// True when the upstream reported a create conflict. Some legacy
    /// endpoints answer 400 instead of 409; callers opt in with `legacy_400`.
    pub fn is_conflict(&self, legacy_400: bool) -> bool {
        match self.status() {
            Some(409) => true,
            Some(400) => legacy_400,
            _ => false,
        }
    }

    /// Shorthand for an upstream error.
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    /// Shorthand for a delete failure of `kind`.
    pub fn delete_failed(kind: impl Into<String>, detail: impl ToString) -> Self {
        Self::DeleteFailed {
            kind: kind.into(),
            detail: detail.to_string(),
        }
    }

    /// Convert into the diagnostics reported to the host.
    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        let summary = self.to_string();
        let diag = match &self {
            Self::MissingCredentials(what) => Diagnostic::error(summary).with_detail(format!(
                "configure the provider with {} (or the matching HSDP_* environment variable)",
                what
            )),
            Self::Upstream { status, .. } => {
                Diagnostic::error(summary).with_detail(format!("HTTP status {}", status))
            },
            _ => Diagnostic::error(summary),
        };
        vec![diag]
    }
}

impl From<crate::client::ApiError> for ProviderError {
    fn from(err: crate::client::ApiError) -> Self {
        use crate::client::ApiError;
        match err {
            ApiError::Status { status, body } => Self::Upstream { status, body },
            ApiError::Transport(msg) => Self::Transport(msg),
            ApiError::Decode(msg) => Self::InvalidResponse(msg),
            ApiError::InvalidUrl(msg) => Self::Configuration(msg),
            ApiError::Cancelled => Self::Cancelled,
            ApiError::Auth(err) => err,
        }
    }
}
