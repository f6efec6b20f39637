use thiserror::Error;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidQuantity: {field} has malformed quantity {value:?}: {reason}")]
    InvalidQuantity {
        field: String,
        value: String,
        reason: String,
    },

    #[error("InvalidDuration: annotation {annotation} has malformed duration {value:?}: {reason}")]
    InvalidDuration {
        annotation: String,
        value: String,
        reason: String,
    },

    #[error("SecretNotFound: required secret '{0}' was not found in the cluster")]
    SecretNotFound(String),

    #[error("ProfileNotFound: profile '{name}' was not found in namespace '{namespace}'")]
    ProfileNotFound { namespace: String, name: String },

    #[error("CacheSyncFailed: {0}")]
    CacheSyncFailed(String),

    #[error("MetricsError: {0}")]
    MetricsError(#[source] prometheus::Error),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = match self {
            StdError::JsonSerializationError(_) => "jsonserializationerror",
            StdError::KubeError(_) => "kubeerror",
            StdError::MetadataMissing(_) => "metadatamissing",
            StdError::InvalidQuantity { .. } => "invalidquantity",
            StdError::InvalidDuration { .. } => "invalidduration",
            StdError::SecretNotFound(_) => "secretnotfound",
            StdError::ProfileNotFound { .. } => "profilenotfound",
            StdError::CacheSyncFailed(_) => "cachesyncfailed",
            StdError::MetricsError(_) => "metricserror",
        };
        label.to_string()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    /// A workload with the Function's name exists but is controlled by something else.
    #[error("Resource {kind} {name:?} already exists and is not managed by Function")]
    OwnershipConflict { kind: String, name: String },
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::OwnershipConflict { .. } => "ownershipconflict".to_string(),
        }
    }

    /// True for an API error carrying the given HTTP status code.
    pub fn is_api_code(&self, code: u16) -> bool {
        matches!(self, Error::StdError(StdError::KubeError(kube::Error::Api(e))) if e.code == code)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
