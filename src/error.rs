use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the compute API boundary (listing, bulk and firewall calls).
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// Token missing, unreadable, expired or rejected by the API.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Transport failure, non-2xx response or malformed payload.
    #[error("compute API error: {0}")]
    Api(String),
}

pub type CloudResult<T> = Result<T, CloudError>;

impl CloudError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }

    /// HTTP status a request handler should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CloudError::Auth(_) => StatusCode::UNAUTHORIZED,
            CloudError::Api(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            CloudError::Auth(_) => 2,
            CloudError::Api(_) => 1,
        }
    }

    /// Classify a non-success HTTP response from the compute API.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            CloudError::Auth(format!("{}: {}", status, body))
        } else {
            CloudError::Api(format!("{}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return CloudError::from_status(status, &err.to_string());
        }
        CloudError::Api(format!("transport error: {}", err))
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Api(format!("malformed response: {}", err))
    }
}

impl From<url::ParseError> for CloudError {
    fn from(err: url::ParseError) -> Self {
        CloudError::Api(format!("invalid url: {}", err))
    }
}
