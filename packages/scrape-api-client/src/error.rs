use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Execution {0} not found")]
    NotFound(String),
}

impl ApiError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(_) => true,
            ApiError::Api { status, .. } => *status == 429 || *status >= 500,
            ApiError::NotFound(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = ApiError::Api {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(err.is_transient());

        let err = ApiError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let err = ApiError::Api {
            status: 400,
            message: "bad input".into(),
        };
        assert!(!err.is_transient());
        assert!(!ApiError::NotFound("abc".into()).is_transient());
    }

    #[test]
    fn not_found_message_names_execution() {
        let err = ApiError::NotFound("run-42".into());
        assert!(err.to_string().contains("run-42"));
    }
}
