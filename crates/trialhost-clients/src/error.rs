//! Transport-level errors of the HTTP clients.
//!
//! Every client maps an [`ApiError`] into the [`ProvisionError`] of the
//! operation that was running, so callers only ever see the step taxonomy.
//!
//! [`ProvisionError`]: trialhost_common::ProvisionError

use thiserror::Error;

/// Maximum number of body bytes kept in an error message.
const MAX_BODY_IN_ERROR: usize = 512;

/// Errors raised while talking to an external HTTP API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The client could not be constructed.
    #[error("Client configuration error: {reason}")]
    Config {
        /// What is missing or invalid.
        reason: String,
    },

    /// The request could not be sent or the response not read.
    #[error("Request to {url} failed: {source}")]
    Transport {
        /// Target URL.
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request exceeded its timeout.
    #[error("Request to {url} timed out")]
    Timeout {
        /// Target URL.
        url: String,
    },

    /// Non-success HTTP status without a structured error body.
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// The API reported an error in its response body.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// API-specific error code, if any.
        code: Option<i64>,
        /// Error message(s) reported by the API.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("Failed to decode response from {url}: {reason}")]
    Decode {
        /// Target URL.
        url: String,
        /// Decoder error.
        reason: String,
    },

    /// An asynchronous hypervisor task finished unsuccessfully.
    #[error("Task {upid} failed: {exit_status}")]
    Task {
        /// Task identifier.
        upid: String,
        /// Exit status reported by the task.
        exit_status: String,
    },
}

impl ApiError {
    /// Create a new `Config` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a new `Decode` error.
    pub fn decode(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Classify a `reqwest` failure.
    pub fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if error.is_decode() {
            Self::decode(url, error.to_string())
        } else {
            Self::Transport {
                url: url.to_string(),
                source: error,
            }
        }
    }

    /// Build a `Status` error, truncating the body.
    pub fn status(url: &str, status: u16, body: &str) -> Self {
        Self::Status {
            url: url.to_string(),
            status,
            body: truncate(body),
        }
    }

    /// HTTP status of the failed response, if there was one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if the API reported the resource as absent.
    pub fn is_not_found(&self) -> bool {
        self.http_status() == Some(404) || self.mentions("does not exist")
    }

    /// Returns `true` if the API reported the resource as already present.
    pub fn is_already_exists(&self) -> bool {
        self.http_status() == Some(409) || self.mentions("already exists")
    }

    /// Case-insensitive search of the reported error text.
    fn mentions(&self, needle: &str) -> bool {
        let text = match self {
            Self::Status { body, .. } => body,
            Self::Api { message, .. } => message,
            Self::Task { exit_status, .. } => exit_status,
            _ => return false,
        };
        text.to_lowercase().contains(needle)
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_BODY_IN_ERROR {
        return body.trim().to_string();
    }
    let mut end = MAX_BODY_IN_ERROR;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = ApiError::Api {
            status: 500,
            code: None,
            message: "CT 9000 already exists on node 'odin'".into(),
        };
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());

        let err = ApiError::status("http://x", 404, "");
        assert!(err.is_not_found());
        assert_eq!(err.http_status(), Some(404));

        let err = ApiError::Task {
            upid: "UPID:odin".into(),
            exit_status: "Configuration file 'nodes/odin/lxc/8011.conf' does not exist".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.http_status(), None);
    }

    #[test]
    fn test_status_body_truncated() {
        let body = "x".repeat(2000);
        let ApiError::Status { body, .. } = ApiError::status("http://x", 500, &body) else {
            panic!("expected Status");
        };
        assert_eq!(body.len(), MAX_BODY_IN_ERROR + 3);
        assert!(body.ends_with("..."));
    }
}
