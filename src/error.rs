use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("dataverse reported duplicate content: {0}")]
    DuplicateContent(String),

    #[error("file cannot be renamed: {0}")]
    NotRenameable(String),

    #[error("content unavailable: {0}")]
    Unavailable(String),

    #[error("dataverse error ({}): {message}", .status.map_or_else(|| "transport".to_string(), |s| s.to_string()))]
    Transport { status: Option<u16>, message: String },

    #[error("malformed path encoding: {0}")]
    BadEncoding(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Render a single-line message for a protocol failure reply.
    /// The protocol is line-oriented, so embedded newlines would desync it.
    pub fn protocol_message(&self) -> String {
        self.to_string().replace('\n', "; ")
    }

    /// True for failures that abort PREPARE, as opposed to per-verb
    /// failures the host may retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Auth { .. } | Self::DatasetNotFound(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_message_is_single_line() {
        let err = RemoteError::Transport {
            status: Some(500),
            message: "first\nsecond".to_string(),
        };
        assert!(!err.protocol_message().contains('\n'));
    }

    #[test]
    fn fatal_classification() {
        assert!(RemoteError::Validation("doi".into()).is_fatal());
        assert!(
            RemoteError::Auth {
                status: 401,
                message: "bad token".into()
            }
            .is_fatal()
        );
        assert!(RemoteError::DatasetNotFound("doi:x".into()).is_fatal());
        assert!(!RemoteError::Unavailable("k".into()).is_fatal());
        assert!(!RemoteError::DuplicateContent("dup".into()).is_fatal());
    }
}
