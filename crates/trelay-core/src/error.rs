use thiserror::Error;

/// Errors produced while serving or issuing a relay request.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for relay request")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("client version {client} incompatible with relay server (requires {required})")]
    VersionMismatch { client: String, required: String },

    #[error("{0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("TCP patching request {app_name} is not supported. Please contact your key user")]
    PatchingNotSupported { app_name: String },

    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("config collection failed: {0}")]
    Collection(String),

    #[error("relay i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether a failure reply can be sent for this error.
    ///
    /// Framing failures happen before a request exists, so the client gets
    /// nothing back and the connection is simply closed.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            RelayError::Protocol(_) | RelayError::Timeout | RelayError::Codec(_)
        )
    }

    /// Short variant name, used when the rendered message is empty.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => "ProtocolError",
            RelayError::Timeout => "ProtocolError",
            RelayError::Codec(_) => "ProtocolError",
            RelayError::VersionMismatch { .. } => "VersionMismatch",
            RelayError::Configuration(_) => "ConfigurationError",
            RelayError::InvalidRequest(_) => "InvalidRequest",
            RelayError::PatchingNotSupported { .. } => "PatchingNotSupported",
            RelayError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            RelayError::Collection(_) => "CollectionError",
            RelayError::Io(_) => "RelayIOError",
        }
    }

    /// Human-readable text for a failure reply.
    pub fn reply_message(&self) -> String {
        let message = self.to_string();
        if message.trim().is_empty() {
            self.kind().to_string()
        } else {
            message
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_falls_back_to_kind() {
        let err = RelayError::Configuration(String::new());
        assert_eq!(err.reply_message(), "ConfigurationError");
    }

    #[test]
    fn patching_message_names_app() {
        let err = RelayError::PatchingNotSupported {
            app_name: "TCP-23".into(),
        };
        assert_eq!(
            err.reply_message(),
            "TCP patching request TCP-23 is not supported. Please contact your key user"
        );
    }

    #[test]
    fn framing_errors_are_not_reportable() {
        assert!(!RelayError::Timeout.is_reportable());
        assert!(!RelayError::Protocol("bad".into()).is_reportable());
        assert!(RelayError::UpstreamUnavailable("refused".into()).is_reportable());
    }
}
