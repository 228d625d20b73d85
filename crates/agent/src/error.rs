use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors returned by the agent's reconciliation components.
///
/// Only the watcher decides what an error means for the loop: transport and
/// parse failures on its own long poll trigger a backoff and retry, everything
/// a handler returns is logged and the loop moves on.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unrecognized reference format: {0:?}")]
    UnrecognizedReference(String),

    #[error(transparent)]
    Classification(#[from] common::ParseError),

    #[error("no {event} scripts are defined for {os}")]
    UnsupportedEvent { event: String, os: String },

    #[error("request {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request {url}: unexpected status {status}")]
    Status { url: String, status: u16 },

    #[error("parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("bad extension {ext:?} for {reference}")]
    BadExtension { reference: String, ext: String },

    #[error("script {metadata}: {message}")]
    Execution { metadata: String, message: String },

    #[error("route {op} {route}: {message}")]
    Route {
        op: &'static str,
        route: String,
        message: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AgentError::Io {
            context: context.into(),
            source,
        }
    }

    /// Transport and parse failures may succeed when retried; everything
    /// else is fatal to the operation that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transport { .. } | AgentError::Status { .. } | AgentError::Parse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        let status = AgentError::Status {
            url: "http://md/".into(),
            status: 503,
        };
        assert!(status.is_retryable());
        let parse = AgentError::Parse {
            what: "attributes".into(),
            source: serde_json::from_str::<u8>("x").unwrap_err(),
        };
        assert!(parse.is_retryable());
        assert!(!AgentError::UnrecognizedReference("ftp://x".into()).is_retryable());
        let bad = AgentError::BadExtension {
            reference: "http://x/test.bad".into(),
            ext: ".bad".into(),
        };
        assert!(bad.to_string().contains("bad extension"));
    }
}
