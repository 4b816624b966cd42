//! Categorized errors for tunnel sessions.
//!
//! Every failure a session can hit is resolved inside that session and
//! reported one layer up; none of them is fatal to the listening process.

use std::fmt;

/// What kind of step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Token missing, not decodable, or missing required fields.
    MalformedToken,
    /// Signature absent or not matching the recomputed HMAC.
    Authentication,
    /// The handshake to the remote transport did not complete.
    TransportConnect,
    /// The server could not reach the resolved destination.
    DestinationConnect,
    /// I/O error on an established bridge.
    Bridge,
    /// A handshake or connect did not finish in time.
    Timeout,
    /// Invalid configuration or address strings.
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::MalformedToken => "malformed_token",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::TransportConnect => "transport_connect",
            ErrorCategory::DestinationConnect => "destination_connect",
            ErrorCategory::Bridge => "bridge",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// A failure inside one session.
///
/// `message` doubles as the reason sent to the peer when a transport is
/// rejected, so it never includes the cause chain.
#[derive(Debug)]
pub struct TunnelError {
    pub category: ErrorCategory,
    pub message: String,
    pub cause: Option<Cause>,
    /// Extra key/value detail for logs (`target`, `status`, ...).
    pub context: Vec<(String, String)>,
}

impl TunnelError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
            context: Vec::new(),
        }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Look up a context value by key.
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Token and signature failures, as opposed to connectivity problems.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::MalformedToken | ErrorCategory::Authentication
        )
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::MalformedToken, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransportConnect, message)
    }

    pub fn destination(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DestinationConnect, message)
    }

    pub fn bridge(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Bridge, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }
}

impl fmt::Display for TunnelError {
    /// `[category] message (k=v, ...): cause`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;
        if !self.context.is_empty() {
            let pairs: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, " ({})", pairs.join(", "))?;
        }
        match &self.cause {
            Some(cause) => write!(f, ": {}", cause),
            None => Ok(()),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// Attach a category to foreign errors with `?`.
pub trait ResultExt<T> {
    fn with_category(self, category: ErrorCategory) -> TunnelResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_category(self, category: ErrorCategory) -> TunnelResult<T> {
        self.map_err(|e| TunnelError::new(category, e.to_string()).with_cause(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::destination("Tunnel connect error to db:5432")
            .with_context("session", "abc123")
            .with_context("ip", "1.2.3.4");

        let display = err.to_string();
        assert!(display.contains("[destination_connect]"));
        assert!(display.contains("Tunnel connect error to db:5432"));
        assert!(display.contains("session=abc123"));
        assert!(display.contains("ip=1.2.3.4"));
    }

    #[test]
    fn test_rejection_categories() {
        assert!(TunnelError::malformed("bad").is_rejection());
        assert!(TunnelError::auth("bad").is_rejection());
        assert!(!TunnelError::destination("down").is_rejection());
        assert!(!TunnelError::timeout("slow").is_rejection());
    }

    #[test]
    fn test_context_lookup_and_plain_display() {
        let err = TunnelError::transport("Server rejected tunnel").with_context("status", "500");
        assert_eq!(err.context_value("status"), Some("500"));
        assert_eq!(err.context_value("target"), None);
        assert_eq!(
            TunnelError::timeout("slow").to_string(),
            "[timeout] slow"
        );
    }

    #[test]
    fn test_with_category_keeps_cause() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let err = res.with_category(ErrorCategory::TransportConnect).unwrap_err();
        assert_eq!(err.category, ErrorCategory::TransportConnect);
        assert!(std::error::Error::source(&err).is_some());
    }
}
