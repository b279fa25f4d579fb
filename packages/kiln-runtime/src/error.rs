//! Error types for the kiln runtime
//!
//! Every failure carries a kind tag plus an append-only key/value context
//! list. Callers branch on the kind; the context is for operators reading
//! logs. Equality in tests compares kinds, never rendered text.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Classification of runtime failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("resources exhausted")]
    Exhausted,

    #[error("allocation already released")]
    DoubleRelease,

    #[error("malformed input")]
    Malformed,

    #[error("cryptographic failure")]
    Crypto,

    #[error("io failure")]
    Io,

    #[error("fatal")]
    Fatal,
}

/// Kind-tagged error with attached key/value context
pub struct WorkerError {
    kind: ErrorKind,
    message: String,
    context: Vec<(String, String)>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        WorkerError {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exhausted, message)
    }

    pub fn double_release(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DoubleRelease, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crypto, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Append one key/value pair of context
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.context.push((key.to_string(), value.to_string()));
        self
    }

    /// Attach the underlying cause
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)?;
        if !self.context.is_empty() {
            write!(f, " [")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, "]")?;
        }
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl fmt::Debug for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            _ => ErrorKind::Io,
        };
        WorkerError::new(kind, "io operation failed").with_source(e)
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::new(ErrorKind::Malformed, "json parse failed").with_source(e)
    }
}

/// Well-known error channel with a bounded delivery budget
///
/// Components that cannot surface errors to a caller (watcher loops, cache
/// warnings) report here. Delivery waits at most one second before falling
/// back to stderr so critical paths are never blocked by a slow consumer.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<WorkerError>,
}

impl ErrorSink {
    pub fn new(tx: mpsc::Sender<WorkerError>) -> Self {
        ErrorSink { tx }
    }

    /// Create a sink plus the receiving half for the daemon to drain
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<WorkerError>) {
        let (tx, rx) = mpsc::channel(depth);
        (ErrorSink { tx }, rx)
    }

    pub async fn report(&self, err: WorkerError) {
        let budget = Duration::from_secs(1);
        match tokio::time::timeout(budget, self.tx.send(err)).await {
            Ok(Ok(())) => {}
            Ok(Err(send_err)) => {
                log::error!("error channel closed: {}", send_err.0);
                eprintln!("kiln: {}", send_err.0);
            }
            Err(_) => {
                log::error!("error channel send timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_preserved_through_context() {
        let err = WorkerError::exhausted("no available slots")
            .with("device", "GPU-aaaa")
            .with("wanted", 4);
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert_eq!(err.context().len(), 2);
    }

    #[test]
    fn test_display_renders_context() {
        let err = WorkerError::double_release("allocation unknown").with("alloc", "a-17");
        let text = format!("{}", err);
        assert!(text.contains("allocation unknown"));
        assert!(text.contains("alloc=a-17"));
    }

    #[test]
    fn test_io_error_mapping() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: WorkerError = missing.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err: WorkerError = denied.into();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn test_sink_delivers() {
        let (sink, mut rx) = ErrorSink::channel(4);
        sink.report(WorkerError::io("disk read failed")).await;
        let err = rx.recv().await.expect("delivered");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_gives_up_after_budget() {
        let (sink, _rx) = ErrorSink::channel(1);
        sink.report(WorkerError::io("first")).await;
        // Channel now full and nobody is draining; must return, not hang.
        sink.report(WorkerError::io("second")).await;
    }
}
