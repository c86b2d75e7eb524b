use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable failure classes. Callers branch on these instead of matching error
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    Stream,
    Consumer,
    Publish,
    Subscription,
    Pull,
    Ack,
    Kv,
    Registry,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Stream => write!(f, "stream"),
            ErrorKind::Consumer => write!(f, "consumer"),
            ErrorKind::Publish => write!(f, "publish"),
            ErrorKind::Subscription => write!(f, "subscription"),
            ErrorKind::Pull => write!(f, "pull"),
            ErrorKind::Ack => write!(f, "ack"),
            ErrorKind::Kv => write!(f, "kv"),
            ErrorKind::Registry => write!(f, "registry"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Config)
    }

    pub fn is_connection(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Connection)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Stream)
    }

    pub fn is_consumer(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Consumer)
    }

    pub fn is_publish(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Publish)
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Subscription)
    }

    pub fn is_pull(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Pull)
    }

    pub fn is_kv(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Kv)
    }

    pub fn is_registry(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Registry)
    }

    /// True when the pull deadline elapsed or a broker timeout bubbled up.
    pub fn is_timeout(&self) -> bool {
        if let Some(source) = &self.inner.source {
            if let Some(pull) = source.downcast_ref::<PullError>() {
                return matches!(pull, PullError::DeadlineExceeded);
            }
            return source.to_string().to_lowercase().contains("timed out");
        }
        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("corral::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::new(ErrorKind::Config, Some(err))
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::new(ErrorKind::Connection, Some(err))
    }
}

impl From<StreamError> for Error {
    fn from(err: StreamError) -> Self {
        Error::new(ErrorKind::Stream, Some(err))
    }
}

impl From<ConsumerError> for Error {
    fn from(err: ConsumerError) -> Self {
        Error::new(ErrorKind::Consumer, Some(err))
    }
}

impl From<SubscriptionError> for Error {
    fn from(err: SubscriptionError) -> Self {
        Error::new(ErrorKind::Subscription, Some(err))
    }
}

impl From<PullError> for Error {
    fn from(err: PullError) -> Self {
        Error::new(ErrorKind::Pull, Some(err))
    }
}

impl From<KvError> for Error {
    fn from(err: KvError) -> Self {
        Error::new(ErrorKind::Kv, Some(err))
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::new(ErrorKind::Registry, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("broker parameters not defined")]
    MissingParameters,
    #[error("broker URL is required")]
    MissingUrl,
    #[error("stream subjects are required")]
    MissingSubjects,
    #[error("consumer durable name is required")]
    MissingDurable,
    #[error("consumer requires subscribe subjects")]
    MissingSubscribeSubjects,
    #[error("credentials error: {0}")]
    Credentials(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is already established")]
    AlreadyOpen,
    #[error("client is not connected")]
    NotOpen,
    #[error("connect failed: {0}")]
    Failed(#[source] BoxError),
    #[error("drain failed: {0}")]
    Drain(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream create failed: {0}")]
    Create(#[source] BoxError),
    #[error("stream update failed: {0}")]
    Update(#[source] BoxError),
    #[error("stream lookup failed: {0}")]
    Lookup(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer create failed: {0}")]
    Create(#[source] BoxError),
    #[error("consumer update failed: {0}")]
    Update(#[source] BoxError),
    #[error("consumer lookup failed: {0}")]
    Lookup(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscribe failed on {subject}: {source}")]
    Failed { subject: String, source: BoxError },
    #[error("no subscription matched subject {0}")]
    NoMatch(String),
    #[error("subscription for {0} is not pull-based")]
    NotPull(String),
}

#[derive(Debug, Error)]
pub enum PullError {
    #[error("pull deadline exceeded")]
    DeadlineExceeded,
    #[error("fetch failed: {0}")]
    Fetch(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("bucket error: {0}")]
    Bucket(#[source] BoxError),
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("revision mismatch on {key}: expected {expected}")]
    WrongRevision { key: String, expected: u64 },
    #[error("create failed: {0}")]
    Create(#[source] BoxError),
    #[error("update failed: {0}")]
    Update(#[source] BoxError),
    #[error("read failed: {0}")]
    Read(#[source] BoxError),
    #[error("delete failed: {0}")]
    Delete(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed controller id: {0}")]
    MalformedId(String),
    #[error("malformed liveness record: {0}")]
    MalformedRecord(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::from(ConnectionError::AlreadyOpen);
        assert!(err.is_connection());
        assert!(!err.is_config());

        let err = Error::from(KvError::AlreadyExists("fac.cond".to_string()));
        assert!(err.is_kv());
    }

    #[test]
    fn test_error_display() {
        let err = Error::from(ConnectionError::NotOpen);
        assert_eq!(err.to_string(), "connection error: client is not connected");
    }

    #[test]
    fn test_timeout_detection() {
        let err = Error::from(PullError::DeadlineExceeded);
        assert!(err.is_pull());
        assert!(err.is_timeout());

        let err = Error::from(PullError::Fetch("boom".into()));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_error_source() {
        let err = Error::from(StreamError::Create("no responders".into()));
        assert!(StdError::source(&err).is_some());
    }
}
