use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::connection::ConnectionState;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Invalid retry policy, heartbeat settings or endpoint passed to `open`
    Configuration,
    /// `open` called while a cycle is still connecting, open or reconnecting
    AlreadyOpen,
    /// `send` called while the channel is not open
    NotConnected,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Configuration {
            reason: reason.into(),
        }
        .into()
    }

    #[must_use]
    pub fn already_open(state: ConnectionState) -> Self {
        AlreadyOpen { state }.into()
    }

    #[must_use]
    pub fn not_connected(state: ConnectionState) -> Self {
        NotConnected { state }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Configuration {
    pub reason: String,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for Configuration {}

/// Returned by `open` when the previous cycle has not been closed yet.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct AlreadyOpen {
    /// State the manager was in when `open` was called
    pub state: ConnectionState,
}

impl fmt::Display for AlreadyOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel is already active ({}), close it before opening again",
            self.state
        )
    }
}

impl StdError for AlreadyOpen {}

/// Returned by `send` when the channel is not open. Nothing was queued.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct NotConnected {
    /// State the manager was in when `send` was called
    pub state: ConnectionState,
}

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot send while channel is {}", self.state)
    }
}

impl StdError for NotConnected {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Configuration, e)
    }
}

impl From<Configuration> for Error {
    fn from(err: Configuration) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<AlreadyOpen> for Error {
    fn from(err: AlreadyOpen) -> Self {
        Error::with_source(Kind::AlreadyOpen, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::NotConnected, err)
    }
}
