use std::io;

/// The five error kinds a scope, handler, or controller can surface.
///
/// Handshake and network failures are never fatal to a scope: handlers close
/// themselves and deregister. Config/permission failures are fatal to the
/// affected scope's start and must fully unwind whatever steps already ran.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("upstream proxy handshake failed: {0}")]
    Handshake(String),

    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("invalid state: {0}")]
    State(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn permission<S: Into<String>>(msg: S) -> Self {
        Error::Permission(msg.into())
    }

    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Error::Handshake(msg.into())
    }

    pub fn state<S: Into<String>>(msg: S) -> Self {
        Error::State(msg.into())
    }

    /// Handshake and network failures are connection-local: the handler
    /// closes and the manager evicts it, but the owning scope keeps running.
    pub fn is_connection_local(&self) -> bool {
        matches!(self, Error::Handshake(_) | Error::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
