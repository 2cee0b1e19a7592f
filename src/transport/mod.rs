//! Upstream session transport
//!
//! A transport is an opaque capability that opens a remote command session
//! and hands back its duplex stream. Controllers never see the wire protocol.

mod memory;
mod process;

pub use memory::{MemoryRemote, MemoryTransport};
pub use process::ProcessTransport;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed write half of a session
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of a session
pub type SessionReader = Box<dyn AsyncRead + Send + Unpin>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session refused: {0}")]
    Refused(String),

    #[error("session stream unavailable: {0}")]
    MissingStream(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open duplex session, ready to receive commands
pub struct SessionStream {
    /// Command input of the remote shell
    pub input: SessionWriter,
    /// Standard output of the remote shell
    pub stdout: SessionReader,
    /// Standard error, when the transport keeps it separate
    pub stderr: Option<SessionReader>,
}

impl SessionStream {
    pub fn new(input: SessionWriter, stdout: SessionReader) -> Self {
        Self {
            input,
            stdout,
            stderr: None,
        }
    }

    pub fn with_stderr(mut self, stderr: SessionReader) -> Self {
        self.stderr = Some(stderr);
        self
    }
}

/// Opens upstream sessions for a controller
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect and open the duplex command stream. Returning is the "ready"
    /// signal.
    async fn connect(&self) -> Result<SessionStream, TransportError>;

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}
