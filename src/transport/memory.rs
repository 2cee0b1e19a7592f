//! In-process transport backed by duplex pipes

use super::{SessionStream, Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

/// The far end of a memory session: read what the controller wrote, write
/// what the "remote shell" prints.
pub struct MemoryRemote {
    /// Commands and relayed keystrokes sent by the controller
    pub input: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
}

/// Transport whose sessions are handed to the test (or demo) through a
/// channel instead of a network
pub struct MemoryTransport {
    remotes: mpsc::UnboundedSender<MemoryRemote>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryTransport {
    /// Create a transport and the receiver that gets one [`MemoryRemote`] per
    /// successful connection
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes: tx,
                refuse: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Make subsequent connection attempts fail
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<SessionStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("memory transport refusing".into()));
        }

        let (input, remote_input) = duplex(PIPE_CAPACITY);
        let (stdout, remote_stdout) = duplex(PIPE_CAPACITY);
        let (stderr, remote_stderr) = duplex(PIPE_CAPACITY);

        self.remotes
            .send(MemoryRemote {
                input: remote_input,
                stdout: remote_stdout,
                stderr: remote_stderr,
            })
            .map_err(|_| TransportError::Refused("remote end dropped".into()))?;

        Ok(SessionStream::new(Box::new(input), Box::new(stdout)).with_stderr(Box::new(stderr)))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
