//! Controllers - long-lived upstream sessions shared by many viewers
//!
//! A [`Controller`] owns one upstream session and one [`CommandQueue`]. A
//! background dispatch loop drains the queue into the session under a rate
//! limit anchored to the last observed output, while viewers are hooked in
//! and out through the shared [`HookRegistry`].

mod dispatch;
mod hooks;
mod set;

pub use hooks::{HookRegistry, Viewer, ViewerId, ViewerOutput};
pub use set::ControllerSet;

use crate::queue::{CommandQueue, QueueError, Value};
use crate::transport::{SessionReader, SessionStream, SessionWriter, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default minimum spacing between commands
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(1200);

/// Capacity of the per-controller event fan-out
const EVENT_CAPACITY: usize = 1024;

/// Read buffer for session output
const READ_CHUNK: usize = 8 * 1024;

/// Controller errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller '{name}' is {state}")]
    InvalidState { name: String, state: ConnectionState },

    #[error("controller '{0}' has no open session")]
    NotConnected(String),

    #[error("write to controller '{name}' failed: {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A queued command payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Text line; a trailing newline is added when missing
    Text(String),
    /// Raw bytes, written verbatim
    Bytes(Vec<u8>),
}

impl Command {
    /// Bytes as written to the session
    pub fn to_wire(&self) -> Cow<'_, [u8]> {
        match self {
            Command::Text(text) if text.ends_with('\n') => Cow::Borrowed(text.as_bytes()),
            Command::Text(text) => {
                let mut line = Vec::with_capacity(text.len() + 1);
                line.extend_from_slice(text.as_bytes());
                line.push(b'\n');
                Cow::Owned(line)
            }
            Command::Bytes(bytes) => Cow::Borrowed(bytes),
        }
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Command::Text(text.to_string())
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Command::Text(text)
    }
}

impl From<Vec<u8>> for Command {
    fn from(bytes: Vec<u8>) -> Self {
        Command::Bytes(bytes)
    }
}

impl From<&[u8]> for Command {
    fn from(bytes: &[u8]) -> Self {
        Command::Bytes(bytes.to_vec())
    }
}

/// Connection state of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    /// The dispatch loop hit a write fault and stopped for good
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which session stream produced a chunk of output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events observable on a controller.
///
/// Every `Output` event is part of the combined output; filter on `stream`
/// for stdout or stderr alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Output { stream: OutputStream, data: Vec<u8> },
    StateChanged(ConnectionState),
    Fault(String),
}

/// Construction parameters for a [`Controller`]
pub struct ControllerOptions {
    pub name: String,
    pub transport: Arc<dyn Transport>,
    pub command_delay: Duration,
    pub init_script: Vec<Command>,
}

impl ControllerOptions {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            command_delay: DEFAULT_COMMAND_DELAY,
            init_script: Vec::new(),
        }
    }

    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    pub fn with_init_script<I, C>(mut self, script: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Command>,
    {
        self.init_script = script.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome of [`Controller::claim`]
enum Claim {
    Write(Arc<Shell>, Command),
    Requeued,
    Stale(Command),
}

/// Write half of the current session
struct Shell {
    generation: u64,
    writer: tokio::sync::Mutex<SessionWriter>,
}

impl Shell {
    async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }
}

struct Inner {
    name: String,
    transport: Arc<dyn Transport>,
    queue: CommandQueue<Command>,
    shell: Mutex<Option<Arc<Shell>>>,
    last_output: Mutex<Instant>,
    command_delay: Duration,
    init_script: Vec<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ControllerEvent>,
    hooks: Arc<HookRegistry>,
    dispatch_started: AtomicBool,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// A managed upstream session with its command queue and dispatch loop.
///
/// Cloning is cheap; all clones refer to the same controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Controller {
    /// Create a controller without connecting it
    pub fn new(options: ControllerOptions, hooks: Arc<HookRegistry>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                name: options.name,
                transport: options.transport,
                queue: CommandQueue::new(),
                shell: Mutex::new(None),
                last_output: Mutex::new(Instant::now()),
                command_delay: options.command_delay,
                init_script: options.init_script,
                state,
                events,
                hooks,
                dispatch_started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a controller and start connecting it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(options: ControllerOptions, hooks: Arc<HookRegistry>) -> Self {
        let controller = Self::new(options, hooks);
        controller.spawn_connect();
        controller
    }

    /// Start a background connection attempt; failures are logged
    pub fn spawn_connect(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.connect().await {
                tracing::error!(controller = %controller.name(), "Connection failed: {}", e);
            }
        });
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to output, state and fault events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    pub fn command_delay(&self) -> Duration {
        self.inner.command_delay
    }

    /// Time of the most recent session output
    pub fn last_output(&self) -> Instant {
        *lock(&self.inner.last_output)
    }

    /// Commands waiting for dispatch
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether a command stream is currently open
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.shell).is_some()
    }

    /// Viewers currently hooked to this controller
    pub fn viewers(&self) -> Vec<ViewerId> {
        self.inner.hooks.viewers_of(&self.inner.name)
    }

    /// Connect the upstream session.
    ///
    /// Only valid from `Disconnected`. On success the queue is discarded,
    /// re-seeded with the init script, and the dispatch loop is started if
    /// it is not already running.
    pub async fn connect(&self) -> Result<(), ControllerError> {
        let entered = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(ControllerError::InvalidState {
                name: self.inner.name.clone(),
                state: self.state(),
            });
        }
        self.emit(ControllerEvent::StateChanged(ConnectionState::Connecting));

        tracing::info!(
            controller = %self.inner.name,
            "Connecting via {}",
            self.inner.transport.describe()
        );

        let session = match self.inner.transport.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.emit(ControllerEvent::Fault(e.to_string()));
                return Err(e.into());
            }
        };

        self.on_ready(session).await
    }

    async fn on_ready(&self, session: SessionStream) -> Result<(), ControllerError> {
        let SessionStream {
            input,
            stdout,
            stderr,
        } = session;

        // Swap in the new session and re-seed the queue under one lock: the
        // dispatch loop either sees the old epoch with the old (absent)
        // session, or the new epoch with the new one.
        let (generation, discarded) = {
            let mut shell = lock(&self.inner.shell);
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let discarded = self.inner.queue.reset(self.inner.init_script.iter().cloned());
            *shell = Some(Arc::new(Shell {
                generation,
                writer: tokio::sync::Mutex::new(input),
            }));
            (generation, discarded)
        };
        if discarded > 0 {
            tracing::info!(
                controller = %self.inner.name,
                "Discarded {} commands queued while disconnected",
                discarded
            );
        }

        self.spawn_reader(stdout, OutputStream::Stdout, generation);
        if let Some(stderr) = stderr {
            self.spawn_reader(stderr, OutputStream::Stderr, generation);
        }

        self.set_state(ConnectionState::Ready);
        tracing::info!(controller = %self.inner.name, "Session ready");

        if !self.inner.dispatch_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(dispatch::run(self.clone()));
        }

        Ok(())
    }

    /// Queue a command for dispatch. Returns once the command is queued.
    ///
    /// Insertions are serialized, so this waits behind an earlier
    /// [`run_all`](Self::run_all) that is still resolving a deferred value.
    pub async fn run(&self, command: impl Into<Command>) -> Result<(), ControllerError> {
        self.inner.queue.add([Value::One(command.into())]).await?;
        Ok(())
    }

    /// Queue any mix of nested or deferred commands, in order
    pub async fn run_all<I>(&self, commands: I) -> Result<(), ControllerError>
    where
        I: IntoIterator<Item = Value<Command>>,
    {
        self.inner.queue.add(commands).await?;
        Ok(())
    }

    /// Write raw bytes straight into the session, bypassing the queue
    pub async fn write(&self, data: &[u8]) -> Result<(), ControllerError> {
        let shell = self
            .shell()
            .ok_or_else(|| ControllerError::NotConnected(self.inner.name.clone()))?;
        shell.write(data).await.map_err(|source| ControllerError::Write {
            name: self.inner.name.clone(),
            source,
        })
    }

    /// Attach a viewer: its input is relayed into the session and session
    /// output is relayed back to it. Any previous attachment of the viewer,
    /// to this or another controller, is removed first.
    ///
    /// Returns false when no session is open or the relays cannot be
    /// installed.
    pub fn hook(&self, viewer: &Viewer) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.inner.hooks.install(self, viewer) {
            Ok(()) => {
                tracing::info!(controller = %self.inner.name, viewer = %viewer.id(), "Viewer hooked");
                true
            }
            Err(e) => {
                tracing::debug!(controller = %self.inner.name, viewer = %viewer.id(), "Hook failed: {}", e);
                false
            }
        }
    }

    /// Detach a viewer from this controller. Returns whether a relation was
    /// removed; calling it again is a no-op.
    pub fn unhook(&self, viewer: &Viewer) -> bool {
        let removed = self.inner.hooks.remove(viewer.id(), Some(&self.inner.name));
        if removed {
            tracing::info!(controller = %self.inner.name, viewer = %viewer.id(), "Viewer unhooked");
        }
        removed
    }

    /// Stop the dispatch loop and output readers, and close the queue
    pub fn shutdown(&self) {
        tracing::info!(controller = %self.inner.name, "Shutting down");
        self.inner.shutdown.cancel();
        self.inner.queue.close();
        lock(&self.inner.shell).take();
    }

    fn shell(&self) -> Option<Arc<Shell>> {
        lock(&self.inner.shell).clone()
    }

    /// The session a command taken in queue `epoch` may be written to.
    ///
    /// `Stale` means the queue was re-seeded by a reconnect after the command
    /// was taken; it must not reach the new session. When no session is open
    /// the command is put back while still holding the session lock, so a
    /// concurrent reconnect cannot slip in between the check and the requeue.
    fn claim(&self, epoch: u64, command: Command) -> Claim {
        let shell = lock(&self.inner.shell);
        if self.inner.queue.epoch() != epoch {
            return Claim::Stale(command);
        }
        match shell.as_ref() {
            Some(shell) => Claim::Write(Arc::clone(shell), command),
            None => {
                self.inner.queue.unshift(command);
                Claim::Requeued
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(ControllerEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn touch_output(&self) {
        *lock(&self.inner.last_output) = Instant::now();
    }

    fn spawn_reader(&self, mut reader: SessionReader, stream: OutputStream, generation: u64) {
        let controller = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let read = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    read = reader.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        controller.touch_output();
                        controller.emit(ControllerEvent::Output {
                            stream,
                            data: buf[..n].to_vec(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(controller = %controller.inner.name, "Read from {:?} failed: {}", stream, e);
                        break;
                    }
                }
            }
            if stream == OutputStream::Stdout {
                controller.session_closed(generation);
            }
        });
    }

    /// The session behind `generation` ended; drop it if it is still current
    fn session_closed(&self, generation: u64) {
        let closed = {
            let mut shell = lock(&self.inner.shell);
            match shell.as_ref() {
                Some(current) if current.generation == generation => {
                    shell.take();
                    true
                }
                _ => false,
            }
        };
        if closed {
            tracing::warn!(controller = %self.inner.name, "Upstream session closed");
            if self.state() == ConnectionState::Ready {
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_gets_newline() {
        assert_eq!(Command::from("ls").to_wire().as_ref(), b"ls\n");
        assert_eq!(Command::from("ls\n").to_wire().as_ref(), b"ls\n");
    }

    #[test]
    fn test_bytes_written_verbatim() {
        let command = Command::from(&b"\x03"[..]);
        assert_eq!(command.to_wire().as_ref(), b"\x03");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
