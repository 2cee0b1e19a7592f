//! Viewer attachment bookkeeping
//!
//! A hook relation binds one viewer to one controller through two relay
//! tasks: viewer input into the session, and session output back to the
//! viewer. The registry is keyed by [`ViewerId`], so a viewer is attached to
//! at most one controller and its relays can be removed without touching
//! anyone else's.
//!
//! Input travels over a bounded channel created per hook, so a stalled
//! session pushes back on the viewer instead of losing keystrokes. Output
//! is fanned out from the controller's broadcast; a viewer that lags past
//! its capacity is unhooked and told how much it missed.

use super::{Controller, ControllerEvent, OutputStream};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Keystroke chunks buffered per hook before senders wait
const INPUT_CAPACITY: usize = 256;

/// Stable identifier for a viewer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(Uuid);

impl ViewerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ViewerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ViewerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a hooked viewer receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerOutput {
    /// A chunk of session output
    Data {
        controller: String,
        stream: OutputStream,
        data: Vec<u8>,
    },
    /// The viewer fell behind the session and was unhooked; `missed` chunks
    /// never reached it
    Unhooked { controller: String, missed: u64 },
}

type InputSlot = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// A viewer channel: an operator's terminal that can be hooked to a
/// controller
#[derive(Clone)]
pub struct Viewer {
    id: ViewerId,
    /// Input side of the current hook, if any
    input: InputSlot,
    output: mpsc::Sender<ViewerOutput>,
}

impl Viewer {
    /// Create a viewer whose relayed output is delivered to `output`
    pub fn new(output: mpsc::Sender<ViewerOutput>) -> Self {
        Self::with_id(ViewerId::new(), output)
    }

    pub fn with_id(id: ViewerId, output: mpsc::Sender<ViewerOutput>) -> Self {
        Self {
            id,
            input: Arc::new(Mutex::new(None)),
            output,
        }
    }

    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Feed keystrokes typed by the viewer, waiting while the session is
    /// slow to take them. Returns false when the viewer is not hooked
    /// anywhere and the input went nowhere.
    pub async fn send_input(&self, data: impl Into<Vec<u8>>) -> bool {
        let sender = lock(&self.input).clone();
        match sender {
            Some(sender) => sender.send(data.into()).await.is_ok(),
            None => false,
        }
    }

    /// Whether the viewer's output side has gone away
    pub fn is_closed(&self) -> bool {
        self.output.is_closed()
    }
}

impl fmt::Debug for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Viewer").field("id", &self.id).finish()
    }
}

/// Why relays could not be installed
#[derive(Debug, Error)]
pub enum HookError {
    #[error("viewer {0} is closed")]
    ViewerClosed(ViewerId),

    #[error("no runtime to run relays on")]
    NoRuntime,
}

/// The two relays installed for one viewer
struct Relation {
    id: u64,
    controller: String,
    input_slot: InputSlot,
    input: AbortHandle,
    output: AbortHandle,
}

impl Relation {
    fn cancel(self) {
        lock(&self.input_slot).take();
        self.input.abort();
        self.output.abort();
    }
}

/// Which viewer is relaying to which controller
#[derive(Default)]
pub struct HookRegistry {
    relations: Mutex<HashMap<ViewerId, Relation>>,
    next_relation: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any relation of `viewer` with fresh relays to `controller`.
    ///
    /// The old relays are aborted before the new ones start, under the same
    /// lock, so the viewer never receives output from two controllers.
    /// Input still buffered for the old relation is dropped with it.
    pub(super) fn install(&self, controller: &Controller, viewer: &Viewer) -> Result<(), HookError> {
        if viewer.is_closed() {
            return Err(HookError::ViewerClosed(viewer.id));
        }
        let runtime = Handle::try_current().map_err(|_| HookError::NoRuntime)?;

        let mut relations = lock(&self.relations);
        if let Some(previous) = relations.remove(&viewer.id) {
            tracing::debug!(viewer = %viewer.id, controller = %previous.controller, "Replacing hook");
            previous.cancel();
        }

        let id = self.next_relation.fetch_add(1, Ordering::Relaxed);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        *lock(&viewer.input) = Some(input_tx);

        // Subscribe before spawning so nothing emitted after `hook` returns
        // is missed.
        let input = runtime
            .spawn(relay_input(controller.clone(), viewer.id, input_rx))
            .abort_handle();
        let output = runtime
            .spawn(relay_output(
                controller.clone(),
                viewer.id,
                id,
                controller.subscribe(),
                viewer.output.clone(),
            ))
            .abort_handle();

        relations.insert(
            viewer.id,
            Relation {
                id,
                controller: controller.name().to_string(),
                input_slot: Arc::clone(&viewer.input),
                input,
                output,
            },
        );
        Ok(())
    }

    /// Remove the relation of `viewer`, optionally only if it belongs to
    /// `controller`. Returns whether anything was removed.
    pub fn remove(&self, viewer: ViewerId, controller: Option<&str>) -> bool {
        let mut relations = lock(&self.relations);
        let matches = match (relations.get(&viewer), controller) {
            (Some(relation), Some(name)) => relation.controller == name,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        relations.remove(&viewer).map(Relation::cancel).is_some()
    }

    /// Drop whatever the viewer is hooked to; called when its channel closes
    pub fn release(&self, viewer: ViewerId) -> bool {
        self.remove(viewer, None)
    }

    /// Called from relation `id`'s own output relay once the viewer has
    /// lagged. Leaves that relay running so it can tell the viewer.
    fn drop_lagged(&self, viewer: ViewerId, id: u64) -> bool {
        let mut relations = lock(&self.relations);
        if relations.get(&viewer).map(|r| r.id) != Some(id) {
            return false;
        }
        match relations.remove(&viewer) {
            Some(relation) => {
                lock(&relation.input_slot).take();
                relation.input.abort();
                true
            }
            None => false,
        }
    }

    /// Name of the controller `viewer` is hooked to
    pub fn controller_of(&self, viewer: ViewerId) -> Option<String> {
        lock(&self.relations).get(&viewer).map(|r| r.controller.clone())
    }

    /// Viewers hooked to the named controller
    pub fn viewers_of(&self, controller: &str) -> Vec<ViewerId> {
        let mut viewers: Vec<ViewerId> = lock(&self.relations)
            .iter()
            .filter(|(_, r)| r.controller == controller)
            .map(|(id, _)| *id)
            .collect();
        viewers.sort();
        viewers
    }

    pub fn len(&self) -> usize {
        lock(&self.relations).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.relations).is_empty()
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        let relations = self.relations.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, relation) in relations.drain() {
            relation.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Viewer keystrokes into the session. Concurrent viewers are not ordered
/// against each other; each chunk is written whole.
async fn relay_input(controller: Controller, viewer: ViewerId, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        if let Err(e) = controller.write(&data).await {
            tracing::debug!(viewer = %viewer, "Dropped input: {}", e);
        }
    }
}

/// Session output back to the viewer. A viewer that falls too far behind
/// is unhooked rather than fed a stream with holes in it.
async fn relay_output(
    controller: Controller,
    viewer: ViewerId,
    relation: u64,
    mut events: broadcast::Receiver<ControllerEvent>,
    output: mpsc::Sender<ViewerOutput>,
) {
    let name = controller.name().to_string();
    loop {
        match events.recv().await {
            Ok(ControllerEvent::Output { stream, data }) => {
                let chunk = ViewerOutput::Data {
                    controller: name.clone(),
                    stream,
                    data,
                };
                if output.send(chunk).await.is_err() {
                    tracing::debug!(viewer = %viewer, "Viewer gone, stopping output relay");
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(
                    viewer = %viewer,
                    controller = %name,
                    "Viewer fell {} chunks behind, unhooking",
                    missed
                );
                if controller.inner.hooks.drop_lagged(viewer, relation) {
                    let _ = output
                        .send(ViewerOutput::Unhooked {
                            controller: name.clone(),
                            missed,
                        })
                        .await;
                }
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
