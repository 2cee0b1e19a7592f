//! The per-controller dispatch loop

use super::{Claim, Controller, ControllerError, ControllerEvent, ConnectionState};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Pause before retrying a command that found no open session
pub(super) const REQUEUE_BACKOFF: Duration = Duration::from_millis(250);

/// Run the dispatch loop until shutdown or a write fault.
///
/// A fault is reported and leaves the controller `Failed`; the loop is not
/// restarted.
pub(super) async fn run(controller: Controller) {
    tracing::info!(controller = %controller.name(), "Dispatch loop started");

    match dispatch(&controller).await {
        Ok(()) => {
            tracing::info!(controller = %controller.name(), "Dispatch loop stopped");
        }
        Err(e) => {
            tracing::error!(controller = %controller.name(), "Dispatch fault: {}", e);
            controller.emit(ControllerEvent::Fault(e.to_string()));
            controller.set_state(ConnectionState::Failed);
        }
    }
}

async fn dispatch(controller: &Controller) -> Result<(), ControllerError> {
    let inner = &controller.inner;
    let shutdown = &inner.shutdown;
    let delay = inner.command_delay;

    loop {
        let entry = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            entry = inner.queue.next_entry() => match entry {
                Some(entry) => entry,
                None => return Ok(()),
            },
        };

        // Hold off until the session has been quiet for `delay`.
        loop {
            let due = controller.last_output() + delay;
            if Instant::now() >= due {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep_until(due) => {}
            }
        }

        match controller.claim(entry.epoch, entry.value) {
            Claim::Write(shell, command) => {
                let wire = command.to_wire();
                shell
                    .write(&wire)
                    .await
                    .map_err(|source| ControllerError::Write {
                        name: inner.name.clone(),
                        source,
                    })?;
                tracing::debug!(controller = %inner.name, "Dispatched {} bytes", wire.len());

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(delay) => {}
                }
            }
            Claim::Requeued => {
                tracing::trace!(controller = %inner.name, "No session, command requeued");

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(REQUEUE_BACKOFF) => {}
                }
            }
            Claim::Stale(command) => {
                tracing::debug!(controller = %inner.name, "Dropped {:?} queued before reconnect", command);
            }
        }
    }
}
