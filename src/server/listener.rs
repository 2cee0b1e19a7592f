//! Unix socket listener and server main loop

use super::connection::{
    ack, client_writer_task, create_error_message, create_welcome_message, ClientConnection,
};
use super::session::OperatorSession;
use crate::auth::{controller_permission, Authorizer, Operator};
use crate::config::OperatorConfig;
use crate::controller::{ConnectionState, Controller, ControllerEvent, ControllerSet, Viewer};
use crate::protocol::{self, check_version_compatibility, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

/// Permission needed to stop the server remotely
pub const SHUTDOWN_PERMISSION: &str = "server.shutdown";

/// Buffered relayed output per client
const OUTPUT_CAPACITY: usize = 256;

/// Server state shared across connections
struct ServerState {
    controllers: Arc<ControllerSet>,
    operators: BTreeMap<String, OperatorConfig>,
    shutdown: mpsc::Sender<()>,
}

/// Unix socket server listener
pub struct ServerListener {
    socket_path: PathBuf,
    controllers: Arc<ControllerSet>,
    operators: BTreeMap<String, OperatorConfig>,
}

impl ServerListener {
    pub fn new(
        socket_path: PathBuf,
        controllers: Arc<ControllerSet>,
        operators: BTreeMap<String, OperatorConfig>,
    ) -> Self {
        Self {
            socket_path,
            controllers,
            operators,
        }
    }

    /// Check if socket already exists (another server running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the server until `shutdown_rx` fires or an operator requests it
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Server already running at {}",
                        self.socket_path.display()
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket: {:?}", self.socket_path);
                    std::fs::remove_file(&self.socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Server listening on {:?}", self.socket_path);

        let (remote_tx, mut remote_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(ServerState {
            controllers: Arc::clone(&self.controllers),
            operators: self.operators.clone(),
            shutdown: remote_tx,
        });

        let audits: Vec<_> = self
            .controllers
            .iter()
            .map(|controller| tokio::spawn(audit(controller.clone())))
            .collect();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                _ = remote_rx.recv() => {
                    tracing::info!("Shutdown requested by operator");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        for task in audits {
            task.abort();
        }
        self.cleanup().await;

        Ok(())
    }

    async fn cleanup(&self) {
        tracing::info!("Cleaning up server resources");

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::error!("Failed to remove socket file: {}", e);
            }
        }
    }
}

/// Log controller lifecycle and output for auditing
async fn audit(controller: Controller) {
    let mut events = controller.subscribe();
    loop {
        match events.recv().await {
            Ok(ControllerEvent::Output { stream, data }) => {
                tracing::trace!(
                    controller = %controller.name(),
                    "{:?}: {}",
                    stream,
                    String::from_utf8_lossy(&data)
                );
            }
            Ok(ControllerEvent::StateChanged(state)) => {
                tracing::info!(controller = %controller.name(), "State changed to {}", state);
            }
            Ok(ControllerEvent::Fault(reason)) => {
                tracing::warn!(controller = %controller.name(), "Fault: {}", reason);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(controller = %controller.name(), "Audit skipped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Handle a single client connection
async fn handle_client(stream: UnixStream, state: Arc<ServerState>) -> Result<()> {
    let peer_uid = match stream.peer_cred() {
        Ok(cred) => Some(cred.uid()),
        Err(e) => {
            tracing::warn!("Could not read peer credentials: {}", e);
            None
        }
    };
    let (mut reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel::<ServerMessage>(256);
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
    let client = ClientConnection::new(tx);
    let mut session = OperatorSession::new(
        client.id(),
        Viewer::with_id(client.id().into(), output_tx),
        peer_uid,
    );

    tracing::info!("Client connected: {}", client.id());

    let writer_handle = tokio::spawn(client_writer_task(writer, rx, output_rx));
    client.send(create_welcome_message(session.id())).await?;

    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(Some(bytes)) => match protocol::deserialize::<ClientMessage>(&bytes) {
                Ok(msg) => {
                    if let Some(response) = process_message(msg, &mut session, &state).await {
                        if let Err(e) = client.send(response).await {
                            tracing::error!("Failed to send response: {}", e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to parse message: {}", e);
                    let _ = client
                        .send(create_error_message(format!("Invalid message: {}", e)))
                        .await;
                }
            },
            Ok(None) => {
                tracing::info!("Client disconnected: {}", client.id());
                break;
            }
            Err(e) => {
                tracing::error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    // The viewer's channel is closed; its relays must not outlive it.
    state.controllers.release_viewer(session.viewer().id());

    writer_handle.abort();

    tracing::info!(
        "Client handler finished: {} (connected {}s)",
        client.id(),
        (chrono::Utc::now() - session.connected_at()).num_seconds()
    );

    Ok(())
}

/// Look up a controller the session's operator is allowed to use
fn permitted<'a>(
    state: &'a ServerState,
    operator: &Operator,
    name: &str,
) -> Result<&'a Controller, ServerMessage> {
    match state.controllers.get(name) {
        Some(controller) if operator.has_permission(&controller_permission(name)) => Ok(controller),
        // Unknown and forbidden look the same to the operator.
        _ => Err(create_error_message(format!("No such controller '{}'", name))),
    }
}

/// Process a client message and return optional response
async fn process_message(
    msg: ClientMessage,
    session: &mut OperatorSession,
    state: &Arc<ServerState>,
) -> Option<ServerMessage> {
    if let ClientMessage::Hello {
        protocol_version,
        operator,
    } = msg
    {
        // Identity is fixed for the life of a connection; hooks and
        // permissions checked so far belong to it.
        if let Some(current) = session.operator() {
            tracing::warn!(
                "Session {} tried to switch from '{}' to '{}'",
                session.id(),
                current.name(),
                operator
            );
            return Some(create_error_message(format!(
                "Already authenticated as '{}'",
                current.name()
            )));
        }
        if let Err(e) = check_version_compatibility(protocol_version, PROTOCOL_VERSION) {
            return Some(create_error_message(e.to_string()));
        }
        let Some(config) = state.operators.get(&operator) else {
            tracing::warn!("Rejected unknown operator '{}'", operator);
            return Some(create_error_message(format!("Unknown operator '{}'", operator)));
        };
        if let Some(required) = config.uid {
            if session.peer_uid() != Some(required) {
                tracing::warn!(
                    "Rejected operator '{}' from uid {:?}",
                    operator,
                    session.peer_uid()
                );
                return Some(create_error_message(format!(
                    "Operator '{}' is not available to this user",
                    operator
                )));
            }
        }
        return match Operator::from_config(&operator, config) {
            Ok(op) => {
                session.authenticate(op);
                Some(ack("Hello"))
            }
            Err(e) => Some(create_error_message(e.to_string())),
        };
    }

    let Some(operator) = session.operator() else {
        return Some(create_error_message("Say Hello first"));
    };
    let viewer = session.viewer();
    let hooks = state.controllers.hooks();

    match msg {
        ClientMessage::Hello { .. } => None,

        ClientMessage::ListControllers => {
            let attached = hooks.controller_of(viewer.id());
            Some(ServerMessage::ControllerList {
                controllers: state.controllers.info_for(operator, attached.as_deref()),
            })
        }

        ClientMessage::Attach { controller } => {
            let controller = match permitted(state, operator, &controller) {
                Ok(c) => c,
                Err(reply) => return Some(reply),
            };
            if controller.hook(viewer) {
                tracing::info!("'{}' attached to '{}'", operator.name(), controller.name());
                Some(ServerMessage::Attached {
                    controller: controller.name().to_string(),
                })
            } else {
                Some(create_error_message(format!(
                    "Controller '{}' is {}",
                    controller.name(),
                    controller.state()
                )))
            }
        }

        ClientMessage::Detach => {
            if let Some(name) = hooks.controller_of(viewer.id()) {
                if let Some(controller) = state.controllers.get(&name) {
                    controller.unhook(viewer);
                }
            }
            Some(ServerMessage::Detached)
        }

        ClientMessage::Input { data } => {
            if viewer.send_input(data).await {
                None
            } else {
                Some(create_error_message("Not attached to a controller"))
            }
        }

        ClientMessage::Run {
            controller,
            command,
        } => {
            let controller = match permitted(state, operator, &controller) {
                Ok(c) => c,
                Err(reply) => return Some(reply),
            };
            match controller.run(command).await {
                Ok(()) => Some(ack("Run")),
                Err(e) => Some(create_error_message(e.to_string())),
            }
        }

        ClientMessage::Reconnect { controller } => {
            let controller = match permitted(state, operator, &controller) {
                Ok(c) => c,
                Err(reply) => return Some(reply),
            };
            match controller.state() {
                ConnectionState::Disconnected => {
                    controller.spawn_connect();
                    Some(ack("Reconnect"))
                }
                other => Some(create_error_message(format!(
                    "Controller '{}' is {}",
                    controller.name(),
                    other
                ))),
            }
        }

        ClientMessage::Shutdown => {
            if !operator.has_permission(SHUTDOWN_PERMISSION) {
                return Some(create_error_message("Permission denied"));
            }
            tracing::info!("'{}' requested shutdown", operator.name());
            let _ = state.shutdown.try_send(());
            Some(ack("Shutdown"))
        }
    }
}
