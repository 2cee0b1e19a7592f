//! Client connection handling

use crate::controller::ViewerOutput;
use crate::protocol::{self, ServerMessage, PROTOCOL_VERSION};
use anyhow::{anyhow, Result};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outgoing side of a connected client
pub struct ClientConnection {
    id: Uuid,
    sender: mpsc::Sender<ServerMessage>,
}

impl ClientConnection {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send a message to the client
    pub async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| anyhow!("Client {} is gone", self.id))
    }
}

/// Write replies and relayed controller output to the client
pub async fn client_writer_task(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<ServerMessage>,
    mut output: mpsc::Receiver<ViewerOutput>,
) {
    'outer: loop {
        let messages = tokio::select! {
            reply = replies.recv() => match reply {
                Some(msg) => vec![msg],
                None => break,
            },
            Some(chunk) = output.recv() => output_messages(chunk),
        };

        for msg in &messages {
            if let Err(e) = protocol::send(&mut writer, msg).await {
                tracing::error!("Failed to write message to client: {}", e);
                break 'outer;
            }
        }
    }

    tracing::debug!("Client writer task finished");
}

fn output_messages(chunk: ViewerOutput) -> Vec<ServerMessage> {
    match chunk {
        ViewerOutput::Data {
            controller,
            stream,
            data,
        } => vec![ServerMessage::Output {
            controller,
            stream,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }],
        ViewerOutput::Unhooked { controller, missed } => vec![
            create_error_message(format!(
                "Fell {} chunks behind '{}' and was detached",
                missed, controller
            )),
            ServerMessage::Detached,
        ],
    }
}

/// Create a welcome message for a new client
pub fn create_welcome_message(session_id: Uuid) -> ServerMessage {
    ServerMessage::Welcome {
        session_id,
        protocol_version: PROTOCOL_VERSION,
    }
}

/// Create an error message
pub fn create_error_message(message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        message: message.into(),
    }
}

pub fn ack(for_command: &str) -> ServerMessage {
    ServerMessage::Ack {
        for_command: for_command.to_string(),
    }
}
