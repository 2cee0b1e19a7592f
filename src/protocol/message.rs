//! Message types for the procraft operator protocol

use crate::controller::{ConnectionState, OutputStream};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake with protocol version and operator name
    Hello {
        protocol_version: u32,
        operator: String,
    },

    /// Request the controllers this operator may use
    ListControllers,

    /// Hook this connection to a controller
    Attach { controller: String },

    /// Unhook from the current controller
    Detach,

    /// Keystrokes for the attached controller
    Input { data: Vec<u8> },

    /// Queue a command on a controller without attaching
    Run { controller: String, command: String },

    /// Connect a controller that is currently disconnected
    Reconnect { controller: String },

    /// Graceful shutdown request
    Shutdown,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response
    Welcome {
        session_id: Uuid,
        protocol_version: u32,
    },

    /// Output relayed from the attached controller
    Output {
        controller: String,
        stream: OutputStream,
        data: Vec<u8>,
        timestamp: i64,
    },

    /// Controller list response
    ControllerList { controllers: Vec<ControllerInfo> },

    /// Now hooked to a controller
    Attached { controller: String },

    /// No longer hooked
    Detached,

    /// Error response
    Error { message: String },

    /// Acknowledgment (for commands that need confirmation)
    Ack { for_command: String },
}

/// Controller status for list responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub name: String,
    pub state: ConnectionState,
    pub queued: usize,
    pub viewers: usize,
    pub is_attached: bool,
}
