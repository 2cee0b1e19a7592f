//! Per-connection operator session

use crate::auth::Operator;
use crate::controller::Viewer;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// State of one connected operator terminal
pub struct OperatorSession {
    id: Uuid,

    /// Set once the client has said Hello with a known operator name
    operator: Option<Operator>,

    /// The terminal as seen by controllers
    viewer: Viewer,

    /// Uid of the connecting process, when the socket reports it
    peer_uid: Option<u32>,

    connected_at: DateTime<Utc>,
}

impl OperatorSession {
    pub fn new(id: Uuid, viewer: Viewer, peer_uid: Option<u32>) -> Self {
        Self {
            id,
            operator: None,
            viewer,
            peer_uid,
            connected_at: Utc::now(),
        }
    }

    pub fn peer_uid(&self) -> Option<u32> {
        self.peer_uid
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operator(&self) -> Option<&Operator> {
        self.operator.as_ref()
    }

    pub fn authenticate(&mut self, operator: Operator) {
        tracing::info!("Session {} authenticated as '{}'", self.id, operator.name());
        self.operator = Some(operator);
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}
