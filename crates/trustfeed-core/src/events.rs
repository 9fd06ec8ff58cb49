//! Domain events published by a running node

use crate::dbs::{ObjectState, SealState};

/// Events a [`Node`](crate::node::Node) broadcasts to its embedder
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// An inbound message was stored
    Message(ObjectState),
    /// An outbound message was delivered
    Sent(ObjectState),
    /// An outbound message was given up on
    SendAborted(ObjectState),
    /// Our seal transaction was submitted
    WroteSeal(SealState),
    /// A seal transaction was seen on chain for the first time
    ReadSeal(SealState),
    /// A seal crossed the confirmation threshold
    SealConfirmed(SealState),
    /// A successor of an object we hold was sealed, but we lack that version
    NewVersion(SealState),
    /// A background component hit an error it will not recover from by itself
    Error { component: String, message: String },
}

impl NodeEvent {
    pub fn error(component: &str, message: impl Into<String>) -> Self {
        NodeEvent::Error {
            component: component.to_string(),
            message: message.into(),
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::Message(_) => "message",
            NodeEvent::Sent(_) => "sent",
            NodeEvent::SendAborted(_) => "sendAborted",
            NodeEvent::WroteSeal(_) => "wroteSeal",
            NodeEvent::ReadSeal(_) => "readSeal",
            NodeEvent::SealConfirmed(_) => "sealConfirmed",
            NodeEvent::NewVersion(_) => "newVersion",
            NodeEvent::Error { .. } => "error",
        }
    }
}
