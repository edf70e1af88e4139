//! Protocol server collaborator
//!
//! The gateway registers its device identity and every accepted point with an
//! [`ObjectServer`]. [`BipServer`] is the BACnet/IP endpoint: it owns the UDP
//! transport, keeps the object table, and handles foreign device registration.
//! Application-layer request dispatch is left to the protocol stack sitting on
//! top of it, which reads and writes points through [`crate::Gateway`].

mod device;
mod server;
mod service;

pub use device::*;
pub use server::*;
pub use service::*;

use serde::Serialize;

use crate::point::{Point, PointIdentifier, PointKind};

/// Errors raised by the protocol collaborator
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to bind transport on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Object already registered: {0}")]
    Registration(PointIdentifier),

    #[error("Foreign device registration failed: {0}")]
    ForeignDevice(String),

    #[error("Invalid broadcast address override: {0}")]
    Broadcast(String),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static description of an object as registered with the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescriptor {
    pub object_identifier: PointIdentifier,
    pub object_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_text: Option<Vec<String>>,
}

impl From<&Point> for ObjectDescriptor {
    fn from(point: &Point) -> Self {
        let (units, state_text) = match &point.kind {
            PointKind::AnalogValue { units, .. } => (units.clone(), None),
            PointKind::MultiState { state_labels, .. } => (None, Some(state_labels.clone())),
            _ => (None, None),
        };

        Self {
            object_identifier: point.id,
            object_name: point.name.clone(),
            description: point.description.clone(),
            units,
            state_text,
        }
    }
}

/// Registration surface of a protocol server
pub trait ObjectServer: Send + Sync {
    /// Publish device-level identity metadata
    fn set_device_info(&self, info: DeviceInfo);

    /// Register an object. Rejects identifiers the server already holds.
    fn add_object(&self, object: ObjectDescriptor) -> Result<(), ProtocolError>;
}
