//! Named events on the push stream and their text wire format.

use serde::{Deserialize, Serialize};

use crate::{
   error::TransportError,
   types::{BulkUpdateMessage, SessionId, VaultId},
   viewer::sse::PushFrame,
};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_BULK_UPDATE: &str = "bulk_update";
pub const EVENT_PING: &str = "ping";
pub const EVENT_RESYNC: &str = "resync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConnectedData {
   session_id:   SessionId,
   vault:        VaultId,
   needs_resync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PingData {
   queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ResyncData {
   vault: VaultId,
}

/// One event pushed from the hub to a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
   /// Session established. `needs_resync` tells the viewer to discard its
   /// tree for the vault and refetch the root.
   Connected { session_id: SessionId, vault: VaultId, needs_resync: bool },
   BulkUpdate(BulkUpdateMessage),
   /// Keep-alive carrying the session's outbound queue depth.
   Ping { queue_depth: usize },
   /// Events were lost upstream; the viewer must refetch the vault.
   Resync { vault: VaultId },
}

impl PushEvent {
   pub const fn event_name(&self) -> &'static str {
      match self {
         Self::Connected { .. } => EVENT_CONNECTED,
         Self::BulkUpdate(_) => EVENT_BULK_UPDATE,
         Self::Ping { .. } => EVENT_PING,
         Self::Resync { .. } => EVENT_RESYNC,
      }
   }

   pub fn data_json(&self) -> serde_json::Result<String> {
      match self {
         Self::Connected { session_id, vault, needs_resync } => {
            serde_json::to_string(&ConnectedData {
               session_id:   *session_id,
               vault:        vault.clone(),
               needs_resync: *needs_resync,
            })
         },
         Self::BulkUpdate(msg) => serde_json::to_string(msg),
         Self::Ping { queue_depth } => serde_json::to_string(&PingData { queue_depth: *queue_depth }),
         Self::Resync { vault } => serde_json::to_string(&ResyncData { vault: vault.clone() }),
      }
   }

   /// Encodes the event as one `event:`/`data:` frame terminated by a blank
   /// line.
   pub fn to_sse_frame(&self) -> serde_json::Result<String> {
      Ok(format!("event: {}\ndata: {}\n\n", self.event_name(), self.data_json()?))
   }

   /// Decodes a received frame. Unknown event names yield `Ok(None)`.
   pub fn from_frame(frame: &PushFrame) -> Result<Option<Self>, TransportError> {
      let malformed = |e: serde_json::Error| {
         TransportError::Malformed(format!("{} payload: {}", frame.event, e))
      };
      let event = match frame.event.as_str() {
         EVENT_CONNECTED => {
            let d: ConnectedData = serde_json::from_str(&frame.data).map_err(malformed)?;
            Self::Connected {
               session_id:   d.session_id,
               vault:        d.vault,
               needs_resync: d.needs_resync,
            }
         },
         EVENT_BULK_UPDATE => Self::BulkUpdate(serde_json::from_str(&frame.data).map_err(malformed)?),
         EVENT_PING => {
            let d: PingData = serde_json::from_str(&frame.data).map_err(malformed)?;
            Self::Ping { queue_depth: d.queue_depth }
         },
         EVENT_RESYNC => {
            let d: ResyncData = serde_json::from_str(&frame.data).map_err(malformed)?;
            Self::Resync { vault: d.vault }
         },
         _ => return Ok(None),
      };
      Ok(Some(event))
   }
}
