//! Viewer side: the push-stream client and the reconciliation store it
//! feeds.

pub mod client;
pub mod sse;
pub mod store;

pub use client::{
   ConnectionState, HubTransport, ListingSource, PushStream, PushTransport, ReconnectPolicy,
   ViewerClient, ViewerEvent,
};
pub use sse::{PushFrame, SseDecoder};
pub use store::{ApplyOutcome, NodeTree, ReconciliationStore, TreeNode};
