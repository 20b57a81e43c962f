//! Gateway client: single-shot correlated RPC over WebSocket.
//!
//! Only the client contract lives here; the gateway server is an external
//! collaborator. Connections are never pooled: one call opens, handshakes,
//! requests, and closes.

pub mod rpc;
pub mod target;
pub mod wire;

pub use rpc::{call, CallOptions};
pub use target::{resolve_target, ResolvedTarget, TargetSource};
pub use wire::{Frame, WireError, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
