//! HTTP gateway for the Lumilio agent core.
//!
//! Thin transport: marshals agent events to Server-Sent Events, holds
//! per-thread run locks, and wires the runtime, the watch supervisor,
//! and the dev collaborators together at startup.

pub mod api;
pub mod locks;
pub mod state;
