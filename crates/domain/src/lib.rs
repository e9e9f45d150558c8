//! Shared domain types for the Lumilio agent core.
//!
//! Everything here is transport- and storage-agnostic: conversation
//! messages, tool call shapes, streaming events, asset DTOs, discovery
//! jobs, the error taxonomy, and configuration. The runtime crates
//! (`lum-agent`, `lum-discovery`) and the gateway build on these types.

pub mod asset;
pub mod chat;
pub mod config;
pub mod discovery;
pub mod error;
pub mod repository;
pub mod stream;

pub use error::{Error, Result};
