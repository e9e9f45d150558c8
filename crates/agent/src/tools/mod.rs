//! Built-in photo tools.
//!
//! Registration is explicit so tests can assemble their own registries
//! with fakes next to (or instead of) the real tools.

pub mod bulk_like;
pub mod filter_assets;

use lum_domain::Result;

use crate::registry::ToolRegistry;

/// Register the built-in tool set.
pub fn register_builtin_tools(registry: &ToolRegistry, confirmation_threshold: u64) -> Result<()> {
    registry.register(
        filter_assets::descriptor(),
        filter_assets::factory(confirmation_threshold),
    )?;
    registry.register(bulk_like::descriptor(), bulk_like::factory())?;
    Ok(())
}
