//! Repository watch & discovery pipeline.
//!
//! One supervised session per active repository subscribes to watchman
//! over its Unix socket, persists clock tokens under the repository's
//! `.lumilio` directory, debounces rapid file mutations, and enqueues
//! idempotent discovery jobs on the `discover_asset` queue. A
//! configurable poll fallback converges discovery even when the push
//! channel silently dies.

pub mod clock;
pub mod filter;
pub mod paths;
pub mod pipeline;
pub mod poll;
pub mod session;
pub mod supervisor;
pub mod watchman;

pub use clock::ClockStore;
pub use filter::ExtensionFilter;
pub use pipeline::{DebouncePipeline, MemoryJobQueue};
pub use session::{WatchSession, WatchSessionConfig};
pub use supervisor::WatchSupervisor;
