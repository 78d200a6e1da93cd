//! turnloop kernel.
//!
//! Small, owner-local building blocks shared by the turn orchestrator and the
//! session controller:
//!
//! - **[`registry`]** -- Name-keyed tool registry with atomic batch
//!   attach/detach.
//! - **[`barrier`]** -- Pending-output barrier tracking in-flight tool
//!   invocations for one turn.
//! - **[`bus`]** -- Publish/subscribe event bus backed by
//!   [`tokio::sync::broadcast`], with explicit [`Subscription`] handles.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! None of these types are meant to be shared across orchestrator or
//! controller instances; each owner builds its own.

pub mod barrier;
pub mod bus;
pub mod error;
pub mod registry;

pub use barrier::PendingOutputBarrier;
pub use bus::{EventBus, Subscription};
pub use error::{KernelError, Result};
pub use registry::ToolRegistry;
