//! Kernel error types.
//!
//! Every variant here is an invariant violation by the caller: they are raised
//! synchronously and never retried.

/// Unified error type for the turnloop kernel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// A tool with this name is already attached.
    #[error("duplicate tool: {name}")]
    DuplicateTool { name: String },

    /// No tool with this name is attached.
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    // -- Barrier errors -----------------------------------------------------
    /// The key was already registered for the current turn.
    #[error("duplicate barrier key: {key}")]
    DuplicateKey { key: String },

    /// The key was never registered for the current turn.
    #[error("unknown barrier key: {key}")]
    UnknownKey { key: String },

    /// The key already holds an output.
    #[error("barrier key already resolved: {key}")]
    AlreadyResolved { key: String },

    /// Outputs were requested while slots are still pending.
    #[error("barrier incomplete: {pending} slot(s) pending")]
    BarrierIncomplete { pending: usize },

    // -- Bus errors ---------------------------------------------------------
    /// The bus was closed by its owner.
    #[error("event bus closed")]
    BusClosed,
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
