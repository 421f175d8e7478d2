//! GPU error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::command::RecordingState;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A fence or acquire did not complete within its timeout.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: &'static str,
        /// The timeout that expired.
        timeout: Duration,
    },

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No memory type matches the resource's type bits and requested properties.
    #[error("No memory type with bits {type_bits:#b} and properties {properties:?}")]
    NoSuitableMemoryType {
        /// Acceptable memory types reported by the resource.
        type_bits: u32,
        /// Requested property flags.
        properties: vk::MemoryPropertyFlags,
    },

    /// A memory arena was initialized without an owner or explicit requirements.
    #[error("Memory arena has neither an owner nor memory requirements")]
    MissingMemoryRequirements,

    /// A bind would run past the end of the arena's allocation.
    #[error("Memory arena exhausted: {requested} bytes requested at offset {offset} of {capacity}")]
    ArenaExhausted {
        /// Current bump offset.
        offset: u64,
        /// Requested binding size.
        requested: u64,
        /// Allocation size.
        capacity: u64,
    },

    /// The resource has no entry in the arena's binding log.
    #[error("Resource not bound: {0}")]
    ResourceNotBound(String),

    /// A command was issued in a recording state that does not allow it.
    #[error("Cannot {operation} while command buffer is {state:?}")]
    InvalidCommandState {
        /// The rejected operation.
        operation: &'static str,
        /// State of the command buffer at the time.
        state: RecordingState,
    },

    /// Vertex buffers bound in one call must occupy contiguous bindings.
    #[error("Vertex bindings must be contiguous: binding {found} follows {previous}")]
    NonContiguousBindings {
        /// Binding index of the previous mesh.
        previous: u32,
        /// Binding index that broke the sequence.
        found: u32,
    },

    /// The command buffer id does not belong to this pool (or was freed).
    #[error("Command buffer is not owned by this pool")]
    UnknownCommandBuffer,

    /// A setter was called at a point where it cannot take effect.
    #[error(transparent)]
    Rejected(#[from] Rejected),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether this error is a fence or acquire timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the swapchain must be recreated before it can be used again.
    pub const fn is_out_of_date(&self) -> bool {
        matches!(self, Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

/// Reason a setter refused to apply a value.
///
/// Setters never fail loudly: the value is dropped, a warning is logged and
/// the reason is handed back so callers can react (or assert on it in tests).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    /// The object has already been initialized; its parameters are frozen.
    #[error("cannot change {0} after initialization")]
    AlreadyInitialized(&'static str),

    /// Image views over a direct handle have no owned image to keep consistent.
    #[error("cannot change {0} on a direct-handle image view")]
    DirectHandle(&'static str),

    /// Memory properties belong to the shared arena, not to the resource.
    #[error("memory properties are fixed by the shared arena")]
    SharedMemory,

    /// A view's format must match the image it was created for.
    #[error("view format {requested:?} does not match image format {image:?}")]
    FormatMismatch {
        /// Format of the viewed image.
        image: vk::Format,
        /// Format that was requested for the view.
        requested: vk::Format,
    },

    /// The image view already has a target image.
    #[error("image view target already set")]
    TargetAlreadySet,
}

/// Outcome of a setter call.
pub type SetResult = std::result::Result<(), Rejected>;

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Log a rejection at `warn` and hand it back.
pub(crate) fn reject(reason: Rejected) -> SetResult {
    tracing::warn!("Setter ignored: {reason}");
    Err(reason)
}
