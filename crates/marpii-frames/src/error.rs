use ash::vk;
use thiserror::Error;

use crate::state::FramePassState;

///Errors and diagnostics of a [Queue](crate::Queue) definition.
///
/// Structural problems are returned by the [QueueBuilder](crate::QueueBuilder). Problems found while deriving
/// load/store operations and descriptor kinds are collected by [Queue::prepare](crate::Queue::prepare) and only logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Attachment {0} is already defined")]
    DuplicateAttachment(String),
    #[error("Pass {0} is already defined")]
    DuplicatePass(String),
    #[error("Pass {pass} uses ordering {ordering}, which is already taken by {other}")]
    DuplicateOrdering {
        pass: String,
        other: String,
        ordering: u32,
    },
    #[error("Pipeline {pipeline} is already defined in pass {pass}")]
    DuplicatePipeline { pass: String, pipeline: String },
    #[error("Attachment does not belong to this queue")]
    UnknownAttachment,
    #[error("Pass does not belong to this queue")]
    UnknownPass,
    #[error("Pass {pass} has no subpass {subpass}")]
    UnknownSubpass { pass: String, subpass: u32 },
    #[error("Attachment {attachment} is already bound to subpass {subpass} of {pass}")]
    DuplicateRole {
        attachment: String,
        pass: String,
        subpass: u32,
    },
    #[error(
        "Attachment {attachment} is bound with {first:?} and {second:?} in subpass {subpass} of {pass}"
    )]
    ConflictingLayout {
        attachment: String,
        pass: String,
        subpass: u32,
        first: vk::ImageLayout,
        second: vk::ImageLayout,
    },
    #[error("Subpass {subpass} of {pass} already has a depth-stencil attachment")]
    MultipleDepthStencil { pass: String, subpass: u32 },
    #[error("Invalid subpass dependency {src} -> {dst} in {pass}")]
    InvalidSubpassDependency { pass: String, src: u32, dst: u32 },
    #[error("Attachment {0} is not an image, but was bound as one")]
    NotAnImage(String),
    #[error("Descriptor kind of {attachment} in {pass} is ambiguous for usage {usage:?}")]
    AmbiguousDescriptorKind {
        attachment: String,
        pass: String,
        usage: vk::BufferUsageFlags,
    },
    #[error("Attachment {attachment} is read in {pass} before anything was written")]
    ReadBeforeWrite { attachment: String, pass: String },
    #[error("Attachment {0} is written, but never read")]
    WrittenNeverRead(String),
    #[error("Queue {0} is prepared already and can't be changed")]
    QueuePrepared(String),
}

///Errors reported by a [Device](crate::Device) implementation.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("Failed to create framebuffer for pass {pass} with extent {extent:?}")]
    Framebuffer { pass: String, extent: vk::Extent2D },
    #[error("Failed to create image for attachment {attachment} with extent {extent:?}")]
    Image {
        attachment: String,
        extent: vk::Extent2D,
    },
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Backend error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Attachment {0} is not marked as input")]
    NotAnInput(String),
    #[error("Attachment does not belong to the requested queue")]
    ForeignAttachment,
    #[error("Queue {0} was not prepared")]
    QueueNotPrepared(String),
    #[error("Pass can't wait for predecessor state {0:?}")]
    InvalidRequiredState(FramePassState),
    #[error("Emitter was invalidated")]
    EmitterInvalidated,
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
    #[error("No emitter with that id")]
    UnknownEmitter,
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),
}

///Top level error.
#[derive(Error, Debug)]
pub enum FramesError {
    #[error("Definition error: {0}")]
    DefinitionError(#[from] DefinitionError),
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),
    #[error("Loop error: {0}")]
    LoopError(#[from] LoopError),
}

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use super::{DefinitionError, DeviceError, FrameError, FramesError, LoopError};

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DefinitionError: Send, Sync);
        assert_impl_all!(DeviceError: Send, Sync);
        assert_impl_all!(FrameError: Send, Sync);
        assert_impl_all!(LoopError: Send, Sync);
        assert_impl_all!(FramesError: Send, Sync);
    }
}
