//! Per-frame lifecycle states.
//!
//! Both enums have a stable ordering. A requirement like "predecessor reached `Submitted`" is checked via `>=`.

///Lifecycle of one pass within a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FramePassState {
    #[default]
    Initial,
    ///All predecessors reached their required state, every referenced attachment is ready.
    Ready,
    ///The pass object is owned by this frame.
    Owned,
    ///Images and framebuffer are bound.
    ResourcesAcquired,
    ///Pass finished its `prepare` step.
    Prepared,
    ///Pass is allowed to submit.
    Submission,
    Submitted,
    Complete,
    Finalized,
}

impl FramePassState {
    ///Returns true if a pass may depend on another pass reaching `self`.
    pub fn is_valid_requirement(&self) -> bool {
        *self != FramePassState::Finalized
    }
}

///Lifecycle of one attachment within a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FrameAttachmentState {
    #[default]
    Initial,
    ///Setup was requested from the attachment handle.
    Setup,
    ///Attachment waits for producer input.
    InputRequired,
    Ready,
    ///A swapchain image was requested, but not yet delivered.
    ResourcesPending,
    ResourcesAcquired,
    ///Last pass was submitted. The attachment is handed to the frame as output.
    Detached,
    Complete,
    ResourcesReleased,
    Finalized,
}
