//! # MarpII frames
//!
//! Runtime for declarative render queues. A [Queue] describes a frame as attachments flowing through passes. Once
//! [prepared](Queue::prepare) it is shared by every frame that renders it.
//!
//! Frames are started by a [FrameEmitter] that paces them to an interval and makes sure they are submitted in order.
//! Each [FrameHandle] drives its [FrameQueue] through acquisition, preparation, submission and retirement. The GPU
//! side is hidden behind the [Device], [AttachmentHandle] and [PassHandle] traits.
//!
//! Everything that changes frame state runs on the thread that polls the [FrameLoop]. Backends report asynchronous
//! results through [Promise]s, which can be completed from any thread.
//!
//! # Features
//!
//! - `logging` (default): reports diagnostics through the `log` crate.
//! - `profiling`: instruments the hot paths with `puffin`.

pub use ash;

///Backend contract. Implemented by the GPU layer.
pub mod backend;
pub use backend::{
    AttachmentHandle, AttachmentObject, DescriptorUpdate, Device, Framebuffer,
    ImageAttachmentObject, ImageObject, ImageViewId, PassContext, PassHandle, PassImage,
    PassObject, Resource, Semaphore, SwapchainBinding,
};

///Pools framebuffers and attachment images between frames.
pub mod cache;
pub use cache::FrameCache;

pub mod emitter;
pub use emitter::{EmitterId, FrameEmitter};

mod error;
pub use error::{DefinitionError, DeviceError, FrameError, FramesError, LoopError};

pub mod frame_queue;
pub use frame_queue::FrameQueue;

pub mod handle;
pub use handle::{FrameContext, FrameHandle, FrameOutput, FrameSetup};

pub mod looper;
pub use looper::{FrameLoop, LoopConfig, LoopHandle};

pub mod promise;
pub use promise::{Callback, Promise, PromiseValue};

pub mod queue;
pub use queue::{
    Attachment, AttachmentDependency, AttachmentDescriptor, AttachmentId, AttachmentOps,
    AttachmentRef, AttachmentRole, AttachmentType, AttachmentUsage, BufferInfo, DescriptorId,
    DescriptorKind, DynamicState, ImageExtent, ImageInfo, ImageOps, PassDef, PassId, PassSlot,
    PassType, PipelineDef, Queue, QueueBuilder, QueueId, RenderOrdering, ShaderSpec, Subpass,
    SubpassAttachment, SubpassDependency,
};

pub mod request;
pub use request::{FrameRequest, InputData};

///Lifecycle states of passes and attachments within a frame.
pub mod state;
pub use state::{FrameAttachmentState, FramePassState};

///Semaphore handover between frames and the synchronization handed to a submission.
pub mod sync;
pub use sync::{ImageTransition, SyncSet, SyncWait};

#[cfg(test)]
pub(crate) mod testing;
