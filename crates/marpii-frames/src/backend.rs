//! Contract between the frame runtime and a GPU backend.
//!
//! The runtime never touches GPU objects directly. It asks the [Device] for framebuffers, images and semaphores, and
//! drives per-frame [AttachmentHandle]s and [PassHandle]s that do the actual work.

use std::sync::Arc;

use ash::vk;

use crate::{
    error::{DeviceError, FrameError},
    handle::{FrameContext, FrameHandle, FrameSetup},
    promise::{Callback, Promise},
    queue::{
        Attachment, AttachmentId, DescriptorId, DescriptorKind, ImageOps, PassDef, PassId, Queue,
    },
    request::{FrameRequest, InputData},
    sync::SyncSet,
};

///Identity of an image view. Framebuffers are cached by the views they are built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageViewId(pub u64);

pub trait Semaphore: Send + Sync {
    fn is_signaled(&self) -> bool;
    fn is_waited(&self) -> bool;
    ///Makes the semaphore usable as a fresh signal.
    fn reset(&self);
}

pub trait ImageObject: Send + Sync {
    fn view(&self) -> ImageViewId;
    fn format(&self) -> vk::Format;
}

pub trait Framebuffer: Send + Sync {
    fn views(&self) -> &[ImageViewId];
    fn extent(&self) -> vk::Extent2D;
}

///Anything the device can compile outside of a frame, e.g. materials.
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;
}

///Image backing an attachment for one frame, with the semaphores that hand it over between frames.
pub struct ImageAttachmentObject {
    pub image: Arc<dyn ImageObject>,
    pub extent: vk::Extent2D,
    ///Layout the image is currently in.
    pub layout: vk::ImageLayout,
    ///Signaled by the last frame that wrote the image. The first pass using it waits for it.
    pub wait_sem: Option<Arc<dyn Semaphore>>,
    ///Signaled by the last pass of this frame using the image.
    pub signal_sem: Option<Arc<dyn Semaphore>>,
    ///Swapchain images are returned to their [SwapchainBinding] instead of being cached.
    pub is_swapchain_image: bool,
}

impl ImageAttachmentObject {
    pub fn new(
        image: Arc<dyn ImageObject>,
        extent: vk::Extent2D,
        signal: Arc<dyn Semaphore>,
    ) -> Self {
        ImageAttachmentObject {
            image,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
            wait_sem: None,
            signal_sem: Some(signal),
            is_swapchain_image: false,
        }
    }

    pub fn view(&self) -> ImageViewId {
        self.image.view()
    }
}

///GPU backend. Shared between the loop thread and worker threads.
pub trait Device: Send + Sync {
    ///Creates the root object of a new frame. Backends that need per-frame state can wrap the default.
    fn make_frame(&self, request: FrameRequest, setup: FrameSetup) -> Result<FrameHandle, FrameError> {
        FrameHandle::new(request, setup)
    }

    fn make_framebuffer(
        &self,
        pass: &PassDef,
        views: &[ImageViewId],
        extent: vk::Extent2D,
    ) -> Result<Arc<dyn Framebuffer>, DeviceError>;

    ///Creates a new image for `attachment`, including its signal semaphore.
    fn make_image(
        &self,
        attachment: &Attachment,
        extent: vk::Extent2D,
    ) -> Result<ImageAttachmentObject, DeviceError>;

    fn make_semaphore(&self) -> Arc<dyn Semaphore>;

    ///Compiles pipelines and render passes of a prepared queue.
    fn compile_render_queue(&self, queue: &Arc<Queue>, cb: Callback);

    fn compile_resource(&self, resource: Arc<dyn Resource>, cb: Callback);

    fn supports_update_after_bind(&self, kind: DescriptorKind) -> bool;
}

///Backend side of an attachment. Creates one handle per frame.
pub trait AttachmentObject: Send + Sync {
    fn make_frame_handle(
        &self,
        frame: &FrameContext,
        attachment: AttachmentId,
    ) -> Box<dyn AttachmentHandle>;
}

///Per-frame state of an attachment.
///
/// Methods that take a [Callback] return true if they finished synchronously. In that case the callback is ignored.
pub trait AttachmentHandle: Send {
    fn setup(&mut self, frame: &FrameContext, cb: Callback) -> bool;

    ///Accepts producer data for an input attachment.
    fn submit_input(&mut self, frame: &FrameContext, data: InputData, cb: Callback) -> bool;

    ///Releases per-frame resources. Called exactly once.
    fn finalize(&mut self, _frame: &FrameContext, _successful: bool) {}

    fn get_descriptor_array_size(
        &self,
        _frame: &FrameContext,
        _pass: PassId,
        _descriptor: DescriptorId,
        _is_external: bool,
    ) -> u32 {
        1
    }

    ///Returns true if slot `index` of the descriptor has to be rebound.
    fn is_descriptor_dirty(
        &self,
        _frame: &FrameContext,
        _pass: PassId,
        _descriptor: DescriptorId,
        _index: u32,
        _is_external: bool,
    ) -> bool {
        true
    }
}

///Handle used for attachments without an [AttachmentObject]. Accepts and drops any input.
pub(crate) struct GenericAttachmentHandle;

impl AttachmentHandle for GenericAttachmentHandle {
    fn setup(&mut self, _frame: &FrameContext, _cb: Callback) -> bool {
        true
    }

    fn submit_input(&mut self, _frame: &FrameContext, _data: InputData, _cb: Callback) -> bool {
        true
    }
}

///Backend side of a pass. Shared by all frames, access is serialized by the pass' [PassSlot](crate::PassSlot).
pub trait PassObject: Send + Sync {
    fn make_frame_handle(&self, frame: &FrameContext, pass: PassId) -> Box<dyn PassHandle>;
}

///Image bound to a pass.
#[derive(Clone)]
pub struct PassImage {
    pub attachment: AttachmentId,
    pub image: Arc<dyn ImageObject>,
    pub view: ImageViewId,
    pub ops: Option<ImageOps>,
}

///Descriptor slot that needs to be (re)bound before the pass records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorUpdate {
    pub attachment: AttachmentId,
    pub descriptor: DescriptorId,
    pub kind: DescriptorKind,
    pub index: u32,
}

///Everything a pass needs to prepare and submit its work for one frame.
#[derive(Clone)]
pub struct PassContext {
    pub frame: FrameContext,
    pub pass: PassId,
    pub extent: vk::Extent2D,
    pub framebuffer: Option<Arc<dyn Framebuffer>>,
    pub images: Vec<PassImage>,
    pub descriptors: Vec<DescriptorUpdate>,
}

///Per-frame state of a pass.
pub trait PassHandle: Send {
    fn is_available(&self, _frame: &FrameContext) -> bool {
        true
    }

    ///Async passes don't take the pass slot and are not held back by the frame's submission order.
    fn is_async(&self) -> bool {
        false
    }

    ///Records the pass. Returns true if done synchronously, otherwise `cb` is completed.
    fn prepare(&mut self, pass: &PassContext, cb: Callback) -> bool;

    ///Enqueues the pass on the GPU. `on_submitted` is completed once the work is queued, `on_complete` once it
    /// finished executing. Called at most once per frame.
    fn submit(
        &mut self,
        pass: &PassContext,
        sync: SyncSet,
        on_submitted: Callback,
        on_complete: Callback,
    );

    fn finalize(&mut self, _frame: &FrameContext, _successful: bool) {}
}

///Source of presentable images for one attachment of a frame.
pub trait SwapchainBinding: Send + Sync {
    fn acquire_image(
        &self,
        frame: &FrameContext,
        attachment: AttachmentId,
        extent: vk::Extent2D,
        promise: Promise<ImageAttachmentObject>,
    );

    ///Takes the image back. `presentable` is false if the frame was invalidated.
    fn release_image(&self, image: ImageAttachmentObject, presentable: bool);
}
