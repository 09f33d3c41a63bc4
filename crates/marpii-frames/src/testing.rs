//! Scripted backend used by the tests.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use ash::vk;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::{
    backend::{
        AttachmentHandle, AttachmentObject, Device, Framebuffer, ImageAttachmentObject,
        ImageObject, ImageViewId, PassContext, PassHandle, PassObject, Resource, Semaphore,
        SwapchainBinding,
    },
    error::DeviceError,
    handle::FrameContext,
    looper::{FrameLoop, LoopConfig},
    promise::{Callback, Promise},
    queue::{Attachment, AttachmentId, DescriptorKind, PassDef, PassId, Queue},
    request::InputData,
    sync::SyncSet,
};

pub(crate) struct MockDevice {
    pub framebuffers: AtomicUsize,
    pub images: AtomicUsize,
    pub semaphores: AtomicUsize,
    pub compiles: AtomicUsize,
    pub update_after_bind: bool,
    pub next_view: AtomicU64,
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice {
            framebuffers: AtomicUsize::new(0),
            images: AtomicUsize::new(0),
            semaphores: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            update_after_bind: false,
            next_view: AtomicU64::new(1),
        }
    }
}

impl MockDevice {
    pub fn next_view(&self) -> ImageViewId {
        ImageViewId(self.next_view.fetch_add(1, Ordering::SeqCst))
    }

    ///Framebuffer that is not counted as created by the device.
    pub fn framebuffer(&self, views: &[ImageViewId], extent: vk::Extent2D) -> Arc<dyn Framebuffer> {
        Arc::new(MockFramebuffer {
            views: views.to_vec(),
            extent,
        })
    }
}

impl Device for MockDevice {
    fn make_framebuffer(
        &self,
        _pass: &PassDef,
        views: &[ImageViewId],
        extent: vk::Extent2D,
    ) -> Result<Arc<dyn Framebuffer>, DeviceError> {
        self.framebuffers.fetch_add(1, Ordering::SeqCst);
        Ok(self.framebuffer(views, extent))
    }

    fn make_image(
        &self,
        attachment: &Attachment,
        extent: vk::Extent2D,
    ) -> Result<ImageAttachmentObject, DeviceError> {
        self.images.fetch_add(1, Ordering::SeqCst);
        let format = attachment
            .image_info()
            .map(|i| i.format)
            .unwrap_or(vk::Format::UNDEFINED);
        Ok(ImageAttachmentObject::new(
            Arc::new(MockImage::new(self.next_view(), format)),
            extent,
            Arc::new(MockSemaphore::default()),
        ))
    }

    fn make_semaphore(&self) -> Arc<dyn Semaphore> {
        self.semaphores.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockSemaphore::default())
    }

    fn compile_render_queue(&self, _queue: &Arc<Queue>, cb: Callback) {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        cb.complete(true);
    }

    fn compile_resource(&self, _resource: Arc<dyn Resource>, cb: Callback) {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        cb.complete(true);
    }

    fn supports_update_after_bind(&self, _kind: DescriptorKind) -> bool {
        self.update_after_bind
    }
}

pub(crate) struct MockFramebuffer {
    views: Vec<ImageViewId>,
    extent: vk::Extent2D,
}

impl Framebuffer for MockFramebuffer {
    fn views(&self) -> &[ImageViewId] {
        &self.views
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

pub(crate) struct MockImage {
    view: ImageViewId,
    format: vk::Format,
}

impl MockImage {
    pub fn new(view: ImageViewId, format: vk::Format) -> Self {
        MockImage { view, format }
    }
}

impl ImageObject for MockImage {
    fn view(&self) -> ImageViewId {
        self.view
    }

    fn format(&self) -> vk::Format {
        self.format
    }
}

#[derive(Default)]
pub(crate) struct MockSemaphore {
    signaled: AtomicBool,
    waited: AtomicBool,
}

impl MockSemaphore {
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
    }

    pub fn wait(&self) {
        self.waited.store(true, Ordering::SeqCst);
    }
}

impl Semaphore for MockSemaphore {
    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    fn is_waited(&self) -> bool {
        self.waited.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.signaled.store(false, Ordering::SeqCst);
        self.waited.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct MockResource(pub String);

impl Resource for MockResource {
    fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Default)]
pub(crate) struct AttachmentStats {
    pub setups: AtomicUsize,
    pub inputs: AtomicUsize,
    pub finalized: AtomicUsize,
    pub successful: AtomicUsize,
    pub last_input: Mutex<Option<u32>>,
}

#[derive(Default)]
pub(crate) struct MockAttachmentObject {
    pub stats: Arc<AttachmentStats>,
    ///Setup completes its callback instead of returning synchronously.
    pub async_setup: bool,
}

impl AttachmentObject for MockAttachmentObject {
    fn make_frame_handle(
        &self,
        _frame: &FrameContext,
        _attachment: AttachmentId,
    ) -> Box<dyn AttachmentHandle> {
        Box::new(MockAttachmentHandle {
            stats: self.stats.clone(),
            async_setup: self.async_setup,
        })
    }
}

struct MockAttachmentHandle {
    stats: Arc<AttachmentStats>,
    async_setup: bool,
}

impl AttachmentHandle for MockAttachmentHandle {
    fn setup(&mut self, _frame: &FrameContext, cb: Callback) -> bool {
        self.stats.setups.fetch_add(1, Ordering::SeqCst);
        if self.async_setup {
            cb.complete(true);
            false
        } else {
            true
        }
    }

    fn submit_input(&mut self, _frame: &FrameContext, data: InputData, _cb: Callback) -> bool {
        self.stats.inputs.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_input.lock() = data.downcast_ref::<u32>().copied();
        true
    }

    fn finalize(&mut self, _frame: &FrameContext, successful: bool) {
        self.stats.finalized.fetch_add(1, Ordering::SeqCst);
        if successful {
            self.stats.successful.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PrepareMode {
    #[default]
    Sync,
    ///Rejects the prepare callback.
    Fail,
    ///Parks the callback in [PassStats::deferred].
    Deferred,
}

#[derive(Default)]
pub(crate) struct PassStats {
    pub prepares: AtomicUsize,
    pub submits: AtomicUsize,
    pub finalized: AtomicUsize,
    pub successful: AtomicUsize,
    pub deferred: Mutex<Vec<Callback>>,
    ///Waits, signals and transitions of the last submission.
    pub last_sync: Mutex<Option<(usize, usize, usize)>>,
    pub last_descriptors: Mutex<usize>,
    pub last_extent: Mutex<Option<vk::Extent2D>>,
}

impl PassStats {
    ///Completes every parked prepare callback.
    pub fn finish_deferred(&self, success: bool) -> usize {
        let parked: Vec<Callback> = self.deferred.lock().drain(..).collect();
        let count = parked.len();
        for cb in parked {
            cb.complete(success);
        }
        count
    }
}

#[derive(Default)]
pub(crate) struct MockPassObject {
    pub stats: Arc<PassStats>,
    pub prepare: PrepareMode,
    pub is_async: bool,
    ///If set, prepare starts a required task that runs until the sender sends or is dropped.
    pub gate: Option<Receiver<()>>,
    ///Shared between passes to record the order of calls, as `prepare:<name>` and `submit:<name>`.
    pub log: Arc<Mutex<Vec<String>>>,
}

impl MockPassObject {
    pub fn with_log(log: Arc<Mutex<Vec<String>>>, prepare: PrepareMode) -> Self {
        MockPassObject {
            prepare,
            log,
            ..Default::default()
        }
    }
}

impl PassObject for MockPassObject {
    fn make_frame_handle(&self, frame: &FrameContext, pass: PassId) -> Box<dyn PassHandle> {
        let name = frame
            .queue()
            .pass(pass)
            .map(|p| p.name().to_owned())
            .unwrap_or_default();
        Box::new(MockPassHandle {
            name,
            stats: self.stats.clone(),
            prepare: self.prepare,
            is_async: self.is_async,
            gate: self.gate.clone(),
            log: self.log.clone(),
        })
    }
}

struct MockPassHandle {
    name: String,
    stats: Arc<PassStats>,
    prepare: PrepareMode,
    is_async: bool,
    gate: Option<Receiver<()>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl PassHandle for MockPassHandle {
    fn is_async(&self) -> bool {
        self.is_async
    }

    fn prepare(&mut self, pass: &PassContext, cb: Callback) -> bool {
        self.stats.prepares.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_descriptors.lock() = pass.descriptors.len();
        *self.stats.last_extent.lock() = Some(pass.extent);
        if let Some(gate) = self.gate.clone() {
            pass.frame
                .perform_required_task(move || gate.recv().is_ok(), |_, _| {});
        }
        self.log.lock().push(format!("prepare:{}", self.name));
        match self.prepare {
            PrepareMode::Sync => true,
            PrepareMode::Fail => {
                cb.complete(false);
                false
            }
            PrepareMode::Deferred => {
                self.stats.deferred.lock().push(cb);
                false
            }
        }
    }

    fn submit(
        &mut self,
        _pass: &PassContext,
        sync: SyncSet,
        on_submitted: Callback,
        on_complete: Callback,
    ) {
        self.stats.submits.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_sync.lock() =
            Some((sync.waits.len(), sync.signals.len(), sync.transitions.len()));
        self.log.lock().push(format!("submit:{}", self.name));
        on_submitted.complete(true);
        on_complete.complete(true);
    }

    fn finalize(&mut self, _frame: &FrameContext, successful: bool) {
        self.stats.finalized.fetch_add(1, Ordering::SeqCst);
        if successful {
            self.stats.successful.fetch_add(1, Ordering::SeqCst);
        }
    }
}

///Hands out fresh images and counts what comes back.
#[derive(Default)]
pub(crate) struct MockSwapchain {
    pub acquired: AtomicUsize,
    pub presented: AtomicUsize,
    pub discarded: AtomicUsize,
    next_view: AtomicU64,
}

impl SwapchainBinding for MockSwapchain {
    fn acquire_image(
        &self,
        _frame: &FrameContext,
        _attachment: AttachmentId,
        extent: vk::Extent2D,
        promise: Promise<ImageAttachmentObject>,
    ) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let view = ImageViewId(1000 + self.next_view.fetch_add(1, Ordering::SeqCst));
        promise.fulfil(ImageAttachmentObject::new(
            Arc::new(MockImage::new(view, vk::Format::B8G8R8A8_SRGB)),
            extent,
            Arc::new(MockSemaphore::default()),
        ));
    }

    fn release_image(&self, _image: ImageAttachmentObject, presentable: bool) {
        if presentable {
            self.presented.fetch_add(1, Ordering::SeqCst);
        } else {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub(crate) fn test_loop(device: Arc<MockDevice>) -> FrameLoop {
    #[cfg(feature = "logging")]
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();

    FrameLoop::new(
        device,
        LoopConfig {
            worker_threads: 2,
            ..Default::default()
        },
    )
    .unwrap()
}
