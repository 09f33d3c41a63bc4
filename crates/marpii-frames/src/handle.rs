use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use ash::vk;

use crate::{
    backend::{Device, ImageObject},
    cache::FrameCache,
    emitter::EmitterId,
    error::FrameError,
    frame_queue::FrameQueue,
    looper::{FrameLoop, LoopHandle},
    promise::{Payload, QueueEntry},
    queue::{AttachmentId, Queue, QueueId},
    request::{CompleteCallback, FrameRequest},
};

static FRAME_COUNTER: AtomicU64 = AtomicU64::new(0);

///Shared view of a frame, handed to attachment and pass handles.
#[derive(Clone)]
pub struct FrameContext {
    pub(crate) queue: Arc<Queue>,
    pub(crate) frame: u64,
    pub(crate) order: u64,
    pub(crate) emitter: EmitterId,
    pub(crate) extent: vk::Extent2D,
    pub(crate) generation: u64,
    pub(crate) handle: LoopHandle,
    pub(crate) required: Arc<AtomicUsize>,
}

impl FrameContext {
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    ///Unique id of the frame.
    pub fn frame_id(&self) -> u64 {
        self.frame
    }

    ///Position of the frame among all frames of its queue.
    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn emitter(&self) -> EmitterId {
        self.emitter
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    ///Number of required tasks still running.
    pub fn required_tasks(&self) -> usize {
        self.required.load(Ordering::Acquire)
    }

    ///Runs `work` on the worker pool, then `complete` on the loop thread.
    pub fn perform_in_queue(
        &self,
        work: impl FnOnce() -> bool + Send + 'static,
        complete: impl FnOnce(&mut FrameLoop, bool) + Send + 'static,
    ) {
        self.handle.perform_in_queue(work, complete);
    }

    pub fn perform_on_gl_thread(&self, f: impl FnOnce(&mut FrameLoop) + Send + 'static) {
        self.handle.perform_on_gl_thread(f);
    }

    ///Like [perform_in_queue](Self::perform_in_queue), but the frame does not complete before the task did.
    pub fn perform_required_task(
        &self,
        work: impl FnOnce() -> bool + Send + 'static,
        complete: impl FnOnce(&mut FrameLoop, bool) + Send + 'static,
    ) {
        self.required.fetch_add(1, Ordering::AcqRel);
        let required = self.required.clone();
        self.handle.perform_in_queue(work, move |lp, success| {
            complete(lp, success);
            required.fetch_sub(1, Ordering::AcqRel);
        });
    }

    ///Calls `predicate` on every loop tick until it returns true.
    pub fn schedule(&self, predicate: impl FnMut(&mut FrameLoop) -> bool + Send + 'static) {
        self.handle.schedule(predicate);
    }
}

///Everything the emitter provides to a new frame.
pub struct FrameSetup {
    pub(crate) emitter: EmitterId,
    pub(crate) generation: u64,
    pub(crate) cache: Arc<FrameCache>,
    pub(crate) handle: LoopHandle,
    pub(crate) device: Arc<dyn Device>,
    ///False while an older frame of the emitter is not submitted.
    pub(crate) in_order: bool,
}

///Attachment a frame is done with.
#[derive(Clone)]
pub struct FrameOutput {
    pub queue: QueueId,
    pub attachment: AttachmentId,
    pub image: Option<Arc<dyn ImageObject>>,
    pub layout: Option<vk::ImageLayout>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FrameUpdate {
    pub submitted: bool,
    pub completed: bool,
}

///Root of one frame.
pub struct FrameHandle {
    id: u64,
    order: u64,
    generation: u64,
    extent: vk::Extent2D,
    queues: Vec<FrameQueue>,
    in_order: bool,
    ready_for_submit: bool,
    valid: bool,
    submitted: bool,
    completed: bool,
    required: Arc<AtomicUsize>,
    on_complete: Option<CompleteCallback>,
}

impl FrameHandle {
    pub fn new(request: FrameRequest, setup: FrameSetup) -> Result<Self, FrameError> {
        let FrameRequest {
            queue,
            extent,
            inputs,
            ready_for_submit,
            swapchain,
            on_complete,
        } = request;

        if !queue.is_prepared() {
            return Err(FrameError::QueueNotPrepared(queue.name().to_owned()));
        }

        let id = FRAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let order = queue.next_frame_order();
        let required = Arc::new(AtomicUsize::new(0));
        let ctx = FrameContext {
            queue,
            frame: id,
            order,
            emitter: setup.emitter,
            extent,
            generation: setup.generation,
            handle: setup.handle,
            required: required.clone(),
        };

        let frame_queue = FrameQueue::new(0, ctx, setup.device, setup.cache, inputs, swapchain)?;

        #[cfg(feature = "logging")]
        log::trace!("Frame {} (order {}) created", id, order);

        Ok(FrameHandle {
            id,
            order,
            generation: setup.generation,
            extent,
            queues: vec![frame_queue],
            in_order: setup.in_order,
            ready_for_submit,
            valid: true,
            submitted: false,
            completed: false,
            required,
            on_complete,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    ///True once every pass was submitted, or the frame was invalidated.
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn is_ready_for_submit(&self) -> bool {
        self.in_order && self.ready_for_submit
    }

    pub fn set_ready_for_submit(&mut self, ready: bool) {
        self.ready_for_submit = ready;
    }

    pub(crate) fn set_in_order(&mut self) {
        self.in_order = true;
    }

    pub fn required_tasks(&self) -> usize {
        self.required.load(Ordering::Acquire)
    }

    pub fn set_complete_callback(&mut self, cb: impl FnOnce(&FrameHandle) + Send + 'static) {
        self.on_complete = Some(Box::new(cb));
    }

    pub fn queues(&self) -> &[FrameQueue] {
        &self.queues
    }

    ///Attachments whose last pass was submitted.
    pub fn outputs(&self) -> impl Iterator<Item = &FrameOutput> {
        self.queues.iter().flat_map(|q| q.outputs().iter())
    }

    ///Frame is done and every queue entry got finalized.
    pub fn is_finalized(&self) -> bool {
        self.completed && self.queues.iter().all(|q| q.is_finalized())
    }

    ///Cancels the frame. Completion is still reported, with [is_valid](Self::is_valid) returning false.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;

        #[cfg(feature = "logging")]
        log::debug!("Invalidating frame {}", self.id);

        for q in self.queues.iter_mut().rev() {
            q.invalidate();
        }
    }

    pub(crate) fn on_event(
        &mut self,
        queue: usize,
        entry: QueueEntry,
        ticket: u64,
        value: Option<Payload>,
    ) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.on_event(entry, ticket, value);
        }
    }

    pub(crate) fn update(&mut self) -> FrameUpdate {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let can_submit = self.is_ready_for_submit();
        for q in self.queues.iter_mut() {
            q.update(can_submit);
        }

        if self.valid && self.queues.iter().any(|q| !q.is_valid()) {
            self.invalidate();
        }

        let mut result = FrameUpdate::default();
        if !self.submitted && (!self.valid || self.queues.iter().all(|q| q.is_submitted())) {
            #[cfg(feature = "logging")]
            log::trace!("Frame {} submitted (valid: {})", self.id, self.valid);
            self.submitted = true;
            result.submitted = true;
        }

        if !self.completed
            && self.submitted
            && self.required_tasks() == 0
            && self.queues.iter().all(|q| q.is_complete() || !q.is_valid())
        {
            #[cfg(feature = "logging")]
            log::trace!("Frame {} complete (valid: {})", self.id, self.valid);
            self.completed = true;
            result.completed = true;
            if let Some(cb) = self.on_complete.take() {
                cb(self);
            }
        }

        result
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        //Dropped before it could complete, e.g. with its emitter.
        if let Some(cb) = self.on_complete.take() {
            #[cfg(feature = "logging")]
            log::debug!("Frame {} dropped before completion", self.id);
            self.valid = false;
            cb(self);
        }
    }
}
