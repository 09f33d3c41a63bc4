//! Per-frame working state of a [Queue](crate::Queue).
//!
//! A [FrameQueue] drives every attachment and pass of one frame through its lifecycle. All transitions happen on the
//! loop thread. Asynchronous backend work is tracked by tickets: an entry that waits for a result remembers the ticket
//! of the promise it handed out, and ignores every result carrying another ticket.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use ash::vk;
use slotmap::SecondaryMap;
use smallvec::SmallVec;

use crate::{
    backend::{
        AttachmentHandle, DescriptorUpdate, Device, GenericAttachmentHandle, ImageAttachmentObject,
        ImageViewId, PassContext, PassHandle, PassImage, SwapchainBinding,
    },
    cache::FrameCache,
    error::FrameError,
    handle::{FrameContext, FrameOutput},
    promise::{Payload, Promise, PromiseValue, QueueEntry, Route},
    queue::{AttachmentId, AttachmentUsage, DescriptorId, DescriptorKind, PassId, PassType},
    request::InputData,
    state::{FrameAttachmentState, FramePassState},
    sync::{ImageTransition, SyncSet, SyncWait},
};

struct AttachmentEntry {
    handle: Box<dyn AttachmentHandle>,
    state: FrameAttachmentState,
    ///Ticket of the result this entry waits for.
    waiting: Option<u64>,
    input: Option<InputData>,
    image: Option<ImageAttachmentObject>,
    ///The image's wait semaphore was handed to a pass.
    wait_consumed: bool,
    ///Pass of the attachment's last descriptor.
    last_pass: Option<PassId>,
    ///State every pass using the attachment has to reach before its image is released.
    release_state: FramePassState,
    released: bool,
}

struct PassEntry {
    handle: Box<dyn PassHandle>,
    state: FramePassState,
    waiting: Option<u64>,
    extent: vk::Extent2D,
    ///Predecessors and the state each of them has to reach before this pass becomes ready.
    requirements: SmallVec<[(PassId, FramePassState); 4]>,
    ///Passes that wait for this pass to reach a state.
    waiters: AHashMap<FramePassState, Vec<PassId>>,
    attachments: SmallVec<[(AttachmentId, DescriptorId); 4]>,
    context: Option<PassContext>,
    sync: SyncSet,
    owns_slot: bool,
    waits_for_slot: bool,
    submit_called: bool,
    submitted_ticket: Option<u64>,
    complete_ticket: Option<u64>,
    gpu_complete: bool,
}

impl PassEntry {
    fn is_pending(&self) -> bool {
        self.waiting.is_some() || self.submitted_ticket.is_some() || self.complete_ticket.is_some()
    }
}

///State machine of one queue within one frame.
pub struct FrameQueue {
    index: usize,
    ctx: FrameContext,
    device: Arc<dyn Device>,
    cache: Arc<FrameCache>,
    swapchain: Option<(AttachmentId, Arc<dyn SwapchainBinding>)>,
    attachments: SecondaryMap<AttachmentId, AttachmentEntry>,
    passes: SecondaryMap<PassId, PassEntry>,
    next_ticket: u64,
    setup_done: bool,
    valid: bool,
    complete: bool,
    ///Every entry reached [Finalized](FramePassState::Finalized).
    finished: bool,
    outputs: Vec<FrameOutput>,
}

impl FrameQueue {
    pub(crate) fn new(
        index: usize,
        ctx: FrameContext,
        device: Arc<dyn Device>,
        cache: Arc<FrameCache>,
        mut inputs: AHashMap<AttachmentId, InputData>,
        swapchain: Option<(AttachmentId, Arc<dyn SwapchainBinding>)>,
    ) -> Result<Self, FrameError> {
        let queue = ctx.queue.clone();

        let mut attachments = SecondaryMap::new();
        for (id, att) in queue.attachments() {
            let handle: Box<dyn AttachmentHandle> = match att.object() {
                Some(object) => object.make_frame_handle(&ctx, id),
                None => Box::new(GenericAttachmentHandle),
            };
            let last = att.descriptors().last().and_then(|d| queue.descriptor(*d));
            let release_state = last
                .map(|d| d.dependency.required_state)
                .unwrap_or_default()
                .max(FramePassState::Submitted);

            attachments.insert(
                id,
                AttachmentEntry {
                    handle,
                    state: FrameAttachmentState::Initial,
                    waiting: None,
                    input: inputs.remove(&id),
                    image: None,
                    wait_consumed: false,
                    last_pass: last.map(|d| d.pass),
                    release_state,
                    released: false,
                },
            );
        }

        let mut passes = SecondaryMap::new();
        for &id in queue.pass_order() {
            let Some(def) = queue.pass(id) else {
                continue;
            };

            let mut requirements: SmallVec<[(PassId, FramePassState); 4]> = SmallVec::new();
            let mut pass_attachments = SmallVec::new();
            for &d in def.descriptors() {
                let Some(desc) = queue.descriptor(d) else {
                    continue;
                };
                pass_attachments.push((desc.attachment, d));

                let required = desc.dependency.required_state;
                if !required.is_valid_requirement() {
                    return Err(FrameError::InvalidRequiredState(required));
                }

                let Some(att) = queue.attachment(desc.attachment) else {
                    continue;
                };
                for earlier in att.descriptors().iter().take_while(|e| **e != d) {
                    let Some(pred) = queue.descriptor(*earlier).map(|e| e.pass) else {
                        continue;
                    };
                    if pred == id {
                        continue;
                    }
                    match requirements.iter_mut().find(|(p, _)| *p == pred) {
                        Some((_, state)) => *state = (*state).max(required),
                        None => requirements.push((pred, required)),
                    }
                }
            }
            requirements.sort_unstable_by_key(|(_, state)| *state);

            passes.insert(
                id,
                PassEntry {
                    handle: def.object().make_frame_handle(&ctx, id),
                    state: FramePassState::Initial,
                    waiting: None,
                    extent: def.extent(&queue, ctx.extent),
                    requirements,
                    waiters: AHashMap::default(),
                    attachments: pass_attachments,
                    context: None,
                    sync: SyncSet::default(),
                    owns_slot: false,
                    waits_for_slot: false,
                    submit_called: false,
                    submitted_ticket: None,
                    complete_ticket: None,
                    gpu_complete: false,
                },
            );
        }

        let edges: Vec<(PassId, FramePassState, PassId)> = passes
            .iter()
            .flat_map(|(waiter, entry)| {
                entry
                    .requirements
                    .iter()
                    .map(move |(pred, state)| (*pred, *state, waiter))
            })
            .collect();
        for (pred, state, waiter) in edges {
            if let Some(entry) = passes.get_mut(pred) {
                entry.waiters.entry(state).or_default().push(waiter);
            }
        }

        Ok(FrameQueue {
            index,
            ctx,
            device,
            cache,
            swapchain,
            attachments,
            passes,
            next_ticket: 0,
            setup_done: false,
            valid: true,
            complete: false,
            finished: false,
            outputs: Vec::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn context(&self) -> &FrameContext {
        &self.ctx
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    ///True once every pass was submitted, or the queue was invalidated.
    pub fn is_submitted(&self) -> bool {
        !self.valid
            || (self.setup_done
                && self
                    .passes
                    .values()
                    .all(|p| p.state >= FramePassState::Submitted))
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_finalized(&self) -> bool {
        self.finished
    }

    ///Attachments whose last pass was submitted.
    pub fn outputs(&self) -> &[FrameOutput] {
        &self.outputs
    }

    pub fn attachment_state(&self, attachment: AttachmentId) -> Option<FrameAttachmentState> {
        self.attachments.get(attachment).map(|a| a.state)
    }

    pub fn pass_state(&self, pass: PassId) -> Option<FramePassState> {
        self.passes.get(pass).map(|p| p.state)
    }

    fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn promise<T: PromiseValue>(&self, entry: QueueEntry, ticket: u64) -> Promise<T> {
        Promise::new(
            self.ctx.handle.sender(),
            Route::Frame {
                emitter: self.ctx.emitter,
                frame: self.ctx.frame,
                queue: self.index,
                entry,
            },
            ticket,
        )
    }

    ///Advances every entry as far as possible. Passes only submit if `can_submit` is set, or if they are async.
    pub(crate) fn update(&mut self, can_submit: bool) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if !self.valid || self.complete {
            self.try_finalize();
            return;
        }

        if !self.setup_done {
            self.setup_attachments();
        }
        if self.valid {
            self.process_inputs();
        }
        if self.valid {
            self.advance_passes(can_submit);
        }
        if self.valid {
            self.release_images();
            self.check_completion();
        }
        if !self.valid || self.complete {
            self.try_finalize();
        }
    }

    fn setup_attachments(&mut self) {
        self.setup_done = true;
        let ids: Vec<AttachmentId> = self.attachments.keys().collect();
        for id in ids {
            let ticket = self.next_ticket();
            let cb = self.promise(QueueEntry::AttachmentSetup(id), ticket);
            let Some(entry) = self.attachments.get_mut(id) else {
                continue;
            };
            entry.state = FrameAttachmentState::Setup;
            if entry.handle.setup(&self.ctx, cb) {
                self.after_setup(id);
            } else {
                entry.waiting = Some(ticket);
            }
        }
    }

    fn after_setup(&mut self, id: AttachmentId) {
        let needs_input = self
            .ctx
            .queue
            .attachment(id)
            .is_some_and(|a| a.usage().contains(AttachmentUsage::INPUT));
        if let Some(entry) = self.attachments.get_mut(id) {
            entry.state = if needs_input {
                FrameAttachmentState::InputRequired
            } else {
                FrameAttachmentState::Ready
            };
            #[cfg(feature = "logging")]
            log::trace!("Frame {}: attachment {:?} -> {:?}", self.ctx.frame, id, entry.state);
        }
    }

    ///Hands pre-bound input to the attachment handles, or asks the producer for it.
    fn process_inputs(&mut self) {
        let queue = self.ctx.queue.clone();
        let ids: Vec<AttachmentId> = self
            .attachments
            .iter()
            .filter(|(_, e)| e.state == FrameAttachmentState::InputRequired && e.waiting.is_none())
            .map(|(id, _)| id)
            .collect();

        for id in ids {
            let ticket = self.next_ticket();
            let has_input = self.attachments.get(id).is_some_and(|e| e.input.is_some());

            if has_input {
                let cb = self.promise(QueueEntry::AttachmentInputSubmitted(id), ticket);
                let Some(entry) = self.attachments.get_mut(id) else {
                    continue;
                };
                let Some(data) = entry.input.take() else {
                    continue;
                };
                if entry.handle.submit_input(&self.ctx, data, cb) {
                    entry.state = FrameAttachmentState::Ready;
                } else {
                    entry.waiting = Some(ticket);
                }
            } else if let Some(input_cb) = queue
                .attachment(id)
                .and_then(|a| a.input_callback())
                .cloned()
            {
                let promise = self.promise(QueueEntry::AttachmentInput(id), ticket);
                if let Some(entry) = self.attachments.get_mut(id) {
                    entry.waiting = Some(ticket);
                }
                input_cb(&self.ctx, id, promise);
            } else {
                #[cfg(feature = "logging")]
                log::warn!(
                    "Frame {}: attachment {} needs input, but has neither data nor an input callback",
                    self.ctx.frame,
                    queue.attachment(id).map(|a| a.name()).unwrap_or_default()
                );
                self.invalidate();
                return;
            }
        }
    }

    fn advance_passes(&mut self, can_submit: bool) {
        let mut worklist: Vec<PassId> = self.ctx.queue.pass_order().iter().rev().copied().collect();
        let mut queued: AHashSet<PassId> = worklist.iter().copied().collect();

        while let Some(id) = worklist.pop() {
            queued.remove(&id);
            let Some(before) = self.pass_state(id) else {
                continue;
            };
            self.advance_pass(id, can_submit);
            if !self.valid {
                return;
            }

            let Some(entry) = self.passes.get(id) else {
                continue;
            };
            let after = entry.state;
            if after == before {
                continue;
            }
            for (state, waiters) in entry.waiters.iter() {
                if *state > before && *state <= after {
                    for w in waiters {
                        if queued.insert(*w) {
                            worklist.push(*w);
                        }
                    }
                }
            }
        }
    }

    fn advance_pass(&mut self, id: PassId, can_submit: bool) {
        loop {
            let Some(entry) = self.passes.get(id) else {
                return;
            };
            if entry.waiting.is_some() {
                return;
            }
            let advanced = match entry.state {
                FramePassState::Initial => self.try_ready(id),
                FramePassState::Ready => self.try_own(id),
                FramePassState::Owned => self.try_acquire_resources(id),
                FramePassState::ResourcesAcquired => self.try_prepare(id),
                FramePassState::Prepared => self.try_submission(id, can_submit),
                FramePassState::Submission => self.try_submit(id),
                FramePassState::Submitted => self.try_complete(id),
                FramePassState::Complete | FramePassState::Finalized => false,
            };
            if !advanced || !self.valid {
                return;
            }
            #[cfg(feature = "logging")]
            log::trace!(
                "Frame {}: pass {:?} -> {:?}",
                self.ctx.frame,
                id,
                self.pass_state(id)
            );
        }
    }

    fn set_pass_state(&mut self, id: PassId, state: FramePassState) {
        if let Some(entry) = self.passes.get_mut(id) {
            entry.state = state;
        }
    }

    fn try_ready(&mut self, id: PassId) -> bool {
        let Some(entry) = self.passes.get(id) else {
            return false;
        };
        let predecessors_done = entry.requirements.iter().all(|(pred, required)| {
            self.passes
                .get(*pred)
                .is_some_and(|p| p.state >= *required)
        });
        let attachments_ready = entry.attachments.iter().all(|(a, _)| {
            self.attachments
                .get(*a)
                .is_some_and(|a| a.state >= FrameAttachmentState::Ready)
        });
        if !predecessors_done || !attachments_ready || !entry.handle.is_available(&self.ctx) {
            return false;
        }
        self.set_pass_state(id, FramePassState::Ready);
        true
    }

    fn try_own(&mut self, id: PassId) -> bool {
        let is_async = self.passes.get(id).is_some_and(|p| p.handle.is_async());
        if is_async {
            self.set_pass_state(id, FramePassState::Owned);
            return true;
        }

        let queue = self.ctx.queue.clone();
        let Some(def) = queue.pass(id) else {
            return false;
        };
        let ticket = self.next_ticket();
        let cb = self.promise(QueueEntry::PassOwnership(id), ticket);
        let acquired = def.slot().acquire_for_frame(self.ctx.frame, cb);

        let Some(entry) = self.passes.get_mut(id) else {
            return false;
        };
        if acquired {
            entry.owns_slot = true;
            entry.state = FramePassState::Owned;
            true
        } else {
            #[cfg(feature = "logging")]
            log::trace!("Frame {} waits for pass {}", self.ctx.frame, def.name());
            entry.waits_for_slot = true;
            entry.waiting = Some(ticket);
            false
        }
    }

    ///Makes sure the attachment has its backing resource. Returns false while a swapchain image is pending.
    fn acquire_attachment(
        &mut self,
        id: AttachmentId,
        pass_extent: vk::Extent2D,
    ) -> Result<bool, FrameError> {
        let queue = self.ctx.queue.clone();
        let Some(def) = queue.attachment(id) else {
            return Ok(true);
        };
        match self.attachments.get(id).map(|a| a.state) {
            Some(FrameAttachmentState::Ready) => {}
            Some(FrameAttachmentState::ResourcesPending) => return Ok(false),
            _ => return Ok(true),
        }

        let Some(info) = def.image_info() else {
            if let Some(entry) = self.attachments.get_mut(id) {
                entry.state = FrameAttachmentState::ResourcesAcquired;
            }
            return Ok(true);
        };
        let extent = info.extent.resolve(pass_extent);

        let binding = self
            .swapchain
            .as_ref()
            .filter(|(att, _)| *att == id)
            .map(|(_, b)| b.clone());
        if let Some(binding) = binding {
            let ticket = self.next_ticket();
            let promise = self.promise(QueueEntry::AttachmentImage(id), ticket);
            if let Some(entry) = self.attachments.get_mut(id) {
                entry.state = FrameAttachmentState::ResourcesPending;
                entry.waiting = Some(ticket);
            }
            binding.acquire_image(&self.ctx, id, extent, promise);
            return Ok(false);
        }

        let image = self
            .cache
            .acquire_image(self.device.as_ref(), id, def, extent)?;
        if let Some(entry) = self.attachments.get_mut(id) {
            entry.image = Some(image);
            entry.state = FrameAttachmentState::ResourcesAcquired;
        }
        Ok(true)
    }

    ///Binds images and framebuffer, collects the sync set and the descriptor update plan.
    fn try_acquire_resources(&mut self, id: PassId) -> bool {
        let queue = self.ctx.queue.clone();
        let Some(def) = queue.pass(id) else {
            return false;
        };
        let Some(entry) = self.passes.get(id) else {
            return false;
        };
        let extent = entry.extent;
        let attachments = entry.attachments.clone();

        let mut pending = false;
        for &(a, _) in attachments.iter() {
            match self.acquire_attachment(a, extent) {
                Ok(true) => {}
                Ok(false) => pending = true,
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::error!("Frame {}: failed to acquire attachment: {}", self.ctx.frame, _e);
                    self.invalidate();
                    return false;
                }
            }
        }
        if pending {
            return false;
        }

        let mut sync = SyncSet::default();
        let mut images = Vec::new();
        let mut views: SmallVec<[ImageViewId; 4]> = SmallVec::new();
        for &(a, d) in attachments.iter() {
            let Some(desc) = queue.descriptor(d) else {
                continue;
            };
            let Some(att) = self.attachments.get_mut(a) else {
                continue;
            };
            let Some(image) = att.image.as_ref() else {
                continue;
            };

            if !att.wait_consumed {
                if let Some(semaphore) = image.wait_sem.clone() {
                    sync.waits.push(SyncWait {
                        semaphore,
                        stage: desc.dependency.initial_stage,
                    });
                }
                att.wait_consumed = true;
            }
            if att.last_pass == Some(id) {
                if let Some(signal) = image.signal_sem.clone() {
                    sync.signals.push(signal);
                }
            }
            if let Some(ops) = desc.image_ops {
                if ops.initial_layout != vk::ImageLayout::UNDEFINED && ops.initial_layout != image.layout {
                    sync.transitions.push(ImageTransition {
                        attachment: a,
                        old: image.layout,
                        new: ops.initial_layout,
                    });
                }
            }

            views.push(image.view());
            images.push(PassImage {
                attachment: a,
                image: image.image.clone(),
                view: image.view(),
                ops: desc.image_ops,
            });
        }

        let framebuffer = if def.ty() == PassType::Graphics && !views.is_empty() {
            match self
                .cache
                .acquire_framebuffer(self.device.as_ref(), id, def, &views, extent)
            {
                Ok(fb) => Some(fb),
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::error!("Frame {}: {}", self.ctx.frame, _e);
                    self.invalidate();
                    return false;
                }
            }
        } else {
            None
        };

        let mut descriptors = Vec::new();
        for &(a, d) in attachments.iter() {
            let (Some(desc), Some(att_def), Some(att)) = (
                queue.descriptor(d),
                queue.attachment(a),
                self.attachments.get(a),
            ) else {
                continue;
            };
            if desc.kind == DescriptorKind::Unknown {
                continue;
            }
            let is_external = !att_def.usage().is_empty();
            let size = att
                .handle
                .get_descriptor_array_size(&self.ctx, id, d, is_external);
            for index in 0..size {
                if !desc.update_after_bind
                    || att
                        .handle
                        .is_descriptor_dirty(&self.ctx, id, d, index, is_external)
                {
                    descriptors.push(DescriptorUpdate {
                        attachment: a,
                        descriptor: d,
                        kind: desc.kind,
                        index,
                    });
                }
            }
        }

        let context = PassContext {
            frame: self.ctx.clone(),
            pass: id,
            extent,
            framebuffer,
            images,
            descriptors,
        };
        let Some(entry) = self.passes.get_mut(id) else {
            return false;
        };
        entry.context = Some(context);
        entry.sync = sync;
        entry.state = FramePassState::ResourcesAcquired;
        true
    }

    fn try_prepare(&mut self, id: PassId) -> bool {
        let ticket = self.next_ticket();
        let cb = self.promise(QueueEntry::PassPrepare(id), ticket);
        let Some(entry) = self.passes.get_mut(id) else {
            return false;
        };
        let Some(context) = entry.context.as_ref() else {
            return false;
        };
        if entry.handle.prepare(context, cb) {
            entry.state = FramePassState::Prepared;
            true
        } else {
            entry.waiting = Some(ticket);
            false
        }
    }

    fn try_submission(&mut self, id: PassId, can_submit: bool) -> bool {
        let Some(entry) = self.passes.get_mut(id) else {
            return false;
        };
        if can_submit || entry.handle.is_async() {
            entry.state = FramePassState::Submission;
            true
        } else {
            false
        }
    }

    fn try_submit(&mut self, id: PassId) -> bool {
        if self.passes.get(id).is_none_or(|p| p.submit_called) {
            return false;
        }
        let submitted_ticket = self.next_ticket();
        let complete_ticket = self.next_ticket();
        let on_submitted = self.promise(QueueEntry::PassSubmitted(id), submitted_ticket);
        let on_complete = self.promise(QueueEntry::PassComplete(id), complete_ticket);

        let Some(entry) = self.passes.get_mut(id) else {
            return false;
        };
        let Some(context) = entry.context.as_ref() else {
            return false;
        };
        let sync = std::mem::take(&mut entry.sync);
        entry.submit_called = true;
        entry.submitted_ticket = Some(submitted_ticket);
        entry.complete_ticket = Some(complete_ticket);
        entry.handle.submit(context, sync, on_submitted, on_complete);
        false
    }

    fn try_complete(&mut self, id: PassId) -> bool {
        let Some(entry) = self.passes.get_mut(id) else {
            return false;
        };
        if entry.gpu_complete {
            entry.state = FramePassState::Complete;
            true
        } else {
            false
        }
    }

    ///Releases the pass slot and framebuffer, and detaches every attachment this pass used last.
    fn on_pass_submitted(&mut self, id: PassId) {
        let queue = self.ctx.queue.clone();
        let Some(entry) = self.passes.get_mut(id) else {
            return;
        };
        entry.state = FramePassState::Submitted;
        let release_slot = std::mem::take(&mut entry.owns_slot);
        let framebuffer = entry.context.as_mut().and_then(|c| c.framebuffer.take());
        let attachments = entry.attachments.clone();

        if release_slot {
            if let Some(def) = queue.pass(id) {
                def.slot().release_for_frame(self.ctx.frame);
            }
        }
        if let Some(fb) = framebuffer {
            self.cache.release_framebuffer(id, fb);
        }

        for (a, d) in attachments {
            let final_layout = queue
                .descriptor(d)
                .and_then(|d| d.image_ops)
                .map(|ops| ops.final_layout);
            let Some(att) = self.attachments.get_mut(a) else {
                continue;
            };
            if let (Some(image), Some(layout)) = (att.image.as_mut(), final_layout) {
                image.layout = layout;
            }
            if att.last_pass == Some(id) {
                att.state = FrameAttachmentState::Detached;
                self.outputs.push(FrameOutput {
                    queue: queue.id(),
                    attachment: a,
                    image: att.image.as_ref().map(|i| i.image.clone()),
                    layout: att.image.as_ref().map(|i| i.layout),
                });
            }
        }
    }

    fn release_images(&mut self) {
        let queue = self.ctx.queue.clone();
        let candidates: Vec<AttachmentId> = self
            .attachments
            .iter()
            .filter(|(_, e)| e.image.is_some() && !e.released)
            .map(|(id, _)| id)
            .collect();

        for id in candidates {
            let (Some(def), Some(entry)) = (queue.attachment(id), self.attachments.get(id)) else {
                continue;
            };
            let release_state = entry.release_state;
            let done = def.descriptors().iter().all(|d| {
                queue
                    .descriptor(*d)
                    .and_then(|d| self.passes.get(d.pass))
                    .is_some_and(|p| p.state >= release_state)
            });
            if done {
                self.release_image(id, true);
            }
        }
    }

    ///Returns the attachment's image to the cache, or to its swapchain.
    fn release_image(&mut self, id: AttachmentId, presentable: bool) {
        let Some(entry) = self.attachments.get_mut(id) else {
            return;
        };
        entry.released = true;
        let Some(image) = entry.image.take() else {
            return;
        };
        if let Some(image) = self.cache.release_image(id, image) {
            self.return_swapchain_image(id, image, presentable);
        }
    }

    fn return_swapchain_image(
        &self,
        id: AttachmentId,
        image: ImageAttachmentObject,
        presentable: bool,
    ) {
        match self.swapchain.as_ref() {
            Some((att, binding)) if *att == id => binding.release_image(image, presentable),
            _ => {
                #[cfg(feature = "logging")]
                log::warn!("Dropping swapchain image of {:?} without binding", id);
            }
        }
    }

    fn check_completion(&mut self) {
        if self.complete {
            return;
        }
        let passes_done = self
            .passes
            .values()
            .all(|p| p.state >= FramePassState::Complete);
        let attachments_done = self
            .attachments
            .values()
            .all(|a| a.state >= FrameAttachmentState::Ready && a.waiting.is_none());
        if !(self.setup_done && passes_done && attachments_done) {
            return;
        }

        #[cfg(feature = "logging")]
        log::trace!("Frame {}: queue {} complete", self.ctx.frame, self.index);
        self.complete = true;
        for entry in self.attachments.values_mut() {
            entry.state = entry.state.max(FrameAttachmentState::Complete);
        }
    }

    ///Finalizes every entry that has no result in flight. Once all passes are finalized, the attachments follow.
    fn try_finalize(&mut self) {
        if self.finished {
            return;
        }
        let successful = self.valid;
        let queue = self.ctx.queue.clone();

        for (id, entry) in self.passes.iter_mut() {
            if entry.state != FramePassState::Finalized && !entry.is_pending() {
                entry.handle.finalize(&self.ctx, successful);
                entry.state = FramePassState::Finalized;
                entry.context = None;
                //Only now the pass object is free for the next frame.
                if std::mem::take(&mut entry.owns_slot) {
                    if let Some(def) = queue.pass(id) {
                        def.slot().release_for_frame(self.ctx.frame);
                    }
                }
            }
        }
        if self
            .passes
            .values()
            .any(|p| p.state != FramePassState::Finalized)
        {
            return;
        }

        let ids: Vec<AttachmentId> = self
            .attachments
            .iter()
            .filter(|(_, e)| e.state != FrameAttachmentState::Finalized && e.waiting.is_none())
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            self.release_image(id, successful);
            if let Some(entry) = self.attachments.get_mut(id) {
                entry.state = FrameAttachmentState::ResourcesReleased;
                entry.handle.finalize(&self.ctx, successful);
                entry.state = FrameAttachmentState::Finalized;
            }
        }

        if self
            .attachments
            .values()
            .all(|a| a.state == FrameAttachmentState::Finalized)
        {
            #[cfg(feature = "logging")]
            log::trace!("Frame {}: queue {} finalized", self.ctx.frame, self.index);
            self.finished = true;
        }
    }

    ///Cancels the queue. Entries with results in flight are finalized once those land. Pass slots are kept until then,
    /// waits for a slot are cancelled right away.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;

        #[cfg(feature = "logging")]
        log::debug!("Frame {}: invalidating queue {}", self.ctx.frame, self.index);

        let queue = self.ctx.queue.clone();
        for id in queue.pass_order().iter().rev() {
            let Some(entry) = self.passes.get_mut(*id) else {
                continue;
            };
            let release = if entry.owns_slot {
                !entry.is_pending() && std::mem::take(&mut entry.owns_slot)
            } else {
                entry.waits_for_slot
            };
            if release {
                if let Some(def) = queue.pass(*id) {
                    def.slot().release_for_frame(self.ctx.frame);
                }
            }
        }

        self.try_finalize();
    }

    fn take_attachment_ticket(&mut self, id: AttachmentId, ticket: u64) -> bool {
        match self.attachments.get_mut(id) {
            Some(entry) if entry.waiting == Some(ticket) => {
                entry.waiting = None;
                true
            }
            _ => false,
        }
    }

    fn take_pass_ticket(&mut self, id: PassId, ticket: u64) -> bool {
        match self.passes.get_mut(id) {
            Some(entry) if entry.waiting == Some(ticket) => {
                entry.waiting = None;
                true
            }
            _ => false,
        }
    }

    fn fail(&mut self, _what: &str) {
        #[cfg(feature = "logging")]
        log::error!("Frame {}: {} failed", self.ctx.frame, _what);
        self.invalidate();
    }

    pub(crate) fn on_event(&mut self, entry: QueueEntry, ticket: u64, value: Option<Payload>) {
        let accepted = match entry {
            QueueEntry::AttachmentSetup(id) => {
                let accepted = self.take_attachment_ticket(id, ticket);
                if accepted && self.valid {
                    if value.is_some() {
                        self.after_setup(id);
                    } else {
                        self.fail("attachment setup");
                    }
                }
                accepted
            }
            QueueEntry::AttachmentInput(id) => {
                let accepted = self.take_attachment_ticket(id, ticket);
                if accepted && self.valid {
                    match value {
                        Some(Payload::Input(data)) => {
                            if let Some(entry) = self.attachments.get_mut(id) {
                                entry.input = Some(data);
                            }
                        }
                        _ => self.fail("input acquisition"),
                    }
                }
                accepted
            }
            QueueEntry::AttachmentInputSubmitted(id) => {
                let accepted = self.take_attachment_ticket(id, ticket);
                if accepted && self.valid {
                    if value.is_some() {
                        if let Some(entry) = self.attachments.get_mut(id) {
                            entry.state = FrameAttachmentState::Ready;
                        }
                    } else {
                        self.fail("input submission");
                    }
                }
                accepted
            }
            QueueEntry::AttachmentImage(id) => {
                let accepted = self.take_attachment_ticket(id, ticket);
                if accepted {
                    match value {
                        Some(Payload::Image(mut image)) => {
                            image.is_swapchain_image = true;
                            if self.valid {
                                if let Some(entry) = self.attachments.get_mut(id) {
                                    entry.image = Some(image);
                                    entry.state = FrameAttachmentState::ResourcesAcquired;
                                }
                            } else {
                                self.return_swapchain_image(id, image, false);
                            }
                        }
                        _ => self.fail("swapchain image acquisition"),
                    }
                }
                accepted
            }
            QueueEntry::PassOwnership(id) => {
                let accepted = self.take_pass_ticket(id, ticket);
                if accepted {
                    if let Some(entry) = self.passes.get_mut(id) {
                        entry.waits_for_slot = false;
                    }
                    if !self.valid {
                        //Handed over after we gave up, pass it on.
                        if value.is_some() {
                            if let Some(def) = self.ctx.queue.pass(id) {
                                def.slot().release_for_frame(self.ctx.frame);
                            }
                        }
                    } else if value.is_some() {
                        if let Some(entry) = self.passes.get_mut(id) {
                            entry.owns_slot = true;
                            entry.state = FramePassState::Owned;
                        }
                    } else {
                        #[cfg(feature = "logging")]
                        log::debug!("Frame {}: ownership wait was displaced", self.ctx.frame);
                        self.invalidate();
                    }
                }
                accepted
            }
            QueueEntry::PassPrepare(id) => {
                let accepted = self.take_pass_ticket(id, ticket);
                if accepted && self.valid {
                    if value.is_some() {
                        self.set_pass_state(id, FramePassState::Prepared);
                    } else {
                        self.fail("pass preparation");
                    }
                }
                accepted
            }
            QueueEntry::PassSubmitted(id) => {
                let accepted = match self.passes.get_mut(id) {
                    Some(entry) if entry.submitted_ticket == Some(ticket) => {
                        entry.submitted_ticket = None;
                        true
                    }
                    _ => false,
                };
                if accepted && self.valid {
                    if value.is_some() {
                        self.on_pass_submitted(id);
                    } else {
                        self.fail("pass submission");
                    }
                }
                accepted
            }
            QueueEntry::PassComplete(id) => {
                let accepted = match self.passes.get_mut(id) {
                    Some(entry) if entry.complete_ticket == Some(ticket) => {
                        entry.complete_ticket = None;
                        entry.gpu_complete = value.is_some();
                        true
                    }
                    _ => false,
                };
                if accepted && self.valid && value.is_none() {
                    self.fail("pass execution");
                }
                accepted
            }
        };

        if !accepted {
            #[cfg(feature = "logging")]
            log::trace!("Frame {}: absorbed stale result {}", self.ctx.frame, ticket);
            return;
        }
        if !self.valid {
            self.try_finalize();
        }
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        //Results still in flight can't be delivered anymore. Finalize what is left and hand back slots and images.
        self.valid = false;
        let queue = self.ctx.queue.clone();
        for (id, entry) in self.passes.iter_mut() {
            if std::mem::take(&mut entry.waits_for_slot) {
                if let Some(def) = queue.pass(id) {
                    def.slot().release_for_frame(self.ctx.frame);
                }
            }
            entry.waiting = None;
            entry.submitted_ticket = None;
            entry.complete_ticket = None;
        }
        for entry in self.attachments.values_mut() {
            entry.waiting = None;
        }
        self.try_finalize();
    }
}
