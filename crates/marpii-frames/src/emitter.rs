use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    backend::Device,
    cache::FrameCache,
    error::FrameError,
    handle::{FrameHandle, FrameSetup},
    looper::LoopHandle,
    promise::{Payload, Promise, QueueEntry, Route},
    queue::QueueId,
    request::FrameRequest,
};

slotmap::new_key_type! {
    pub struct EmitterId;
}

///Asked for a new frame whenever the emitter is ready to start one and no request is pending. Dropping the promise
/// skips the frame.
pub type AcquireCallback = Box<dyn FnMut(Promise<FrameRequest>) + Send>;
pub type FrameCompleteCallback = Box<dyn FnMut(&FrameHandle) + Send>;

///Paces frames of a producer.
///
/// At most one frame is started per interval, and only once every active frame was submitted. Frames are submitted in
/// the order they were started. A frame may be prepared while its predecessor is still running, but it only submits
/// after the predecessor did.
pub struct FrameEmitter {
    id: EmitterId,
    interval: Duration,
    generation: u64,
    frames: VecDeque<FrameHandle>,
    next_request: Option<FrameRequest>,
    acquire: Option<AcquireCallback>,
    acquire_in_progress: Option<u64>,
    next_acquire: u64,
    caches: Vec<(QueueId, Arc<FrameCache>)>,
    valid: bool,
    frame_timeout_passed: bool,
    timer: Option<Instant>,
    emitted: u64,
    submitted: u64,
    completed: u64,
    on_frame_complete: Option<FrameCompleteCallback>,
    device: Arc<dyn Device>,
    handle: LoopHandle,
}

impl FrameEmitter {
    pub(crate) fn new(
        id: EmitterId,
        interval: Duration,
        device: Arc<dyn Device>,
        handle: LoopHandle,
    ) -> Self {
        FrameEmitter {
            id,
            interval,
            generation: 0,
            frames: VecDeque::new(),
            next_request: None,
            acquire: None,
            acquire_in_progress: None,
            next_acquire: 0,
            caches: Vec::new(),
            valid: true,
            frame_timeout_passed: true,
            timer: None,
            emitted: 0,
            submitted: 0,
            completed: 0,
            on_frame_complete: None,
            device,
            handle,
        }
    }

    pub fn id(&self) -> EmitterId {
        self.id
    }

    pub fn frame_interval(&self) -> Duration {
        self.interval
    }

    pub fn frame_interval_us(&self) -> u64 {
        self.interval.as_micros() as u64
    }

    pub fn set_frame_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn frames(&self) -> impl Iterator<Item = &FrameHandle> {
        self.frames.iter()
    }

    pub fn frame(&self, id: u64) -> Option<&FrameHandle> {
        self.frames.iter().find(|f| f.id() == id)
    }

    pub fn frame_mut(&mut self, id: u64) -> Option<&mut FrameHandle> {
        self.frames.iter_mut().find(|f| f.id() == id)
    }

    pub fn has_pending_request(&self) -> bool {
        self.next_request.is_some()
    }

    pub fn is_acquire_in_progress(&self) -> bool {
        self.acquire_in_progress.is_some()
    }

    ///Deadline of the pacing timer, if one is running.
    pub fn timer(&self) -> Option<Instant> {
        self.timer
    }

    pub fn cache(&self, queue: QueueId) -> Option<&Arc<FrameCache>> {
        self.caches.iter().find(|(q, _)| *q == queue).map(|(_, c)| c)
    }

    pub fn set_acquire_callback(&mut self, cb: impl FnMut(Promise<FrameRequest>) + Send + 'static) {
        self.acquire = Some(Box::new(cb));
    }

    pub fn set_frame_complete_callback(&mut self, cb: impl FnMut(&FrameHandle) + Send + 'static) {
        self.on_frame_complete = Some(Box::new(cb));
    }

    ///Stores the request for the next frame. Replaces an older request that was not started yet.
    pub fn schedule_next_frame(&mut self, request: FrameRequest) {
        if self.next_request.replace(request).is_some() {
            #[cfg(feature = "logging")]
            log::debug!("Replaced pending frame request");
        }
    }

    ///Starts a frame right away, without waiting for the pacing timer. Returns the frame's id.
    ///
    /// If an older frame was not submitted yet, the new frame is prepared, but only submits after the older one.
    pub fn submit_next_frame(
        &mut self,
        request: FrameRequest,
        now: Instant,
    ) -> Result<u64, FrameError> {
        if !self.valid {
            return Err(FrameError::EmitterInvalidated);
        }
        self.start_frame(request, now)
    }

    fn cache_for(&mut self, queue: QueueId) -> Arc<FrameCache> {
        if let Some(cache) = self.cache(queue) {
            return cache.clone();
        }
        let cache = Arc::new(FrameCache::new(queue));
        self.caches.push((queue, cache.clone()));
        cache
    }

    fn start_frame(&mut self, request: FrameRequest, now: Instant) -> Result<u64, FrameError> {
        let setup = FrameSetup {
            emitter: self.id,
            generation: self.generation,
            cache: self.cache_for(request.queue().id()),
            handle: self.handle.clone(),
            device: self.device.clone(),
            in_order: self.frames.iter().all(|f| f.is_submitted()),
        };

        let frame = self.device.make_frame(request, setup)?;
        let id = frame.id();

        #[cfg(feature = "logging")]
        log::trace!("Emitter started frame {}", id);

        self.emitted += 1;
        if self.interval.is_zero() {
            self.frame_timeout_passed = true;
        } else {
            self.frame_timeout_passed = false;
            self.timer = Some(now + self.interval);
        }
        self.frames.push_back(frame);
        Ok(id)
    }

    ///Starts a frame if the emitter is valid, the frame interval passed, no acquisition is running and every active
    /// frame was submitted. `timeout` is set if called because the pacing timer fired. Returns true if a frame was
    /// started or acquired.
    pub fn on_frame_request(&mut self, timeout: bool, now: Instant) -> bool {
        if timeout {
            self.frame_timeout_passed = true;
        }

        if !self.valid
            || !self.frame_timeout_passed
            || self.acquire_in_progress.is_some()
            || !self.frames.iter().all(|f| f.is_submitted())
        {
            return false;
        }

        if let Some(request) = self.next_request.take() {
            match self.start_frame(request, now) {
                Ok(_) => true,
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to start frame: {}", _e);
                    false
                }
            }
        } else if self.acquire.is_some() {
            self.next_acquire += 1;
            let ticket = self.next_acquire;
            let promise = Promise::new(
                self.handle.sender(),
                Route::Acquire { emitter: self.id },
                ticket,
            );
            self.acquire_in_progress = Some(ticket);
            if let Some(acquire) = self.acquire.as_mut() {
                acquire(promise);
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn on_acquired(&mut self, ticket: u64, request: Option<FrameRequest>, now: Instant) {
        if self.acquire_in_progress != Some(ticket) {
            return;
        }
        self.acquire_in_progress = None;

        match request {
            Some(request) if self.valid => {
                if let Err(_e) = self.start_frame(request, now) {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to start acquired frame: {}", _e);
                }
            }
            Some(_) => {}
            None => {
                //Producer skipped the frame, ask again after the next interval.
                if !self.interval.is_zero() {
                    self.frame_timeout_passed = false;
                    self.timer = Some(now + self.interval);
                }
            }
        }
    }

    pub(crate) fn poll_timer(&mut self, now: Instant) -> bool {
        match self.timer {
            Some(deadline) if deadline <= now => {
                self.timer = None;
                self.on_frame_request(true, now);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn on_event(
        &mut self,
        frame: u64,
        queue: usize,
        entry: QueueEntry,
        ticket: u64,
        value: Option<Payload>,
    ) {
        if let Some(f) = self.frame_mut(frame) {
            f.on_event(queue, entry, ticket, value);
        } else {
            #[cfg(feature = "logging")]
            log::trace!("Dropping result for retired frame {}", frame);
        }
    }

    ///A frame was submitted. The oldest frame that is not submitted yet may submit now.
    fn set_frame_submitted(&mut self) {
        self.submitted += 1;
        if let Some(next) = self.frames.iter_mut().find(|f| !f.is_submitted()) {
            next.set_in_order();
        }
    }

    ///Advances all frames and retires finished ones. Returns true if anything happened.
    pub(crate) fn update(&mut self, now: Instant) -> bool {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let mut progressed = self.on_frame_request(false, now);
        let mut any_submitted = false;

        let mut idx = 0;
        while idx < self.frames.len() {
            let Some(frame) = self.frames.get_mut(idx) else {
                break;
            };
            let update = frame.update();
            let finalized = frame.is_finalized();

            if update.submitted {
                progressed = true;
                any_submitted = true;
                self.set_frame_submitted();
            }
            if update.completed {
                progressed = true;
                self.completed += 1;
                if let (Some(cb), Some(frame)) =
                    (self.on_frame_complete.as_mut(), self.frames.get(idx))
                {
                    cb(frame);
                }
            }

            if finalized {
                progressed = true;
                self.frames.remove(idx);
            } else {
                idx += 1;
            }
        }

        if any_submitted {
            progressed |= self.on_frame_request(false, now);
        }
        progressed
    }

    ///Invalidates all frames (newest first), then all caches. No new frames are started afterwards.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;
        self.timer = None;
        self.next_request = None;

        for frame in self.frames.iter_mut().rev() {
            frame.invalidate();
        }
        for (_, cache) in self.caches.iter().rev() {
            cache.invalidate();
        }
    }

    ///Starts a new generation, e.g. after the swapchain was recreated. Frames of older generations are invalidated.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        let current = self.generation;
        for frame in self.frames.iter_mut().rev() {
            if frame.generation() < current {
                frame.invalidate();
            }
        }
        current
    }
}
