//! The frame loop owns every emitter and drives all frame state machines on a single thread.
//!
//! Backends talk to the loop only through [Promise](crate::Promise)s and a [LoopHandle]. Both post messages to the
//! loop's channel, which are handled the next time the loop is polled.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use slotmap::SlotMap;

use crate::{
    backend::{Device, Resource},
    emitter::{EmitterId, FrameEmitter},
    error::LoopError,
    promise::{Callback, LoopEvent, Payload, Promise, Route},
    queue::Queue,
    request::FrameRequest,
};

type CompileCallback = Box<dyn FnOnce(&mut FrameLoop, bool) + Send>;
type ScheduledTask = Box<dyn FnMut(&mut FrameLoop) -> bool + Send>;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    ///Threads of the worker pool. 0 lets rayon decide.
    pub worker_threads: usize,
    pub thread_name: String,
    ///Upper bound of event/update rounds per poll. Keeps a chatty backend from starving the caller.
    pub max_poll_iterations: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            worker_threads: 0,
            thread_name: "marpii-frames-worker".to_owned(),
            max_poll_iterations: 64,
        }
    }
}

///Cloneable, thread safe access to a [FrameLoop].
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<LoopEvent>,
    pool: Arc<rayon::ThreadPool>,
}

impl LoopHandle {
    pub(crate) fn sender(&self) -> Sender<LoopEvent> {
        self.tx.clone()
    }

    fn post(&self, event: LoopEvent) {
        if self.tx.send(event).is_err() {
            #[cfg(feature = "logging")]
            log::warn!("Frame loop is gone, dropping task");
        }
    }

    ///Runs `f` on the loop thread.
    pub fn perform_on_gl_thread(&self, f: impl FnOnce(&mut FrameLoop) + Send + 'static) {
        self.post(LoopEvent::Task(Box::new(f)));
    }

    ///Runs `work` on the worker pool. `complete` is called on the loop thread with `work`'s result. A panicking
    /// `work` counts as failed.
    pub fn perform_in_queue(
        &self,
        work: impl FnOnce() -> bool + Send + 'static,
        complete: impl FnOnce(&mut FrameLoop, bool) + Send + 'static,
    ) {
        let handle = self.clone();
        self.pool.spawn(move || {
            let success = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(success) => success,
                Err(_) => {
                    #[cfg(feature = "logging")]
                    log::error!("Worker task panicked");
                    false
                }
            };
            handle.perform_on_gl_thread(move |lp| complete(lp, success));
        });
    }

    ///Calls `predicate` once per loop tick until it returns true.
    pub fn schedule(&self, predicate: impl FnMut(&mut FrameLoop) -> bool + Send + 'static) {
        self.post(LoopEvent::Schedule(Box::new(predicate)));
    }
}

///Drives every [FrameEmitter] and all of their frames. Lives on the thread that talks to the GPU.
pub struct FrameLoop {
    device: Arc<dyn Device>,
    config: LoopConfig,
    handle: LoopHandle,
    rx: Receiver<LoopEvent>,
    emitters: SlotMap<EmitterId, FrameEmitter>,
    scheduled: Vec<ScheduledTask>,
    compile_callbacks: AHashMap<u64, CompileCallback>,
    next_compile: u64,
}

impl FrameLoop {
    pub fn new(device: Arc<dyn Device>, config: LoopConfig) -> Result<Self, LoopError> {
        let thread_name = config.thread_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(move |idx| format!("{}-{}", thread_name, idx))
            .build()
            .map_err(|e| LoopError::ThreadPool(e.to_string()))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        Ok(FrameLoop {
            device,
            config,
            handle: LoopHandle {
                tx,
                pool: Arc::new(pool),
            },
            rx,
            emitters: SlotMap::with_key(),
            scheduled: Vec::new(),
            compile_callbacks: AHashMap::default(),
            next_compile: 0,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    ///Adds an emitter that starts at most one frame per `interval`. A zero interval disables pacing.
    pub fn add_emitter(&mut self, interval: Duration) -> EmitterId {
        let device = self.device.clone();
        let handle = self.handle.clone();
        self.emitters
            .insert_with_key(|id| FrameEmitter::new(id, interval, device, handle))
    }

    ///Removes an emitter. Its frames are invalidated and report completion, unless a required task still runs. Those
    /// report once the returned emitter is dropped.
    pub fn remove_emitter(&mut self, id: EmitterId) -> Option<FrameEmitter> {
        let mut emitter = self.emitters.remove(id)?;
        emitter.invalidate();
        emitter.update(Instant::now());
        Some(emitter)
    }

    pub fn emitter(&self, id: EmitterId) -> Option<&FrameEmitter> {
        self.emitters.get(id)
    }

    pub fn emitter_mut(&mut self, id: EmitterId) -> Option<&mut FrameEmitter> {
        self.emitters.get_mut(id)
    }

    ///Stores `request` as the next frame of `emitter`. It starts once the emitter's pacing allows it.
    pub fn schedule_next_frame(
        &mut self,
        emitter: EmitterId,
        request: FrameRequest,
    ) -> Result<(), LoopError> {
        self.emitters
            .get_mut(emitter)
            .ok_or(LoopError::UnknownEmitter)?
            .schedule_next_frame(request);
        Ok(())
    }

    ///Starts a frame immediately, regardless of the emitter's pacing.
    pub fn submit_next_frame(
        &mut self,
        emitter: EmitterId,
        request: FrameRequest,
    ) -> Result<u64, LoopError> {
        let id = self
            .emitters
            .get_mut(emitter)
            .ok_or(LoopError::UnknownEmitter)?
            .submit_next_frame(request, Instant::now())?;
        Ok(id)
    }

    fn register_compile(&mut self, cb: CompileCallback) -> Callback {
        self.next_compile += 1;
        let id = self.next_compile;
        self.compile_callbacks.insert(id, cb);
        Promise::new(self.handle.sender(), Route::Compile { id }, id)
    }

    ///Lets the device compile `queue`. `cb` is called on the loop thread.
    pub fn compile_queue(
        &mut self,
        queue: Arc<Queue>,
        cb: impl FnOnce(&mut FrameLoop, bool) + Send + 'static,
    ) {
        if !queue.is_prepared() {
            #[cfg(feature = "logging")]
            log::error!(
                "{}",
                crate::error::FrameError::QueueNotPrepared(queue.name().to_owned())
            );
            cb(self, false);
            return;
        }
        let promise = self.register_compile(Box::new(cb));
        self.device.compile_render_queue(&queue, promise);
    }

    pub fn compile_resource(
        &mut self,
        resource: Arc<dyn Resource>,
        cb: impl FnOnce(&mut FrameLoop, bool) + Send + 'static,
    ) {
        let promise = self.register_compile(Box::new(cb));
        self.device.compile_resource(resource, promise);
    }

    ///Invalidates every emitter, and with them all frames in flight.
    pub fn invalidate(&mut self) {
        for (_, emitter) in self.emitters.iter_mut() {
            emitter.invalidate();
        }
    }

    fn dispatch(&mut self, event: LoopEvent, now: Instant) {
        match event {
            LoopEvent::Resolved {
                route,
                ticket,
                value,
            } => match route {
                Route::Frame {
                    emitter,
                    frame,
                    queue,
                    entry,
                } => {
                    if let Some(e) = self.emitters.get_mut(emitter) {
                        e.on_event(frame, queue, entry, ticket, value);
                    }
                }
                Route::Acquire { emitter } => {
                    let request = match value {
                        Some(Payload::Request(req)) => Some(*req),
                        _ => None,
                    };
                    if let Some(e) = self.emitters.get_mut(emitter) {
                        e.on_acquired(ticket, request, now);
                    }
                }
                Route::Compile { id } => {
                    if let Some(cb) = self.compile_callbacks.remove(&id) {
                        cb(self, value.is_some());
                    }
                }
            },
            LoopEvent::Task(f) => f(self),
            LoopEvent::Schedule(p) => self.scheduled.push(p),
        }
    }

    fn run_scheduled(&mut self) -> bool {
        let tasks = std::mem::take(&mut self.scheduled);
        let before = tasks.len();
        let mut keep = Vec::with_capacity(before);
        for mut task in tasks {
            if !task(self) {
                keep.push(task);
            }
        }
        let finished = keep.len() < before;
        //Tasks scheduled while running are already in `self.scheduled`.
        keep.append(&mut self.scheduled);
        self.scheduled = keep;
        finished
    }

    ///Polls with the current time.
    pub fn poll(&mut self) {
        self.poll_at(Instant::now())
    }

    ///Handles all pending events, fires due timers and advances every frame, until nothing changes anymore.
    pub fn poll_at(&mut self, now: Instant) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.run_scheduled();

        for _ in 0..self.config.max_poll_iterations {
            let mut progressed = false;
            while let Ok(event) = self.rx.try_recv() {
                progressed = true;
                self.dispatch(event, now);
            }

            for (_, emitter) in self.emitters.iter_mut() {
                progressed |= emitter.poll_timer(now);
                progressed |= emitter.update(now);
            }

            if !progressed && self.rx.is_empty() {
                break;
            }
        }
    }

    ///Earliest pending emitter timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.emitters.values().filter_map(|e| e.timer()).min()
    }

    ///Polls until `predicate` returns true or `timeout` passed. Returns the predicate's last result.
    pub fn run_until(
        &mut self,
        mut predicate: impl FnMut(&FrameLoop) -> bool,
        timeout: Duration,
    ) -> bool {
        let end = Instant::now() + timeout;
        loop {
            self.poll();
            if predicate(self) {
                return true;
            }

            let now = Instant::now();
            if now >= end {
                return false;
            }
            let wake = self.next_deadline().map(|d| d.min(end)).unwrap_or(end);
            match self.rx.recv_timeout(wake.saturating_duration_since(now)) {
                Ok(event) => self.dispatch(event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return predicate(self),
            }
        }
    }
}
