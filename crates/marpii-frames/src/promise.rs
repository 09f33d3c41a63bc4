//! Completion tokens for asynchronous backend work.
//!
//! Every asynchronous operation gets a [Promise]. Completing it posts a [LoopEvent] to the frame loop, which routes the
//! result back to the waiting entry on the loop's thread. A promise that is dropped without being completed reports a
//! failure, so no entry waits forever on a callback that got lost.

use std::{any::Any, marker::PhantomData};

use crossbeam_channel::Sender;

use crate::{
    backend::ImageAttachmentObject,
    emitter::EmitterId,
    looper::FrameLoop,
    queue::{AttachmentId, PassId},
    request::{FrameRequest, InputData},
};

#[doc(hidden)]
pub enum Payload {
    Done,
    Input(InputData),
    Image(ImageAttachmentObject),
    Request(Box<FrameRequest>),
}

mod sealed {
    pub trait Sealed {}
}

///Values that can be delivered through a [Promise].
pub trait PromiseValue: sealed::Sealed + Send + 'static {
    #[doc(hidden)]
    fn into_payload(self) -> Payload;
}

impl sealed::Sealed for () {}
impl PromiseValue for () {
    fn into_payload(self) -> Payload {
        Payload::Done
    }
}

impl sealed::Sealed for Box<dyn Any + Send> {}
impl PromiseValue for Box<dyn Any + Send> {
    fn into_payload(self) -> Payload {
        Payload::Input(self)
    }
}

impl sealed::Sealed for ImageAttachmentObject {}
impl PromiseValue for ImageAttachmentObject {
    fn into_payload(self) -> Payload {
        Payload::Image(self)
    }
}

impl sealed::Sealed for FrameRequest {}
impl PromiseValue for FrameRequest {
    fn into_payload(self) -> Payload {
        Payload::Request(Box::new(self))
    }
}

///Entry of a frame queue a result is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueEntry {
    AttachmentSetup(AttachmentId),
    AttachmentInput(AttachmentId),
    AttachmentInputSubmitted(AttachmentId),
    AttachmentImage(AttachmentId),
    PassOwnership(PassId),
    PassPrepare(PassId),
    PassSubmitted(PassId),
    PassComplete(PassId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Frame {
        emitter: EmitterId,
        frame: u64,
        queue: usize,
        entry: QueueEntry,
    },
    Acquire {
        emitter: EmitterId,
    },
    Compile {
        id: u64,
    },
}

pub(crate) enum LoopEvent {
    Resolved {
        route: Route,
        ticket: u64,
        ///`None` if the promise was rejected or dropped.
        value: Option<Payload>,
    },
    Task(Box<dyn FnOnce(&mut FrameLoop) + Send>),
    Schedule(Box<dyn FnMut(&mut FrameLoop) -> bool + Send>),
}

///One-shot completion token. See the module documentation.
pub struct Promise<T: PromiseValue> {
    tx: Sender<LoopEvent>,
    route: Route,
    ticket: u64,
    fired: bool,
    ty: PhantomData<fn(T)>,
}

///Promise that only reports success or failure.
pub type Callback = Promise<()>;

impl<T: PromiseValue> Promise<T> {
    pub(crate) fn new(tx: Sender<LoopEvent>, route: Route, ticket: u64) -> Self {
        Promise {
            tx,
            route,
            ticket,
            fired: false,
            ty: PhantomData,
        }
    }

    pub fn fulfil(mut self, value: T) {
        self.send(Some(value.into_payload()));
    }

    pub fn reject(mut self) {
        self.send(None);
    }

    fn send(&mut self, value: Option<Payload>) {
        self.fired = true;
        //If the loop is gone there is nobody left to care.
        if self
            .tx
            .send(LoopEvent::Resolved {
                route: self.route,
                ticket: self.ticket,
                value,
            })
            .is_err()
        {
            #[cfg(feature = "logging")]
            log::trace!("Promise {} resolved after its loop was dropped", self.ticket);
        }
    }
}

impl Promise<()> {
    pub fn complete(self, success: bool) {
        if success {
            self.fulfil(())
        } else {
            self.reject()
        }
    }
}

impl<T: PromiseValue> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fired {
            self.send(None);
        }
    }
}
