use std::sync::Arc;

use ash::vk;

use crate::{
    backend::{Device, ImageAttachmentObject, Semaphore},
    queue::AttachmentId,
};

#[derive(Clone)]
pub struct SyncWait {
    pub semaphore: Arc<dyn Semaphore>,
    ///Stage that waits for the semaphore.
    pub stage: vk::PipelineStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub attachment: AttachmentId,
    pub old: vk::ImageLayout,
    pub new: vk::ImageLayout,
}

///Synchronization a pass has to honour when it is submitted.
#[derive(Clone, Default)]
pub struct SyncSet {
    pub waits: Vec<SyncWait>,
    pub signals: Vec<Arc<dyn Semaphore>>,
    ///Layout transitions of the pass' images, before its first subpass.
    pub transitions: Vec<ImageTransition>,
}

impl SyncSet {
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.signals.is_empty() && self.transitions.is_empty()
    }
}

impl ImageAttachmentObject {
    ///Prepares the semaphores of a cached image for the next frame.
    ///
    /// A signal semaphore that was signaled but never waited on becomes the new wait semaphore. A wait semaphore that
    /// was waited on is reset and reused as the new signal. Unused signals are discarded. If no signal is left, a new
    /// one is created by `device`.
    pub fn rearm(&mut self, device: &dyn Device) {
        let old_wait = self.wait_sem.take();
        let mut spare = None;

        if let Some(signal) = self.signal_sem.take() {
            if signal.is_signaled() && !signal.is_waited() {
                self.wait_sem = Some(signal);
            } else if signal.is_signaled() {
                signal.reset();
                spare = Some(signal);
            }
        }

        if let Some(wait) = old_wait {
            if wait.is_waited() {
                wait.reset();
                if spare.is_none() {
                    spare = Some(wait);
                }
            } else if self.wait_sem.is_none() {
                //Never consumed, the content it guards is still pending.
                self.wait_sem = Some(wait);
            }
        }

        self.signal_sem = Some(spare.unwrap_or_else(|| device.make_semaphore()));
    }
}
