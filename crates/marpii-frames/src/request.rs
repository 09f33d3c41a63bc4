use std::{any::Any, sync::Arc};

use ahash::AHashMap;
use ash::vk;

use crate::{
    backend::SwapchainBinding,
    error::FrameError,
    handle::FrameHandle,
    queue::{AttachmentId, AttachmentUsage, Queue},
};

///Producer data for an input attachment. The attachment's handle knows what to downcast it to.
pub type InputData = Box<dyn Any + Send>;

///Called exactly once per frame, after it completed or was invalidated. Check [FrameHandle::is_valid] to tell both apart.
pub type CompleteCallback = Box<dyn FnOnce(&FrameHandle) + Send>;

///Everything needed to start a frame of a queue.
pub struct FrameRequest {
    pub(crate) queue: Arc<Queue>,
    pub(crate) extent: vk::Extent2D,
    pub(crate) inputs: AHashMap<AttachmentId, InputData>,
    pub(crate) ready_for_submit: bool,
    pub(crate) swapchain: Option<(AttachmentId, Arc<dyn SwapchainBinding>)>,
    pub(crate) on_complete: Option<CompleteCallback>,
}

impl FrameRequest {
    pub fn new(queue: Arc<Queue>, extent: vk::Extent2D) -> Self {
        FrameRequest {
            queue,
            extent,
            inputs: AHashMap::default(),
            ready_for_submit: true,
            swapchain: None,
            on_complete: None,
        }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    ///Pre-binds input for `attachment`. The attachment's input callback won't be called for this frame.
    pub fn add_input(
        &mut self,
        attachment: AttachmentId,
        data: impl Any + Send,
    ) -> Result<(), FrameError> {
        let att = self
            .queue
            .attachment(attachment)
            .ok_or(FrameError::ForeignAttachment)?;
        if !att.usage().contains(AttachmentUsage::INPUT) {
            return Err(FrameError::NotAnInput(att.name().to_owned()));
        }
        if self.inputs.insert(attachment, Box::new(data)).is_some() {
            #[cfg(feature = "logging")]
            log::warn!("Replaced input of {}", att.name());
        }
        Ok(())
    }

    pub fn has_input(&self, attachment: AttachmentId) -> bool {
        self.inputs.contains_key(&attachment)
    }

    ///If false, the frame is prepared, but its passes wait with submission until
    /// [FrameHandle::set_ready_for_submit] is called.
    pub fn set_ready_for_submit(&mut self, ready: bool) {
        self.ready_for_submit = ready;
    }

    ///Images of `attachment` are acquired from, and returned to `binding`.
    pub fn bind_swapchain(
        &mut self,
        attachment: AttachmentId,
        binding: Arc<dyn SwapchainBinding>,
    ) -> Result<(), FrameError> {
        if self.queue.attachment(attachment).is_none() {
            return Err(FrameError::ForeignAttachment);
        }
        self.swapchain = Some((attachment, binding));
        Ok(())
    }

    pub fn set_complete_callback(&mut self, cb: impl FnOnce(&FrameHandle) + Send + 'static) {
        self.on_complete = Some(Box::new(cb));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk;

    use crate::{
        error::FrameError,
        queue::{AttachmentUsage, ImageInfo, Queue},
    };

    use super::FrameRequest;

    #[test]
    fn inputs_are_checked() {
        let mut b = Queue::builder("q");
        let input = b
            .add_image_attachment(
                "in",
                ImageInfo::new(vk::Format::R8_UNORM),
                AttachmentUsage::INPUT,
            )
            .unwrap();
        let other = b
            .add_image_attachment(
                "other",
                ImageInfo::new(vk::Format::R8_UNORM),
                AttachmentUsage::OUTPUT,
            )
            .unwrap();
        let queue = Arc::new(b.build());

        let mut req = FrameRequest::new(
            queue,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
        );
        req.add_input(input, 5u32).unwrap();
        assert!(req.has_input(input));
        assert!(matches!(
            req.add_input(other, 5u32),
            Err(FrameError::NotAnInput(_))
        ));
        assert!(!req.has_input(other));
    }
}
