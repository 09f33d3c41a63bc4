use std::{hash::BuildHasher, sync::Arc};

use ahash::{AHashMap, RandomState};
use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    backend::{Device, Framebuffer, ImageAttachmentObject, ImageViewId},
    error::DeviceError,
    queue::{Attachment, AttachmentId, PassDef, PassId, QueueId},
};

type ViewList = SmallVec<[ImageViewId; 4]>;

///Identity of a view set. Order does not matter.
fn view_key(views: &[ImageViewId]) -> ViewList {
    let mut key: ViewList = views.iter().copied().collect();
    key.sort_unstable();
    key
}

struct FramebufferBucket {
    extent: vk::Extent2D,
    ///Keyed by the hash of the sorted view list. Collisions are told apart by the full sorted list.
    entries: AHashMap<u64, Vec<(ViewList, Arc<dyn Framebuffer>)>>,
}

struct ImageBucket {
    extent: vk::Extent2D,
    images: Vec<ImageAttachmentObject>,
}

struct CacheInner {
    valid: bool,
    hasher: RandomState,
    framebuffers: AHashMap<PassId, FramebufferBucket>,
    images: AHashMap<AttachmentId, ImageBucket>,
}

///Pool of framebuffers and attachment images of one queue, shared by the frames of an emitter.
///
/// Can be used from any thread.
pub struct FrameCache {
    queue: QueueId,
    inner: Mutex<CacheInner>,
}

impl FrameCache {
    pub fn new(queue: QueueId) -> Self {
        FrameCache {
            queue,
            inner: Mutex::new(CacheInner {
                valid: true,
                hasher: RandomState::new(),
                framebuffers: AHashMap::default(),
                images: AHashMap::default(),
            }),
        }
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }

    ///Returns a cached framebuffer built from the same set of `views`, or creates a new one from `views` in the given
    /// order.
    ///
    /// If the pass was cached with another extent, all of its framebuffers are dropped.
    pub fn acquire_framebuffer(
        &self,
        device: &dyn Device,
        id: PassId,
        pass: &PassDef,
        views: &[ImageViewId],
        extent: vk::Extent2D,
    ) -> Result<Arc<dyn Framebuffer>, DeviceError> {
        {
            let mut inner = self.inner.lock();
            let key = view_key(views);
            let hash = inner.hasher.hash_one(&key);
            let bucket = inner
                .framebuffers
                .entry(id)
                .or_insert_with(|| FramebufferBucket {
                    extent,
                    entries: AHashMap::default(),
                });
            if bucket.extent != extent {
                #[cfg(feature = "logging")]
                log::trace!("Extent of {} changed, dropping framebuffers", pass.name());
                bucket.entries.clear();
                bucket.extent = extent;
            }

            if let Some(list) = bucket.entries.get_mut(&hash) {
                if let Some(pos) = list.iter().position(|(v, _)| *v == key) {
                    let (_, fb) = list.swap_remove(pos);
                    return Ok(fb);
                }
            }
        }

        device.make_framebuffer(pass, views, extent)
    }

    ///Returns the framebuffer to the cache, if it still matches the pass' extent.
    pub fn release_framebuffer(&self, pass: PassId, framebuffer: Arc<dyn Framebuffer>) {
        let mut inner = self.inner.lock();
        if !inner.valid {
            return;
        }
        let key = view_key(framebuffer.views());
        let hash = inner.hasher.hash_one(&key);
        if let Some(bucket) = inner.framebuffers.get_mut(&pass) {
            if bucket.extent == framebuffer.extent() {
                bucket
                    .entries
                    .entry(hash)
                    .or_default()
                    .push((key, framebuffer));
            }
        }
    }

    ///Returns a cached image with rearmed semaphores, or creates a new one.
    pub fn acquire_image(
        &self,
        device: &dyn Device,
        id: AttachmentId,
        attachment: &Attachment,
        extent: vk::Extent2D,
    ) -> Result<ImageAttachmentObject, DeviceError> {
        let cached = {
            let mut inner = self.inner.lock();
            let bucket = inner.images.entry(id).or_insert_with(|| ImageBucket {
                extent,
                images: Vec::new(),
            });
            if bucket.extent != extent {
                bucket.images.clear();
                bucket.extent = extent;
            }
            bucket.images.pop()
        };

        match cached {
            Some(mut image) => {
                image.rearm(device);
                Ok(image)
            }
            None => device.make_image(attachment, extent),
        }
    }

    ///Takes an image back. Swapchain images are never cached, they are handed back to the caller to be returned to
    /// their swapchain.
    pub fn release_image(
        &self,
        attachment: AttachmentId,
        image: ImageAttachmentObject,
    ) -> Option<ImageAttachmentObject> {
        if image.is_swapchain_image {
            return Some(image);
        }

        let mut inner = self.inner.lock();
        if !inner.valid {
            return None;
        }
        if let Some(bucket) = inner.images.get_mut(&attachment) {
            if bucket.extent == image.extent {
                bucket.images.push(image);
            }
        }
        None
    }

    ///Drops everything. Released resources are not cached anymore.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.valid = false;
        inner.framebuffers.clear();
        inner.images.clear();
    }

    pub fn cached_framebuffers(&self) -> usize {
        self.inner
            .lock()
            .framebuffers
            .values()
            .flat_map(|b| b.entries.values())
            .map(|l| l.len())
            .sum()
    }

    pub fn cached_images(&self) -> usize {
        self.inner
            .lock()
            .images
            .values()
            .map(|b| b.images.len())
            .sum()
    }
}
