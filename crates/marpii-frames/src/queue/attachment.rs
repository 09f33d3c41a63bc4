use std::sync::Arc;

use ash::vk;

use crate::{
    backend::AttachmentObject,
    handle::FrameContext,
    promise::Promise,
    request::InputData,
    state::FramePassState,
};

use super::{AttachmentId, DescriptorId, PassId};

///Called whenever a frame needs producer input for an attachment that was not bound on the
/// [FrameRequest](crate::FrameRequest). Fulfilling the promise submits the data to the attachment's handle, dropping it
/// invalidates the frame.
pub type InputCallback = Arc<dyn Fn(&FrameContext, AttachmentId, Promise<InputData>) + Send + Sync>;

bitflags::bitflags! {
    ///External usage of an attachment. `INPUT` attachments receive data from the producer, `OUTPUT` attachments
    /// are handed out once the frame is done with them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachmentUsage: u8 {
        const INPUT = 0b01;
        const OUTPUT = 0b10;
    }
}

bitflags::bitflags! {
    ///What a subpass reference does to the color (or depth) and stencil component of an image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachmentOps: u8 {
        const READS_COLOR = 0b0001;
        const WRITES_COLOR = 0b0010;
        const READS_STENCIL = 0b0100;
        const WRITES_STENCIL = 0b1000;
    }
}

impl AttachmentOps {
    pub fn reads(&self, stencil: bool) -> bool {
        if stencil {
            self.contains(Self::READS_STENCIL)
        } else {
            self.contains(Self::READS_COLOR)
        }
    }

    pub fn writes(&self, stencil: bool) -> bool {
        if stencil {
            self.contains(Self::WRITES_STENCIL)
        } else {
            self.contains(Self::WRITES_COLOR)
        }
    }

    pub fn touches(&self, stencil: bool) -> bool {
        self.reads(stencil) || self.writes(stencil)
    }
}

///Size of an image attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageExtent {
    ///Follows the extent of the pass that acquires the image.
    #[default]
    Frame,
    Fixed(vk::Extent2D),
}

impl ImageExtent {
    pub fn resolve(&self, frame: vk::Extent2D) -> vk::Extent2D {
        match self {
            ImageExtent::Frame => frame,
            ImageExtent::Fixed(e) => *e,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: vk::Format,
    pub extent: ImageExtent,
    pub samples: vk::SampleCountFlags,
    ///Usage flags. Flags implied by the attachment's references are added when the queue is prepared.
    pub usage: vk::ImageUsageFlags,
    ///Layout the image is in, before the first pass uses it.
    pub initial_layout: vk::ImageLayout,
    ///Layout the last pass leaves the image in. If not set, the last reference's layout is kept.
    pub final_layout: Option<vk::ImageLayout>,
    ///If set, the first pass that writes the image clears it.
    pub clear_on_load: bool,
}

impl ImageInfo {
    pub fn new(format: vk::Format) -> Self {
        ImageInfo {
            format,
            extent: ImageExtent::Frame,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::empty(),
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: None,
            clear_on_load: false,
        }
    }

    pub fn with_extent(mut self, extent: ImageExtent) -> Self {
        self.extent = extent;
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.initial_layout = layout;
        self
    }

    pub fn with_final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = Some(layout);
        self
    }

    pub fn with_clear(mut self) -> Self {
        self.clear_on_load = true;
        self
    }

    pub fn has_stencil(&self) -> bool {
        matches!(
            self.format,
            vk::Format::S8_UINT
                | vk::Format::D16_UNORM_S8_UINT
                | vk::Format::D24_UNORM_S8_UINT
                | vk::Format::D32_SFLOAT_S8_UINT
        )
    }

    pub fn is_depth(&self) -> bool {
        matches!(
            self.format,
            vk::Format::D16_UNORM
                | vk::Format::X8_D24_UNORM_PACK32
                | vk::Format::D32_SFLOAT
                | vk::Format::D16_UNORM_S8_UINT
                | vk::Format::D24_UNORM_S8_UINT
                | vk::Format::D32_SFLOAT_S8_UINT
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentType {
    Image(ImageInfo),
    Buffer(BufferInfo),
    ///Anything the backend manages on its own. The runtime only tracks its lifecycle.
    Generic,
}

///Role of an attachment within a subpass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentRole {
    Input,
    Output,
    ///Input and output within the same subpass, created by binding both with the same layout.
    InputOutput,
    Resolve,
    DepthStencil,
    Preserve,
}

impl AttachmentRole {
    ///Color/stencil operations of a reference with this role, bound in `layout`.
    pub fn ops(&self, layout: vk::ImageLayout) -> AttachmentOps {
        match self {
            AttachmentRole::Input => AttachmentOps::READS_COLOR | AttachmentOps::READS_STENCIL,
            AttachmentRole::Output | AttachmentRole::Resolve => {
                AttachmentOps::WRITES_COLOR | AttachmentOps::WRITES_STENCIL
            }
            AttachmentRole::InputOutput => AttachmentOps::all(),
            AttachmentRole::DepthStencil => depth_stencil_ops(layout),
            AttachmentRole::Preserve => AttachmentOps::empty(),
        }
    }

    pub fn image_usage(&self) -> vk::ImageUsageFlags {
        match self {
            AttachmentRole::Input => vk::ImageUsageFlags::INPUT_ATTACHMENT,
            AttachmentRole::Output | AttachmentRole::Resolve => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            }
            AttachmentRole::InputOutput => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT
            }
            AttachmentRole::DepthStencil => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            AttachmentRole::Preserve => vk::ImageUsageFlags::empty(),
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, AttachmentRole::Input | AttachmentRole::InputOutput)
    }
}

fn depth_stencil_ops(layout: vk::ImageLayout) -> AttachmentOps {
    //Attachment layouts write, read-only layouts read.
    match layout {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            AttachmentOps::READS_COLOR | AttachmentOps::READS_STENCIL
        }
        vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL => {
            AttachmentOps::READS_COLOR | AttachmentOps::WRITES_STENCIL
        }
        vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => {
            AttachmentOps::WRITES_COLOR | AttachmentOps::READS_STENCIL
        }
        vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL => AttachmentOps::READS_COLOR,
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL => AttachmentOps::WRITES_COLOR,
        vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL => AttachmentOps::READS_STENCIL,
        vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL => AttachmentOps::WRITES_STENCIL,
        _ => AttachmentOps::WRITES_COLOR | AttachmentOps::WRITES_STENCIL,
    }
}

///Usage implied by an attachment leaving a pass in `layout`.
pub(crate) fn layout_usage(layout: vk::ImageLayout) -> vk::ImageUsageFlags {
    match layout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::ImageUsageFlags::TRANSFER_SRC,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::ImageUsageFlags::TRANSFER_DST,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::ImageUsageFlags::SAMPLED,
        vk::ImageLayout::GENERAL => vk::ImageUsageFlags::STORAGE,
        _ => vk::ImageUsageFlags::empty(),
    }
}

///Kind of descriptor a pass binds an attachment as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DescriptorKind {
    #[default]
    Unknown,
    InputAttachment,
    SampledImage,
    StorageImage,
    CombinedImageSampler,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    pub fn descriptor_type(&self) -> Option<vk::DescriptorType> {
        Some(match self {
            DescriptorKind::Unknown => return None,
            DescriptorKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        })
    }

    ///Infers the descriptor kind from buffer usage. Returns `None` if more than one kind would match.
    pub fn from_buffer_usage(usage: vk::BufferUsageFlags) -> Option<Self> {
        let candidates = [
            (
                vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
                DescriptorKind::UniformTexelBuffer,
            ),
            (
                vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
                DescriptorKind::StorageTexelBuffer,
            ),
            (
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                DescriptorKind::UniformBuffer,
            ),
            (
                vk::BufferUsageFlags::STORAGE_BUFFER,
                DescriptorKind::StorageBuffer,
            ),
        ];

        let mut found = DescriptorKind::Unknown;
        for (flag, kind) in candidates {
            if usage.contains(flag) {
                if found != DescriptorKind::Unknown {
                    return None;
                }
                found = kind;
            }
        }
        Some(found)
    }
}

///Synchronization record of a reference or descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDependency {
    pub initial_stage: vk::PipelineStageFlags,
    pub initial_access: vk::AccessFlags,
    pub final_stage: vk::PipelineStageFlags,
    pub final_access: vk::AccessFlags,
    ///State every earlier pass using the attachment has to reach, before this one may become ready.
    pub required_state: FramePassState,
}

impl Default for AttachmentDependency {
    fn default() -> Self {
        AttachmentDependency {
            initial_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            initial_access: vk::AccessFlags::empty(),
            final_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            final_access: vk::AccessFlags::empty(),
            required_state: FramePassState::Submitted,
        }
    }
}

impl AttachmentDependency {
    pub fn new(stage: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        AttachmentDependency {
            initial_stage: stage,
            initial_access: access,
            final_stage: stage,
            final_access: access,
            ..Default::default()
        }
    }

    pub fn with_required_state(mut self, state: FramePassState) -> Self {
        self.required_state = state;
        self
    }

    pub(crate) fn merge(&mut self, other: &AttachmentDependency) {
        self.initial_stage |= other.initial_stage;
        self.initial_access |= other.initial_access;
        self.final_stage |= other.final_stage;
        self.final_access |= other.final_access;
        self.required_state = self.required_state.max(other.required_state);
    }
}

///Load/store operations and layouts derived for an image descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOps {
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl Default for ImageOps {
    fn default() -> Self {
        ImageOps {
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

///Usage of an attachment in one subpass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub subpass: u32,
    pub role: AttachmentRole,
    pub layout: vk::ImageLayout,
    pub dependency: AttachmentDependency,
}

///Binding site of an attachment within one pass.
#[derive(Debug, Clone)]
pub struct AttachmentDescriptor {
    pub attachment: AttachmentId,
    pub pass: PassId,
    ///References sorted by subpass once the queue is prepared.
    pub refs: Vec<AttachmentRef>,
    pub kind: DescriptorKind,
    pub dependency: AttachmentDependency,
    ///Folded operations of all references.
    pub ops: AttachmentOps,
    ///Only set for image attachments.
    pub image_ops: Option<ImageOps>,
    pub update_after_bind: bool,
}

impl AttachmentDescriptor {
    pub(crate) fn new(attachment: AttachmentId, pass: PassId) -> Self {
        AttachmentDescriptor {
            attachment,
            pass,
            refs: Vec::new(),
            kind: DescriptorKind::Unknown,
            dependency: AttachmentDependency::default(),
            ops: AttachmentOps::empty(),
            image_ops: None,
            update_after_bind: false,
        }
    }

    pub fn has_input_ref(&self) -> bool {
        self.refs.iter().any(|r| r.role.is_input())
    }
}

///Named resource that flows through the passes of a queue.
pub struct Attachment {
    pub(crate) name: String,
    pub(crate) ty: AttachmentType,
    pub(crate) usage: AttachmentUsage,
    pub(crate) kind_hint: DescriptorKind,
    ///Sorted by pass ordering once the queue is prepared.
    pub(crate) descriptors: Vec<DescriptorId>,
    pub(crate) transient: bool,
    pub(crate) input_callback: Option<InputCallback>,
    pub(crate) object: Option<Arc<dyn AttachmentObject>>,
}

impl Attachment {
    pub(crate) fn new(name: String, ty: AttachmentType, usage: AttachmentUsage) -> Self {
        Attachment {
            name,
            ty,
            usage,
            kind_hint: DescriptorKind::Unknown,
            descriptors: Vec::new(),
            transient: false,
            input_callback: None,
            object: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &AttachmentType {
        &self.ty
    }

    pub fn image_info(&self) -> Option<&ImageInfo> {
        if let AttachmentType::Image(info) = &self.ty {
            Some(info)
        } else {
            None
        }
    }

    pub fn usage(&self) -> AttachmentUsage {
        self.usage
    }

    pub fn kind_hint(&self) -> DescriptorKind {
        self.kind_hint
    }

    pub fn descriptors(&self) -> &[DescriptorId] {
        &self.descriptors
    }

    ///True if only a single pass touches the attachment and it is neither input nor output.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn input_callback(&self) -> Option<&InputCallback> {
        self.input_callback.as_ref()
    }

    pub fn object(&self) -> Option<&Arc<dyn AttachmentObject>> {
        self.object.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;

    #[test]
    fn buffer_kind_inference() {
        assert_eq!(
            DescriptorKind::from_buffer_usage(
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            ),
            Some(DescriptorKind::StorageBuffer)
        );
        assert_eq!(
            DescriptorKind::from_buffer_usage(vk::BufferUsageFlags::TRANSFER_SRC),
            Some(DescriptorKind::Unknown)
        );
        assert_eq!(
            DescriptorKind::from_buffer_usage(
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER
            ),
            None
        );
    }

    #[test]
    fn depth_layouts() {
        let rw = AttachmentRole::DepthStencil.ops(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert!(rw.writes(false) && rw.writes(true));
        assert!(!rw.reads(false));

        let ro = AttachmentRole::DepthStencil.ops(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
        assert!(ro.reads(false) && ro.reads(true));
        assert!(!ro.writes(false) && !ro.writes(true));

        assert!(AttachmentRole::Preserve
            .ops(vk::ImageLayout::GENERAL)
            .is_empty());
    }

    #[test]
    fn stencil_formats() {
        assert!(ImageInfo::new(vk::Format::D24_UNORM_S8_UINT).has_stencil());
        assert!(!ImageInfo::new(vk::Format::D32_SFLOAT).has_stencil());
        assert!(ImageInfo::new(vk::Format::D32_SFLOAT).is_depth());
        assert!(!ImageInfo::new(vk::Format::R8G8B8A8_UNORM).is_depth());
    }
}
