use std::sync::Arc;

use ash::vk;

use crate::backend::PassObject;

use super::{slot::PassSlot, AttachmentId, DescriptorId, Queue, RenderOrdering};

///Maps the frame's extent to the extent a pass renders at.
pub type FrameSizeCallback = Arc<dyn Fn(&Queue, vk::Extent2D) -> vk::Extent2D + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassType {
    ///Render pass with a framebuffer.
    Graphics,
    Compute,
    Transfer,
    Generic,
}

///Attachment bound to a subpass in some layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassAttachment {
    pub attachment: AttachmentId,
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Default)]
pub struct Subpass {
    pub index: u32,
    pub inputs: Vec<SubpassAttachment>,
    pub outputs: Vec<SubpassAttachment>,
    pub resolves: Vec<SubpassAttachment>,
    pub depth_stencil: Option<SubpassAttachment>,
    pub preserve: Vec<AttachmentId>,
    pub pipelines: Vec<PipelineDef>,
}

impl Subpass {
    pub(crate) fn new(index: u32) -> Self {
        Subpass {
            index,
            ..Default::default()
        }
    }
}

///Explicit dependency between two subpasses of one pass. Use [vk::SUBPASS_EXTERNAL] for anything outside the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassDependency {
    pub src: u32,
    pub dst: u32,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub by_region: bool,
}

///Shader stage of a pipeline with its specialization constants as `(constant_id, value)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSpec {
    pub stage: vk::ShaderStageFlags,
    pub entry: String,
    pub constants: Vec<(u32, u32)>,
}

impl ShaderSpec {
    pub fn new(stage: vk::ShaderStageFlags, entry: impl Into<String>) -> Self {
        ShaderSpec {
            stage,
            entry: entry.into(),
            constants: Vec::new(),
        }
    }

    pub fn with_constant(mut self, id: u32, value: u32) -> Self {
        self.constants.push((id, value));
        self
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DynamicState: u8 {
        const VIEWPORT = 0b01;
        const SCISSOR = 0b10;
    }
}

///Pipeline declared in a subpass. Compilation is up to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDef {
    pub name: String,
    pub shaders: Vec<ShaderSpec>,
    pub dynamic_state: DynamicState,
}

impl PipelineDef {
    pub fn new(name: impl Into<String>) -> Self {
        PipelineDef {
            name: name.into(),
            shaders: Vec::new(),
            dynamic_state: DynamicState::empty(),
        }
    }

    pub fn with_shader(mut self, shader: ShaderSpec) -> Self {
        self.shaders.push(shader);
        self
    }

    pub fn with_dynamic_state(mut self, state: DynamicState) -> Self {
        self.dynamic_state |= state;
        self
    }
}

pub struct PassDef {
    pub(crate) name: String,
    pub(crate) ordering: RenderOrdering,
    pub(crate) ty: PassType,
    pub(crate) subpasses: Vec<Subpass>,
    pub(crate) dependencies: Vec<SubpassDependency>,
    ///One descriptor per attachment, in binding order.
    pub(crate) descriptors: Vec<DescriptorId>,
    pub(crate) object: Arc<dyn PassObject>,
    pub(crate) slot: PassSlot,
    pub(crate) frame_size: Option<FrameSizeCallback>,
}

impl PassDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordering(&self) -> RenderOrdering {
        self.ordering
    }

    pub fn ty(&self) -> PassType {
        self.ty
    }

    pub fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }

    pub fn dependencies(&self) -> &[SubpassDependency] {
        &self.dependencies
    }

    pub fn descriptors(&self) -> &[DescriptorId] {
        &self.descriptors
    }

    pub fn object(&self) -> &Arc<dyn PassObject> {
        &self.object
    }

    pub fn slot(&self) -> &PassSlot {
        &self.slot
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &PipelineDef> {
        self.subpasses.iter().flat_map(|s| s.pipelines.iter())
    }

    ///Extent this pass renders at for a frame of `frame_extent`.
    pub fn extent(&self, queue: &Queue, frame_extent: vk::Extent2D) -> vk::Extent2D {
        if let Some(cb) = &self.frame_size {
            cb(queue, frame_extent)
        } else {
            frame_extent
        }
    }
}
