//! Declarative description of a frame.
//!
//! A [Queue] is assembled by a [QueueBuilder] from attachments, passes and the references between them. Once built,
//! [Queue::prepare] derives load/store operations, layouts, image usage and descriptor kinds. A prepared queue is
//! immutable and shared by every frame that renders it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use ash::vk;
use slotmap::SlotMap;

use crate::{
    backend::{AttachmentObject, Device, PassObject},
    error::DefinitionError,
    handle::FrameContext,
    promise::Promise,
    request::InputData,
};

mod attachment;
pub use attachment::{
    Attachment, AttachmentDependency, AttachmentDescriptor, AttachmentOps, AttachmentRef,
    AttachmentRole, AttachmentType, AttachmentUsage, BufferInfo, DescriptorKind, ImageExtent,
    ImageInfo, ImageOps, InputCallback,
};
mod pass;
pub use pass::{
    DynamicState, FrameSizeCallback, PassDef, PassType, PipelineDef, ShaderSpec, Subpass,
    SubpassAttachment, SubpassDependency,
};
mod slot;
pub use slot::PassSlot;

slotmap::new_key_type! {
    pub struct AttachmentId;
    pub struct PassId;
    pub struct DescriptorId;
}

static QUEUE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

///Rank of a pass within its queue. Lower orderings are scheduled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RenderOrdering(pub u32);

pub struct Queue {
    id: QueueId,
    name: String,
    attachments: SlotMap<AttachmentId, Attachment>,
    passes: SlotMap<PassId, PassDef>,
    descriptors: SlotMap<DescriptorId, AttachmentDescriptor>,
    ///Passes sorted by ordering.
    pass_order: Vec<PassId>,
    prepared: bool,
    diagnostics: Vec<DefinitionError>,
    frame_order: AtomicU64,
}

impl Queue {
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder::new(name)
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    ///Warnings found while preparing the queue.
    pub fn diagnostics(&self) -> &[DefinitionError] {
        &self.diagnostics
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<&Attachment> {
        self.attachments.get(id)
    }

    pub fn attachments(&self) -> impl Iterator<Item = (AttachmentId, &Attachment)> {
        self.attachments.iter()
    }

    pub fn find_attachment(&self, name: &str) -> Option<AttachmentId> {
        self.attachments
            .iter()
            .find(|(_, a)| a.name == name)
            .map(|(id, _)| id)
    }

    pub fn pass(&self, id: PassId) -> Option<&PassDef> {
        self.passes.get(id)
    }

    pub fn find_pass(&self, name: &str) -> Option<PassId> {
        self.passes
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(id, _)| id)
    }

    pub fn pass_order(&self) -> &[PassId] {
        &self.pass_order
    }

    pub fn descriptor(&self, id: DescriptorId) -> Option<&AttachmentDescriptor> {
        self.descriptors.get(id)
    }

    ///Descriptor of `attachment` in `pass`, if the pass uses it.
    pub fn descriptor_of(&self, pass: PassId, attachment: AttachmentId) -> Option<DescriptorId> {
        self.passes.get(pass).and_then(|p| {
            p.descriptors
                .iter()
                .copied()
                .find(|d| self.descriptors.get(*d).map(|d| d.attachment) == Some(attachment))
        })
    }

    ///Order of the next frame created for this queue.
    pub(crate) fn next_frame_order(&self) -> u64 {
        self.frame_order.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_attachment_object(
        &mut self,
        attachment: AttachmentId,
        object: Arc<dyn AttachmentObject>,
    ) -> Result<(), DefinitionError> {
        if self.prepared {
            return Err(DefinitionError::QueuePrepared(self.name.clone()));
        }
        let att = self
            .attachments
            .get_mut(attachment)
            .ok_or(DefinitionError::UnknownAttachment)?;
        att.object = Some(object);
        Ok(())
    }

    pub fn set_input_callback(
        &mut self,
        attachment: AttachmentId,
        cb: impl Fn(&FrameContext, AttachmentId, Promise<InputData>) + Send + Sync + 'static,
    ) -> Result<(), DefinitionError> {
        if self.prepared {
            return Err(DefinitionError::QueuePrepared(self.name.clone()));
        }
        let att = self
            .attachments
            .get_mut(attachment)
            .ok_or(DefinitionError::UnknownAttachment)?;
        att.input_callback = Some(Arc::new(cb));
        Ok(())
    }

    ///Derives everything the frame runtime needs from the definition. Returns false if the queue was prepared already.
    ///
    /// Inconsistencies like reading an attachment before anything wrote it don't fail. They are logged and can be
    /// inspected via [diagnostics](Self::diagnostics).
    pub fn prepare(&mut self, device: &dyn Device) -> bool {
        if self.prepared {
            return false;
        }

        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let mut diagnostics = Vec::new();

        let attachment_ids: Vec<AttachmentId> = self.attachments.keys().collect();
        for att in attachment_ids {
            self.sort_descriptors(att);
            self.derive_dependencies(att);
            self.derive_kinds(att, device, &mut diagnostics);
            self.derive_image_ops(att, &mut diagnostics);
        }

        #[cfg(feature = "logging")]
        for warning in &diagnostics {
            log::warn!("Queue {}: {}", self.name, warning);
        }

        self.diagnostics = diagnostics;
        self.prepared = true;
        true
    }

    fn sort_descriptors(&mut self, att: AttachmentId) {
        let Some(attachment) = self.attachments.get_mut(att) else {
            return;
        };
        let descriptors = &self.descriptors;
        let passes = &self.passes;
        attachment.descriptors.sort_by_key(|d| {
            descriptors
                .get(*d)
                .and_then(|d| passes.get(d.pass))
                .map(|p| p.ordering)
        });

        attachment.transient =
            attachment.descriptors.len() == 1 && attachment.usage.is_empty();
    }

    fn derive_dependencies(&mut self, att: AttachmentId) {
        let Some(attachment) = self.attachments.get(att) else {
            return;
        };
        for d in &attachment.descriptors {
            let Some(desc) = self.descriptors.get_mut(*d) else {
                continue;
            };
            desc.refs.sort_by_key(|r| r.subpass);
            let (Some(first), Some(last)) = (desc.refs.first(), desc.refs.last()) else {
                continue;
            };
            desc.dependency = AttachmentDependency {
                initial_stage: first.dependency.initial_stage,
                initial_access: first.dependency.initial_access,
                final_stage: last.dependency.final_stage,
                final_access: last.dependency.final_access,
                required_state: desc
                    .refs
                    .iter()
                    .map(|r| r.dependency.required_state)
                    .max()
                    .unwrap_or_default(),
            };
        }
    }

    fn derive_kinds(
        &mut self,
        att: AttachmentId,
        device: &dyn Device,
        diagnostics: &mut Vec<DefinitionError>,
    ) {
        let Some(attachment) = self.attachments.get(att) else {
            return;
        };

        for d in &attachment.descriptors {
            let Some(desc) = self.descriptors.get_mut(*d) else {
                continue;
            };

            desc.kind = match &attachment.ty {
                AttachmentType::Buffer(info) => {
                    if attachment.kind_hint != DescriptorKind::Unknown {
                        attachment.kind_hint
                    } else if let Some(kind) = DescriptorKind::from_buffer_usage(info.usage) {
                        kind
                    } else {
                        diagnostics.push(DefinitionError::AmbiguousDescriptorKind {
                            attachment: attachment.name.clone(),
                            pass: self
                                .passes
                                .get(desc.pass)
                                .map(|p| p.name.clone())
                                .unwrap_or_default(),
                            usage: info.usage,
                        });
                        DescriptorKind::Unknown
                    }
                }
                AttachmentType::Image(_) if desc.has_input_ref() => DescriptorKind::InputAttachment,
                _ => attachment.kind_hint,
            };

            desc.update_after_bind =
                desc.kind != DescriptorKind::Unknown && device.supports_update_after_bind(desc.kind);
        }
    }

    ///Load/store operations, layout chain and image usage of an image attachment.
    fn derive_image_ops(&mut self, att: AttachmentId, diagnostics: &mut Vec<DefinitionError>) {
        let Some(attachment) = self.attachments.get_mut(att) else {
            return;
        };
        let AttachmentType::Image(info) = &mut attachment.ty else {
            return;
        };

        let mask = if info.has_stencil() {
            AttachmentOps::all()
        } else {
            AttachmentOps::READS_COLOR | AttachmentOps::WRITES_COLOR
        };

        //Fold refs into per descriptor ops
        let mut chain = Vec::with_capacity(attachment.descriptors.len());
        for d in &attachment.descriptors {
            let Some(desc) = self.descriptors.get_mut(*d) else {
                continue;
            };
            desc.ops = desc
                .refs
                .iter()
                .fold(AttachmentOps::empty(), |ops, r| ops | r.role.ops(r.layout))
                & mask;
            chain.push(*d);
        }

        let ops: Vec<AttachmentOps> = chain
            .iter()
            .filter_map(|d| self.descriptors.get(*d).map(|d| d.ops))
            .collect();
        let is_input = attachment.usage.contains(AttachmentUsage::INPUT);
        let is_output = attachment.usage.contains(AttachmentUsage::OUTPUT);

        let mut usage = info.usage;
        if attachment.transient {
            usage |= vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
        }
        if let Some(layout) = info.final_layout {
            usage |= attachment::layout_usage(layout);
        }

        let mut layout = info.initial_layout;
        let mut ever_read = [false, false];
        let mut ever_written = [false, false];

        for (idx, d) in chain.iter().enumerate() {
            let Some(desc) = self.descriptors.get_mut(*d) else {
                continue;
            };

            let mut image_ops = ImageOps {
                initial_layout: layout,
                final_layout: desc.refs.last().map(|r| r.layout).unwrap_or(layout),
                ..Default::default()
            };

            for (component, stencil) in [(0, false), (1, true)] {
                let written_before =
                    (idx == 0 && is_input) || ops[..idx].iter().any(|o| o.writes(stencil));
                let read_after = (idx + 1 == ops.len() && is_output)
                    || ops[idx + 1..].iter().any(|o| o.reads(stencil));

                let (load, store) = if desc.ops.touches(stencil) {
                    let load = if written_before {
                        vk::AttachmentLoadOp::LOAD
                    } else if info.clear_on_load {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::DONT_CARE
                    };
                    let store = if read_after {
                        vk::AttachmentStoreOp::STORE
                    } else {
                        vk::AttachmentStoreOp::DONT_CARE
                    };

                    if load == vk::AttachmentLoadOp::DONT_CARE
                        && first_access_reads(&desc.refs, mask, stencil)
                    {
                        diagnostics.push(DefinitionError::ReadBeforeWrite {
                            attachment: attachment.name.clone(),
                            pass: self
                                .passes
                                .get(desc.pass)
                                .map(|p| p.name.clone())
                                .unwrap_or_default(),
                        });
                    }
                    (load, store)
                } else if written_before && read_after {
                    //Untouched, but the content has to survive this pass.
                    (vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::STORE)
                } else {
                    (
                        vk::AttachmentLoadOp::DONT_CARE,
                        vk::AttachmentStoreOp::DONT_CARE,
                    )
                };

                ever_read[component] |= desc.ops.reads(stencil);
                ever_written[component] |= desc.ops.writes(stencil);

                if stencil {
                    image_ops.stencil_load_op = load;
                    image_ops.stencil_store_op = store;
                } else {
                    image_ops.load_op = load;
                    image_ops.store_op = store;
                }
            }

            if idx + 1 == chain.len() {
                if let Some(final_layout) = info.final_layout {
                    image_ops.final_layout = final_layout;
                }
            }
            layout = image_ops.final_layout;

            for r in &desc.refs {
                usage |= r.role.image_usage();
            }
            usage |= attachment::layout_usage(image_ops.final_layout);

            desc.image_ops = Some(image_ops);
        }

        //Transient content is thrown away by definition.
        if !is_output && !attachment.transient && (0..2).any(|c| ever_written[c] && !ever_read[c]) {
            diagnostics.push(DefinitionError::WrittenNeverRead(attachment.name.clone()));
        }

        info.usage = usage;
    }
}

///True if the first reference touching the component reads it.
fn first_access_reads(refs: &[AttachmentRef], mask: AttachmentOps, stencil: bool) -> bool {
    refs.iter()
        .map(|r| r.role.ops(r.layout) & mask)
        .find(|o| o.touches(stencil))
        .map(|o| o.reads(stencil))
        .unwrap_or(false)
}

///Assembles a [Queue].
///
/// Structural errors are reported as soon as the offending element is added.
pub struct QueueBuilder {
    queue: Queue,
    attachment_names: AHashMap<String, AttachmentId>,
    pass_names: AHashMap<String, PassId>,
    orderings: AHashMap<RenderOrdering, PassId>,
}

impl QueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        QueueBuilder {
            queue: Queue {
                id: QueueId(QUEUE_COUNTER.fetch_add(1, Ordering::Relaxed)),
                name: name.into(),
                attachments: SlotMap::with_key(),
                passes: SlotMap::with_key(),
                descriptors: SlotMap::with_key(),
                pass_order: Vec::new(),
                prepared: false,
                diagnostics: Vec::new(),
                frame_order: AtomicU64::new(0),
            },
            attachment_names: AHashMap::default(),
            pass_names: AHashMap::default(),
            orderings: AHashMap::default(),
        }
    }

    fn add_attachment(
        &mut self,
        name: String,
        ty: AttachmentType,
        usage: AttachmentUsage,
    ) -> Result<AttachmentId, DefinitionError> {
        if self.attachment_names.contains_key(&name) {
            return Err(DefinitionError::DuplicateAttachment(name));
        }
        let id = self
            .queue
            .attachments
            .insert(Attachment::new(name.clone(), ty, usage));
        self.attachment_names.insert(name, id);
        Ok(id)
    }

    pub fn add_image_attachment(
        &mut self,
        name: impl Into<String>,
        info: ImageInfo,
        usage: AttachmentUsage,
    ) -> Result<AttachmentId, DefinitionError> {
        self.add_attachment(name.into(), AttachmentType::Image(info), usage)
    }

    pub fn add_buffer_attachment(
        &mut self,
        name: impl Into<String>,
        info: BufferInfo,
        usage: AttachmentUsage,
    ) -> Result<AttachmentId, DefinitionError> {
        self.add_attachment(name.into(), AttachmentType::Buffer(info), usage)
    }

    pub fn add_generic_attachment(
        &mut self,
        name: impl Into<String>,
        usage: AttachmentUsage,
    ) -> Result<AttachmentId, DefinitionError> {
        self.add_attachment(name.into(), AttachmentType::Generic, usage)
    }

    ///Overrides descriptor kind inference for buffer and generic attachments.
    pub fn set_descriptor_kind(
        &mut self,
        attachment: AttachmentId,
        kind: DescriptorKind,
    ) -> Result<(), DefinitionError> {
        self.attachment_mut(attachment)?.kind_hint = kind;
        Ok(())
    }

    pub fn set_input_callback(
        &mut self,
        attachment: AttachmentId,
        cb: impl Fn(&FrameContext, AttachmentId, Promise<InputData>) + Send + Sync + 'static,
    ) -> Result<(), DefinitionError> {
        self.attachment_mut(attachment)?.input_callback = Some(Arc::new(cb));
        Ok(())
    }

    pub fn set_attachment_object(
        &mut self,
        attachment: AttachmentId,
        object: Arc<dyn AttachmentObject>,
    ) -> Result<(), DefinitionError> {
        self.attachment_mut(attachment)?.object = Some(object);
        Ok(())
    }

    fn attachment_mut(&mut self, id: AttachmentId) -> Result<&mut Attachment, DefinitionError> {
        self.queue
            .attachments
            .get_mut(id)
            .ok_or(DefinitionError::UnknownAttachment)
    }

    fn pass_mut(&mut self, id: PassId) -> Result<&mut PassDef, DefinitionError> {
        self.queue
            .passes
            .get_mut(id)
            .ok_or(DefinitionError::UnknownPass)
    }

    ///Adds a pass with a single subpass.
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        ty: PassType,
        ordering: RenderOrdering,
        object: Arc<dyn PassObject>,
    ) -> Result<PassId, DefinitionError> {
        let name = name.into();
        if self.pass_names.contains_key(&name) {
            return Err(DefinitionError::DuplicatePass(name));
        }
        if let Some(other) = self.orderings.get(&ordering) {
            let other = self
                .queue
                .passes
                .get(*other)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            return Err(DefinitionError::DuplicateOrdering {
                pass: name,
                other,
                ordering: ordering.0,
            });
        }

        let id = self.queue.passes.insert(PassDef {
            name: name.clone(),
            ordering,
            ty,
            subpasses: vec![Subpass::new(0)],
            dependencies: Vec::new(),
            descriptors: Vec::new(),
            object,
            slot: PassSlot::default(),
            frame_size: None,
        });
        self.pass_names.insert(name, id);
        self.orderings.insert(ordering, id);
        Ok(id)
    }

    ///Appends a subpass and returns its index.
    pub fn add_subpass(&mut self, pass: PassId) -> Result<u32, DefinitionError> {
        let pass = self.pass_mut(pass)?;
        let index = pass.subpasses.len() as u32;
        pass.subpasses.push(Subpass::new(index));
        Ok(index)
    }

    pub fn set_frame_size_callback(
        &mut self,
        pass: PassId,
        cb: impl Fn(&Queue, vk::Extent2D) -> vk::Extent2D + Send + Sync + 'static,
    ) -> Result<(), DefinitionError> {
        self.pass_mut(pass)?.frame_size = Some(Arc::new(cb));
        Ok(())
    }

    ///Binds `attachment` to `subpass` of `pass` in `role`.
    ///
    /// Binding an attachment as input and output of the same subpass with the same layout merges both into
    /// [AttachmentRole::InputOutput]. Any other second binding is an error.
    pub fn add_attachment_ref(
        &mut self,
        pass: PassId,
        subpass: u32,
        attachment: AttachmentId,
        role: AttachmentRole,
        layout: vk::ImageLayout,
        dependency: AttachmentDependency,
    ) -> Result<(), DefinitionError> {
        let (att_name, is_image) = {
            let att = self
                .queue
                .attachments
                .get(attachment)
                .ok_or(DefinitionError::UnknownAttachment)?;
            (att.name.clone(), matches!(att.ty, AttachmentType::Image(_)))
        };
        let pass_def = self
            .queue
            .passes
            .get(pass)
            .ok_or(DefinitionError::UnknownPass)?;
        let pass_name = pass_def.name.clone();
        let sub = pass_def
            .subpasses
            .get(subpass as usize)
            .ok_or_else(|| DefinitionError::UnknownSubpass {
                pass: pass_name.clone(),
                subpass,
            })?;

        if !is_image
            && matches!(
                role,
                AttachmentRole::DepthStencil | AttachmentRole::Resolve
            )
        {
            return Err(DefinitionError::NotAnImage(att_name));
        }
        if role == AttachmentRole::DepthStencil && sub.depth_stencil.is_some() {
            return Err(DefinitionError::MultipleDepthStencil {
                pass: pass_name,
                subpass,
            });
        }
        //Layouts only matter for images.
        let layout = if is_image {
            layout
        } else {
            vk::ImageLayout::UNDEFINED
        };

        let descriptor = match self.queue.descriptor_of(pass, attachment) {
            Some(d) => d,
            None => {
                let d = self
                    .queue
                    .descriptors
                    .insert(AttachmentDescriptor::new(attachment, pass));
                self.attachment_mut(attachment)?.descriptors.push(d);
                self.pass_mut(pass)?.descriptors.push(d);
                d
            }
        };

        let desc = self
            .queue
            .descriptors
            .get_mut(descriptor)
            .ok_or(DefinitionError::UnknownAttachment)?;

        let role = if let Some(existing) = desc.refs.iter_mut().find(|r| r.subpass == subpass) {
            if existing.layout != layout {
                return Err(DefinitionError::ConflictingLayout {
                    attachment: att_name,
                    pass: pass_name,
                    subpass,
                    first: existing.layout,
                    second: layout,
                });
            }
            match (existing.role, role) {
                (AttachmentRole::Input, AttachmentRole::Output)
                | (AttachmentRole::Output, AttachmentRole::Input) => {
                    existing.role = AttachmentRole::InputOutput;
                    existing.dependency.merge(&dependency);
                    //The other half is added to the subpass below.
                    role
                }
                _ => {
                    return Err(DefinitionError::DuplicateRole {
                        attachment: att_name,
                        pass: pass_name,
                        subpass,
                    });
                }
            }
        } else {
            desc.refs.push(AttachmentRef {
                subpass,
                role,
                layout,
                dependency,
            });
            role
        };

        let entry = SubpassAttachment { attachment, layout };
        let sub = self
            .pass_mut(pass)?
            .subpasses
            .get_mut(subpass as usize)
            .ok_or(DefinitionError::UnknownPass)?;
        match role {
            AttachmentRole::Input => sub.inputs.push(entry),
            AttachmentRole::Output => sub.outputs.push(entry),
            AttachmentRole::InputOutput => {
                sub.inputs.push(entry);
                sub.outputs.push(entry);
            }
            AttachmentRole::Resolve => sub.resolves.push(entry),
            AttachmentRole::DepthStencil => sub.depth_stencil = Some(entry),
            AttachmentRole::Preserve => sub.preserve.push(attachment),
        }

        Ok(())
    }

    pub fn add_subpass_dependency(
        &mut self,
        pass: PassId,
        dependency: SubpassDependency,
    ) -> Result<(), DefinitionError> {
        let pass = self.pass_mut(pass)?;
        let count = pass.subpasses.len() as u32;
        let exists = |idx: u32| idx == vk::SUBPASS_EXTERNAL || idx < count;
        let ordered = dependency.src == vk::SUBPASS_EXTERNAL || dependency.src <= dependency.dst;
        let both_external =
            dependency.src == vk::SUBPASS_EXTERNAL && dependency.dst == vk::SUBPASS_EXTERNAL;

        if !exists(dependency.src) || !exists(dependency.dst) || !ordered || both_external {
            return Err(DefinitionError::InvalidSubpassDependency {
                pass: pass.name.clone(),
                src: dependency.src,
                dst: dependency.dst,
            });
        }

        pass.dependencies.push(dependency);
        Ok(())
    }

    pub fn add_pipeline(
        &mut self,
        pass: PassId,
        subpass: u32,
        pipeline: PipelineDef,
    ) -> Result<(), DefinitionError> {
        let pass = self.pass_mut(pass)?;
        if pass.pipelines().any(|p| p.name == pipeline.name) {
            return Err(DefinitionError::DuplicatePipeline {
                pass: pass.name.clone(),
                pipeline: pipeline.name,
            });
        }
        let name = pass.name.clone();
        pass.subpasses
            .get_mut(subpass as usize)
            .ok_or(DefinitionError::UnknownSubpass {
                pass: name,
                subpass,
            })?
            .pipelines
            .push(pipeline);
        Ok(())
    }

    pub fn build(self) -> Queue {
        let mut queue = self.queue;
        let mut order: Vec<(RenderOrdering, PassId)> =
            queue.passes.iter().map(|(id, p)| (p.ordering, id)).collect();
        order.sort();
        queue.pass_order = order.into_iter().map(|(_, id)| id).collect();
        queue
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk;

    use super::*;
    use crate::{
        state::FramePassState,
        testing::{MockDevice, MockPassObject},
    };

    fn color() -> ImageInfo {
        ImageInfo::new(vk::Format::R8G8B8A8_UNORM)
    }

    fn pass(b: &mut QueueBuilder, name: &str, ordering: u32) -> PassId {
        b.add_pass(
            name,
            PassType::Graphics,
            RenderOrdering(ordering),
            Arc::new(MockPassObject::default()),
        )
        .unwrap()
    }

    fn output(b: &mut QueueBuilder, pass: PassId, att: AttachmentId) {
        b.add_attachment_ref(
            pass,
            0,
            att,
            AttachmentRole::Output,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            AttachmentDependency::default(),
        )
        .unwrap();
    }

    fn input(b: &mut QueueBuilder, pass: PassId, att: AttachmentId) {
        b.add_attachment_ref(
            pass,
            0,
            att,
            AttachmentRole::Input,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            AttachmentDependency::default(),
        )
        .unwrap();
    }

    fn ops_of(queue: &Queue, pass: PassId, att: AttachmentId) -> ImageOps {
        let d = queue.descriptor_of(pass, att).unwrap();
        queue.descriptor(d).unwrap().image_ops.unwrap()
    }

    #[test]
    fn unique_names_and_orderings() {
        let mut b = Queue::builder("q");
        pass(&mut b, "a", 0);
        assert!(matches!(
            b.add_pass(
                "a",
                PassType::Graphics,
                RenderOrdering(1),
                Arc::new(MockPassObject::default())
            ),
            Err(DefinitionError::DuplicatePass(_))
        ));
        assert!(matches!(
            b.add_pass(
                "b",
                PassType::Graphics,
                RenderOrdering(0),
                Arc::new(MockPassObject::default())
            ),
            Err(DefinitionError::DuplicateOrdering { ordering: 0, .. })
        ));

        b.add_image_attachment("img", color(), AttachmentUsage::empty())
            .unwrap();
        assert!(matches!(
            b.add_image_attachment("img", color(), AttachmentUsage::empty()),
            Err(DefinitionError::DuplicateAttachment(_))
        ));
    }

    #[test]
    fn pass_order_follows_ordering() {
        let mut b = Queue::builder("q");
        let late = pass(&mut b, "late", 10);
        let early = pass(&mut b, "early", 2);
        let mid = pass(&mut b, "mid", 5);
        let q = b.build();
        assert_eq!(q.pass_order(), &[early, mid, late]);
    }

    #[test]
    fn ref_roles_and_layouts() {
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        let a = b
            .add_image_attachment("a", color(), AttachmentUsage::empty())
            .unwrap();
        let depth = b
            .add_image_attachment(
                "depth",
                ImageInfo::new(vk::Format::D32_SFLOAT),
                AttachmentUsage::empty(),
            )
            .unwrap();
        let depth2 = b
            .add_image_attachment(
                "depth2",
                ImageInfo::new(vk::Format::D32_SFLOAT),
                AttachmentUsage::empty(),
            )
            .unwrap();

        b.add_attachment_ref(
            p,
            0,
            a,
            AttachmentRole::Input,
            vk::ImageLayout::GENERAL,
            AttachmentDependency::default(),
        )
        .unwrap();
        //different layout conflicts
        assert!(matches!(
            b.add_attachment_ref(
                p,
                0,
                a,
                AttachmentRole::Output,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                AttachmentDependency::default(),
            ),
            Err(DefinitionError::ConflictingLayout { .. })
        ));
        //same layout merges
        b.add_attachment_ref(
            p,
            0,
            a,
            AttachmentRole::Output,
            vk::ImageLayout::GENERAL,
            AttachmentDependency::default(),
        )
        .unwrap();
        //anything else is a duplicate
        assert!(matches!(
            b.add_attachment_ref(
                p,
                0,
                a,
                AttachmentRole::Resolve,
                vk::ImageLayout::GENERAL,
                AttachmentDependency::default(),
            ),
            Err(DefinitionError::DuplicateRole { .. })
        ));

        b.add_attachment_ref(
            p,
            0,
            depth,
            AttachmentRole::DepthStencil,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            AttachmentDependency::default(),
        )
        .unwrap();
        assert!(matches!(
            b.add_attachment_ref(
                p,
                0,
                depth2,
                AttachmentRole::DepthStencil,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                AttachmentDependency::default(),
            ),
            Err(DefinitionError::MultipleDepthStencil { .. })
        ));

        let q = b.build();
        let d = q.descriptor_of(p, a).unwrap();
        assert_eq!(q.descriptor(d).unwrap().refs.len(), 1);
        assert_eq!(
            q.descriptor(d).unwrap().refs[0].role,
            AttachmentRole::InputOutput
        );
        let sub = &q.pass(p).unwrap().subpasses()[0];
        assert_eq!(sub.inputs.len(), 1);
        assert_eq!(sub.outputs.len(), 1);
    }

    #[test]
    fn buffers_are_no_images() {
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        let buf = b
            .add_buffer_attachment(
                "buf",
                BufferInfo {
                    size: 64,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                },
                AttachmentUsage::empty(),
            )
            .unwrap();
        assert!(matches!(
            b.add_attachment_ref(
                p,
                0,
                buf,
                AttachmentRole::DepthStencil,
                vk::ImageLayout::GENERAL,
                AttachmentDependency::default(),
            ),
            Err(DefinitionError::NotAnImage(_))
        ));
    }

    #[test]
    fn subpass_dependencies_and_pipelines() {
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        let second = b.add_subpass(p).unwrap();
        assert_eq!(second, 1);

        let dep = |src, dst| SubpassDependency {
            src,
            dst,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            by_region: true,
        };
        b.add_subpass_dependency(p, dep(0, 1)).unwrap();
        b.add_subpass_dependency(p, dep(vk::SUBPASS_EXTERNAL, 0))
            .unwrap();
        b.add_subpass_dependency(p, dep(1, vk::SUBPASS_EXTERNAL))
            .unwrap();
        assert!(b.add_subpass_dependency(p, dep(1, 0)).is_err());
        assert!(b.add_subpass_dependency(p, dep(0, 2)).is_err());

        b.add_pipeline(
            p,
            1,
            PipelineDef::new("tonemap")
                .with_shader(ShaderSpec::new(vk::ShaderStageFlags::FRAGMENT, "main").with_constant(0, 1))
                .with_dynamic_state(DynamicState::VIEWPORT | DynamicState::SCISSOR),
        )
        .unwrap();
        assert!(matches!(
            b.add_pipeline(p, 0, PipelineDef::new("tonemap")),
            Err(DefinitionError::DuplicatePipeline { .. })
        ));
        assert!(b.add_pipeline(p, 4, PipelineDef::new("other")).is_err());

        let q = b.build();
        assert_eq!(q.pass(p).unwrap().dependencies().len(), 3);
        assert_eq!(q.pass(p).unwrap().pipelines().count(), 1);
    }

    #[test]
    fn prepare_is_idempotent() {
        let device = MockDevice::default();
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        let a = b
            .add_image_attachment("a", color(), AttachmentUsage::OUTPUT)
            .unwrap();
        output(&mut b, p, a);

        let mut q = b.build();
        assert!(q.prepare(&device));
        let ops = ops_of(&q, p, a);
        assert!(!q.prepare(&device));
        assert_eq!(ops, ops_of(&q, p, a));
        assert!(matches!(
            q.set_attachment_object(a, Arc::new(crate::testing::MockAttachmentObject::default())),
            Err(DefinitionError::QueuePrepared(_))
        ));
    }

    ///Two passes: first writes depth and color, second reads the color and writes another.
    #[test]
    fn two_pass_chain_ops() {
        let device = MockDevice::default();
        let mut b = Queue::builder("q");
        let p1 = pass(&mut b, "p1", 0);
        let p2 = pass(&mut b, "p2", 1);
        let depth = b
            .add_image_attachment(
                "depth",
                ImageInfo::new(vk::Format::D24_UNORM_S8_UINT).with_clear(),
                AttachmentUsage::empty(),
            )
            .unwrap();
        let c1 = b
            .add_image_attachment("c1", color().with_clear(), AttachmentUsage::empty())
            .unwrap();
        let c2 = b
            .add_image_attachment(
                "c2",
                color().with_final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                AttachmentUsage::OUTPUT,
            )
            .unwrap();

        b.add_attachment_ref(
            p1,
            0,
            depth,
            AttachmentRole::DepthStencil,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            AttachmentDependency::default(),
        )
        .unwrap();
        output(&mut b, p1, c1);
        input(&mut b, p2, c1);
        output(&mut b, p2, c2);

        let mut q = b.build();
        q.prepare(&device);

        let d = ops_of(&q, p1, depth);
        assert_eq!(d.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(d.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(d.stencil_load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(d.stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert!(q.attachment(depth).unwrap().is_transient());
        assert!(q
            .attachment(depth)
            .unwrap()
            .image_info()
            .unwrap()
            .usage
            .contains(vk::ImageUsageFlags::TRANSIENT_ATTACHMENT));

        let c1_p1 = ops_of(&q, p1, c1);
        let c1_p2 = ops_of(&q, p2, c1);
        assert_eq!(c1_p1.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(c1_p1.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(c1_p2.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(c1_p2.store_op, vk::AttachmentStoreOp::DONT_CARE);
        //color formats carry no stencil ops
        assert_eq!(c1_p1.stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);

        //layout chain
        assert_eq!(c1_p1.final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(c1_p2.initial_layout, c1_p1.final_layout);
        assert_eq!(c1_p2.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        //output attachment is stored and ends in its declared layout
        let c2_ops = ops_of(&q, p2, c2);
        assert_eq!(c2_ops.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(c2_ops.final_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let c2_usage = q.attachment(c2).unwrap().image_info().unwrap().usage;
        assert!(c2_usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(c2_usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));

        let c1_usage = q.attachment(c1).unwrap().image_info().unwrap().usage;
        assert!(c1_usage.contains(
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT
        ));
        assert!(c1_usage.contains(vk::ImageUsageFlags::SAMPLED));

        let kind = q
            .descriptor(q.descriptor_of(p2, c1).unwrap())
            .unwrap()
            .kind;
        assert_eq!(kind, DescriptorKind::InputAttachment);

        //P2 waits for P1 to be submitted
        let dep = q
            .descriptor(q.descriptor_of(p2, c1).unwrap())
            .unwrap()
            .dependency;
        assert_eq!(dep.required_state, FramePassState::Submitted);

        assert!(q.diagnostics().is_empty(), "{:?}", q.diagnostics());
    }

    #[test]
    fn unread_writes_are_never_stored() {
        let device = MockDevice::default();
        let mut b = Queue::builder("q");
        let p1 = pass(&mut b, "p1", 0);
        let p2 = pass(&mut b, "p2", 1);
        let p3 = pass(&mut b, "p3", 2);
        let a = b
            .add_image_attachment("a", color(), AttachmentUsage::empty())
            .unwrap();
        output(&mut b, p1, a);
        output(&mut b, p2, a);
        output(&mut b, p3, a);

        let mut q = b.build();
        q.prepare(&device);
        for p in [p1, p2, p3] {
            assert_eq!(ops_of(&q, p, a).store_op, vk::AttachmentStoreOp::DONT_CARE);
        }
        assert!(q
            .diagnostics()
            .iter()
            .any(|d| matches!(d, DefinitionError::WrittenNeverRead(_))));

        //Layouts chain over all three descriptors
        let ops: Vec<_> = [p1, p2, p3].iter().map(|p| ops_of(&q, *p, a)).collect();
        for w in ops.windows(2) {
            assert_eq!(w[1].initial_layout, w[0].final_layout);
        }
    }

    #[test]
    fn read_before_write() {
        let device = MockDevice::default();
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        let a = b
            .add_image_attachment("a", color(), AttachmentUsage::empty())
            .unwrap();
        input(&mut b, p, a);

        let mut q = b.build();
        q.prepare(&device);
        assert_eq!(ops_of(&q, p, a).load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert!(q
            .diagnostics()
            .iter()
            .any(|d| matches!(d, DefinitionError::ReadBeforeWrite { .. })));
    }

    #[test]
    fn input_attachments_load() {
        let device = MockDevice::default();
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        let a = b
            .add_image_attachment(
                "a",
                color().with_initial_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                AttachmentUsage::INPUT,
            )
            .unwrap();
        input(&mut b, p, a);

        let mut q = b.build();
        q.prepare(&device);
        let ops = ops_of(&q, p, a);
        assert_eq!(ops.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(ops.initial_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(q.diagnostics().is_empty());
        assert!(!q.attachment(a).unwrap().is_transient());
    }

    #[test]
    fn buffer_descriptor_kinds() {
        let device = MockDevice {
            update_after_bind: true,
            ..Default::default()
        };
        let mut b = Queue::builder("q");
        let p = b
            .add_pass(
                "compute",
                PassType::Compute,
                RenderOrdering(0),
                Arc::new(MockPassObject::default()),
            )
            .unwrap();
        let storage = b
            .add_buffer_attachment(
                "storage",
                BufferInfo {
                    size: 256,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::TRANSFER_DST,
                },
                AttachmentUsage::INPUT,
            )
            .unwrap();
        let ambiguous = b
            .add_buffer_attachment(
                "ambiguous",
                BufferInfo {
                    size: 256,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::UNIFORM_BUFFER,
                },
                AttachmentUsage::INPUT,
            )
            .unwrap();
        let hinted = b
            .add_buffer_attachment(
                "hinted",
                BufferInfo {
                    size: 256,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::UNIFORM_BUFFER,
                },
                AttachmentUsage::INPUT,
            )
            .unwrap();
        b.set_descriptor_kind(hinted, DescriptorKind::UniformBuffer)
            .unwrap();
        for att in [storage, ambiguous, hinted] {
            b.add_attachment_ref(
                p,
                0,
                att,
                AttachmentRole::Input,
                vk::ImageLayout::UNDEFINED,
                AttachmentDependency::default(),
            )
            .unwrap();
        }

        let mut q = b.build();
        q.prepare(&device);
        let desc = |att| q.descriptor(q.descriptor_of(p, att).unwrap()).unwrap();
        assert_eq!(desc(storage).kind, DescriptorKind::StorageBuffer);
        assert!(desc(storage).update_after_bind);
        assert!(desc(storage).image_ops.is_none());
        assert_eq!(desc(ambiguous).kind, DescriptorKind::Unknown);
        assert!(!desc(ambiguous).update_after_bind);
        assert_eq!(desc(hinted).kind, DescriptorKind::UniformBuffer);
        assert_eq!(
            q.diagnostics()
                .iter()
                .filter(|d| matches!(d, DefinitionError::AmbiguousDescriptorKind { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn dependency_over_subpasses() {
        let device = MockDevice::default();
        let mut b = Queue::builder("q");
        let p = pass(&mut b, "p", 0);
        b.add_subpass(p).unwrap();
        let a = b
            .add_image_attachment("a", color(), AttachmentUsage::OUTPUT)
            .unwrap();

        //Added out of order, sorted by prepare
        b.add_attachment_ref(
            p,
            1,
            a,
            AttachmentRole::Input,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            AttachmentDependency::new(
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::INPUT_ATTACHMENT_READ,
            )
            .with_required_state(FramePassState::Complete),
        )
        .unwrap();
        b.add_attachment_ref(
            p,
            0,
            a,
            AttachmentRole::Output,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            AttachmentDependency::new(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .with_required_state(FramePassState::Prepared),
        )
        .unwrap();

        let mut q = b.build();
        q.prepare(&device);
        let desc = q.descriptor(q.descriptor_of(p, a).unwrap()).unwrap();
        assert_eq!(desc.refs[0].subpass, 0);
        assert_eq!(
            desc.dependency.initial_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            desc.dependency.final_stage,
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert_eq!(desc.dependency.required_state, FramePassState::Complete);
        assert_eq!(
            desc.image_ops.unwrap().final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }
}
