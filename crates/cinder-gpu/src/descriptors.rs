//! Descriptor set management.
//!
//! Layouts are described as plain data first ([`LayoutDescription`]) and only
//! then turned into Vulkan objects, so the binding rules can be checked without
//! a device. Pools track their remaining capacity on the CPU ([`PoolBudget`]);
//! running out is a recoverable [`DescriptorAllocError`], not a `GpuError`.

use crate::capabilities::GpuCapabilities;
use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// How shader resources are bound, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorMode {
    /// Large partially bound arrays indexed in the shader.
    Bindless,
    /// One descriptor per resource, rebound per draw.
    Classic,
}

impl DescriptorMode {
    /// Pick the binding model the device supports.
    pub fn select(capabilities: &GpuCapabilities) -> Self {
        let mode = if capabilities.bindless_enabled() {
            Self::Bindless
        } else {
            Self::Classic
        };
        tracing::debug!("Descriptor mode: {mode:?}");
        mode
    }

    /// Whether layouts and pools need update-after-bind semantics.
    pub fn is_bindless(self) -> bool {
        self == Self::Bindless
    }
}

/// One binding of a set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    /// Binding index in the shader.
    pub binding: u32,
    /// Resource kind.
    pub descriptor_type: vk::DescriptorType,
    /// Stages that can see the binding.
    pub stage_flags: vk::ShaderStageFlags,
    /// Declared capacity; the upper bound for a variable-length array.
    pub descriptor_count: u32,
    /// Number of descriptors actually allocated per set.
    pub logical_count: u32,
}

/// Validated layout contents, ready to become a Vulkan layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescription {
    bindings: Vec<LayoutBinding>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
    update_after_bind: bool,
}

impl LayoutDescription {
    /// Bindings in declaration order.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Per-binding flags, parallel to [`Self::bindings`]. Empty unless bindless.
    pub fn binding_flags(&self) -> &[vk::DescriptorBindingFlags] {
        &self.binding_flags
    }

    /// Whether sets need an update-after-bind pool.
    pub fn is_update_after_bind(&self) -> bool {
        self.update_after_bind
    }

    /// Look up a binding by index.
    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Runtime length of the trailing variable-count binding, if any.
    pub fn variable_count(&self) -> Option<u32> {
        if !self.update_after_bind {
            return None;
        }
        self.bindings.last().map(|b| b.logical_count)
    }

    /// Descriptors of each kind consumed by one set.
    pub fn demand(&self) -> BTreeMap<vk::DescriptorType, u32> {
        let variable = self.variable_count().map(|_| self.bindings.len() - 1);
        let mut demand = BTreeMap::new();
        for (i, binding) in self.bindings.iter().enumerate() {
            let count = if Some(i) == variable {
                binding.logical_count
            } else {
                binding.descriptor_count
            };
            *demand.entry(binding.descriptor_type).or_insert(0) += count;
        }
        demand
    }
}

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<LayoutBinding>,
    update_after_bind: bool,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type,
            stage_flags,
            descriptor_count: count,
            logical_count: count,
        });
        self
    }

    /// Add an array binding with room for `capacity` descriptors of which
    /// `logical_count` are allocated per set.
    ///
    /// In an update-after-bind layout only the last binding may vary in
    /// length, so declare the bindless array last.
    pub fn add_bindless_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        capacity: u32,
        logical_count: u32,
    ) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type,
            stage_flags,
            descriptor_count: capacity,
            logical_count: logical_count.min(capacity),
        });
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags, 1)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags, 1)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
            1,
        )
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags, 1)
    }

    /// Mark the layout as bindless (update-after-bind pool).
    pub fn update_after_bind(mut self, enable: bool) -> Self {
        self.update_after_bind = enable;
        self
    }

    /// Validate the bindings and compute the per-binding flags.
    pub fn describe(&self) -> Result<LayoutDescription> {
        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(GpuError::DuplicateBinding(binding.binding));
            }
        }

        let binding_flags = if self.update_after_bind {
            bindless_binding_flags(self.bindings.len())
        } else {
            Vec::new()
        };

        Ok(LayoutDescription {
            bindings: self.bindings.clone(),
            binding_flags,
            update_after_bind: self.update_after_bind,
        })
    }

    /// Build the descriptor set layout.
    pub fn build(&self, device: &Arc<Device>) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(device, self.describe()?)
    }
}

/// Flags for a bindless layout with `count` bindings.
///
/// Every binding is partially bound and updatable after bind; only the last
/// one has a variable descriptor count.
pub fn bindless_binding_flags(count: usize) -> Vec<vk::DescriptorBindingFlags> {
    let base = vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
    (0..count)
        .map(|i| {
            if i + 1 == count {
                base | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
            } else {
                base
            }
        })
        .collect()
}

/// Descriptor set layout together with the bindings it was built from.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    description: LayoutDescription,
}

impl DescriptorSetLayout {
    /// Create the Vulkan layout for `description`.
    pub fn new(device: &Arc<Device>, description: LayoutDescription) -> Result<Self> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = description
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage_flags)
            })
            .collect();

        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&description.binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if description.update_after_bind {
            layout_info = layout_info
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut flags_info);
        }

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| GpuError::DescriptorCreation(format!("set layout: {e}")))?
        };

        Ok(Self {
            device: Arc::clone(device),
            layout,
            description,
        })
    }

    /// Raw layout handle.
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Bindings and flags the layout was built from.
    pub fn description(&self) -> &LayoutDescription {
        &self.description
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Why a descriptor set could not be allocated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorAllocError {
    /// Host memory ran out.
    #[error("out of host memory")]
    HostOutOfMemory,
    /// Device memory ran out.
    #[error("out of device memory")]
    DeviceOutOfMemory,
    /// The pool has no sets or descriptors left.
    #[error("descriptor pool exhausted")]
    PoolExhausted,
    /// The pool has room in total but not in one piece.
    #[error("descriptor pool fragmented")]
    Fragmented,
    /// Any other driver error.
    #[error("descriptor allocation failed: {0}")]
    Unknown(vk::Result),
}

impl From<vk::Result> for DescriptorAllocError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::HostOutOfMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::DeviceOutOfMemory,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::PoolExhausted,
            vk::Result::ERROR_FRAGMENTED_POOL => Self::Fragmented,
            other => Self::Unknown(other),
        }
    }
}

/// Remaining capacity of a descriptor pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBudget {
    max_sets: u32,
    remaining_sets: u32,
    capacity: BTreeMap<vk::DescriptorType, u32>,
    remaining: BTreeMap<vk::DescriptorType, u32>,
}

impl PoolBudget {
    /// Budget for `max_sets` sets drawing from `sizes`.
    pub fn new(max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut capacity = BTreeMap::new();
        for size in sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Self {
            max_sets,
            remaining_sets: max_sets,
            remaining: capacity.clone(),
            capacity,
        }
    }

    /// Sets that can still be allocated.
    pub fn remaining_sets(&self) -> u32 {
        self.remaining_sets
    }

    /// Descriptors of `ty` still available.
    pub fn remaining(&self, ty: vk::DescriptorType) -> u32 {
        self.remaining.get(&ty).copied().unwrap_or(0)
    }

    /// Whether one more set of `layout` fits.
    pub fn fits(&self, layout: &LayoutDescription) -> bool {
        self.remaining_sets > 0
            && layout
                .demand()
                .iter()
                .all(|(ty, &count)| self.remaining(*ty) >= count)
    }

    /// Take the capacity for one set of `layout`.
    pub fn reserve(&mut self, layout: &LayoutDescription) -> std::result::Result<(), DescriptorAllocError> {
        if !self.fits(layout) {
            return Err(DescriptorAllocError::PoolExhausted);
        }
        self.remaining_sets -= 1;
        for (ty, count) in layout.demand() {
            if let Some(remaining) = self.remaining.get_mut(&ty) {
                *remaining -= count;
            }
        }
        Ok(())
    }

    /// Return the capacity of `sets` sets of `layout`.
    pub fn release(&mut self, layout: &LayoutDescription, sets: u32) {
        self.remaining_sets = (self.remaining_sets + sets).min(self.max_sets);
        for (ty, count) in layout.demand() {
            let cap = self.capacity.get(&ty).copied().unwrap_or(0);
            if let Some(remaining) = self.remaining.get_mut(&ty) {
                *remaining = (*remaining + count * sets).min(cap);
            }
        }
    }

    /// Restore the full budget.
    pub fn reset(&mut self) {
        self.remaining_sets = self.max_sets;
        self.remaining = self.capacity.clone();
    }
}

/// Reserve budget for one set of `layout`, then call the driver.
///
/// The driver is not called when the budget is exhausted. A driver failure
/// returns the reserved budget.
fn allocate_within_budget<F>(
    budget: &mut PoolBudget,
    layout: &LayoutDescription,
    allocate: F,
) -> std::result::Result<vk::DescriptorSet, DescriptorAllocError>
where
    F: FnOnce() -> ash::prelude::VkResult<Vec<vk::DescriptorSet>>,
{
    if let Err(e) = budget.reserve(layout) {
        tracing::warn!("Descriptor set allocation failed: {e}");
        return Err(e);
    }

    let result = match allocate() {
        Ok(sets) => sets
            .first()
            .copied()
            .ok_or(DescriptorAllocError::Unknown(vk::Result::ERROR_UNKNOWN)),
        Err(result) => Err(DescriptorAllocError::from(result)),
    };
    if let Err(e) = result {
        budget.release(layout, 1);
        tracing::warn!("Descriptor set allocation failed: {e}");
    }
    result
}

/// Builder for a [`DescriptorPool`].
#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolBuilder {
    max_sets: u32,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    update_after_bind: bool,
}

impl DescriptorPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            max_sets: 1000,
            ..Self::default()
        }
    }

    /// Reserve `count` descriptors of `ty`.
    pub fn add_pool_size(mut self, ty: vk::DescriptorType, count: u32) -> Self {
        self.pool_sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        });
        self
    }

    /// Maximum number of sets.
    pub fn max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    /// Allow allocating sets of update-after-bind layouts.
    pub fn update_after_bind(mut self, enable: bool) -> Self {
        self.update_after_bind = enable;
        self
    }

    /// Whether the pool will accept update-after-bind layouts.
    pub fn is_update_after_bind(&self) -> bool {
        self.update_after_bind
    }

    /// Build the descriptor pool.
    pub fn build(&self, device: &Arc<Device>) -> Result<DescriptorPool> {
        DescriptorPool::new(
            device,
            self.max_sets,
            &self.pool_sizes,
            self.update_after_bind,
        )
    }
}

/// Fixed-capacity descriptor pool.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    budget: PoolBudget,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> Result<Self> {
        let mut flags = vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        if update_after_bind {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);

        let pool = unsafe {
            device
                .handle()
                .create_descriptor_pool(&create_info, None)
                .map_err(|e| GpuError::DescriptorCreation(format!("pool: {e}")))?
        };

        Ok(Self {
            device: Arc::clone(device),
            pool,
            budget: PoolBudget::new(max_sets, pool_sizes),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Remaining capacity.
    pub fn budget(&self) -> &PoolBudget {
        &self.budget
    }

    /// Allocate one set of `layout`.
    ///
    /// Bindless layouts get their trailing array sized to its logical count.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, DescriptorAllocError> {
        let description = layout.description();
        let layouts = [layout.handle()];
        let variable_counts = description.variable_count().map(|count| [count]);
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default();

        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        if let Some(counts) = variable_counts.as_ref() {
            variable_info = variable_info.descriptor_counts(counts);
            alloc_info = alloc_info.push_next(&mut variable_info);
        }

        let device = &self.device;
        allocate_within_budget(&mut self.budget, description, || unsafe {
            device.handle().allocate_descriptor_sets(&alloc_info)
        })
    }

    /// Return sets allocated with `layout` to the pool.
    ///
    /// The caller guarantees no in-flight work still references them.
    pub fn free_descriptors(
        &mut self,
        layout: &DescriptorSetLayout,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        unsafe { self.device.handle().free_descriptor_sets(self.pool, sets)? };
        self.budget
            .release(layout.description(), sets.len() as u32);
        Ok(())
    }

    /// Reset the pool, freeing all descriptor sets.
    ///
    /// The caller guarantees no in-flight work still references them.
    pub fn reset(&mut self) -> Result<()> {
        unsafe {
            self.device
                .handle()
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        self.budget.reset();
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum WriteResource {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
}

struct PendingWrite {
    binding: u32,
    first_element: u32,
    descriptor_type: vk::DescriptorType,
    resource: WriteResource,
}

/// Collects descriptor writes for one layout and applies them to sets.
///
/// The same writer can populate several sets, e.g. one per frame in flight.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a mut DescriptorPool,
    writes: Vec<PendingWrite>,
}

impl<'a> DescriptorWriter<'a> {
    /// Create a writer for sets of `layout` allocated from `pool`.
    pub fn new(layout: &'a DescriptorSetLayout, pool: &'a mut DescriptorPool) -> Self {
        Self {
            layout,
            pool,
            writes: Vec::new(),
        }
    }

    fn declared_type(&self, binding: u32) -> Option<vk::DescriptorType> {
        let found = self.layout.description().binding(binding);
        debug_assert!(found.is_some(), "layout does not contain binding {binding}");
        found.map(|b| b.descriptor_type)
    }

    /// Write a buffer to `binding`.
    pub fn write_buffer(mut self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        if let Some(descriptor_type) = self.declared_type(binding) {
            self.writes.push(PendingWrite {
                binding,
                first_element: 0,
                descriptor_type,
                resource: WriteResource::Buffers(vec![info]),
            });
        }
        self
    }

    /// Write an image to `binding`.
    pub fn write_image(mut self, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        if let Some(descriptor_type) = self.declared_type(binding) {
            self.writes.push(PendingWrite {
                binding,
                first_element: 0,
                descriptor_type,
                resource: WriteResource::Images(vec![info]),
            });
        }
        self
    }

    /// Write consecutive array elements of `binding` starting at `first_element`.
    pub fn write_image_array(
        mut self,
        binding: u32,
        first_element: u32,
        infos: &[vk::DescriptorImageInfo],
    ) -> Self {
        if infos.is_empty() {
            return self;
        }
        if let Some(descriptor_type) = self.declared_type(binding) {
            self.writes.push(PendingWrite {
                binding,
                first_element,
                descriptor_type,
                resource: WriteResource::Images(infos.to_vec()),
            });
        }
        self
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether no writes are queued.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Allocate a set and apply every queued write to it.
    pub fn build(&mut self) -> std::result::Result<vk::DescriptorSet, DescriptorAllocError> {
        let set = self.pool.allocate_descriptor_set(self.layout)?;
        self.overwrite(set);
        Ok(set)
    }

    /// Apply every queued write to an already allocated set.
    pub fn overwrite(&self, set: vk::DescriptorSet) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.first_element)
                    .descriptor_type(write.descriptor_type);
                match &write.resource {
                    WriteResource::Buffers(infos) => base.buffer_info(infos),
                    WriteResource::Images(infos) => base.image_info(infos),
                }
            })
            .collect();

        unsafe {
            self.pool
                .device
                .handle()
                .update_descriptor_sets(&writes, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn uniform_layout() -> LayoutDescription {
        DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .describe()
            .unwrap()
    }

    #[test]
    fn duplicate_binding_fails() {
        let result = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .describe();
        assert!(matches!(result, Err(GpuError::DuplicateBinding(0))));
    }

    #[test]
    fn classic_layout_has_no_flags() {
        let layout = uniform_layout();
        assert!(layout.binding_flags().is_empty());
        assert!(!layout.is_update_after_bind());
        assert_eq!(layout.variable_count(), None);
    }

    #[test]
    fn bindless_flags_mark_only_last_binding_variable() {
        for count in 1..=6usize {
            let flags = bindless_binding_flags(count);
            assert_eq!(flags.len(), count);
            for (i, f) in flags.iter().enumerate() {
                assert!(f.contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND));
                assert!(f.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
                assert_eq!(
                    f.contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT),
                    i + 1 == count
                );
            }
        }
    }

    #[test]
    fn bindless_description_uses_logical_count() {
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
            .add_bindless_binding(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                4096,
                128,
            )
            .update_after_bind(true)
            .describe()
            .unwrap();

        assert_eq!(layout.binding_flags().len(), 2);
        assert_eq!(layout.variable_count(), Some(128));
        assert_eq!(layout.binding(1).unwrap().descriptor_count, 4096);

        let demand = layout.demand();
        assert_eq!(demand[&vk::DescriptorType::COMBINED_IMAGE_SAMPLER], 128);
        assert_eq!(demand[&vk::DescriptorType::UNIFORM_BUFFER], 1);
    }

    #[test]
    fn pool_sized_for_three_sets_rejects_fourth() {
        let layout = uniform_layout();
        let mut budget = PoolBudget::new(
            3,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 3,
            }],
        );

        for _ in 0..3 {
            assert_eq!(budget.reserve(&layout), Ok(()));
        }
        assert_eq!(
            budget.reserve(&layout),
            Err(DescriptorAllocError::PoolExhausted)
        );
    }

    #[test]
    fn descriptor_shortage_exhausts_before_sets() {
        let layout = uniform_layout();
        let mut budget = PoolBudget::new(
            10,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2,
            }],
        );
        assert!(budget.reserve(&layout).is_ok());
        assert!(budget.reserve(&layout).is_ok());
        assert_eq!(budget.remaining_sets(), 8);
        assert_eq!(
            budget.reserve(&layout),
            Err(DescriptorAllocError::PoolExhausted)
        );
    }

    #[test]
    fn release_and_reset_restore_budget() {
        let layout = uniform_layout();
        let mut budget = PoolBudget::new(
            2,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2,
            }],
        );
        budget.reserve(&layout).unwrap();
        budget.reserve(&layout).unwrap();
        budget.release(&layout, 1);
        assert_eq!(budget.remaining_sets(), 1);
        assert_eq!(budget.remaining(vk::DescriptorType::UNIFORM_BUFFER), 1);

        budget.reset();
        assert_eq!(budget.remaining_sets(), 2);
        assert_eq!(budget.remaining(vk::DescriptorType::UNIFORM_BUFFER), 2);
    }

    #[test]
    fn missing_kind_never_fits() {
        let layout = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .describe()
            .unwrap();
        let budget = PoolBudget::new(
            4,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 4,
            }],
        );
        assert!(!budget.fits(&layout));
    }

    #[test]
    fn driver_errors_are_categorized() {
        assert_eq!(
            DescriptorAllocError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            DescriptorAllocError::PoolExhausted
        );
        assert_eq!(
            DescriptorAllocError::from(vk::Result::ERROR_FRAGMENTED_POOL),
            DescriptorAllocError::Fragmented
        );
        assert_eq!(
            DescriptorAllocError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            DescriptorAllocError::HostOutOfMemory
        );
        assert_eq!(
            DescriptorAllocError::from(vk::Result::ERROR_DEVICE_LOST),
            DescriptorAllocError::Unknown(vk::Result::ERROR_DEVICE_LOST)
        );
    }

    fn three_set_budget() -> PoolBudget {
        PoolBudget::new(
            3,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 3,
            }],
        )
    }

    #[test]
    fn fourth_allocation_is_refused_without_calling_the_driver() {
        let layout = uniform_layout();
        let mut budget = three_set_budget();
        let mut driver_calls = 0;

        for i in 0..3u64 {
            let set = allocate_within_budget(&mut budget, &layout, || {
                driver_calls += 1;
                Ok(vec![vk::DescriptorSet::from_raw(i + 1)])
            });
            assert_eq!(set, Ok(vk::DescriptorSet::from_raw(i + 1)));
        }

        let fourth = allocate_within_budget(&mut budget, &layout, || {
            driver_calls += 1;
            Ok(vec![vk::DescriptorSet::from_raw(99)])
        });
        assert_eq!(fourth, Err(DescriptorAllocError::PoolExhausted));
        assert_eq!(driver_calls, 3);
        assert_eq!(budget.remaining_sets(), 0);
    }

    #[test]
    fn driver_failures_map_to_status_and_return_budget() {
        let layout = uniform_layout();
        let mut budget = three_set_budget();

        let exhausted = allocate_within_budget(&mut budget, &layout, || {
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        });
        assert_eq!(exhausted, Err(DescriptorAllocError::PoolExhausted));
        assert_eq!(budget.remaining_sets(), 3);

        let fragmented = allocate_within_budget(&mut budget, &layout, || {
            Err(vk::Result::ERROR_FRAGMENTED_POOL)
        });
        assert_eq!(fragmented, Err(DescriptorAllocError::Fragmented));
        assert_eq!(budget.remaining(vk::DescriptorType::UNIFORM_BUFFER), 3);

        let empty = allocate_within_budget(&mut budget, &layout, || Ok(Vec::new()));
        assert_eq!(
            empty,
            Err(DescriptorAllocError::Unknown(vk::Result::ERROR_UNKNOWN))
        );
        assert_eq!(budget.remaining_sets(), 3);
    }

}
