//! Typed buffers with alignment-aware addressing and host access.

use crate::copy::copy_to_mapped;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::AllocatedBuffer;
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Round `size` up to a multiple of `min_alignment`.
///
/// `min_alignment` must be a power of two; values of 0 and 1 leave `size`
/// unchanged. A result that would not fit in `u64` saturates to the largest
/// aligned value and asserts in debug builds.
pub const fn get_alignment(size: u64, min_alignment: u64) -> u64 {
    match checked_alignment(size, min_alignment) {
        Some(aligned) => aligned,
        None => {
            debug_assert!(false, "aligned size overflows u64");
            u64::MAX & !(min_alignment - 1)
        }
    }
}

/// [`get_alignment`] that reports overflow as `None`.
pub const fn checked_alignment(size: u64, min_alignment: u64) -> Option<u64> {
    if min_alignment <= 1 {
        return Some(size);
    }
    debug_assert!(
        min_alignment.is_power_of_two(),
        "alignment must be a power of two"
    );
    match size.checked_add(min_alignment - 1) {
        Some(padded) => Some(padded & !(min_alignment - 1)),
        None => None,
    }
}

/// Addressing model of a buffer holding `count` equally sized elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Size of one element in bytes.
    pub size: u64,
    /// Stride between elements after alignment.
    pub aligned_size: u64,
    /// Number of elements.
    pub count: u32,
}

impl BufferLayout {
    /// Layout for `count` elements of `size` bytes, each padded to `min_alignment`.
    pub const fn new(size: u64, count: u32, min_alignment: u64) -> Self {
        Self {
            size,
            aligned_size: get_alignment(size, min_alignment),
            count,
        }
    }

    /// Total allocation size.
    pub const fn total_size(&self) -> u64 {
        self.aligned_size * self.count as u64
    }

    /// Byte offset of element `index`.
    pub const fn offset_of(&self, index: u32) -> u64 {
        self.aligned_size * index as u64
    }

    /// Offset and size of element `index` as bound through a descriptor.
    pub const fn range_of(&self, index: u32) -> (u64, u64) {
        (self.offset_of(index), self.size)
    }

    /// Whether `index` addresses an element of this buffer.
    pub const fn contains(&self, index: u32) -> bool {
        index < self.count
    }
}

/// Creation parameters for a [`Buffer`].
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Debug name for the allocation.
    pub name: String,
    /// Size of one element in bytes.
    pub instance_size: u64,
    /// Number of elements.
    pub instance_count: u32,
    /// Vulkan usage flags.
    pub usage: vk::BufferUsageFlags,
    /// Memory placement.
    pub location: MemoryLocation,
    /// Per-element alignment for dynamic offsets; 1 for tightly packed.
    pub min_alignment: u64,
    /// Keep the buffer mapped for its whole lifetime.
    pub persistent: bool,
}

impl BufferDesc {
    /// Describe a buffer of `count` elements of `T`.
    pub fn of<T>(
        name: impl Into<String>,
        count: u32,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Self {
        Self::new(name, std::mem::size_of::<T>() as u64, count, usage, location)
    }

    /// Describe a buffer of `count` elements of `instance_size` bytes.
    pub fn new(
        name: impl Into<String>,
        instance_size: u64,
        count: u32,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Self {
        Self {
            name: name.into(),
            instance_size,
            instance_count: count,
            usage,
            location,
            min_alignment: 1,
            persistent: false,
        }
    }

    /// Pad each element to `min_alignment`.
    pub fn with_alignment(mut self, min_alignment: u64) -> Self {
        self.min_alignment = min_alignment;
        self
    }

    /// Keep the buffer mapped for its whole lifetime.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Addressing layout implied by this description.
    pub fn layout(&self) -> BufferLayout {
        BufferLayout::new(self.instance_size, self.instance_count, self.min_alignment)
    }
}

/// A device buffer with an element layout and optional host mapping.
///
/// Host-visible memory stays mapped by the allocator; [`Buffer::map`] and
/// [`Buffer::unmap`] only control whether this buffer hands out its pointer.
pub struct Buffer {
    device: Arc<Device>,
    allocated: Option<AllocatedBuffer>,
    layout: BufferLayout,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    persistent: bool,
    mapped: bool,
}

impl Buffer {
    /// Create a buffer.
    pub fn new(device: &Arc<Device>, desc: &BufferDesc) -> Result<Self> {
        let stride = checked_alignment(desc.instance_size, desc.min_alignment);
        if stride.and_then(|s| s.checked_mul(u64::from(desc.instance_count))).is_none() {
            return Err(GpuError::InvalidState(format!(
                "{}: {} elements of {} bytes overflow the address space",
                desc.name, desc.instance_count, desc.instance_size
            )));
        }
        let layout = desc.layout();
        let allocated = if desc.min_alignment > 1 {
            device
                .create_buffer_with_alignment(
                    desc.instance_size,
                    desc.instance_count,
                    desc.usage,
                    desc.location,
                    desc.min_alignment,
                    &desc.name,
                )?
                .0
        } else {
            device.create_buffer(layout.total_size(), desc.usage, desc.location, &desc.name)?
        };

        let mut buffer = Self {
            device: Arc::clone(device),
            allocated: Some(allocated),
            layout,
            usage: desc.usage,
            location: desc.location,
            persistent: desc.persistent,
            mapped: false,
        };

        if desc.persistent {
            buffer.map()?;
        }

        Ok(buffer)
    }

    /// Upload `data` into a new device-local buffer through a staging buffer.
    ///
    /// Blocks until the copy completes; meant for load-time uploads.
    pub fn upload_via_staging(
        device: &Arc<Device>,
        name: &str,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let size = data.len() as u64;
        let count = u32::try_from(size)
            .map_err(|_| GpuError::InvalidState(format!("{name}: upload of {size} bytes too large")))?;

        let mut staging = Self::new(
            device,
            &BufferDesc::new(
                format!("{name} staging"),
                1,
                count,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            ),
        )?;
        staging.map()?;
        staging.write_to_buffer(data, 0);
        staging.unmap();

        let target = Self::new(
            device,
            &BufferDesc::new(
                name,
                1,
                count,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            ),
        )?;
        staging.copy_to(&target, size)?;

        Ok(target)
    }

    /// Publish the host pointer of this buffer's memory.
    ///
    /// Fails when the memory is not host visible.
    pub fn map(&mut self) -> Result<()> {
        let Some(allocated) = self.allocated.as_ref() else {
            debug_assert!(false, "map on a destroyed buffer");
            return Ok(());
        };
        if allocated.mapped_ptr().is_none() {
            return Err(GpuError::InvalidState(format!(
                "buffer memory in {:?} is not host visible",
                self.location
            )));
        }
        self.mapped = true;
        Ok(())
    }

    /// Withdraw the host pointer. Ignored for persistent buffers.
    pub fn unmap(&mut self) {
        if !self.persistent {
            self.mapped = false;
        }
    }

    /// Whether host writes are currently allowed.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn mapped_view(&self) -> Option<MappedView> {
        if !self.mapped {
            return None;
        }
        let ptr = self
            .allocated
            .as_ref()
            .and_then(AllocatedBuffer::mapped_ptr)?;
        // SAFETY: the allocation holds at least `total_size` bytes and stays
        // mapped while `self` is alive.
        Some(unsafe { MappedView::new(ptr.as_ptr(), self.layout) })
    }

    /// Copy `data` into the mapped memory at byte `offset`.
    ///
    /// Writing while unmapped or past the end is a programmer error: it
    /// asserts in debug builds and does nothing in release builds.
    pub fn write_to_buffer(&mut self, data: &[u8], offset: u64) {
        let Some(view) = self.mapped_view() else {
            debug_assert!(false, "write to an unmapped buffer");
            return;
        };
        if !view.write(data, offset) {
            debug_assert!(
                false,
                "write of {} bytes at {offset} overruns buffer of {}",
                data.len(),
                self.buffer_size()
            );
        }
    }

    /// Copy `data` into element `index`.
    pub fn write_to_index(&mut self, data: &[u8], index: u32) {
        let Some(view) = self.mapped_view() else {
            debug_assert!(false, "write to an unmapped buffer");
            return;
        };
        if !view.write_index(data, index) {
            debug_assert!(false, "write of {} bytes to index {index} out of range", data.len());
        }
    }

    /// Write one plain-old-data value at the start of the buffer.
    pub fn write_value<T: Pod>(&mut self, value: &T) {
        self.write_to_buffer(bytemuck::bytes_of(value), 0);
    }

    /// Write one plain-old-data value into element `index`.
    pub fn write_value_to_index<T: Pod>(&mut self, value: &T, index: u32) {
        self.write_to_index(bytemuck::bytes_of(value), index);
    }

    /// Write a slice of plain-old-data values starting at byte `offset`.
    pub fn write_slice<T: Pod>(&mut self, values: &[T], offset: u64) {
        self.write_to_buffer(bytemuck::cast_slice(values), offset);
    }

    /// Read back `len` bytes at `offset` from mapped memory.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        self.mapped_view()?.read(offset, len)
    }

    /// Make host writes in the range visible to the device.
    ///
    /// `size` may be [`vk::WHOLE_SIZE`].
    pub fn flush(&self, size: u64, offset: u64) -> Result<()> {
        let Some(range) = self.mapped_range(size, offset) else {
            return Ok(());
        };
        unsafe { self.device.handle().flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    /// Make device writes in the range visible to the host.
    pub fn invalidate(&self, size: u64, offset: u64) -> Result<()> {
        let Some(range) = self.mapped_range(size, offset) else {
            return Ok(());
        };
        unsafe { self.device.handle().invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    /// Flush element `index`.
    pub fn flush_index(&self, index: u32) -> Result<()> {
        let (offset, _) = self.layout.range_of(index);
        self.flush(self.layout.aligned_size, offset)
    }

    /// Invalidate element `index`.
    pub fn invalidate_index(&self, index: u32) -> Result<()> {
        let (offset, _) = self.layout.range_of(index);
        self.invalidate(self.layout.aligned_size, offset)
    }

    fn mapped_range(&self, size: u64, offset: u64) -> Option<vk::MappedMemoryRange<'static>> {
        if !self.mapped {
            debug_assert!(false, "flush or invalidate on an unmapped buffer");
            return None;
        }
        let (memory, base, allocation_size) = self.allocated.as_ref()?.memory_range()?;
        let size = if size == vk::WHOLE_SIZE {
            self.buffer_size().saturating_sub(offset)
        } else {
            size
        };
        let (start, len) = atom_aligned_range(
            base + offset,
            size,
            self.device.capabilities().non_coherent_atom_size,
            base + allocation_size,
        );
        Some(
            vk::MappedMemoryRange::default()
                .memory(memory)
                .offset(start)
                .size(len),
        )
    }

    /// Descriptor info for `size` bytes at `offset`.
    pub fn descriptor_info(&self, size: u64, offset: u64) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle(),
            offset,
            range: size,
        }
    }

    /// Descriptor info covering element `index`.
    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        let (offset, range) = self.layout.range_of(index);
        self.descriptor_info(range, offset)
    }

    /// Copy `size` bytes from this buffer into `dst` on the GPU, blocking until done.
    pub fn copy_to(&self, dst: &Self, size: u64) -> Result<()> {
        self.device.copy_buffer(self.handle(), dst.handle(), size)
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.allocated
            .as_ref()
            .map_or(vk::Buffer::null(), AllocatedBuffer::handle)
    }

    /// Element layout.
    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Total size in bytes.
    pub fn buffer_size(&self) -> u64 {
        self.layout.total_size()
    }

    /// Element stride after alignment.
    pub fn aligned_size(&self) -> u64 {
        self.layout.aligned_size
    }

    /// Size of one element.
    pub fn instance_size(&self) -> u64 {
        self.layout.size
    }

    /// Number of elements.
    pub fn instance_count(&self) -> u32 {
        self.layout.count
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory placement.
    pub fn location(&self) -> MemoryLocation {
        self.location
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.mapped = false;
        if let Some(allocated) = self.allocated.take() {
            if let Err(e) = self.device.destroy_buffer(allocated) {
                tracing::error!("Failed to free buffer: {e}");
            }
        }
    }
}

/// Host view of a mapped allocation, bounded by its element layout.
#[derive(Debug, Clone, Copy)]
struct MappedView {
    ptr: *mut u8,
    layout: BufferLayout,
}

impl MappedView {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `layout.total_size()` bytes
    /// for as long as the view is used.
    unsafe fn new(ptr: *mut u8, layout: BufferLayout) -> Self {
        Self { ptr, layout }
    }

    fn in_bounds(&self, offset: u64, len: usize) -> bool {
        offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.layout.total_size())
    }

    /// Copy `data` to byte `offset`. Returns false and writes nothing when the
    /// range leaves the buffer.
    fn write(&self, data: &[u8], offset: u64) -> bool {
        if !self.in_bounds(offset, data.len()) {
            return false;
        }
        // SAFETY: in bounds of the view, and mapped memory cannot alias `data`
        unsafe { copy_to_mapped(self.ptr.add(offset as usize), data) };
        true
    }

    /// Copy `data` into element `index`; it may not spill past the element stride.
    fn write_index(&self, data: &[u8], index: u32) -> bool {
        if !self.layout.contains(index) || data.len() as u64 > self.layout.aligned_size {
            return false;
        }
        self.write(data, self.layout.offset_of(index))
    }

    fn read(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        if !self.in_bounds(offset, len) {
            return None;
        }
        // SAFETY: in bounds of the view
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.add(offset as usize), len) };
        Some(bytes.to_vec())
    }
}

/// Widen `[offset, offset + size)` outward to `atom` boundaries.
///
/// `limit` is the end of the region known to lie inside the memory object.
/// When the widened end passes it the size becomes [`vk::WHOLE_SIZE`], which
/// runs to the end of the mapping and is valid regardless of atom size.
/// Returns the widened offset and size.
pub(crate) fn atom_aligned_range(offset: u64, size: u64, atom: u64, limit: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    let end = offset.saturating_add(size).div_ceil(atom).saturating_mul(atom);
    if end > limit {
        (start, vk::WHOLE_SIZE)
    } else {
        (start, end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_to_smallest_multiple() {
        for shift in 0..10 {
            let align = 1u64 << shift;
            for size in 0..600u64 {
                let aligned = get_alignment(size, align);
                assert_eq!(aligned % align, 0);
                assert!(aligned >= size);
                assert!(aligned < size + align);
            }
        }
    }

    #[test]
    fn alignment_zero_and_one_are_identity() {
        for size in [0u64, 1, 7, 64, 1000] {
            assert_eq!(get_alignment(size, 0), size);
            assert_eq!(get_alignment(size, 1), size);
        }
    }

    #[test]
    fn uniform_array_layout() {
        let layout = BufferLayout::new(64, 256, 256);
        assert_eq!(layout.aligned_size, 256);
        assert_eq!(layout.total_size(), 256 * 256);
        assert_eq!(layout.offset_of(3), 768);
        assert_eq!(layout.range_of(3), (768, 64));
        assert!(layout.contains(255));
        assert!(!layout.contains(256));
    }

    #[test]
    fn unaligned_layout_is_tight() {
        let desc = BufferDesc::of::<[f32; 3]>(
            "verts",
            10,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
        );
        let layout = desc.layout();
        assert_eq!(layout.aligned_size, 12);
        assert_eq!(layout.total_size(), 120);
    }

    fn host_view(memory: &mut [u8], layout: BufferLayout) -> MappedView {
        assert!(memory.len() as u64 >= layout.total_size());
        unsafe { MappedView::new(memory.as_mut_ptr(), layout) }
    }

    #[test]
    fn indexed_writes_land_at_aligned_offsets() {
        let layout = BufferLayout::new(64, 16, 256);
        let mut memory = vec![0u8; layout.total_size() as usize];
        let view = host_view(&mut memory, layout);

        for index in 0..layout.count {
            let element: Vec<u8> = (0..64).map(|b| (b as u32 + index) as u8).collect();
            assert!(view.write_index(&element, index));
        }
        for index in 0..layout.count {
            let offset = layout.offset_of(index);
            let expected: Vec<u8> = (0..64).map(|b| (b as u32 + index) as u8).collect();
            assert_eq!(view.read(offset, 64).unwrap(), expected);
            assert!(view.read(offset + 64, 192).unwrap().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn write_filling_buffer_exactly_succeeds() {
        let layout = BufferLayout::new(16, 4, 1);
        let mut memory = vec![0u8; 64];
        let view = host_view(&mut memory, layout);

        let data: Vec<u8> = (0..64).collect();
        assert!(view.write(&data, 0));
        assert_eq!(view.read(0, 64).unwrap(), data);
        assert!(view.write(&data[..16], 48));
    }

    #[test]
    fn write_one_byte_past_end_is_ignored() {
        let layout = BufferLayout::new(16, 4, 1);
        let mut memory = vec![0u8; 64];
        let view = host_view(&mut memory, layout);

        assert!(!view.write(&[0xFF; 65], 0));
        assert!(!view.write(&[0xFF; 2], 63));
        assert!(!view.write(&[0xFF], u64::MAX));
        assert!(memory.iter().all(|&b| b == 0));
    }

    #[test]
    fn indexed_writes_reject_bad_index_and_oversized_data() {
        let layout = BufferLayout::new(16, 4, 32);
        let mut memory = vec![0u8; layout.total_size() as usize];
        let view = host_view(&mut memory, layout);

        assert!(!view.write_index(&[1; 16], 4));
        assert!(!view.write_index(&[1; 33], 0));
        assert!(view.write_index(&[1; 32], 3));
        assert!(memory[..96].iter().all(|&b| b == 0));
    }

    #[test]
    fn reads_are_bounds_checked() {
        let layout = BufferLayout::new(8, 2, 1);
        let mut memory = vec![7u8; 16];
        let view = host_view(&mut memory, layout);

        assert_eq!(view.read(8, 8).unwrap(), vec![7; 8]);
        assert!(view.read(9, 8).is_none());
        assert!(view.read(u64::MAX, 1).is_none());
    }

    #[test]
    fn alignment_overflow_is_reported() {
        assert_eq!(checked_alignment(u64::MAX - 3, 256), None);
        assert_eq!(checked_alignment(u64::MAX, 1), Some(u64::MAX));
        assert_eq!(checked_alignment(300, 256), Some(512));
    }

    #[test]
    fn atom_range_widens_to_whole_atoms() {
        assert_eq!(atom_aligned_range(70, 10, 64, 1024), (64, 64));
        assert_eq!(atom_aligned_range(0, 256, 64, 1024), (0, 256));
        assert_eq!(atom_aligned_range(1000, 10, 64, 1024), (960, 64));
        assert_eq!(atom_aligned_range(5, 3, 1, 100), (5, 3));
    }

    #[test]
    fn atom_range_past_suballocation_end_runs_to_whole_size() {
        // Sub-allocation [64, 124) inside a larger memory block.
        assert_eq!(atom_aligned_range(64, 60, 64, 124), (64, vk::WHOLE_SIZE));

        // Sub-allocation at a non-zero base with an unaligned tail.
        let base = 4096 + 100;
        let (start, len) = atom_aligned_range(base, 20, 256, base + 100);
        assert_eq!(start, 4096);
        assert_eq!(len, vk::WHOLE_SIZE);
    }

    #[test]
    fn atom_range_inside_limit_is_atom_multiple() {
        for offset in [0u64, 1, 63, 64, 65, 200] {
            for size in [1u64, 60, 64, 100] {
                let (start, len) = atom_aligned_range(offset, size, 64, 4096);
                assert_eq!(start % 64, 0);
                assert_eq!(len % 64, 0);
                assert!(start <= offset);
                assert!(start + len >= offset + size);
            }
        }
    }
}
