//! GPU capability detection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Descriptor-indexing feature bits relevant to bindless rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindlessSupport {
    pub sampled_image_array_non_uniform_indexing: bool,
    pub runtime_descriptor_array: bool,
    pub partially_bound: bool,
    pub variable_descriptor_count: bool,
    pub storage_buffer_update_after_bind: bool,
    pub sampled_image_update_after_bind: bool,
}

impl BindlessSupport {
    /// Extract the bindless-relevant bits from the Vulkan 1.2 feature struct.
    pub fn from_vulkan_1_2(features: &vk::PhysicalDeviceVulkan12Features<'_>) -> Self {
        Self {
            sampled_image_array_non_uniform_indexing: features
                .shader_sampled_image_array_non_uniform_indexing
                == vk::TRUE,
            runtime_descriptor_array: features.runtime_descriptor_array == vk::TRUE,
            partially_bound: features.descriptor_binding_partially_bound == vk::TRUE,
            variable_descriptor_count: features.descriptor_binding_variable_descriptor_count
                == vk::TRUE,
            storage_buffer_update_after_bind: features
                .descriptor_binding_storage_buffer_update_after_bind
                == vk::TRUE,
            sampled_image_update_after_bind: features
                .descriptor_binding_sampled_image_update_after_bind
                == vk::TRUE,
        }
    }

    /// Bindless is all-or-nothing: every bit must be present.
    pub fn is_supported(&self) -> bool {
        self.sampled_image_array_non_uniform_indexing
            && self.runtime_descriptor_array
            && self.partially_bound
            && self.variable_descriptor_count
            && self.storage_buffer_update_after_bind
            && self.sampled_image_update_after_bind
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device type (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Anisotropic sampling support
    pub supports_anisotropy: bool,
    /// Line and point polygon modes (wireframe rendering).
    pub supports_fill_mode_non_solid: bool,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,
    /// Descriptor indexing (core 1.2 or VK_EXT_descriptor_indexing)
    pub supports_descriptor_indexing: bool,
    /// Extended dynamic state (core 1.3 or VK_EXT_extended_dynamic_state)
    pub supports_extended_dynamic_state: bool,
    /// Bindless feature bits
    pub bindless: BindlessSupport,

    // Limits used by buffer addressing and push constants
    /// Minimum dynamic-offset alignment for uniform buffers
    pub min_uniform_buffer_offset_alignment: u64,
    /// Minimum dynamic-offset alignment for storage buffers
    pub min_storage_buffer_offset_alignment: u64,
    /// Granularity of flush/invalidate ranges on non-coherent memory
    pub non_coherent_atom_size: u64,
    /// Maximum push constant block size in bytes
    pub max_push_constants_size: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 = api_at_least(api_version, 1, 2);
        let has_vulkan_1_3 = api_at_least(api_version, 1, 3);

        // Chaining the 1.2 feature struct is only valid on 1.2+ devices.
        let (features, bindless) = if has_vulkan_1_2 {
            let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
            let features = {
                let mut features2 =
                    vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2);
                instance.get_physical_device_features2(physical_device, &mut features2);
                features2.features
            };
            (features, BindlessSupport::from_vulkan_1_2(&vulkan_1_2))
        } else {
            (
                instance.get_physical_device_features(physical_device),
                BindlessSupport::default(),
            )
        };

        let limits = &properties.limits;

        Self {
            vendor,
            device_name,
            device_type: properties.device_type,
            api_version,
            driver_version: properties.driver_version,

            supports_anisotropy: features.sampler_anisotropy == vk::TRUE,
            supports_fill_mode_non_solid: features.fill_mode_non_solid == vk::TRUE,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
            supports_descriptor_indexing: has_vulkan_1_2
                || available_extensions.contains("VK_EXT_descriptor_indexing"),
            supports_extended_dynamic_state: has_vulkan_1_3
                || available_extensions.contains("VK_EXT_extended_dynamic_state"),
            bindless,

            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            max_push_constants_size: limits.max_push_constants_size,

            device_local_memory_mb,
            available_extensions,
        }
    }

    /// Whether bindless descriptor arrays can be used on this device.
    pub fn bindless_enabled(&self) -> bool {
        self.supports_descriptor_indexing && self.bindless.is_supported()
    }

    /// Whether an extension is advertised by the device.
    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .map(|name| self.available_extensions.contains(name))
            .unwrap_or(false)
    }

    /// Reasons this device cannot host the renderer; empty when it can.
    ///
    /// Queue families and surface support are checked separately because
    /// they depend on the presentation surface.
    pub fn missing_requirements(&self) -> Vec<String> {
        let mut missing = Vec::new();

        if !api_at_least(self.api_version, 1, 3) {
            missing.push(format!(
                "Vulkan 1.3 (device reports {}.{})",
                vk::api_version_major(self.api_version),
                vk::api_version_minor(self.api_version)
            ));
        }
        if !self.has_extension(ash::khr::swapchain::NAME) {
            missing.push("VK_KHR_swapchain".to_string());
        }
        if !self.supports_descriptor_indexing {
            missing.push("VK_EXT_descriptor_indexing".to_string());
        }
        if !self.supports_extended_dynamic_state {
            missing.push("VK_EXT_extended_dynamic_state".to_string());
        }
        if !self.supports_anisotropy {
            missing.push("samplerAnisotropy".to_string());
        }

        missing
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self) -> bool {
        self.missing_requirements().is_empty()
    }

    /// [`Self::missing_requirements`] as an error naming the device.
    pub fn check_requirements(&self) -> Result<()> {
        let missing = self.missing_requirements();
        if missing.is_empty() {
            return Ok(());
        }
        Err(GpuError::ExtensionNotSupported(format!(
            "{}: {}",
            self.device_name,
            missing.join(", ")
        )))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - bindless {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.bindless_enabled() { "on" } else { "off" },
        )
    }
}

fn api_at_least(version: u32, major: u32, minor: u32) -> bool {
    let actual = (vk::api_version_major(version), vk::api_version_minor(version));
    actual >= (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bindless() -> BindlessSupport {
        BindlessSupport {
            sampled_image_array_non_uniform_indexing: true,
            runtime_descriptor_array: true,
            partially_bound: true,
            variable_descriptor_count: true,
            storage_buffer_update_after_bind: true,
            sampled_image_update_after_bind: true,
        }
    }

    fn capable_device() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 250),
            driver_version: 1,
            supports_anisotropy: true,
            supports_fill_mode_non_solid: true,
            max_sampler_anisotropy: 16.0,
            supports_descriptor_indexing: true,
            supports_extended_dynamic_state: true,
            bindless: full_bindless(),
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            non_coherent_atom_size: 64,
            max_push_constants_size: 128,
            device_local_memory_mb: 8192,
            available_extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn bindless_requires_every_bit() {
        assert!(full_bindless().is_supported());

        let partial = BindlessSupport {
            variable_descriptor_count: false,
            ..full_bindless()
        };
        assert!(!partial.is_supported());

        let no_update_after_bind = BindlessSupport {
            storage_buffer_update_after_bind: false,
            ..full_bindless()
        };
        assert!(!no_update_after_bind.is_supported());

        assert!(!BindlessSupport::default().is_supported());
    }

    #[test]
    fn bindless_from_vulkan_1_2_features() {
        let features = vk::PhysicalDeviceVulkan12Features::default()
            .shader_sampled_image_array_non_uniform_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true);
        assert_eq!(BindlessSupport::from_vulkan_1_2(&features), full_bindless());
    }

    #[test]
    fn missing_bindless_is_not_a_requirement() {
        let mut caps = capable_device();
        caps.bindless.partially_bound = false;
        assert!(caps.meets_requirements());
        assert!(!caps.bindless_enabled());
    }

    #[test]
    fn reports_missing_requirements() {
        let mut caps = capable_device();
        assert!(caps.meets_requirements());

        caps.supports_anisotropy = false;
        caps.available_extensions.clear();
        caps.api_version = vk::make_api_version(0, 1, 2, 0);

        let missing = caps.missing_requirements();
        assert_eq!(missing.len(), 3);
        assert!(missing.iter().any(|m| m == "samplerAnisotropy"));
        assert!(missing.iter().any(|m| m == "VK_KHR_swapchain"));
    }

    #[test]
    fn unmet_requirements_become_extension_error() {
        let mut caps = capable_device();
        assert!(caps.check_requirements().is_ok());

        caps.supports_extended_dynamic_state = false;
        match caps.check_requirements() {
            Err(GpuError::ExtensionNotSupported(reason)) => {
                assert!(reason.contains(&caps.device_name));
                assert!(reason.contains("VK_EXT_extended_dynamic_state"));
            }
            other => panic!("expected ExtensionNotSupported, got {other:?}"),
        }
    }
}
