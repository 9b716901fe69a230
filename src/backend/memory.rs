// Image memory - depth attachments through gpu-allocator
//
// The swapchain asks for one depth image per swapchain image on every
// rebuild, so allocations come and go with window resizes. Each image's
// allocation is kept here until the image is destroyed.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::collections::HashMap;

pub struct ImageMemory {
    allocator: Allocator,
    allocations: HashMap<vk::Image, Allocation>,
}

impl ImageMemory {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator,
            allocations: HashMap::new(),
        })
    }

    /// Create a device-local 2D depth image and bind fresh memory to it.
    pub fn create_depth_image(
        &mut self,
        device: &ash::Device,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VkResult<vk::Image> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name: "depth attachment",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                log::error!("Depth image allocation failed: {}", err);
                unsafe { device.destroy_image(image, None) };
                return Err(allocation_error_code(&err));
            }
        };

        let bound = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
        if let Err(code) = bound {
            unsafe { device.destroy_image(image, None) };
            if let Err(err) = self.allocator.free(allocation) {
                log::warn!("Failed to free depth image memory: {}", err);
            }
            return Err(code);
        }

        self.allocations.insert(image, allocation);
        Ok(image)
    }

    /// Destroy an image created by [`Self::create_depth_image`] and release
    /// its memory.
    pub fn destroy_image(&mut self, device: &ash::Device, image: vk::Image) {
        unsafe { device.destroy_image(image, None) };

        match self.allocations.remove(&image) {
            Some(allocation) => {
                if let Err(err) = self.allocator.free(allocation) {
                    log::warn!("Failed to free image memory: {}", err);
                }
            }
            None => log::warn!("Destroyed image {:?} with no tracked allocation", image),
        }
    }
}

impl Drop for ImageMemory {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            log::warn!(
                "Dropping image memory with {} live allocations",
                self.allocations.len()
            );
        }
    }
}

fn allocation_error_code(err: &AllocationError) -> vk::Result {
    match err {
        AllocationError::OutOfMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        AllocationError::NoCompatibleMemoryTypeFound => vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        _ => vk::Result::ERROR_INITIALIZATION_FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_errors_map_to_vulkan_codes() {
        assert_eq!(
            allocation_error_code(&AllocationError::OutOfMemory),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        );
        assert_eq!(
            allocation_error_code(&AllocationError::Internal("boom".into())),
            vk::Result::ERROR_INITIALIZATION_FAILED
        );
    }
}
