//! `ash` implementation of [`DeviceBackend`] on real hardware.

use std::ffi::{CStr, CString};

use ash::vk;
use tracing::{debug, error, info, warn};

use vexel_core::config::DeviceConfig;
use vexel_core::{ExecError, ExecResult, QueueFamily};

use crate::backend::DeviceBackend;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VulkanBackend {
    /// Keeps the loader alive for as long as the instance exists
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    device_name: String,
    families: Vec<QueueFamily>,
    /// queues[family][index]
    queues: Vec<Vec<vk::Queue>>,
    max_frames_in_flight: u32,
}

impl VulkanBackend {
    /// Load the Vulkan loader, pick a physical device (discrete first) and
    /// create a logical device exposing every queue of every family.
    pub fn create(config: &DeviceConfig) -> ExecResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            error!("failed to load Vulkan loader: {}", e);
            ExecError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        })?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|e| ExecError::Config(format!("application_name: {}", e)))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vexel")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 3, 0));

        let layers = if config.enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let (physical_device, device_name) = match pick_physical_device(&instance) {
            Ok(found) => found,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families: Vec<QueueFamily> = family_props
            .iter()
            .enumerate()
            .map(|(i, props)| QueueFamily::from_vk(i as u32, props))
            .collect();

        let priorities: Vec<Vec<f32>> = families
            .iter()
            .map(|f| vec![1.0; f.queue_count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .filter(|f| f.queue_count > 0)
            .map(|f| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(f.index)
                    .queue_priorities(&priorities[f.index as usize])
            })
            .collect();
        let device_create_info =
            vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

        let device =
            match unsafe { instance.create_device(physical_device, &device_create_info, None) } {
                Ok(device) => device,
                Err(e) => {
                    error!("vkCreateDevice failed on {}: {:?}", device_name, e);
                    unsafe { instance.destroy_instance(None) };
                    return Err(e.into());
                }
            };

        let queues: Vec<Vec<vk::Queue>> = families
            .iter()
            .map(|f| {
                (0..f.queue_count)
                    .map(|i| unsafe { device.get_device_queue(f.index, i) })
                    .collect()
            })
            .collect();

        info!(
            "created Vulkan device {} with {} queue families",
            device_name,
            families.len()
        );
        for family in &families {
            debug!(
                "family {}: {} queue(s), {}",
                family.index, family.queue_count, family.capabilities
            );
        }

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            device_name,
            families,
            queues,
            max_frames_in_flight: config.max_frames_in_flight,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The logical device, for collaborators that record commands.
    pub fn raw_device(&self) -> &ash::Device {
        &self.device
    }

    /// Tag families that passed the surface support query. Must be called
    /// before the backend is shared with a lease manager.
    pub fn mark_present_families(&mut self, present: &[u32]) {
        for family in &mut self.families {
            *family = family.with_present(present.contains(&family.index));
        }
    }
}

fn pick_physical_device(instance: &ash::Instance) -> ExecResult<(vk::PhysicalDevice, String)> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    let mut chosen: Option<(vk::PhysicalDevice, vk::PhysicalDeviceProperties)> = None;
    for pd in physical_devices {
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
        let replace = match &chosen {
            None => true,
            Some((_, current)) => {
                is_discrete && current.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
            }
        };
        if replace {
            chosen = Some((pd, props));
        }
    }

    match chosen {
        Some((pd, props)) => {
            let name = unsafe {
                CStr::from_ptr(props.device_name.as_ptr())
                    .to_string_lossy()
                    .into_owned()
            };
            Ok((pd, name))
        }
        None => {
            warn!("no Vulkan physical devices found");
            Err(ExecError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))
        }
    }
}

impl DeviceBackend for VulkanBackend {
    fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        self.queues[family as usize][index as usize]
    }

    fn max_frames_in_flight(&self) -> u32 {
        self.max_frames_in_flight
    }

    fn create_command_pool(&self, family: u32) -> ExecResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> ExecResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(ExecError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) };
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> ExecResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> ExecResult<()> {
        unsafe { self.device.end_command_buffer(buffer)? };
        Ok(())
    }

    fn reset_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        release_resources: bool,
    ) -> ExecResult<()> {
        let flags = if release_resources {
            vk::CommandBufferResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandBufferResetFlags::empty()
        };
        unsafe { self.device.reset_command_buffer(buffer, flags)? };
        Ok(())
    }

    fn create_fence(&self) -> ExecResult<vk::Fence> {
        let create_info = vk::FenceCreateInfo::default();
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn reset_fence(&self, fence: vk::Fence) -> ExecResult<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> ExecResult<bool> {
        match unsafe { self.device.get_fence_status(fence) } {
            Ok(signaled) => Ok(signaled),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(ExecError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> ExecResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        match unsafe { self.device.wait_for_fences(fences, true, u64::MAX) } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(ExecError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> ExecResult<()> {
        let buffers = [buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        match unsafe { self.device.queue_submit(queue, &[submit], fence) } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(ExecError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
