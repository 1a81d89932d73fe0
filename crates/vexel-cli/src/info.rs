use vexel_core::VexelConfig;
use vexel_exec::{DeviceBackend, VulkanBackend};

pub fn run_info(config: &VexelConfig) -> anyhow::Result<()> {
    let backend = VulkanBackend::create(&config.device)
        .map_err(|e| anyhow::anyhow!("cannot open a Vulkan device: {}", e))?;

    println!("Device: {}", backend.device_name());
    println!("Queue families:");
    println!();
    for family in backend.queue_families() {
        let granularity = family.min_image_transfer_granularity;
        println!("  Family {}", family.index);
        println!("    Queues:       {}", family.queue_count);
        println!("    Capabilities: {}", family.capabilities);
        if family.timestamp_valid_bits == 0 {
            println!("    Timestamps:   unsupported");
        } else {
            println!("    Timestamps:   {} bits", family.timestamp_valid_bits);
        }
        println!(
            "    Granularity:  {}x{}x{}",
            granularity.width, granularity.height, granularity.depth
        );
        println!();
    }
    println!(
        "Frames in flight: {} (from configuration)",
        backend.max_frames_in_flight()
    );
    Ok(())
}
