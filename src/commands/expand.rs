use vdevice_plugin::plugin::device::{expand_all, probe};
use vdevice_plugin::PluginConfig;

pub(crate) fn cmd_expand(config: &PluginConfig) -> anyhow::Result<()> {
    let devices = expand_all(&config.virtual_devices)?;

    println!("{} ({} slots)", config.resource_name, config.num_devices);
    if devices.is_empty() {
        println!("  no device files matched");
    }
    for device in &devices {
        println!(
            "  {} -> {} ({})",
            device.host_path.display(),
            device.container_path.display(),
            device.permission
        );
    }
    println!("health: {}", probe(&devices));

    Ok(())
}
