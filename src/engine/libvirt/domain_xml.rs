use std::fmt::Write;
use std::path::Path;

use super::descriptor::PlatformDescriptor;
use crate::engine::{DeviceConfig, SerialPort, StandardDevice};

/// Per-boot choices that are not part of the device configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootPlan<'a> {
    /// Show the firmware boot menu and prefer removable media.
    pub recovery: bool,
    /// Installer image attached as a CD-ROM and booted first.
    pub install_media: Option<&'a Path>,
}

/// Escape text for XML attribute and element content.
fn esc(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// `vda`..`vdz`, then `vdaa`, `vdab`, ... as the kernel names virtio disks.
fn disk_target(index: usize) -> String {
    let mut suffix = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        suffix.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    suffix.reverse();
    format!("vd{}", String::from_utf8_lossy(&suffix))
}

/// Generate libvirt domain XML for one boot of `config`.
pub fn generate_domain_xml(
    name: &str,
    uuid: &uuid::Uuid,
    config: &DeviceConfig,
    platform: &PlatformDescriptor,
    plan: BootPlan<'_>,
) -> String {
    let memory_kib = config.memory_size / 1024;
    let cpus = config.cpu_count;
    let arch = esc(&platform.arch);
    let machine = esc(&platform.machine);
    let code = esc(&platform.firmware_code);
    let nvram = esc(&config.platform.aux_storage.display().to_string());

    // Boot order: installer media, then removable (read-only) disks when
    // recovering, then the boot disk. Other disks are not bootable.
    let mut devices = String::new();
    let mut next_boot = 1;

    if let Some(media) = plan.install_media {
        let _ = write!(
            devices,
            r#"
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
      <boot order='{next_boot}'/>
    </disk>"#,
            esc(&media.display().to_string())
        );
        next_boot += 1;
    }

    let mut order: Vec<usize> = Vec::new();
    if plan.recovery {
        order.extend((1..config.storage.len()).filter(|&i| config.storage[i].read_only));
    }
    if !config.storage.is_empty() {
        order.push(0);
    }

    for (i, disk) in config.storage.iter().enumerate() {
        let boot = order
            .iter()
            .position(|&o| o == i)
            .map(|pos| format!("\n      <boot order='{}'/>", next_boot + pos))
            .unwrap_or_default();
        let serial = disk
            .identifier
            .as_deref()
            .map(|id| format!("\n      <serial>{}</serial>", esc(id)))
            .unwrap_or_default();
        let readonly = if disk.read_only { "\n      <readonly/>" } else { "" };
        let _ = write!(
            devices,
            r#"
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='{}' bus='virtio'/>{serial}{readonly}{boot}
    </disk>"#,
            esc(&disk.path.display().to_string()),
            disk_target(i),
        );
    }

    for nic in &config.network {
        let mac = nic
            .mac
            .map(|m| format!("\n      <mac address='{m}'/>"))
            .unwrap_or_default();
        let _ = write!(
            devices,
            r#"
    <interface type='network'>
      <source network='default'/>{mac}
      <model type='virtio'/>
    </interface>"#
        );
    }

    for device in &config.standard_devices {
        devices.push_str(match device {
            StandardDevice::Pointer => "\n    <input type='tablet' bus='usb'/>",
            StandardDevice::Keyboard => "\n    <input type='keyboard' bus='virtio'/>",
            StandardDevice::Entropy => {
                "\n    <rng model='virtio'>\n      <backend model='random'>/dev/urandom</backend>\n    </rng>"
            }
            StandardDevice::MemoryBalloon => "\n    <memballoon model='virtio'/>",
        });
    }

    for display in &config.displays {
        let _ = write!(
            devices,
            r#"
    <graphics type='vnc' autoport='yes' listen='127.0.0.1'/>
    <video>
      <model type='virtio' heads='1' primary='yes'>
        <resolution x='{}' y='{}'/>
      </model>
    </video>"#,
            display.width, display.height
        );
    }

    if let Some(SerialPort::Stdio) = config.serial {
        devices.push_str(
            r#"
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>"#,
        );
    }

    let bootmenu = if plan.recovery {
        "\n    <bootmenu enable='yes' timeout='10000'/>"
    } else {
        ""
    };
    let apic = if platform.arch == "x86_64" { "\n    <apic/>" } else { "" };
    let name = esc(name);

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='{arch}' machine='{machine}'>hvm</type>
    <loader readonly='yes' type='pflash'>{code}</loader>
    <nvram>{nvram}</nvram>{bootmenu}
  </os>
  <features>
    <acpi/>{apic}
  </features>
  <cpu mode='host-passthrough'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>{devices}
  </devices>
</domain>
"#
    )
}
