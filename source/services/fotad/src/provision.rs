// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Linux collaborator implementations.
//!
//! Slot provisioning shells out to the system utilities that own the
//! machinery (mount, mkfs.ext4, reboot) and uses the tar crate for
//! archive extraction. The engine never sees any of this: it talks to
//! the `SlotProvisioner` / `PowerControl` traits only.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use bootstate::Slot;
use fota::engine::{BootImageInfo, PowerControl, SlotProvisioner};
use fota::error::ProvisionError;

use crate::config::{DaemonConfig, SlotConfig};

/// File name of the falcon argument bundle inside a boot area.
pub const BUNDLE_FILE: &str = "falcon.bin";

pub struct LinuxProvisioner {
    slot_a: SlotConfig,
    slot_b: SlotConfig,
    kernel_image: String,
    /// Scratch mount points, created under the data dir.
    mount_boot: PathBuf,
    mount_root: PathBuf,
}

impl LinuxProvisioner {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            slot_a: config.slot_a.clone(),
            slot_b: config.slot_b.clone(),
            kernel_image: config.kernel_image.clone(),
            mount_boot: config.data_dir.join("mnt_boot"),
            mount_root: config.data_dir.join("mnt_root"),
        }
    }

    fn slot_config(&self, slot: Slot) -> &SlotConfig {
        match slot {
            Slot::A => &self.slot_a,
            Slot::B => &self.slot_b,
        }
    }

    fn mount<'a>(&self, device: &Path, target: &'a Path) -> Result<MountGuard<'a>, ProvisionError> {
        fs::create_dir_all(target)
            .map_err(|err| ProvisionError(format!("mkdir {}: {err}", target.display())))?;
        run_tool(Command::new("mount").arg(device).arg(target), "mount")?;
        Ok(MountGuard { target, armed: true })
    }
}

/// Unmounts on drop so error paths never leak a mount; `finish` unmounts
/// with error reporting for the success path.
struct MountGuard<'a> {
    target: &'a Path,
    armed: bool,
}

impl MountGuard<'_> {
    fn finish(mut self) -> Result<(), ProvisionError> {
        self.armed = false;
        sync_filesystems();
        run_tool(Command::new("umount").arg(self.target), "umount")
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = Command::new("umount").arg(self.target).status();
        }
    }
}

fn run_tool(cmd: &mut Command, what: &str) -> Result<(), ProvisionError> {
    let status = cmd
        .status()
        .map_err(|err| ProvisionError(format!("{what}: spawn failed: {err}")))?;
    if !status.success() {
        return Err(ProvisionError(format!("{what}: {status}")));
    }
    Ok(())
}

fn sync_filesystems() {
    let _ = Command::new("sync").status();
}

fn clear_dir(dir: &Path) -> Result<(), ProvisionError> {
    let entries =
        fs::read_dir(dir).map_err(|err| ProvisionError(format!("read {}: {err}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|err| ProvisionError(format!("read {}: {err}", dir.display())))?;
        let path = entry.path();
        let result = if entry
            .file_type()
            .map_err(|err| ProvisionError(format!("stat {}: {err}", path.display())))?
            .is_dir()
        {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|err| ProvisionError(format!("remove {}: {err}", path.display())))?;
    }
    Ok(())
}

fn extract_archive(archive: &Path, target: &Path) -> Result<(), ProvisionError> {
    let file = File::open(archive)
        .map_err(|err| ProvisionError(format!("open {}: {err}", archive.display())))?;
    tar::Archive::new(file)
        .unpack(target)
        .map_err(|err| ProvisionError(format!("extract {}: {err}", archive.display())))
}

impl SlotProvisioner for LinuxProvisioner {
    fn wipe_boot(&mut self, slot: Slot) -> Result<(), ProvisionError> {
        let device = self.slot_config(slot).boot_device.clone();
        let guard = self.mount(&device, &self.mount_boot)?;
        clear_dir(&self.mount_boot)?;
        guard.finish()
    }

    fn extract_boot(&mut self, slot: Slot, archive: &Path) -> Result<BootImageInfo, ProvisionError> {
        let device = self.slot_config(slot).boot_device.clone();
        let guard = self.mount(&device, &self.mount_boot)?;
        extract_archive(archive, &self.mount_boot)?;

        // FAT boot areas locate the kernel by name; the bundle records
        // offset zero and the image size for raw-area consumers.
        let kernel = self.mount_boot.join(&self.kernel_image);
        let size = fs::metadata(&kernel)
            .map_err(|err| ProvisionError(format!("kernel {}: {err}", kernel.display())))?
            .len();
        let size = u32::try_from(size)
            .map_err(|_| ProvisionError(format!("kernel {} too large", kernel.display())))?;
        guard.finish()?;
        Ok(BootImageInfo { kernel_offset: 0, kernel_size: size })
    }

    fn format_root(&mut self, slot: Slot) -> Result<(), ProvisionError> {
        let device = self.slot_config(slot).root_device.clone();
        let label = format!("ROOT_{}", slot.letter().to_ascii_uppercase());
        run_tool(
            Command::new("mkfs.ext4").arg("-F").arg("-L").arg(label).arg(&device),
            "mkfs.ext4",
        )
    }

    fn extract_root(&mut self, slot: Slot, archive: &Path) -> Result<(), ProvisionError> {
        let device = self.slot_config(slot).root_device.clone();
        let guard = self.mount(&device, &self.mount_root)?;
        extract_archive(archive, &self.mount_root)?;
        guard.finish()
    }

    fn write_falcon_bundle(&mut self, slot: Slot, bundle: &[u8]) -> Result<(), ProvisionError> {
        let device = self.slot_config(slot).boot_device.clone();
        let guard = self.mount(&device, &self.mount_boot)?;
        let path = self.mount_boot.join(BUNDLE_FILE);
        fs::write(&path, bundle)
            .map_err(|err| ProvisionError(format!("write {}: {err}", path.display())))?;
        guard.finish()
    }
}

/// Reboot through the init system.
pub struct LinuxPower;

impl PowerControl for LinuxPower {
    fn request_reboot(&self) -> Result<(), ProvisionError> {
        sync_filesystems();
        run_tool(&mut Command::new("reboot"), "reboot")
    }
}
