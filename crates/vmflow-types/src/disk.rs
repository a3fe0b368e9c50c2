//! Virtual disk types and device slot assignments

use serde::{Deserialize, Serialize};

/// Opaque handle to a virtual disk on the hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DiskRef(pub String);

impl std::fmt::Display for DiskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device slot a disk is attached at.
///
/// HVM guests only expose the first few slots until paravirt drivers
/// load, so the assignments below are fixed: the rescue slot must stay
/// distinct from the root slot, and ephemeral disks go last.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeviceSlot(pub u8);

impl DeviceSlot {
    pub const ROOT: DeviceSlot = DeviceSlot(0);
    pub const RESCUE: DeviceSlot = DeviceSlot(1);
    pub const CD: DeviceSlot = DeviceSlot(1);
    pub const SWAP: DeviceSlot = DeviceSlot(2);
    pub const CONFIG_DRIVE: DeviceSlot = DeviceSlot(3);
    pub const EPHEMERAL: DeviceSlot = DeviceSlot(4);

    /// Slot for a caller-supplied block device name, e.g. "/dev/xvdb" -> 1
    pub fn for_device_name(device: &str) -> Option<DeviceSlot> {
        let last = device.strip_prefix("/dev/")?.chars().last()?;
        if last.is_ascii_lowercase() {
            Some(DeviceSlot(last as u8 - b'a'))
        } else {
            None
        }
    }
}

/// What role a disk plays for its instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Root,
    Swap,
    Ephemeral,
    ConfigDrive,
    /// Caller-supplied volume attached at a named device
    Volume,
    Iso,
}

/// A virtual disk known to the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    pub disk_ref: DiskRef,
    pub kind: DiskKind,
    pub size_mib: u64,

    /// True for volumes owned by an external volume service; these are
    /// never destroyed during rollback.
    #[serde(default)]
    pub externally_owned: bool,
}

impl Disk {
    pub fn new(disk_ref: impl Into<String>, kind: DiskKind, size_mib: u64) -> Self {
        Self {
            disk_ref: DiskRef(disk_ref.into()),
            kind,
            size_mib,
            externally_owned: false,
        }
    }

    /// Mark the disk as owned by an external volume service
    pub fn externally_owned(mut self) -> Self {
        self.externally_owned = true;
        self
    }

    pub fn size_gb(&self) -> u64 {
        self.size_mib / 1024
    }
}

/// A caller-supplied volume to attach during spawn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeAttachment {
    pub disk: Disk,
    /// Block device name inside the guest, e.g. "/dev/xvdb"
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_slots_fixed() {
        assert_eq!(DeviceSlot::ROOT.0, 0);
        assert_eq!(DeviceSlot::RESCUE.0, 1);
        assert_eq!(DeviceSlot::SWAP.0, 2);
        assert_eq!(DeviceSlot::CONFIG_DRIVE.0, 3);
        assert_eq!(DeviceSlot::EPHEMERAL.0, 4);
        assert_ne!(DeviceSlot::ROOT, DeviceSlot::RESCUE);
    }

    #[test]
    fn test_slot_for_device_name() {
        assert_eq!(DeviceSlot::for_device_name("/dev/xvda"), Some(DeviceSlot(0)));
        assert_eq!(DeviceSlot::for_device_name("/dev/xvdb"), Some(DeviceSlot(1)));
        assert_eq!(DeviceSlot::for_device_name("/dev/xvdf"), Some(DeviceSlot(5)));
        assert_eq!(DeviceSlot::for_device_name("sdb"), None);
    }

    #[test]
    fn test_disk_sizes() {
        let disk = Disk::new("vdi-1", DiskKind::Root, 10 * 1024);
        assert_eq!(disk.size_gb(), 10);
        assert!(!disk.externally_owned);

        let volume = Disk::new("vdi-2", DiskKind::Volume, 2048).externally_owned();
        assert!(volume.externally_owned);
    }
}
