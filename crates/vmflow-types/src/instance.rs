//! Instance, flavor, and image metadata types
//!
//! These describe what the caller wants provisioned. They are read by
//! the workflows and never mutated by them; derived attributes (such as
//! the normalized VM mode) are persisted through the record store
//! instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque handle to a VM definition on the hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VmRef(pub String);

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Virtualization mode of a guest.
///
/// `Pv` guests boot through an external kernel/ramdisk; `Hvm` guests
/// boot from their own disk firmware.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmMode {
    Pv,
    Hvm,
}

/// The instance to be provisioned or migrated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    /// Stable identifier used for record-store updates and locking
    pub uuid: String,

    /// Display name, also the VM definition name on the hypervisor
    pub name: String,

    /// Hostname injected into the guest
    pub hostname: String,

    /// Guest OS type (used for agent build lookup)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,

    /// Guest architecture (used for agent build lookup)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// Requested memory
    pub memory_mib: u64,

    /// Root disk size in GB
    pub root_gb: u64,

    /// Ephemeral disk size in GB (0 = none)
    #[serde(default)]
    pub ephemeral_gb: u64,

    /// Swap disk size in MB (0 = none)
    #[serde(default)]
    pub swap_mb: u64,

    /// External kernel image id, for PV guests booting a non-disk kernel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_id: Option<String>,

    /// External ramdisk image id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramdisk_id: Option<String>,

    /// Requested VM mode; None means "determine from the root disk"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_mode: Option<VmMode>,

    /// Whether the guest allows automatic root partition resizing
    #[serde(default)]
    pub auto_disk_config: bool,

    /// Whether the guest agent should be negotiated with after boot
    #[serde(default)]
    pub agent_enabled: bool,

    /// Whether a config-drive disk must be generated and attached
    #[serde(default)]
    pub needs_config_drive: bool,

    /// User-supplied key/value metadata, injected into the guest
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl InstanceSpec {
    /// Create a minimal instance spec
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uuid: uuid.into(),
            hostname: name.clone(),
            name,
            os_type: None,
            architecture: None,
            memory_mib: 1024,
            root_gb: 10,
            ephemeral_gb: 0,
            swap_mb: 0,
            kernel_id: None,
            ramdisk_id: None,
            vm_mode: None,
            auto_disk_config: false,
            agent_enabled: false,
            needs_config_drive: false,
            metadata: HashMap::new(),
        }
    }

    /// Set memory size
    pub fn with_memory_mib(mut self, mib: u64) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Set root disk size
    pub fn with_root_gb(mut self, gb: u64) -> Self {
        self.root_gb = gb;
        self
    }

    /// Set ephemeral disk size
    pub fn with_ephemeral_gb(mut self, gb: u64) -> Self {
        self.ephemeral_gb = gb;
        self
    }

    /// Set swap disk size
    pub fn with_swap_mb(mut self, mb: u64) -> Self {
        self.swap_mb = mb;
        self
    }

    /// Set the guest OS type
    pub fn with_os_type(mut self, os: impl Into<String>) -> Self {
        self.os_type = Some(os.into());
        self
    }

    /// Set the guest architecture
    pub fn with_architecture(mut self, arch: impl Into<String>) -> Self {
        self.architecture = Some(arch.into());
        self
    }

    /// Set external kernel/ramdisk image ids
    pub fn with_boot_assets(
        mut self,
        kernel_id: impl Into<String>,
        ramdisk_id: impl Into<String>,
    ) -> Self {
        self.kernel_id = Some(kernel_id.into());
        self.ramdisk_id = Some(ramdisk_id.into());
        self
    }

    /// Enable guest agent negotiation
    pub fn with_agent_enabled(mut self, enabled: bool) -> Self {
        self.agent_enabled = enabled;
        self
    }

    /// Enable automatic root partition resizing
    pub fn with_auto_disk_config(mut self, enabled: bool) -> Self {
        self.auto_disk_config = enabled;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the image boots through external kernel/ramdisk assets
    pub fn has_external_boot_assets(&self) -> bool {
        self.kernel_id.is_some() || self.ramdisk_id.is_some()
    }
}

/// Resource sizing an instance is being resized to during migration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flavor {
    pub name: String,
    pub memory_mib: u64,
    pub root_gb: u64,
    #[serde(default)]
    pub ephemeral_gb: u64,
    #[serde(default)]
    pub swap_mb: u64,
}

impl Flavor {
    pub fn new(name: impl Into<String>, memory_mib: u64, root_gb: u64) -> Self {
        Self {
            name: name.into(),
            memory_mib,
            root_gb,
            ephemeral_gb: 0,
            swap_mb: 0,
        }
    }
}

/// Image metadata as reported by the image repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageMeta {
    pub id: String,

    /// Disk format as recorded in the repository ("raw", "vhd", "iso", ...)
    pub disk_format: String,
}

impl ImageMeta {
    pub fn new(id: impl Into<String>, disk_format: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disk_format: disk_format.into(),
        }
    }

    /// Determine how this image's disk is handled at attach time
    pub fn disk_image_kind(&self) -> DiskImageKind {
        match self.disk_format.as_str() {
            "iso" => DiskImageKind::Iso,
            _ => DiskImageKind::Disk,
        }
    }
}

/// How an image's root disk is handled during provisioning
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskImageKind {
    /// A bootable disk image attached as the root device
    Disk,
    /// An ISO attached as a CD alongside a blank root disk
    Iso,
}

/// Name applied to the source VM during a migration, so the old and new
/// definitions can coexist on one host until the move is confirmed.
pub fn orig_vm_name(name: &str) -> String {
    format!("{name}-orig")
}

/// Rescue-mode hostname prefix
pub fn rescue_hostname(hostname: &str) -> String {
    format!("RESCUE-{hostname}")
}

/// Restrict a guest metadata key to the character set the metadata
/// channel accepts. Anything outside `[A-Za-z0-9-_@]` becomes `_`,
/// including `/`, which would otherwise read as a path separator.
pub fn sanitize_metadata_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '@' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_spec_builder() {
        let instance = InstanceSpec::new("uuid-1", "web-1")
            .with_memory_mib(2048)
            .with_root_gb(20)
            .with_swap_mb(512)
            .with_os_type("linux")
            .with_architecture("x86_64")
            .with_agent_enabled(true)
            .with_metadata("role", "web");

        assert_eq!(instance.name, "web-1");
        assert_eq!(instance.hostname, "web-1");
        assert_eq!(instance.memory_mib, 2048);
        assert_eq!(instance.root_gb, 20);
        assert_eq!(instance.swap_mb, 512);
        assert!(instance.agent_enabled);
        assert_eq!(instance.metadata.get("role"), Some(&"web".to_string()));
    }

    #[test]
    fn test_external_boot_assets() {
        let plain = InstanceSpec::new("u", "vm");
        assert!(!plain.has_external_boot_assets());

        let pv = InstanceSpec::new("u", "vm").with_boot_assets("kernel-1", "ramdisk-1");
        assert!(pv.has_external_boot_assets());
    }

    #[test]
    fn test_disk_image_kind() {
        assert_eq!(
            ImageMeta::new("img", "raw").disk_image_kind(),
            DiskImageKind::Disk
        );
        assert_eq!(
            ImageMeta::new("img", "vhd").disk_image_kind(),
            DiskImageKind::Disk
        );
        assert_eq!(
            ImageMeta::new("img", "iso").disk_image_kind(),
            DiskImageKind::Iso
        );
    }

    #[test]
    fn test_orig_vm_name() {
        assert_eq!(orig_vm_name("web-1"), "web-1-orig");
    }

    #[test]
    fn test_rescue_hostname() {
        assert_eq!(rescue_hostname("web-1"), "RESCUE-web-1");
    }

    #[test]
    fn test_sanitize_metadata_key() {
        assert_eq!(sanitize_metadata_key("plain-key_1@host"), "plain-key_1@host");
        assert_eq!(sanitize_metadata_key("a/b c!"), "a_b_c_");
        assert_eq!(sanitize_metadata_key(""), "");
    }

    #[test]
    fn test_instance_spec_serialization() {
        let instance = InstanceSpec::new("uuid-1", "web-1").with_root_gb(20);
        let json = serde_json::to_string(&instance).unwrap();
        let parsed: InstanceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(instance, parsed);
    }
}
