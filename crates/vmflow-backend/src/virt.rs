//! The hypervisor capability interface
//!
//! A thin, name-per-primitive surface over the hypervisor RPC binding.
//! Nothing here sequences operations; sequencing, rollback and progress
//! live in the orchestration crates.

use crate::error::Result;
use async_trait::async_trait;
use vmflow_types::{
    DeviceSlot, Disk, DiskKind, DiskRef, ImageMeta, InstanceSpec, NetworkInterface, PowerState,
    VmRef,
};

/// Hypervisor primitives consumed by the workflows.
///
/// Implementations are expected to be cheap handles (`Arc`-shared);
/// every method is one RPC-shaped primitive with no cross-call state.
#[async_trait]
pub trait VirtualizationBackend: Send + Sync {
    /// Find a VM definition by display name
    async fn lookup_vm(&self, name: &str) -> Result<Option<VmRef>>;

    /// Create a VM definition for the instance. Fails with
    /// `DuplicateName` or `InsufficientResources`; performs no disk or
    /// network attachment.
    async fn create_vm_record(&self, spec: &InstanceSpec) -> Result<VmRef>;

    /// Destroy a VM definition, releasing its disk attachments. The
    /// disks themselves are not destroyed; reclamation stays with the
    /// caller (the workflows register a destroy undo per created disk).
    async fn destroy_vm(&self, vm: &VmRef) -> Result<()>;

    /// Change a VM's display name
    async fn set_vm_name(&self, vm: &VmRef, name: &str) -> Result<()>;

    /// Free memory on this host, in MiB
    async fn free_memory_mib(&self) -> Result<u64>;

    /// Create the root disk from the instance's image
    async fn create_root_disk(&self, spec: &InstanceSpec, image: &ImageMeta) -> Result<Disk>;

    /// Create a blank disk of the given kind and size
    async fn create_disk(&self, kind: DiskKind, size_mib: u64) -> Result<Disk>;

    /// Generate a config-drive disk carrying the instance's metadata
    async fn generate_config_drive(&self, spec: &InstanceSpec) -> Result<Disk>;

    /// Destroy a disk
    async fn destroy_disk(&self, disk: &DiskRef) -> Result<()>;

    /// Copy a disk into a new disk of a different virtual size
    async fn duplicate_disk_resized(&self, disk: &DiskRef, new_size_gb: u64) -> Result<Disk>;

    /// Resize a disk in place (grow only)
    async fn resize_disk(&self, disk: &DiskRef, new_size_gb: u64) -> Result<()>;

    /// Ask the backend to grow the root partition to fill the disk.
    /// A guest image that forbids this is skipped by the caller, not
    /// routed here.
    async fn try_auto_resize_partition(&self, disk: &DiskRef, size_gb: u64) -> Result<()>;

    /// Attach a disk to a VM at a device slot
    async fn attach_disk(
        &self,
        vm: &VmRef,
        disk: &DiskRef,
        slot: DeviceSlot,
        bootable: bool,
    ) -> Result<()>;

    /// The disk attached at the root device slot
    async fn root_disk(&self, vm: &VmRef) -> Result<Disk>;

    /// Whether the disk carries a paravirtualized guest
    async fn root_disk_is_pv(&self, disk: &DiskRef) -> Result<bool>;

    /// The copy-on-write chain of a VM's root disk, leaf first
    /// (index 0 = mutable leaf, ascending indexes = older ancestors).
    async fn snapshot_disk_chain(&self, vm: &VmRef) -> Result<Vec<DiskRef>>;

    /// Transfer one disk layer to a remote host's staging area. The
    /// sequence number identifies the layer's chain position on the
    /// receiving side (0 = leaf).
    async fn transfer_disk_layer(
        &self,
        instance_uuid: &str,
        layer: &DiskRef,
        dest_host: &str,
        staging_path: &str,
        sequence: u32,
    ) -> Result<()>;

    /// Fetch an external kernel or ramdisk image onto the host,
    /// returning its local path
    async fn materialize_boot_asset(&self, instance_uuid: &str, asset_id: &str) -> Result<String>;

    /// Remove all materialized boot assets for an instance
    async fn remove_boot_assets(&self, instance_uuid: &str) -> Result<()>;

    /// Create and plug a virtual network interface
    async fn plug_vif(&self, vm: &VmRef, vif: &NetworkInterface) -> Result<()>;

    /// Power on a VM
    async fn power_on(&self, vm: &VmRef) -> Result<()>;

    /// Request a clean guest shutdown. Returns false if the guest did
    /// not comply (caller decides whether to force).
    async fn clean_shutdown(&self, vm: &VmRef) -> Result<bool>;

    /// Force a VM off. Returns false if the VM was already halted.
    async fn hard_shutdown(&self, vm: &VmRef) -> Result<bool>;

    /// Suspend a VM to host storage
    async fn suspend(&self, vm: &VmRef) -> Result<()>;

    /// Resume a suspended VM
    async fn resume(&self, vm: &VmRef) -> Result<()>;

    /// Current power state of a VM
    async fn power_state(&self, vm: &VmRef) -> Result<PowerState>;

    /// Block power-state-changing operations on a VM (advisory lock
    /// used while rescue/suspend sequences are in flight)
    async fn acquire_boot_lock(&self, vm: &VmRef) -> Result<()>;

    /// Lift the blocked-operations boot lock
    async fn release_boot_lock(&self, vm: &VmRef) -> Result<()>;

    /// Write one key into the guest's metadata channel. Values are
    /// JSON; callers sanitize keys before writing.
    async fn write_guest_metadata(
        &self,
        vm: &VmRef,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()>;

    /// Remove one key from the guest's metadata channel
    async fn delete_guest_metadata(&self, vm: &VmRef, key: &str) -> Result<()>;
}
