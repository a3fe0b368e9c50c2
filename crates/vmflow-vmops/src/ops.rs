//! Instance lifecycle operations outside the two long workflows
//!
//! Destination-side migration completion, confirm/revert, reboot,
//! rescue/unrescue, suspend/resume, teardown, and metadata refresh.
//! These are short sequences without step accounting; rescue reuses the
//! spawn workflow underneath.

use crate::config::VmOpsConfig;
use crate::error::Result;
use crate::inject;
use crate::locks::MetadataLocks;
use crate::report::RecordProgressReporter;
use crate::spawn::{ProvisioningWorkflow, SpawnRequest};
use std::sync::Arc;
use tracing::{info, warn};
use vmflow_backend::{
    BackendError, CapabilityOutcome, FirewallBackend, GuestAgentChannel, InstanceRecordStore,
    VirtualizationBackend,
};
use vmflow_types::{
    orig_vm_name, DeviceSlot, Disk, InstanceSpec, VmRef, VolumeAttachment,
    MIGRATION_TOTAL_PHASES,
};
use vmflow_workflow::ProgressReporter;

/// Shut a VM down cleanly, forcing it off if the guest refuses.
pub(crate) async fn ensure_shutdown(
    backend: &dyn VirtualizationBackend,
    vm: &VmRef,
) -> vmflow_backend::Result<()> {
    if !backend.clean_shutdown(vm).await? {
        warn!(vm = %vm, "Clean shutdown refused, forcing");
        backend.hard_shutdown(vm).await?;
    }
    Ok(())
}

fn rescue_vm_name(name: &str) -> String {
    format!("{name}-rescue")
}

/// Short instance lifecycle sequences
pub struct LifecycleOps {
    backend: Arc<dyn VirtualizationBackend>,
    records: Arc<dyn InstanceRecordStore>,
    firewall: Arc<dyn FirewallBackend>,
    locks: Arc<MetadataLocks>,
    spawner: ProvisioningWorkflow,
}

impl LifecycleOps {
    pub fn new(
        backend: Arc<dyn VirtualizationBackend>,
        agent: Arc<dyn GuestAgentChannel>,
        records: Arc<dyn InstanceRecordStore>,
        firewall: Arc<dyn FirewallBackend>,
        config: VmOpsConfig,
    ) -> Self {
        let locks = Arc::new(MetadataLocks::new());
        let spawner = ProvisioningWorkflow::new(
            backend.clone(),
            agent,
            records.clone(),
            firewall.clone(),
            config,
        )
        .with_metadata_locks(locks.clone());
        Self {
            backend,
            records,
            firewall,
            locks,
            spawner,
        }
    }

    async fn lookup_required(&self, name: &str) -> Result<VmRef> {
        Ok(self
            .backend
            .lookup_vm(name)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("VM {name}")))?)
    }

    /// Destination side of a migration: rebuild the VM around the
    /// transferred root disk, growing it to the new flavor size if
    /// needed, and report the final phase.
    pub async fn finish_migration(
        &self,
        spec: &InstanceSpec,
        root: &Disk,
        volumes: &[VolumeAttachment],
        start: bool,
    ) -> Result<VmRef> {
        info!(instance = %spec.uuid, start, "Finishing migration");
        let vm = self.backend.create_vm_record(spec).await?;

        if spec.root_gb * 1024 > root.size_mib {
            self.backend
                .resize_disk(&root.disk_ref, spec.root_gb)
                .await?;
        }
        self.backend
            .attach_disk(&vm, &root.disk_ref, DeviceSlot::ROOT, true)
            .await?;
        for volume in volumes {
            let slot = DeviceSlot::for_device_name(&volume.device).ok_or_else(|| {
                BackendError::InvalidState(format!(
                    "unrecognized device name '{}'",
                    volume.device
                ))
            })?;
            self.backend
                .attach_disk(&vm, &volume.disk.disk_ref, slot, false)
                .await?;
        }

        if start {
            self.backend.power_on(&vm).await?;
        }

        RecordProgressReporter::new(self.records.clone(), spec.uuid.clone())
            .report(MIGRATION_TOTAL_PHASES, MIGRATION_TOTAL_PHASES)
            .await;
        Ok(vm)
    }

    /// The migration stuck: destroy the renamed source VM. Nothing to
    /// destroy is fine, confirmation is idempotent.
    pub async fn confirm_migration(&self, spec: &InstanceSpec) -> Result<()> {
        match self.backend.lookup_vm(&orig_vm_name(&spec.name)).await? {
            Some(vm) => {
                info!(instance = %spec.uuid, "Confirming migration, destroying source VM");
                Ok(self.backend.destroy_vm(&vm).await?)
            }
            None => {
                warn!(instance = %spec.uuid, "No renamed source VM to confirm");
                Ok(())
            }
        }
    }

    /// The migration is being rolled back: drop the half-built new VM
    /// if one exists, give the source its name back and boot it.
    pub async fn finish_revert_migration(&self, spec: &InstanceSpec) -> Result<()> {
        let original = self.lookup_required(&orig_vm_name(&spec.name)).await?;

        if let Some(new_vm) = self.backend.lookup_vm(&spec.name).await? {
            self.backend.destroy_vm(&new_vm).await?;
        }
        self.backend.set_vm_name(&original, &spec.name).await?;
        self.backend.power_on(&original).await?;
        Ok(())
    }

    /// Clean reboot, forcing a halted or unresponsive guest off first
    pub async fn reboot(&self, spec: &InstanceSpec) -> Result<()> {
        let vm = self.lookup_required(&spec.name).await?;
        ensure_shutdown(self.backend.as_ref(), &vm).await?;
        Ok(self.backend.power_on(&vm).await?)
    }

    /// Boot a rescue VM with the broken instance's root disk riding
    /// along. The original is powered off and boot-locked until
    /// [`unrescue`](Self::unrescue).
    pub async fn rescue(&self, mut request: SpawnRequest) -> Result<VmRef> {
        let original = self.lookup_required(&request.instance.name).await?;
        self.backend.hard_shutdown(&original).await?;
        self.backend.acquire_boot_lock(&original).await?;

        request.instance.name = rescue_vm_name(&request.instance.name);
        request.rescue_from = Some(original.clone());

        match self.spawner.spawn(request).await {
            Ok(vm) => Ok(vm),
            Err(e) => {
                if let Err(unlock) = self.backend.release_boot_lock(&original).await {
                    warn!(vm = %original, error = %unlock, "Failed to release boot lock");
                }
                Err(e)
            }
        }
    }

    /// Tear the rescue VM down and boot the original again
    pub async fn unrescue(&self, spec: &InstanceSpec) -> Result<()> {
        let rescue_vm = self
            .backend
            .lookup_vm(&rescue_vm_name(&spec.name))
            .await?
            .ok_or_else(|| {
                BackendError::InvalidState("instance is not in rescue mode".to_string())
            })?;
        let original = self.lookup_required(&spec.name).await?;

        self.backend.hard_shutdown(&rescue_vm).await?;
        self.backend.destroy_vm(&rescue_vm).await?;
        self.backend.release_boot_lock(&original).await?;
        Ok(self.backend.power_on(&original).await?)
    }

    /// Suspend to host storage, boot-locked so nothing restarts the VM
    /// behind the suspension
    pub async fn suspend(&self, spec: &InstanceSpec) -> Result<()> {
        let vm = self.lookup_required(&spec.name).await?;
        self.backend.acquire_boot_lock(&vm).await?;
        if let Err(e) = self.backend.suspend(&vm).await {
            if let Err(unlock) = self.backend.release_boot_lock(&vm).await {
                warn!(vm = %vm, error = %unlock, "Failed to release boot lock");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Resume a suspended VM and lift its boot lock
    pub async fn resume(&self, spec: &InstanceSpec) -> Result<()> {
        let vm = self.lookup_required(&spec.name).await?;
        self.backend.resume(&vm).await?;
        Ok(self.backend.release_boot_lock(&vm).await?)
    }

    /// Destroy the instance's VM and drop its filter rules. A VM that
    /// is already gone is not an error.
    pub async fn destroy(&self, spec: &InstanceSpec) -> Result<()> {
        if let Some(vm) = self.backend.lookup_vm(&spec.name).await? {
            self.backend.hard_shutdown(&vm).await?;
            self.backend.destroy_vm(&vm).await?;
        }
        if let CapabilityOutcome::Failed(e) = self.firewall.remove_instance_filter(spec).await {
            warn!(instance = %spec.uuid, error = %e, "Failed to remove instance filter");
        }
        Ok(())
    }

    /// Re-inject metadata, the auto-disk-config flag, and the hostname,
    /// serialized against any concurrent writer for this instance
    pub async fn refresh_instance_metadata(&self, spec: &InstanceSpec) -> Result<()> {
        let vm = self.lookup_required(&spec.name).await?;
        let _guard = self.locks.lock(&spec.uuid).await;
        inject::inject_metadata(self.backend.as_ref(), &vm, spec.metadata.iter()).await?;
        inject::inject_auto_disk_config(self.backend.as_ref(), &vm, spec.auto_disk_config)
            .await?;
        Ok(inject::inject_hostname(self.backend.as_ref(), &vm, &spec.hostname).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmOpsError;
    use vmflow_backend::{FakeAgent, FakeBackend, FakeFirewall, FakeRecordStore};
    use vmflow_types::{DiskKind, ImageMeta, PowerState};

    struct Fixture {
        backend: Arc<FakeBackend>,
        records: Arc<FakeRecordStore>,
        firewall: Arc<FakeFirewall>,
        ops: LifecycleOps,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeBackend::new());
        let agent = Arc::new(FakeAgent::new());
        let records = Arc::new(FakeRecordStore::new());
        let firewall = Arc::new(FakeFirewall::new());
        let ops = LifecycleOps::new(
            backend.clone(),
            agent,
            records.clone(),
            firewall.clone(),
            VmOpsConfig::default(),
        );
        Fixture {
            backend,
            records,
            firewall,
            ops,
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec::new("uuid-1", "web-1")
    }

    #[tokio::test]
    async fn test_ensure_shutdown_forces_when_clean_refused() {
        let backend = FakeBackend::new();
        backend.set_clean_shutdown_succeeds(false);
        let vm = backend.insert_vm("web-1");

        ensure_shutdown(&backend, &vm).await.unwrap();

        assert_eq!(backend.vm_power(&vm), Some(PowerState::Shutdown));
        assert!(backend.ops().iter().any(|op| op == "hard_shutdown"));
    }

    #[tokio::test]
    async fn test_reboot() {
        let fx = fixture();
        let vm = fx.backend.insert_vm("web-1");

        fx.ops.reboot(&spec()).await.unwrap();

        assert_eq!(fx.backend.vm_power(&vm), Some(PowerState::Running));
        let ops = fx.backend.ops();
        let down = ops.iter().position(|op| op == "clean_shutdown").unwrap();
        let up = ops.iter().position(|op| op == "power_on").unwrap();
        assert!(down < up);
    }

    #[tokio::test]
    async fn test_finish_migration_resizes_up_and_reports_final_phase() {
        let fx = fixture();
        // Staged root arrived at the old 10 GB size; the flavor wants 20
        let root = fx.backend.insert_disk(DiskKind::Root, 10 * 1024);
        let spec = spec().with_root_gb(20);

        let vm = fx
            .ops
            .finish_migration(&spec, &root, &[], true)
            .await
            .unwrap();

        assert!(fx.backend.vm_exists(&vm));
        assert_eq!(fx.backend.vm_power(&vm), Some(PowerState::Running));
        assert!(fx.backend.ops().iter().any(|op| op == "resize_disk"));
        assert_eq!(fx.records.progress_history("uuid-1"), vec![100]);
    }

    #[tokio::test]
    async fn test_finish_migration_same_size_skips_resize() {
        let fx = fixture();
        let root = fx.backend.insert_disk(DiskKind::Root, 10 * 1024);

        fx.ops
            .finish_migration(&spec().with_root_gb(10), &root, &[], false)
            .await
            .unwrap();

        assert!(!fx.backend.ops().iter().any(|op| op == "resize_disk"));
        assert!(!fx.backend.ops().iter().any(|op| op == "power_on"));
    }

    #[tokio::test]
    async fn test_confirm_migration_destroys_renamed_source() {
        let fx = fixture();
        let orig = fx.backend.insert_vm("web-1-orig");

        fx.ops.confirm_migration(&spec()).await.unwrap();

        assert!(!fx.backend.vm_exists(&orig));
        // Idempotent when nothing is left
        fx.ops.confirm_migration(&spec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_revert_migration() {
        let fx = fixture();
        let orig = fx.backend.insert_vm("web-1-orig");
        let new_vm = fx.backend.insert_vm("web-1");

        fx.ops.finish_revert_migration(&spec()).await.unwrap();

        assert!(!fx.backend.vm_exists(&new_vm));
        assert_eq!(fx.backend.vm_name(&orig), Some("web-1".to_string()));
        assert_eq!(fx.backend.vm_power(&orig), Some(PowerState::Running));
    }

    #[tokio::test]
    async fn test_rescue_and_unrescue() {
        let fx = fixture();
        let original = fx.backend.insert_vm("web-1");
        let root = fx.backend.insert_disk(DiskKind::Root, 10 * 1024);
        fx.backend
            .attach_disk(&original, &root.disk_ref, DeviceSlot::ROOT, true)
            .await
            .unwrap();

        let request = SpawnRequest::new(spec(), ImageMeta::new("rescue-img", "raw"));
        let rescue_vm = fx.ops.rescue(request).await.unwrap();

        assert_eq!(
            fx.backend.vm_name(&rescue_vm),
            Some("web-1-rescue".to_string())
        );
        assert_eq!(fx.backend.vm_power(&original), Some(PowerState::Shutdown));
        assert!(fx.backend.boot_locked(&original));
        assert_eq!(
            fx.backend
                .metadata_value(&rescue_vm, "vm-data/hostname")
                .unwrap(),
            "RESCUE-web-1"
        );

        fx.ops.unrescue(&spec()).await.unwrap();

        assert!(!fx.backend.vm_exists(&rescue_vm));
        assert!(!fx.backend.boot_locked(&original));
        assert_eq!(fx.backend.vm_power(&original), Some(PowerState::Running));
    }

    #[tokio::test]
    async fn test_unrescue_without_rescue_vm() {
        let fx = fixture();
        fx.backend.insert_vm("web-1");

        let err = fx.ops.unrescue(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            VmOpsError::Backend(BackendError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_suspend_resume_cycle() {
        let fx = fixture();
        let vm = fx.backend.insert_vm("web-1");

        fx.ops.suspend(&spec()).await.unwrap();
        assert_eq!(fx.backend.vm_power(&vm), Some(PowerState::Suspended));
        assert!(fx.backend.boot_locked(&vm));

        fx.ops.resume(&spec()).await.unwrap();
        assert_eq!(fx.backend.vm_power(&vm), Some(PowerState::Running));
        assert!(!fx.backend.boot_locked(&vm));
    }

    #[tokio::test]
    async fn test_suspend_failure_releases_boot_lock() {
        let fx = fixture();
        let vm = fx.backend.insert_vm("web-1");
        fx.backend.fail_on("suspend");

        assert!(fx.ops.suspend(&spec()).await.is_err());
        assert!(!fx.backend.boot_locked(&vm));
    }

    #[tokio::test]
    async fn test_destroy() {
        let fx = fixture();
        let vm = fx.backend.insert_vm("web-1");

        fx.ops.destroy(&spec()).await.unwrap();

        assert!(!fx.backend.vm_exists(&vm));
        assert!(fx
            .firewall
            .calls()
            .iter()
            .any(|c| c == "remove_instance_filter"));
        // Destroying a gone instance is fine
        fx.ops.destroy(&spec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_instance_metadata() {
        let fx = fixture();
        let vm = fx.backend.insert_vm("web-1");
        let spec = spec().with_metadata("role", "web");

        fx.ops.refresh_instance_metadata(&spec).await.unwrap();

        assert_eq!(
            fx.backend
                .metadata_value(&vm, "vm-data/user-metadata/role")
                .unwrap(),
            "web"
        );
        assert_eq!(
            fx.backend.metadata_value(&vm, "vm-data/hostname").unwrap(),
            "web-1"
        );
    }
}
