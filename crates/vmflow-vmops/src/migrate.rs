//! The migration workflow (source side)
//!
//! Moves an instance's disks to another host. Direction is decided by
//! the destination flavor's root disk size: shrinking requires the
//! guest off and a resized copy, growing streams copy-on-write layers
//! while the guest stays up. Both directions report against the same
//! five-phase denominator; phase 5 belongs to the destination host and
//! is reported by `LifecycleOps::finish_migration`.

use crate::config::VmOpsConfig;
use crate::error::{Result, VmOpsError};
use crate::ops::ensure_shutdown;
use crate::report::RecordProgressReporter;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vmflow_backend::{BackendError, InstanceRecordStore, VirtualizationBackend};
use vmflow_types::{
    orig_vm_name, Disk, Flavor, InstanceSpec, MigrationDirection, MigrationPlan, VmRef,
    MIGRATION_TOTAL_PHASES,
};
use vmflow_workflow::{
    NoopStep, ProgressReporter, RollbackPolicy, Step, StepError, UndoLedger, WorkflowEngine,
};

/// Everything one migration call needs.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub instance: InstanceSpec,
    pub dest_flavor: Flavor,
    pub dest_host: String,
}

struct MigrateState {
    instance: InstanceSpec,
    dest_gb: u64,
    dest_host: String,
    staging_path: String,
    vm: Option<VmRef>,
    duplicate: Option<Disk>,
}

impl MigrateState {
    fn vm(&self) -> std::result::Result<VmRef, StepError> {
        self.vm
            .clone()
            .ok_or_else(|| StepError::from("source VM not resolved yet"))
    }
}

/// Rename the source VM out of the way and power it off. The undo
/// restores the name and boots it again.
struct RenameAndShutdown {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<MigrateState> for RenameAndShutdown {
    fn name(&self) -> &str {
        "rename_and_shutdown"
    }

    async fn run(
        &self,
        state: &mut MigrateState,
        ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let name = state.instance.name.clone();
        let vm = self
            .backend
            .lookup_vm(&name)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("VM {name}")))?;

        self.backend.set_vm_name(&vm, &orig_vm_name(&name)).await?;
        {
            let backend = self.backend.clone();
            let vm = vm.clone();
            let name = name.clone();
            ledger.record("restore VM name", move || async move {
                backend.set_vm_name(&vm, &name).await?;
                Ok(())
            });
        }

        ensure_shutdown(self.backend.as_ref(), &vm).await?;
        {
            let backend = self.backend.clone();
            let vm = vm.clone();
            ledger.record("power VM back on", move || async move {
                backend.power_on(&vm).await?;
                Ok(())
            });
        }

        state.vm = Some(vm);
        Ok(())
    }
}

struct DuplicateResizedDisk {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<MigrateState> for DuplicateResizedDisk {
    fn name(&self) -> &str {
        "duplicate_resized_disk"
    }

    async fn run(
        &self,
        state: &mut MigrateState,
        ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let vm = state.vm()?;
        let root = self.backend.root_disk(&vm).await?;
        let duplicate = self
            .backend
            .duplicate_disk_resized(&root.disk_ref, state.dest_gb)
            .await?;

        let backend = self.backend.clone();
        let disk_ref = duplicate.disk_ref.clone();
        ledger.record("destroy duplicated disk", move || async move {
            backend.destroy_disk(&disk_ref).await?;
            Ok(())
        });

        state.duplicate = Some(duplicate);
        Ok(())
    }
}

/// Ship the resized copy whole (sequence 0) and drop the local copy.
/// Past a successful transfer the path is irreversible.
struct TransferResizedDisk {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<MigrateState> for TransferResizedDisk {
    fn name(&self) -> &str {
        "transfer_resized_disk"
    }

    async fn run(
        &self,
        state: &mut MigrateState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let duplicate = state
            .duplicate
            .clone()
            .ok_or_else(|| StepError::from("no duplicated disk to transfer"))?;

        self.backend
            .transfer_disk_layer(
                &state.instance.uuid,
                &duplicate.disk_ref,
                &state.dest_host,
                &state.staging_path,
                0,
            )
            .await?;
        self.backend.destroy_disk(&duplicate.disk_ref).await?;
        Ok(())
    }
}

/// Source side of a migration
pub struct MigrationWorkflow {
    backend: Arc<dyn VirtualizationBackend>,
    records: Arc<dyn InstanceRecordStore>,
    config: VmOpsConfig,
}

impl MigrationWorkflow {
    pub fn new(
        backend: Arc<dyn VirtualizationBackend>,
        records: Arc<dyn InstanceRecordStore>,
        config: VmOpsConfig,
    ) -> Self {
        Self {
            backend,
            records,
            config,
        }
    }

    /// Transfer the instance's disks to the destination host and leave
    /// the source powered off under its `-orig` name. Returns the plan
    /// that was executed; phases 1-4 are reported here, phase 5 by the
    /// destination.
    pub async fn migrate_disk_and_power_off(
        &self,
        request: &MigrationRequest,
    ) -> Result<MigrationPlan> {
        let plan = MigrationPlan::new(request.instance.root_gb, request.dest_flavor.root_gb);
        info!(
            instance = %request.instance.uuid,
            direction = ?plan.direction,
            source_gb = plan.source_gb,
            dest_gb = plan.dest_gb,
            "Starting disk migration"
        );

        let reporter = Arc::new(RecordProgressReporter::new(
            self.records.clone(),
            request.instance.uuid.clone(),
        ));
        // Zero out any stale progress before phase work begins
        reporter.report(0, MIGRATION_TOTAL_PHASES).await;

        match plan.direction {
            MigrationDirection::Shrink => self.migrate_shrink(request, reporter).await?,
            MigrationDirection::GrowOrEqual => self.migrate_grow(request, reporter).await?,
        }
        Ok(plan)
    }

    /// Shrink path: four local phases through the engine, with rollback
    /// failures escalated because a half-renamed source VM must not be
    /// reported as cleanly rolled back.
    async fn migrate_shrink(
        &self,
        request: &MigrationRequest,
        reporter: Arc<RecordProgressReporter>,
    ) -> Result<()> {
        let engine = WorkflowEngine::new(reporter).with_rollback_policy(RollbackPolicy::Escalate);
        let steps: Vec<Box<dyn Step<MigrateState>>> = vec![
            Box::new(NoopStep::new("align_phase_count")),
            Box::new(RenameAndShutdown {
                backend: self.backend.clone(),
            }),
            Box::new(DuplicateResizedDisk {
                backend: self.backend.clone(),
            }),
            Box::new(TransferResizedDisk {
                backend: self.backend.clone(),
            }),
        ];
        let mut state = MigrateState {
            instance: request.instance.clone(),
            dest_gb: request.dest_flavor.root_gb,
            dest_host: request.dest_host.clone(),
            staging_path: self.config.staging_path.clone(),
            vm: None,
            duplicate: None,
        };

        engine
            .run_with_total("migrate_shrink", steps, MIGRATION_TOTAL_PHASES, &mut state)
            .await
            .map_err(|source| VmOpsError::InstanceFaultRollback { source })
    }

    /// Grow path: ancestors stream while the guest runs, the leaf goes
    /// after shutdown. On failure the rename is undone best-effort.
    async fn migrate_grow(
        &self,
        request: &MigrationRequest,
        reporter: Arc<RecordProgressReporter>,
    ) -> Result<()> {
        let mut ledger = UndoLedger::new();
        match self.grow_phases(request, reporter.as_ref(), &mut ledger).await {
            Ok(()) => Ok(()),
            Err((phase, source)) => {
                warn!(
                    instance = %request.instance.uuid,
                    %phase,
                    error = %source,
                    "Migration failed, rolling back"
                );
                ledger.unwind().await;
                Err(VmOpsError::MigrationFailed { phase, source })
            }
        }
    }

    async fn grow_phases(
        &self,
        request: &MigrationRequest,
        reporter: &RecordProgressReporter,
        ledger: &mut UndoLedger,
    ) -> std::result::Result<(), (String, BackendError)> {
        let spec = &request.instance;
        let fail = |phase: &str| {
            let phase = phase.to_string();
            move |e: BackendError| (phase, e)
        };

        let vm = self
            .backend
            .lookup_vm(&spec.name)
            .await
            .map_err(fail("resolving source VM"))?
            .ok_or_else(|| {
                (
                    "resolving source VM".to_string(),
                    BackendError::NotFound(format!("VM {}", spec.name)),
                )
            })?;

        self.backend
            .set_vm_name(&vm, &orig_vm_name(&spec.name))
            .await
            .map_err(fail("renaming source VM"))?;
        {
            let backend = self.backend.clone();
            let undo_vm = vm.clone();
            let name = spec.name.clone();
            ledger.record("restore VM name", move || async move {
                backend.set_vm_name(&undo_vm, &name).await?;
                Ok(())
            });
        }

        let chain = self
            .backend
            .snapshot_disk_chain(&vm)
            .await
            .map_err(fail("snapshotting disk chain"))?;
        reporter.report(1, MIGRATION_TOTAL_PHASES).await;

        // Ancestors go oldest first; the sequence number is the layer's
        // distance from the leaf, so the destination can rebuild the
        // chain by number.
        for (sequence, layer) in chain.iter().enumerate().skip(1).rev() {
            self.backend
                .transfer_disk_layer(
                    &spec.uuid,
                    layer,
                    &request.dest_host,
                    &self.config.staging_path,
                    sequence as u32,
                )
                .await
                .map_err(fail("transferring ancestor layer"))?;
            reporter.report(2, MIGRATION_TOTAL_PHASES).await;
        }

        ensure_shutdown(self.backend.as_ref(), &vm)
            .await
            .map_err(fail("powering down source VM"))?;
        reporter.report(3, MIGRATION_TOTAL_PHASES).await;

        let leaf = chain.first().ok_or_else(|| {
            (
                "transferring leaf layer".to_string(),
                BackendError::NotFound(format!("disk chain of VM {vm}")),
            )
        })?;
        self.backend
            .transfer_disk_layer(
                &spec.uuid,
                leaf,
                &request.dest_host,
                &self.config.staging_path,
                0,
            )
            .await
            .map_err(fail("transferring leaf layer"))?;
        reporter.report(4, MIGRATION_TOTAL_PHASES).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmflow_backend::FakeBackend;
    use vmflow_types::{DeviceSlot, DiskKind, DiskRef, PowerState};

    struct Fixture {
        backend: Arc<FakeBackend>,
        records: Arc<vmflow_backend::FakeRecordStore>,
        workflow: MigrationWorkflow,
        vm: VmRef,
    }

    async fn fixture(root_gb: u64) -> Fixture {
        let backend = Arc::new(FakeBackend::new());
        let records = Arc::new(vmflow_backend::FakeRecordStore::new());
        let vm = backend.insert_vm("web-1");
        let root = backend.insert_disk(DiskKind::Root, root_gb * 1024);
        backend
            .attach_disk(&vm, &root.disk_ref, DeviceSlot::ROOT, true)
            .await
            .unwrap();
        let workflow = MigrationWorkflow::new(
            backend.clone(),
            records.clone(),
            VmOpsConfig::default().with_staging_path("/staging"),
        );
        Fixture {
            backend,
            records,
            workflow,
            vm,
        }
    }

    fn request(source_gb: u64, dest_gb: u64) -> MigrationRequest {
        MigrationRequest {
            instance: InstanceSpec::new("uuid-1", "web-1").with_root_gb(source_gb),
            dest_flavor: Flavor::new("small", 2048, dest_gb),
            dest_host: "host-b".to_string(),
        }
    }

    #[tokio::test]
    async fn test_shrink_happy_path() {
        let fx = fixture(20).await;

        let plan = fx
            .workflow
            .migrate_disk_and_power_off(&request(20, 10))
            .await
            .unwrap();

        assert_eq!(plan.direction, MigrationDirection::Shrink);
        assert_eq!(fx.backend.vm_name(&fx.vm), Some("web-1-orig".to_string()));
        assert_eq!(fx.backend.vm_power(&fx.vm), Some(PowerState::Shutdown));

        let transfers = fx.backend.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].sequence, 0);
        assert_eq!(transfers[0].dest_host, "host-b");
        // The resized local copy is dropped once transferred
        assert!(!fx.backend.disk_exists(&transfers[0].layer));

        // Reset to zero, then four local phases out of five
        assert_eq!(
            fx.records.progress_history("uuid-1"),
            vec![0, 20, 40, 60, 80]
        );
    }

    #[tokio::test]
    async fn test_shrink_rollback_restores_name_and_power() {
        let fx = fixture(20).await;
        fx.backend.fail_on("duplicate_disk_resized");

        let err = fx
            .workflow
            .migrate_disk_and_power_off(&request(20, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, VmOpsError::InstanceFaultRollback { .. }));
        assert_eq!(fx.backend.vm_name(&fx.vm), Some("web-1".to_string()));
        assert_eq!(fx.backend.vm_power(&fx.vm), Some(PowerState::Running));
        assert!(fx.backend.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_shrink_transfer_failure_destroys_duplicate() {
        let fx = fixture(20).await;
        // insert_vm and insert_disk took ids 1-2, the duplicate is 3
        fx.backend.fail_on("transfer_disk_layer:disk-3");

        let err = fx
            .workflow
            .migrate_disk_and_power_off(&request(20, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, VmOpsError::InstanceFaultRollback { .. }));
        assert!(!fx.backend.disk_exists(&DiskRef("disk-3".to_string())));
        assert_eq!(fx.backend.vm_name(&fx.vm), Some("web-1".to_string()));
        assert!(fx.backend.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_grow_transfers_ancestors_then_leaf() {
        let fx = fixture(10).await;
        let chain = vec![
            DiskRef("leaf".to_string()),
            DiskRef("anc-1".to_string()),
            DiskRef("anc-2".to_string()),
        ];
        fx.backend.set_disk_chain(&fx.vm, chain);

        let plan = fx
            .workflow
            .migrate_disk_and_power_off(&request(10, 20))
            .await
            .unwrap();

        assert_eq!(plan.direction, MigrationDirection::GrowOrEqual);
        let transfers = fx.backend.transfers();
        let order: Vec<(String, u32)> = transfers
            .iter()
            .map(|t| (t.layer.0.clone(), t.sequence))
            .collect();
        // Oldest ancestor first, leaf (sequence 0) last
        assert_eq!(
            order,
            vec![
                ("anc-2".to_string(), 2),
                ("anc-1".to_string(), 1),
                ("leaf".to_string(), 0)
            ]
        );
        assert_eq!(fx.backend.vm_name(&fx.vm), Some("web-1-orig".to_string()));
        assert_eq!(fx.backend.vm_power(&fx.vm), Some(PowerState::Shutdown));
        // Reset to zero, then per-layer reporting repeats phase 2
        assert_eq!(
            fx.records.progress_history("uuid-1"),
            vec![0, 20, 40, 40, 60, 80]
        );
    }

    #[tokio::test]
    async fn test_grow_partial_layer_failure() {
        let fx = fixture(10).await;
        let chain = vec![
            DiskRef("leaf".to_string()),
            DiskRef("anc-1".to_string()),
            DiskRef("anc-2".to_string()),
            DiskRef("anc-3".to_string()),
        ];
        fx.backend.set_disk_chain(&fx.vm, chain);
        // Second ancestor in transfer order fails
        fx.backend.fail_on("transfer_disk_layer:anc-2");

        let err = fx
            .workflow
            .migrate_disk_and_power_off(&request(10, 20))
            .await
            .unwrap_err();

        assert!(
            matches!(err, VmOpsError::MigrationFailed { ref phase, .. } if phase == "transferring ancestor layer")
        );
        // Only the oldest ancestor made it across; the leaf never moved
        let transferred: Vec<String> = fx
            .backend
            .transfers()
            .iter()
            .map(|t| t.layer.0.clone())
            .collect();
        assert_eq!(transferred, vec!["anc-3"]);
        // Rename was rolled back and the guest never shut down
        assert_eq!(fx.backend.vm_name(&fx.vm), Some("web-1".to_string()));
        assert_eq!(fx.backend.vm_power(&fx.vm), Some(PowerState::Running));
    }

    #[tokio::test]
    async fn test_missing_source_vm() {
        let backend = Arc::new(FakeBackend::new());
        let records = Arc::new(vmflow_backend::FakeRecordStore::new());
        let workflow =
            MigrationWorkflow::new(backend.clone(), records, VmOpsConfig::default());

        let err = workflow
            .migrate_disk_and_power_off(&request(10, 20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VmOpsError::MigrationFailed { source: BackendError::NotFound(_), .. }
        ));
    }
}
