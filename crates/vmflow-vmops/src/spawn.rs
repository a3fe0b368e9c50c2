//! The provisioning (spawn) workflow
//!
//! Builds the ordered step list for one spawn call and runs it through
//! the workflow engine. Conditional steps (external kernel/ramdisk,
//! rescue root attach) are resolved while building, so the progress
//! denominator is fixed before the first step executes.

use crate::agent::{GuestAgentNegotiator, GuestCredentials};
use crate::boot::BootReadinessPoller;
use crate::config::VmOpsConfig;
use crate::error::{Result, VmOpsError};
use crate::inject;
use crate::locks::MetadataLocks;
use crate::report::RecordProgressReporter;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vmflow_backend::{
    BackendError, CapabilityOutcome, FirewallBackend, GuestAgentChannel, InstanceRecordStore,
    VirtualizationBackend,
};
use vmflow_types::{
    rescue_hostname, DeviceSlot, Disk, DiskImageKind, DiskKind, ImageMeta, InstanceSpec,
    NetworkInterface, VmMode, VmRef, VolumeAttachment,
};
use vmflow_workflow::{Step, StepError, UndoLedger, WorkflowEngine};

/// Everything one spawn call needs.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub instance: InstanceSpec,
    pub image: ImageMeta,
    pub vifs: Vec<NetworkInterface>,
    pub volumes: Vec<VolumeAttachment>,
    pub credentials: GuestCredentials,

    /// When set, this spawn builds a rescue VM: the named original VM's
    /// root disk is attached read-only at the rescue device slot and
    /// the guest hostname gets the rescue prefix.
    pub rescue_from: Option<VmRef>,
}

impl SpawnRequest {
    pub fn new(instance: InstanceSpec, image: ImageMeta) -> Self {
        Self {
            instance,
            image,
            vifs: Vec::new(),
            volumes: Vec::new(),
            credentials: GuestCredentials::default(),
            rescue_from: None,
        }
    }

    pub fn with_vif(mut self, vif: NetworkInterface) -> Self {
        self.vifs.push(vif);
        self
    }

    pub fn with_volume(mut self, volume: VolumeAttachment) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_credentials(mut self, credentials: GuestCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn rescuing(mut self, original: VmRef) -> Self {
        self.rescue_from = Some(original);
        self
    }

    fn is_rescue(&self) -> bool {
        self.rescue_from.is_some()
    }
}

struct PlannedAttach {
    disk: Disk,
    slot: DeviceSlot,
    bootable: bool,
}

/// Shared state threaded through the spawn steps
struct SpawnState {
    request: SpawnRequest,
    image_kind: Option<DiskImageKind>,
    disks: Vec<PlannedAttach>,
    vm: Option<VmRef>,
}

impl SpawnState {
    fn new(request: SpawnRequest) -> Self {
        Self {
            request,
            image_kind: None,
            disks: Vec::new(),
            vm: None,
        }
    }

    fn vm(&self) -> std::result::Result<VmRef, StepError> {
        self.vm
            .clone()
            .ok_or_else(|| StepError::from("VM record not created yet"))
    }
}

struct DetermineImageType;

#[async_trait]
impl Step<SpawnState> for DetermineImageType {
    fn name(&self) -> &str {
        "determine_image_type"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let kind = state.request.image.disk_image_kind();
        debug!(image = %state.request.image.id, ?kind, "Determined disk image kind");
        state.image_kind = Some(kind);
        Ok(())
    }
}

struct CreateDisks {
    backend: Arc<dyn VirtualizationBackend>,
}

impl CreateDisks {
    /// Track a disk for attachment. Only disks this step created get a
    /// destroy undo; caller-supplied volumes are never reclaimed here.
    fn track(
        &self,
        state: &mut SpawnState,
        ledger: &mut UndoLedger,
        disk: Disk,
        slot: DeviceSlot,
        bootable: bool,
    ) {
        if !disk.externally_owned && disk.kind != DiskKind::Volume {
            let backend = self.backend.clone();
            let disk_ref = disk.disk_ref.clone();
            ledger.record(format!("destroy disk {disk_ref}"), move || async move {
                backend.destroy_disk(&disk_ref).await?;
                Ok(())
            });
        }
        state.disks.push(PlannedAttach {
            disk,
            slot,
            bootable,
        });
    }
}

#[async_trait]
impl Step<SpawnState> for CreateDisks {
    fn name(&self) -> &str {
        "create_disks"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let spec = state.request.instance.clone();
        let image = state.request.image.clone();

        match state.image_kind {
            // An ISO boots as a CD next to a blank root disk
            Some(DiskImageKind::Iso) => {
                let iso = self.backend.create_root_disk(&spec, &image).await?;
                self.track(state, ledger, iso, DeviceSlot::CD, true);
                let blank = self
                    .backend
                    .create_disk(DiskKind::Root, spec.root_gb * 1024)
                    .await?;
                self.track(state, ledger, blank, DeviceSlot::ROOT, false);
            }
            _ => {
                let root = self.backend.create_root_disk(&spec, &image).await?;
                self.track(state, ledger, root, DeviceSlot::ROOT, true);
            }
        }

        let volumes = state.request.volumes.clone();
        for volume in volumes {
            let slot = DeviceSlot::for_device_name(&volume.device).ok_or_else(|| {
                format!("unrecognized device name '{}'", volume.device)
            })?;
            self.track(state, ledger, volume.disk, slot, false);
        }

        if spec.swap_mb > 0 {
            let swap = self.backend.create_disk(DiskKind::Swap, spec.swap_mb).await?;
            self.track(state, ledger, swap, DeviceSlot::SWAP, false);
        }

        if spec.ephemeral_gb > 0 {
            let ephemeral = self
                .backend
                .create_disk(DiskKind::Ephemeral, spec.ephemeral_gb * 1024)
                .await?;
            self.track(state, ledger, ephemeral, DeviceSlot::EPHEMERAL, false);
        }

        if spec.needs_config_drive {
            let config_drive = self.backend.generate_config_drive(&spec).await?;
            self.track(state, ledger, config_drive, DeviceSlot::CONFIG_DRIVE, false);
        }

        Ok(())
    }
}

struct CreateKernelRamdisk {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<SpawnState> for CreateKernelRamdisk {
    fn name(&self) -> &str {
        "create_kernel_ramdisk"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let spec = &state.request.instance;
        let assets = [spec.kernel_id.as_deref(), spec.ramdisk_id.as_deref()];

        let mut registered = false;
        for asset in assets.into_iter().flatten() {
            self.backend.materialize_boot_asset(&spec.uuid, asset).await?;
            if !registered {
                registered = true;
                let backend = self.backend.clone();
                let uuid = spec.uuid.clone();
                ledger.record("remove boot assets", move || async move {
                    backend.remove_boot_assets(&uuid).await?;
                    Ok(())
                });
            }
        }
        Ok(())
    }
}

struct CreateVmRecord {
    backend: Arc<dyn VirtualizationBackend>,
    records: Arc<dyn InstanceRecordStore>,
}

#[async_trait]
impl Step<SpawnState> for CreateVmRecord {
    fn name(&self) -> &str {
        "create_vm_record"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let spec = &state.request.instance;

        // Advisory check only: two concurrent spawns can still race to
        // create_vm_record, which then reports the conflict itself.
        if self.backend.lookup_vm(&spec.name).await?.is_some() {
            return Err(BackendError::DuplicateName(spec.name.clone()).into());
        }

        let available_mib = self.backend.free_memory_mib().await?;
        if spec.memory_mib > available_mib {
            return Err(BackendError::InsufficientResources {
                requested_mib: spec.memory_mib,
                available_mib,
            }
            .into());
        }

        let vm = self.backend.create_vm_record(spec).await?;
        {
            let backend = self.backend.clone();
            let undo_vm = vm.clone();
            ledger.record(format!("destroy VM {vm}"), move || async move {
                backend.destroy_vm(&undo_vm).await?;
                Ok(())
            });
        }

        let mode = match spec.vm_mode {
            Some(mode) => mode,
            None => match state.disks.iter().find(|p| p.slot == DeviceSlot::ROOT) {
                Some(root) if self.backend.root_disk_is_pv(&root.disk.disk_ref).await? => {
                    VmMode::Pv
                }
                Some(_) | None => VmMode::Hvm,
            },
        };
        self.records.update_vm_mode(&spec.uuid, mode).await?;

        state.vm = Some(vm);
        Ok(())
    }
}

struct AttachDisks {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<SpawnState> for AttachDisks {
    fn name(&self) -> &str {
        "attach_disks"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let vm = state.vm()?;
        for planned in &state.disks {
            self.backend
                .attach_disk(&vm, &planned.disk.disk_ref, planned.slot, planned.bootable)
                .await?;
        }

        let spec = &state.request.instance;
        if spec.auto_disk_config {
            if let Some(root) = state.disks.iter().find(|p| p.slot == DeviceSlot::ROOT) {
                self.backend
                    .try_auto_resize_partition(&root.disk.disk_ref, spec.root_gb)
                    .await?;
            }
        }
        Ok(())
    }
}

struct AttachRescueDisk {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<SpawnState> for AttachRescueDisk {
    fn name(&self) -> &str {
        "attach_rescue_disk"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let vm = state.vm()?;
        let original = state
            .request
            .rescue_from
            .clone()
            .ok_or_else(|| StepError::from("rescue spawn without an original VM"))?;

        // The original root rides along non-bootable at its own slot so
        // the rescue image stays the boot device.
        let root = self.backend.root_disk(&original).await?;
        self.backend
            .attach_disk(&vm, &root.disk_ref, DeviceSlot::RESCUE, false)
            .await?;
        Ok(())
    }
}

struct SetupNetworking {
    backend: Arc<dyn VirtualizationBackend>,
}

#[async_trait]
impl Step<SpawnState> for SetupNetworking {
    fn name(&self) -> &str {
        "setup_networking"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let vm = state.vm()?;
        for vif in &state.request.vifs {
            self.backend.plug_vif(&vm, vif).await?;
            inject::inject_network_config(self.backend.as_ref(), &vm, vif).await?;
        }
        Ok(())
    }
}

struct InjectInstanceData {
    backend: Arc<dyn VirtualizationBackend>,
    locks: Arc<MetadataLocks>,
}

#[async_trait]
impl Step<SpawnState> for InjectInstanceData {
    fn name(&self) -> &str {
        "inject_instance_data"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let vm = state.vm()?;
        let spec = &state.request.instance;

        let _guard = self.locks.lock(&spec.uuid).await;
        inject::inject_metadata(self.backend.as_ref(), &vm, spec.metadata.iter()).await?;
        inject::inject_auto_disk_config(self.backend.as_ref(), &vm, spec.auto_disk_config).await?;

        let hostname = if state.request.is_rescue() {
            rescue_hostname(&spec.hostname)
        } else {
            spec.hostname.clone()
        };
        inject::inject_hostname(self.backend.as_ref(), &vm, &hostname).await?;
        Ok(())
    }
}

fn require_capability(
    what: &str,
    outcome: CapabilityOutcome,
) -> std::result::Result<(), StepError> {
    match outcome {
        CapabilityOutcome::Applied => Ok(()),
        CapabilityOutcome::NotSupported => {
            debug!("Firewall backend does not support {what}, skipping");
            Ok(())
        }
        CapabilityOutcome::Failed(e) => Err(format!("{what} failed: {e}").into()),
    }
}

struct PrepareFilter {
    firewall: Arc<dyn FirewallBackend>,
}

#[async_trait]
impl Step<SpawnState> for PrepareFilter {
    fn name(&self) -> &str {
        "prepare_filter"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let spec = &state.request.instance;
        let vifs = &state.request.vifs;
        require_capability(
            "basic filtering",
            self.firewall.setup_basic_filtering(spec, vifs).await,
        )?;
        require_capability(
            "instance filter preparation",
            self.firewall.prepare_instance_filter(spec, vifs).await,
        )
    }
}

struct BootInstance {
    backend: Arc<dyn VirtualizationBackend>,
    agent: Arc<dyn GuestAgentChannel>,
    records: Arc<dyn InstanceRecordStore>,
    config: VmOpsConfig,
}

#[async_trait]
impl Step<SpawnState> for BootInstance {
    fn name(&self) -> &str {
        "boot_instance"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        let vm = state.vm()?;
        self.backend.power_on(&vm).await?;

        let poller = BootReadinessPoller::new(self.backend.clone(), &self.config);
        if let Err(timeout) = poller.await_running(&vm).await {
            // Non-fatal by contract: a slow boot is left to finish on
            // its own and the workflow keeps going.
            warn!(vm = %vm, %timeout, "VM not observed running, continuing anyway");
        }

        let negotiator =
            GuestAgentNegotiator::new(self.agent.clone(), self.records.clone(), &self.config);
        negotiator
            .negotiate(&state.request.instance, &vm, &state.request.credentials)
            .await;
        Ok(())
    }
}

struct ApplyFilter {
    firewall: Arc<dyn FirewallBackend>,
}

#[async_trait]
impl Step<SpawnState> for ApplyFilter {
    fn name(&self) -> &str {
        "apply_filter"
    }

    async fn run(
        &self,
        state: &mut SpawnState,
        _ledger: &mut UndoLedger,
    ) -> std::result::Result<(), StepError> {
        require_capability(
            "instance filter activation",
            self.firewall
                .apply_instance_filter(&state.request.instance)
                .await,
        )
    }
}

/// Builds and runs the spawn step sequence
pub struct ProvisioningWorkflow {
    backend: Arc<dyn VirtualizationBackend>,
    agent: Arc<dyn GuestAgentChannel>,
    records: Arc<dyn InstanceRecordStore>,
    firewall: Arc<dyn FirewallBackend>,
    config: VmOpsConfig,
    locks: Arc<MetadataLocks>,
}

impl ProvisioningWorkflow {
    pub fn new(
        backend: Arc<dyn VirtualizationBackend>,
        agent: Arc<dyn GuestAgentChannel>,
        records: Arc<dyn InstanceRecordStore>,
        firewall: Arc<dyn FirewallBackend>,
        config: VmOpsConfig,
    ) -> Self {
        Self {
            backend,
            agent,
            records,
            firewall,
            config,
            locks: Arc::new(MetadataLocks::new()),
        }
    }

    /// Share a lock table with other metadata writers (the lifecycle
    /// ops), so per-instance serialization holds across callers
    pub fn with_metadata_locks(mut self, locks: Arc<MetadataLocks>) -> Self {
        self.locks = locks;
        self
    }

    fn build_steps(&self, request: &SpawnRequest) -> Vec<Box<dyn Step<SpawnState>>> {
        let mut steps: Vec<Box<dyn Step<SpawnState>>> = vec![
            Box::new(DetermineImageType),
            Box::new(CreateDisks {
                backend: self.backend.clone(),
            }),
        ];
        if request.instance.has_external_boot_assets() {
            steps.push(Box::new(CreateKernelRamdisk {
                backend: self.backend.clone(),
            }));
        }
        steps.push(Box::new(CreateVmRecord {
            backend: self.backend.clone(),
            records: self.records.clone(),
        }));
        steps.push(Box::new(AttachDisks {
            backend: self.backend.clone(),
        }));
        if request.is_rescue() {
            steps.push(Box::new(AttachRescueDisk {
                backend: self.backend.clone(),
            }));
        }
        steps.push(Box::new(SetupNetworking {
            backend: self.backend.clone(),
        }));
        steps.push(Box::new(InjectInstanceData {
            backend: self.backend.clone(),
            locks: self.locks.clone(),
        }));
        steps.push(Box::new(PrepareFilter {
            firewall: self.firewall.clone(),
        }));
        steps.push(Box::new(BootInstance {
            backend: self.backend.clone(),
            agent: self.agent.clone(),
            records: self.records.clone(),
            config: self.config.clone(),
        }));
        steps.push(Box::new(ApplyFilter {
            firewall: self.firewall.clone(),
        }));
        steps
    }

    /// Provision the instance. Any step failure rolls back every side
    /// effect created so far and surfaces one `SpawnFailed`.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<VmRef> {
        info!(
            instance = %request.instance.uuid,
            name = %request.instance.name,
            rescue = request.is_rescue(),
            "Spawning instance"
        );

        let reporter = Arc::new(RecordProgressReporter::new(
            self.records.clone(),
            request.instance.uuid.clone(),
        ));
        let engine = WorkflowEngine::new(reporter);
        let steps = self.build_steps(&request);
        let mut state = SpawnState::new(request);

        engine
            .run("spawn", steps, &mut state)
            .await
            .map_err(|source| VmOpsError::SpawnFailed { source })?;

        state.vm.ok_or_else(|| {
            VmOpsError::Backend(BackendError::InvalidState(
                "spawn finished without a VM record".to_string(),
            ))
        })
    }
}
