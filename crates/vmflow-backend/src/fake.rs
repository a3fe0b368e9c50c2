//! In-memory recording implementations of the capability traits
//!
//! Used by the workflow tests: every call is appended to an op log, and
//! named ops can be made to fail so rollback paths are exercisable
//! without a hypervisor.

use crate::agent::{AgentRpc, GuestAgentChannel};
use crate::error::{BackendError, Result};
use crate::firewall::{CapabilityOutcome, FirewallBackend};
use crate::records::{AgentBuild, InstanceRecordStore};
use crate::virt::VirtualizationBackend;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use vmflow_types::{
    DeviceSlot, Disk, DiskKind, DiskRef, ImageMeta, InstanceSpec, NetworkInterface, PowerState,
    VmMode, VmRef,
};

/// One recorded disk-layer transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub layer: DiskRef,
    pub dest_host: String,
    pub staging_path: String,
    pub sequence: u32,
}

#[derive(Debug, Clone)]
struct VmState {
    name: String,
    power: PowerState,
    boot_locked: bool,
    attached: Vec<(DiskRef, DeviceSlot)>,
}

#[derive(Default)]
struct Inner {
    ops: Vec<String>,
    fail_ops: HashSet<String>,
    vms: HashMap<String, VmState>,
    disks: HashMap<String, Disk>,
    chains: HashMap<String, Vec<DiskRef>>,
    metadata: HashMap<String, HashMap<String, serde_json::Value>>,
    transfers: Vec<TransferRecord>,
    boot_assets: HashMap<String, Vec<String>>,
    free_memory_mib: u64,
    clean_shutdown_succeeds: bool,
    polls_until_running: Option<u32>,
    next_id: u64,
}

/// In-memory [`VirtualizationBackend`]
pub struct FakeBackend {
    inner: Mutex<Inner>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                free_memory_mib: 64 * 1024,
                clean_shutdown_succeeds: true,
                ..Inner::default()
            }),
        }
    }

    /// Make the named op fail with `Unavailable`
    pub fn fail_on(&self, op: &str) {
        self.inner.lock().unwrap().fail_ops.insert(op.to_string());
    }

    pub fn set_free_memory_mib(&self, mib: u64) {
        self.inner.lock().unwrap().free_memory_mib = mib;
    }

    /// Make `clean_shutdown` report that the guest did not comply
    pub fn set_clean_shutdown_succeeds(&self, succeeds: bool) {
        self.inner.lock().unwrap().clean_shutdown_succeeds = succeeds;
    }

    /// Make `power_state` report `Shutdown` for the first `polls`
    /// calls, then `Running`
    pub fn set_polls_until_running(&self, polls: u32) {
        self.inner.lock().unwrap().polls_until_running = Some(polls);
    }

    /// Seed a pre-existing VM definition
    pub fn insert_vm(&self, name: &str) -> VmRef {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let vm = VmRef(format!("vm-{}", inner.next_id));
        inner.vms.insert(
            vm.0.clone(),
            VmState {
                name: name.to_string(),
                power: PowerState::Running,
                boot_locked: false,
                attached: Vec::new(),
            },
        );
        vm
    }

    /// Seed a disk and return its handle
    pub fn insert_disk(&self, kind: DiskKind, size_mib: u64) -> Disk {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let disk = Disk::new(format!("disk-{}", inner.next_id), kind, size_mib);
        inner.disks.insert(disk.disk_ref.0.clone(), disk.clone());
        disk
    }

    /// Seed a VM's copy-on-write chain, leaf first
    pub fn set_disk_chain(&self, vm: &VmRef, chain: Vec<DiskRef>) {
        self.inner.lock().unwrap().chains.insert(vm.0.clone(), chain);
    }

    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.inner.lock().unwrap().transfers.clone()
    }

    pub fn vm_name(&self, vm: &VmRef) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .vms
            .get(&vm.0)
            .map(|s| s.name.clone())
    }

    pub fn vm_power(&self, vm: &VmRef) -> Option<PowerState> {
        self.inner.lock().unwrap().vms.get(&vm.0).map(|s| s.power)
    }

    pub fn vm_exists(&self, vm: &VmRef) -> bool {
        self.inner.lock().unwrap().vms.contains_key(&vm.0)
    }

    pub fn disk_exists(&self, disk: &DiskRef) -> bool {
        self.inner.lock().unwrap().disks.contains_key(&disk.0)
    }

    pub fn boot_locked(&self, vm: &VmRef) -> bool {
        self.inner
            .lock()
            .unwrap()
            .vms
            .get(&vm.0)
            .map(|s| s.boot_locked)
            .unwrap_or(false)
    }

    pub fn metadata_value(&self, vm: &VmRef, key: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .metadata
            .get(&vm.0)
            .and_then(|m| m.get(key))
            .cloned()
    }

    fn begin(&self, op: &str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(op.to_string());
        if inner.fail_ops.contains(op) {
            return Err(BackendError::Unavailable(format!(
                "injected failure in {op}"
            )));
        }
        Ok(inner)
    }
}

fn new_disk(inner: &mut Inner, kind: DiskKind, size_mib: u64) -> Disk {
    inner.next_id += 1;
    let disk = Disk::new(format!("disk-{}", inner.next_id), kind, size_mib);
    inner.disks.insert(disk.disk_ref.0.clone(), disk.clone());
    disk
}

fn vm_state<'a>(inner: &'a mut Inner, vm: &VmRef) -> Result<&'a mut VmState> {
    inner
        .vms
        .get_mut(&vm.0)
        .ok_or_else(|| BackendError::NotFound(format!("VM {vm}")))
}

#[async_trait]
impl VirtualizationBackend for FakeBackend {
    async fn lookup_vm(&self, name: &str) -> Result<Option<VmRef>> {
        let inner = self.begin("lookup_vm")?;
        Ok(inner
            .vms
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, _)| VmRef(id.clone())))
    }

    async fn create_vm_record(&self, spec: &InstanceSpec) -> Result<VmRef> {
        let mut inner = self.begin("create_vm_record")?;
        if inner.vms.values().any(|s| s.name == spec.name) {
            return Err(BackendError::DuplicateName(spec.name.clone()));
        }
        if spec.memory_mib > inner.free_memory_mib {
            return Err(BackendError::InsufficientResources {
                requested_mib: spec.memory_mib,
                available_mib: inner.free_memory_mib,
            });
        }
        inner.next_id += 1;
        let vm = VmRef(format!("vm-{}", inner.next_id));
        inner.vms.insert(
            vm.0.clone(),
            VmState {
                name: spec.name.clone(),
                power: PowerState::Shutdown,
                boot_locked: false,
                attached: Vec::new(),
            },
        );
        Ok(vm)
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.begin("destroy_vm")?;
        inner
            .vms
            .remove(&vm.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("VM {vm}")))
    }

    async fn set_vm_name(&self, vm: &VmRef, name: &str) -> Result<()> {
        let mut inner = self.begin("set_vm_name")?;
        vm_state(&mut inner, vm)?.name = name.to_string();
        Ok(())
    }

    async fn free_memory_mib(&self) -> Result<u64> {
        let inner = self.begin("free_memory_mib")?;
        Ok(inner.free_memory_mib)
    }

    async fn create_root_disk(&self, spec: &InstanceSpec, _image: &ImageMeta) -> Result<Disk> {
        let mut inner = self.begin("create_root_disk")?;
        Ok(new_disk(&mut inner, DiskKind::Root, spec.root_gb * 1024))
    }

    async fn create_disk(&self, kind: DiskKind, size_mib: u64) -> Result<Disk> {
        let mut inner = self.begin("create_disk")?;
        Ok(new_disk(&mut inner, kind, size_mib))
    }

    async fn generate_config_drive(&self, _spec: &InstanceSpec) -> Result<Disk> {
        let mut inner = self.begin("generate_config_drive")?;
        Ok(new_disk(&mut inner, DiskKind::ConfigDrive, 64))
    }

    async fn destroy_disk(&self, disk: &DiskRef) -> Result<()> {
        let mut inner = self.begin("destroy_disk")?;
        inner
            .disks
            .remove(&disk.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("disk {disk}")))
    }

    async fn duplicate_disk_resized(&self, disk: &DiskRef, new_size_gb: u64) -> Result<Disk> {
        let mut inner = self.begin("duplicate_disk_resized")?;
        if !inner.disks.contains_key(&disk.0) {
            return Err(BackendError::NotFound(format!("disk {disk}")));
        }
        Ok(new_disk(&mut inner, DiskKind::Root, new_size_gb * 1024))
    }

    async fn resize_disk(&self, disk: &DiskRef, new_size_gb: u64) -> Result<()> {
        let mut inner = self.begin("resize_disk")?;
        match inner.disks.get_mut(&disk.0) {
            Some(d) => {
                d.size_mib = new_size_gb * 1024;
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("disk {disk}"))),
        }
    }

    async fn try_auto_resize_partition(&self, _disk: &DiskRef, _size_gb: u64) -> Result<()> {
        self.begin("try_auto_resize_partition")?;
        Ok(())
    }

    async fn attach_disk(
        &self,
        vm: &VmRef,
        disk: &DiskRef,
        slot: DeviceSlot,
        _bootable: bool,
    ) -> Result<()> {
        let mut inner = self.begin("attach_disk")?;
        if !inner.disks.contains_key(&disk.0) {
            return Err(BackendError::NotFound(format!("disk {disk}")));
        }
        let state = vm_state(&mut inner, vm)?;
        if state.attached.iter().any(|(_, s)| *s == slot) {
            return Err(BackendError::InvalidState(format!(
                "device slot {} already occupied",
                slot.0
            )));
        }
        state.attached.push((disk.clone(), slot));
        Ok(())
    }

    async fn root_disk(&self, vm: &VmRef) -> Result<Disk> {
        let mut inner = self.begin("root_disk")?;
        let state = vm_state(&mut inner, vm)?;
        let root = state
            .attached
            .iter()
            .find(|(_, slot)| *slot == DeviceSlot::ROOT)
            .map(|(d, _)| d.0.clone())
            .ok_or_else(|| BackendError::NotFound(format!("root disk of VM {vm}")))?;
        inner
            .disks
            .get(&root)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("disk {root}")))
    }

    async fn root_disk_is_pv(&self, _disk: &DiskRef) -> Result<bool> {
        self.begin("root_disk_is_pv")?;
        Ok(true)
    }

    async fn snapshot_disk_chain(&self, vm: &VmRef) -> Result<Vec<DiskRef>> {
        let inner = self.begin("snapshot_disk_chain")?;
        inner
            .chains
            .get(&vm.0)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("disk chain of VM {vm}")))
    }

    async fn transfer_disk_layer(
        &self,
        _instance_uuid: &str,
        layer: &DiskRef,
        dest_host: &str,
        staging_path: &str,
        sequence: u32,
    ) -> Result<()> {
        let op = format!("transfer_disk_layer:{layer}");
        let mut inner = self.begin(&op)?;
        inner.transfers.push(TransferRecord {
            layer: layer.clone(),
            dest_host: dest_host.to_string(),
            staging_path: staging_path.to_string(),
            sequence,
        });
        Ok(())
    }

    async fn materialize_boot_asset(&self, instance_uuid: &str, asset_id: &str) -> Result<String> {
        let mut inner = self.begin("materialize_boot_asset")?;
        let path = format!("/var/lib/vmflow/{instance_uuid}/{asset_id}");
        inner
            .boot_assets
            .entry(instance_uuid.to_string())
            .or_default()
            .push(path.clone());
        Ok(path)
    }

    async fn remove_boot_assets(&self, instance_uuid: &str) -> Result<()> {
        let mut inner = self.begin("remove_boot_assets")?;
        inner.boot_assets.remove(instance_uuid);
        Ok(())
    }

    async fn plug_vif(&self, vm: &VmRef, _vif: &NetworkInterface) -> Result<()> {
        let mut inner = self.begin("plug_vif")?;
        vm_state(&mut inner, vm)?;
        Ok(())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.begin("power_on")?;
        vm_state(&mut inner, vm)?.power = PowerState::Running;
        Ok(())
    }

    async fn clean_shutdown(&self, vm: &VmRef) -> Result<bool> {
        let mut inner = self.begin("clean_shutdown")?;
        let succeeds = inner.clean_shutdown_succeeds;
        if succeeds {
            vm_state(&mut inner, vm)?.power = PowerState::Shutdown;
        }
        Ok(succeeds)
    }

    async fn hard_shutdown(&self, vm: &VmRef) -> Result<bool> {
        let mut inner = self.begin("hard_shutdown")?;
        let state = vm_state(&mut inner, vm)?;
        let was_up = !state.power.is_shutdown();
        state.power = PowerState::Shutdown;
        Ok(was_up)
    }

    async fn suspend(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.begin("suspend")?;
        vm_state(&mut inner, vm)?.power = PowerState::Suspended;
        Ok(())
    }

    async fn resume(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.begin("resume")?;
        vm_state(&mut inner, vm)?.power = PowerState::Running;
        Ok(())
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        let mut inner = self.begin("power_state")?;
        if let Some(polls) = inner.polls_until_running {
            if polls > 0 {
                inner.polls_until_running = Some(polls - 1);
                return Ok(PowerState::Shutdown);
            }
            return Ok(PowerState::Running);
        }
        vm_state(&mut inner, vm).map(|s| s.power)
    }

    async fn acquire_boot_lock(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.begin("acquire_boot_lock")?;
        vm_state(&mut inner, vm)?.boot_locked = true;
        Ok(())
    }

    async fn release_boot_lock(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.begin("release_boot_lock")?;
        vm_state(&mut inner, vm)?.boot_locked = false;
        Ok(())
    }

    async fn write_guest_metadata(
        &self,
        vm: &VmRef,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.begin("write_guest_metadata")?;
        vm_state(&mut inner, vm)?;
        inner
            .metadata
            .entry(vm.0.clone())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete_guest_metadata(&self, vm: &VmRef, key: &str) -> Result<()> {
        let mut inner = self.begin("delete_guest_metadata")?;
        if let Some(map) = inner.metadata.get_mut(&vm.0) {
            map.remove(key);
        }
        Ok(())
    }
}

#[derive(Default)]
struct AgentInner {
    calls: Vec<String>,
    version: Option<String>,
    timeout_ops: HashSet<String>,
    not_implemented_ops: HashSet<String>,
    passwords: Vec<String>,
    ssh_keys: Vec<String>,
    files: Vec<(String, String)>,
    updated_to: Vec<String>,
    network_resets: u32,
}

/// In-memory [`GuestAgentChannel`]. With no configured version every
/// probe times out, matching an agent-less guest.
#[derive(Default)]
pub struct FakeAgent {
    inner: Mutex<AgentInner>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the version the agent reports when probed
    pub fn set_version(&self, version: &str) {
        self.inner.lock().unwrap().version = Some(version.to_string());
    }

    /// Make the named call time out
    pub fn timeout_on(&self, op: &str) {
        self.inner.lock().unwrap().timeout_ops.insert(op.to_string());
    }

    /// Make the named call report `NotImplemented`
    pub fn not_implemented_on(&self, op: &str) {
        self.inner
            .lock()
            .unwrap()
            .not_implemented_ops
            .insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn passwords(&self) -> Vec<String> {
        self.inner.lock().unwrap().passwords.clone()
    }

    pub fn ssh_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().ssh_keys.clone()
    }

    pub fn files(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().files.clone()
    }

    pub fn updates(&self) -> Vec<String> {
        self.inner.lock().unwrap().updated_to.clone()
    }

    pub fn network_resets(&self) -> u32 {
        self.inner.lock().unwrap().network_resets
    }

    fn begin(&self, op: &str) -> std::result::Result<MutexGuard<'_, AgentInner>, AgentRpc<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(op.to_string());
        if inner.timeout_ops.contains(op) {
            return Err(AgentRpc::Timeout);
        }
        if inner.not_implemented_ops.contains(op) {
            return Err(AgentRpc::NotImplemented);
        }
        Ok(inner)
    }
}

fn map_unit<T>(err: AgentRpc<()>) -> AgentRpc<T> {
    match err {
        AgentRpc::Ok(()) => unreachable!("begin never returns Ok as an error"),
        AgentRpc::Timeout => AgentRpc::Timeout,
        AgentRpc::NotImplemented => AgentRpc::NotImplemented,
        AgentRpc::Error(e) => AgentRpc::Error(e),
    }
}

#[async_trait]
impl GuestAgentChannel for FakeAgent {
    async fn agent_version(&self, _vm: &VmRef) -> AgentRpc<String> {
        match self.begin("agent_version") {
            Ok(inner) => match &inner.version {
                Some(v) => AgentRpc::Ok(v.clone()),
                None => AgentRpc::Timeout,
            },
            Err(e) => map_unit(e),
        }
    }

    async fn agent_update(&self, _vm: &VmRef, url: &str) -> AgentRpc<()> {
        match self.begin("agent_update") {
            Ok(mut inner) => {
                inner.updated_to.push(url.to_string());
                AgentRpc::Ok(())
            }
            Err(e) => e,
        }
    }

    async fn inject_ssh_key(&self, _vm: &VmRef, key: &str) -> AgentRpc<()> {
        match self.begin("inject_ssh_key") {
            Ok(mut inner) => {
                inner.ssh_keys.push(key.to_string());
                AgentRpc::Ok(())
            }
            Err(e) => e,
        }
    }

    async fn inject_file(&self, _vm: &VmRef, path: &str, contents: &str) -> AgentRpc<()> {
        match self.begin("inject_file") {
            Ok(mut inner) => {
                inner.files.push((path.to_string(), contents.to_string()));
                AgentRpc::Ok(())
            }
            Err(e) => e,
        }
    }

    async fn set_admin_password(&self, _vm: &VmRef, password: &str) -> AgentRpc<()> {
        match self.begin("set_admin_password") {
            Ok(mut inner) => {
                inner.passwords.push(password.to_string());
                AgentRpc::Ok(())
            }
            Err(e) => e,
        }
    }

    async fn reset_network(&self, _vm: &VmRef) -> AgentRpc<()> {
        match self.begin("reset_network") {
            Ok(mut inner) => {
                inner.network_resets += 1;
                AgentRpc::Ok(())
            }
            Err(e) => e,
        }
    }
}

#[derive(Default)]
struct RecordsInner {
    progress: HashMap<String, Vec<u8>>,
    vm_modes: HashMap<String, VmMode>,
    builds: HashMap<(String, String, String), AgentBuild>,
    fail_progress: bool,
}

/// In-memory [`InstanceRecordStore`] keeping full progress history
#[derive(Default)]
pub struct FakeRecordStore {
    inner: Mutex<RecordsInner>,
}

impl FakeRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every progress update fail with `Unavailable`
    pub fn fail_progress_updates(&self) {
        self.inner.lock().unwrap().fail_progress = true;
    }

    /// Publish an agent build for a guest triple
    pub fn set_agent_build(&self, hypervisor: &str, os: &str, arch: &str, build: AgentBuild) {
        self.inner.lock().unwrap().builds.insert(
            (hypervisor.to_string(), os.to_string(), arch.to_string()),
            build,
        );
    }

    pub fn progress_history(&self, instance_uuid: &str) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap()
            .progress
            .get(instance_uuid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn vm_mode(&self, instance_uuid: &str) -> Option<VmMode> {
        self.inner
            .lock()
            .unwrap()
            .vm_modes
            .get(instance_uuid)
            .copied()
    }
}

#[async_trait]
impl InstanceRecordStore for FakeRecordStore {
    async fn update_progress(&self, instance_uuid: &str, percent: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_progress {
            return Err(BackendError::Unavailable(
                "record store rejecting progress".to_string(),
            ));
        }
        inner
            .progress
            .entry(instance_uuid.to_string())
            .or_default()
            .push(percent);
        Ok(())
    }

    async fn update_vm_mode(&self, instance_uuid: &str, mode: VmMode) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .vm_modes
            .insert(instance_uuid.to_string(), mode);
        Ok(())
    }

    async fn latest_agent_build(
        &self,
        hypervisor: &str,
        os_type: &str,
        architecture: &str,
    ) -> Result<Option<AgentBuild>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .builds
            .get(&(
                hypervisor.to_string(),
                os_type.to_string(),
                architecture.to_string(),
            ))
            .cloned())
    }
}

#[derive(Default)]
struct FirewallInner {
    calls: Vec<String>,
    outcomes: HashMap<String, CapabilityOutcome>,
}

/// In-memory [`FirewallBackend`]; every call applies unless an outcome
/// is overridden
#[derive(Default)]
pub struct FakeFirewall {
    inner: Mutex<FirewallInner>,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the outcome of the named call
    pub fn set_outcome(&self, op: &str, outcome: CapabilityOutcome) {
        self.inner
            .lock()
            .unwrap()
            .outcomes
            .insert(op.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn invoke(&self, op: &str) -> CapabilityOutcome {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(op.to_string());
        inner
            .outcomes
            .get(op)
            .cloned()
            .unwrap_or(CapabilityOutcome::Applied)
    }
}

#[async_trait]
impl FirewallBackend for FakeFirewall {
    async fn setup_basic_filtering(
        &self,
        _spec: &InstanceSpec,
        _vifs: &[NetworkInterface],
    ) -> CapabilityOutcome {
        self.invoke("setup_basic_filtering")
    }

    async fn prepare_instance_filter(
        &self,
        _spec: &InstanceSpec,
        _vifs: &[NetworkInterface],
    ) -> CapabilityOutcome {
        self.invoke("prepare_instance_filter")
    }

    async fn apply_instance_filter(&self, _spec: &InstanceSpec) -> CapabilityOutcome {
        self.invoke("apply_instance_filter")
    }

    async fn remove_instance_filter(&self, _spec: &InstanceSpec) -> CapabilityOutcome {
        self.invoke("remove_instance_filter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_vm_record_duplicate_name() {
        let backend = FakeBackend::new();
        backend.insert_vm("web-1");

        let err = backend
            .create_vm_record(&InstanceSpec::new("u", "web-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::DuplicateName(n) if n == "web-1"));
    }

    #[tokio::test]
    async fn test_create_vm_record_insufficient_memory() {
        let backend = FakeBackend::new();
        backend.set_free_memory_mib(512);

        let err = backend
            .create_vm_record(&InstanceSpec::new("u", "big").with_memory_mib(4096))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InsufficientResources { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure_and_op_log() {
        let backend = FakeBackend::new();
        backend.fail_on("power_on");
        let vm = backend.insert_vm("web-1");

        assert!(backend.power_on(&vm).await.is_err());
        assert_eq!(backend.ops(), vec!["power_on"]);
    }

    #[tokio::test]
    async fn test_polls_until_running() {
        let backend = FakeBackend::new();
        backend.set_polls_until_running(2);
        let vm = backend.insert_vm("web-1");

        assert_eq!(backend.power_state(&vm).await.unwrap(), PowerState::Shutdown);
        assert_eq!(backend.power_state(&vm).await.unwrap(), PowerState::Shutdown);
        assert_eq!(backend.power_state(&vm).await.unwrap(), PowerState::Running);
    }

    #[tokio::test]
    async fn test_destroy_vm_leaves_attached_disks() {
        let backend = FakeBackend::new();
        let vm = backend.insert_vm("web-1");
        let disk = backend.insert_disk(DiskKind::Root, 1024);
        backend
            .attach_disk(&vm, &disk.disk_ref, DeviceSlot::ROOT, true)
            .await
            .unwrap();

        backend.destroy_vm(&vm).await.unwrap();

        assert!(!backend.vm_exists(&vm));
        assert!(backend.disk_exists(&disk.disk_ref));
    }

    #[tokio::test]
    async fn test_attach_disk_slot_conflict() {
        let backend = FakeBackend::new();
        let vm = backend.insert_vm("web-1");
        let a = backend.insert_disk(DiskKind::Root, 1024);
        let b = backend.insert_disk(DiskKind::Swap, 512);

        backend
            .attach_disk(&vm, &a.disk_ref, DeviceSlot::ROOT, true)
            .await
            .unwrap();
        let err = backend
            .attach_disk(&vm, &b.disk_ref, DeviceSlot::ROOT, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_agent_without_version_times_out() {
        let agent = FakeAgent::new();
        let vm = VmRef("vm-1".to_string());

        assert_eq!(agent.agent_version(&vm).await, AgentRpc::Timeout);

        agent.set_version("1.2.0");
        assert_eq!(
            agent.agent_version(&vm).await,
            AgentRpc::Ok("1.2.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_record_store_progress_history() {
        let records = FakeRecordStore::new();
        records.update_progress("u-1", 25).await.unwrap();
        records.update_progress("u-1", 50).await.unwrap();

        assert_eq!(records.progress_history("u-1"), vec![25, 50]);
        assert!(records.progress_history("u-2").is_empty());
    }

    #[tokio::test]
    async fn test_firewall_outcome_override() {
        let firewall = FakeFirewall::new();
        let spec = InstanceSpec::new("u", "web-1");
        firewall.set_outcome("apply_instance_filter", CapabilityOutcome::NotSupported);

        assert!(firewall.setup_basic_filtering(&spec, &[]).await.is_applied());
        assert_eq!(
            firewall.apply_instance_filter(&spec).await,
            CapabilityOutcome::NotSupported
        );
    }
}
