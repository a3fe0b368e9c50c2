//! Guest metadata channel writes shared by spawn and lifecycle ops
//!
//! Keys under `vm-data/` are read by the guest at boot and by the
//! agent at runtime. User-supplied metadata keys are sanitized; the
//! fixed paths below are written verbatim.

use serde_json::json;
use vmflow_backend::{BackendError, Result, VirtualizationBackend};
use vmflow_types::{sanitize_metadata_key, NetworkInterface, VmRef};

pub(crate) const HOSTNAME_KEY: &str = "vm-data/hostname";
pub(crate) const AUTO_DISK_CONFIG_KEY: &str = "vm-data/auto-disk-config";
pub(crate) const NETWORKING_PREFIX: &str = "vm-data/networking";
pub(crate) const USER_METADATA_PREFIX: &str = "vm-data/user-metadata";

pub(crate) async fn inject_hostname(
    backend: &dyn VirtualizationBackend,
    vm: &VmRef,
    hostname: &str,
) -> Result<()> {
    backend
        .write_guest_metadata(vm, HOSTNAME_KEY, &json!(hostname))
        .await
}

pub(crate) async fn inject_auto_disk_config(
    backend: &dyn VirtualizationBackend,
    vm: &VmRef,
    enabled: bool,
) -> Result<()> {
    backend
        .write_guest_metadata(vm, AUTO_DISK_CONFIG_KEY, &json!(enabled))
        .await
}

/// Write one interface's configuration at its MAC-keyed path
pub(crate) async fn inject_network_config(
    backend: &dyn VirtualizationBackend,
    vm: &VmRef,
    vif: &NetworkInterface,
) -> Result<()> {
    let key = format!("{NETWORKING_PREFIX}/{}", vif.mac.replace(':', ""));
    let value = serde_json::to_value(vif)
        .map_err(|e| BackendError::InvalidState(format!("unserializable interface: {e}")))?;
    backend.write_guest_metadata(vm, &key, &value).await
}

/// Write the user metadata map, sanitizing each key
pub(crate) async fn inject_metadata<'a>(
    backend: &dyn VirtualizationBackend,
    vm: &VmRef,
    entries: impl Iterator<Item = (&'a String, &'a String)>,
) -> Result<()> {
    for (key, value) in entries {
        let key = format!("{USER_METADATA_PREFIX}/{}", sanitize_metadata_key(key));
        backend.write_guest_metadata(vm, &key, &json!(value)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use vmflow_backend::FakeBackend;

    #[tokio::test]
    async fn test_network_config_key_strips_colons() {
        let backend = FakeBackend::new();
        let vm = backend.insert_vm("web-1");
        let vif = NetworkInterface::new("vif-1", "00:11:22:33:44:55");

        inject_network_config(&backend, &vm, &vif).await.unwrap();

        let value = backend
            .metadata_value(&vm, "vm-data/networking/001122334455")
            .unwrap();
        assert_eq!(value["mac"], "00:11:22:33:44:55");
    }

    #[tokio::test]
    async fn test_metadata_keys_sanitized() {
        let backend = FakeBackend::new();
        let vm = backend.insert_vm("web-1");
        let mut metadata = HashMap::new();
        metadata.insert("role/primary".to_string(), "web".to_string());

        inject_metadata(&backend, &vm, metadata.iter()).await.unwrap();

        assert_eq!(
            backend
                .metadata_value(&vm, "vm-data/user-metadata/role_primary")
                .unwrap(),
            "web"
        );
    }

    #[tokio::test]
    async fn test_hostname_and_auto_disk_config() {
        let backend = FakeBackend::new();
        let vm = backend.insert_vm("web-1");

        inject_hostname(&backend, &vm, "web-1").await.unwrap();
        inject_auto_disk_config(&backend, &vm, true).await.unwrap();

        assert_eq!(backend.metadata_value(&vm, HOSTNAME_KEY).unwrap(), "web-1");
        assert_eq!(
            backend.metadata_value(&vm, AUTO_DISK_CONFIG_KEY).unwrap(),
            true
        );
    }
}
