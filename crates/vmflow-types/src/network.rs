//! Virtual network interface types

use serde::{Deserialize, Serialize};

/// A virtual network interface to plug into a VM definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterface {
    pub id: String,
    pub mac: String,

    /// Bridge or network name on the host, if pinned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

impl NetworkInterface {
    pub fn new(id: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mac: mac.into(),
            bridge: None,
        }
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = Some(bridge.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_builder() {
        let vif = NetworkInterface::new("vif-1", "00:11:22:33:44:55").with_bridge("br0");
        assert_eq!(vif.mac, "00:11:22:33:44:55");
        assert_eq!(vif.bridge, Some("br0".to_string()));
    }
}
