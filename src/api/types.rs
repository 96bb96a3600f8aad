//! JSON request and response types for the control plane.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Default vCPU count applied when the request omits or zeroes `cpu`.
pub const DEFAULT_CPU: u32 = 1;

/// Default memory (MiB) applied when the request omits or zeroes `memory`.
pub const DEFAULT_MEMORY: u32 = 1024;

/// Default image reference when the request omits `image`.
pub const DEFAULT_IMAGE: &str = "ubuntu:22.04";

/// Request to create a new instance.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateInstanceRequest {
    /// vCPU count; 0 or absent means the default.
    #[serde(default)]
    #[schema(example = 2)]
    pub cpu: Option<u32>,
    /// Memory in MiB; 0 or absent means the default.
    #[serde(default)]
    #[schema(example = 2048)]
    pub memory: Option<u32>,
    /// Container image the root disk is built from.
    #[serde(default)]
    #[schema(example = "ubuntu:22.04")]
    pub image: Option<String>,
    /// SSH public key granted access to the guest. Required.
    #[serde(default)]
    #[schema(example = "ssh-ed25519 AAAA... user@host")]
    pub public_key: Option<String>,
}

impl CreateInstanceRequest {
    /// Effective vCPU count with the default applied.
    pub fn effective_cpu(&self) -> u32 {
        self.cpu.filter(|c| *c > 0).unwrap_or(DEFAULT_CPU)
    }

    /// Effective memory with the default applied.
    pub fn effective_memory(&self) -> u32 {
        self.memory.filter(|m| *m > 0).unwrap_or(DEFAULT_MEMORY)
    }

    /// Effective image reference with the default applied.
    pub fn effective_image(&self) -> String {
        match self.image.as_deref() {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => DEFAULT_IMAGE.to_string(),
        }
    }
}

/// Successful instance creation.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateInstanceResponse {
    /// Instance id, the key for delete/manage calls.
    pub id: String,
    /// Ready-to-paste SSH command reaching the guest.
    #[schema(example = "ssh -p 20003 ubuntu@203.0.113.7")]
    pub ssh_command: String,
}

/// Request to change an instance's lifecycle state.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ManageInstanceRequest {
    /// One of "start", "stop", "reboot". Required.
    #[serde(default)]
    #[schema(example = "reboot")]
    pub action: Option<String>,
}

/// Successful manage call.
#[derive(Debug, Serialize, ToSchema)]
pub struct ManageInstanceResponse {
    /// The instance acted on.
    pub id: String,
    /// The applied action.
    pub action: String,
}

/// Successful deletion.
#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteInstanceResponse {
    /// Id of the deleted instance.
    pub deleted: String,
}

/// Health probe response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always "ok" when the agent is serving.
    pub status: String,
    /// Agent version.
    pub version: String,
}

/// JSON error body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Human-readable failure description.
    pub error: String,
    /// Machine-readable failure kind.
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_for_absent_fields() {
        let req: CreateInstanceRequest =
            serde_json::from_str(r#"{"public_key": "ssh-ed25519 AAAA"}"#).unwrap();
        assert_eq!(req.effective_cpu(), 1);
        assert_eq!(req.effective_memory(), 1024);
        assert_eq!(req.effective_image(), "ubuntu:22.04");
    }

    #[test]
    fn test_defaults_applied_for_zero_values() {
        let req: CreateInstanceRequest =
            serde_json::from_str(r#"{"cpu": 0, "memory": 0, "public_key": "k"}"#).unwrap();
        assert_eq!(req.effective_cpu(), 1);
        assert_eq!(req.effective_memory(), 1024);
    }

    #[test]
    fn test_explicit_values_kept() {
        let req: CreateInstanceRequest = serde_json::from_str(
            r#"{"cpu": 2, "memory": 2048, "image": "debian:12", "public_key": "k"}"#,
        )
        .unwrap();
        assert_eq!(req.effective_cpu(), 2);
        assert_eq!(req.effective_memory(), 2048);
        assert_eq!(req.effective_image(), "debian:12");
    }

    #[test]
    fn test_missing_action_deserialises() {
        let req: ManageInstanceRequest = serde_json::from_str("{}").unwrap();
        assert!(req.action.is_none());
    }
}
