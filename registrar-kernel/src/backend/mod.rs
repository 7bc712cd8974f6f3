/**
 * PROVISIONING BACKEND - What the registrar consumes from the bare-metal service
 *
 * ROLE :
 * The backend is the source of truth for node inventory and provision state.
 * The reconciler only ever talks to it through `ProvisioningBackend`, so the
 * REST client and the test stub are interchangeable.
 */

pub mod ironic;
#[cfg(test)]
pub mod stub;

use crate::error::BackendError;
use crate::models::Attributes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ironic::IronicClient;

/// A node as reported by the backend, either as a list summary or in detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendNode {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub fields: Attributes,
}

impl BackendNode {
    /// List summaries carry no hardware properties; those need a detail fetch.
    pub fn has_details(&self) -> bool {
        self.fields.contains_key("properties")
    }
}

/// One network interface ("port") of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInterface {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(flatten)]
    pub fields: Attributes,
}

/// One JSON-Patch operation on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchVerb,
    pub path: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchVerb {
    Add,
}

impl PatchOp {
    pub fn add(path: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            op: PatchVerb::Add,
            path: path.to_string(),
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<BackendNode>, BackendError>;

    async fn get_node(&self, id: &str) -> Result<BackendNode, BackendError>;

    async fn list_interfaces(&self, id: &str) -> Result<Vec<BackendInterface>, BackendError>;

    /// Requests a provision state transition. The outcome is observed on a later listing.
    async fn set_lifecycle_state(&self, id: &str, target: &str) -> Result<(), BackendError>;

    async fn patch_attributes(&self, id: &str, ops: &[PatchOp]) -> Result<(), BackendError>;

    /// Checks user credentials against the backend identity service.
    async fn verify_credentials(&self, username: &str, password: &str)
        -> Result<bool, BackendError>;

    /// False when the backend runs without an identity service: the API is then open.
    fn auth_enabled(&self) -> bool;
}
