//! In-memory backend for tests: serves a configurable inventory and records
//! every command the registrar issues.

use super::{BackendInterface, BackendNode, PatchOp, ProvisioningBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
pub struct StubBackend {
    nodes: Mutex<BTreeMap<String, BackendNode>>,
    interfaces: Mutex<HashMap<String, Vec<String>>>,
    listing_down: Mutex<bool>,
    broken: Mutex<HashSet<(String, &'static str)>>,
    transitions: Mutex<Vec<(String, String)>>,
    patches: Mutex<Vec<(String, Vec<PatchOp>)>>,
    credentials: Option<(String, String)>,
    on_patch: Mutex<Option<PatchHook>>,
}

type PatchHook = Box<dyn Fn() + Send + Sync>;

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Adds or replaces a node; `node` must carry a `uuid`.
    pub fn put_node(&self, node: Value, addresses: &[&str]) {
        let node: BackendNode = serde_json::from_value(node).expect("stub node");
        self.interfaces.lock().insert(
            node.uuid.clone(),
            addresses.iter().map(|a| a.to_string()).collect(),
        );
        self.nodes.lock().insert(node.uuid.clone(), node);
    }

    /// What the backend reports on the next listing, e.g. after a transition completed.
    pub fn set_provision_state(&self, id: &str, state: &str) {
        if let Some(node) = self.nodes.lock().get_mut(id) {
            node.fields
                .insert("provision_state".into(), Value::String(state.into()));
        }
    }

    pub fn set_listing_down(&self, down: bool) {
        *self.listing_down.lock() = down;
    }

    /// Makes `operation` ("get", "ports", "provision", "patch") fail for node `id`.
    pub fn break_operation(&self, id: &str, operation: &'static str) {
        self.broken.lock().insert((id.to_string(), operation));
    }

    /// Runs `hook` inside every successful `patch_attributes` call.
    pub fn on_patch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_patch.lock() = Some(Box::new(hook));
    }

    pub fn transitions(&self) -> Vec<(String, String)> {
        self.transitions.lock().clone()
    }

    pub fn patches(&self) -> Vec<(String, Vec<PatchOp>)> {
        self.patches.lock().clone()
    }

    fn check(&self, id: &str, operation: &'static str) -> Result<(), BackendError> {
        if self.broken.lock().contains(&(id.to_string(), operation)) {
            return Err(BackendError::Status {
                operation,
                status: 500,
                body: format!("stub failure for {id}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningBackend for StubBackend {
    async fn list_nodes(&self) -> Result<Vec<BackendNode>, BackendError> {
        if *self.listing_down.lock() {
            return Err(BackendError::Unavailable("stub listing down".into()));
        }
        Ok(self.nodes.lock().values().cloned().collect())
    }

    async fn get_node(&self, id: &str) -> Result<BackendNode, BackendError> {
        self.check(id, "get")?;
        self.nodes
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::Status {
                operation: "get",
                status: 404,
                body: id.to_string(),
            })
    }

    async fn list_interfaces(&self, id: &str) -> Result<Vec<BackendInterface>, BackendError> {
        self.check(id, "ports")?;
        let addresses = self.interfaces.lock().get(id).cloned().unwrap_or_default();
        Ok(addresses
            .into_iter()
            .map(|address| BackendInterface {
                address: Some(address),
                fields: Default::default(),
            })
            .collect())
    }

    async fn set_lifecycle_state(&self, id: &str, target: &str) -> Result<(), BackendError> {
        self.check(id, "provision")?;
        self.transitions
            .lock()
            .push((id.to_string(), target.to_string()));
        Ok(())
    }

    async fn patch_attributes(&self, id: &str, ops: &[PatchOp]) -> Result<(), BackendError> {
        self.check(id, "patch")?;
        if let Some(hook) = self.on_patch.lock().as_ref() {
            hook();
        }
        self.patches.lock().push((id.to_string(), ops.to_vec()));
        Ok(())
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, BackendError> {
        Ok(match &self.credentials {
            None => true,
            Some((u, p)) => u == username && p == password,
        })
    }

    fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }
}
