/**
 * PATCH APPLIER - Turns a pending request into registry + backend changes
 *
 * Two effects per request :
 * - registry-only fields (virtual name, virtual link id, console endpoint),
 *   applied locally and unconditionally;
 * - a JSON-Patch for the backend built from the backend-visible subset
 *   (BMC credentials, BMC address and port, roles). Renaming is never sent:
 *   the backend rejects name changes.
 *
 * A failed backend call does not roll the local changes back.
 */

use crate::backend::{PatchOp, ProvisioningBackend};
use crate::error::BackendError;
use crate::models::PendingEntry;
use crate::state::SharedStore;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalUpdate {
    pub virtual_name: Option<String>,
    pub virtual_link_id: Option<String>,
    pub management_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchPlan {
    pub local: LocalUpdate,
    pub backend_ops: Vec<PatchOp>,
}

pub fn plan(pending: &PendingEntry) -> PatchPlan {
    let changes = &pending.changes;

    let management_endpoint = match (&changes.vnc_host, &changes.vnc_port) {
        (Some(host), Some(port)) => Some(format!("{host}:{port}")),
        _ => None,
    };
    let local = LocalUpdate {
        virtual_name: changes.name.clone(),
        virtual_link_id: Some(pending.request_id.clone()),
        management_endpoint,
    };

    let mut backend_ops = Vec::new();
    if let Some(user) = &changes.bmc_user {
        backend_ops.push(PatchOp::add("/driver_info/ipmi_username", user.as_str()));
    }
    if let Some(password) = &changes.bmc_password {
        backend_ops.push(PatchOp::add("/driver_info/ipmi_password", password.as_str()));
    }
    if let Some(host) = &changes.bmc_host {
        backend_ops.push(PatchOp::add("/driver_info/ipmi_address", host.as_str()));
    }
    if let Some(port) = &changes.bmc_port {
        let value = serde_json::to_value(port).unwrap_or_else(|_| port.to_string().into());
        backend_ops.push(PatchOp::add("/driver_info/ipmi_port", value));
    }
    if let Some(roles) = &changes.roles {
        backend_ops.push(PatchOp::add("/extra/roles", roles.clone()));
    }

    PatchPlan { local, backend_ops }
}

/// Applies `pending` to node `entry_id`. The local part always lands; the
/// result reflects the backend call only. A node that vanished from the
/// registry is an error and nothing is applied.
pub async fn apply(
    store: &SharedStore,
    backend: &dyn ProvisioningBackend,
    entry_id: &str,
    pending: &PendingEntry,
) -> Result<(), BackendError> {
    if store.lock().get_registered(entry_id).is_none() {
        warn!(node = %entry_id, request = %pending.request_id, "node no longer registered, request kept");
        return Err(BackendError::Status {
            operation: "patch node",
            status: 404,
            body: format!("{entry_id} is no longer registered"),
        });
    }
    let PatchPlan { local, backend_ops } = plan(pending);

    let changed = store.lock().apply_local_update(entry_id, &local);
    info!(
        node = %entry_id,
        request = %pending.request_id,
        ?changed,
        "applied pending request locally"
    );

    if backend_ops.is_empty() {
        return Ok(());
    }
    backend
        .patch_attributes(entry_id, &backend_ops)
        .await
        .inspect_err(|e| {
            warn!(node = %entry_id, request = %pending.request_id, error = %e, "backend patch failed")
        })
}
