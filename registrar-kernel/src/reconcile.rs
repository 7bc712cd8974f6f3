/**
 * RECONCILIATION CYCLE - Periodic merge / match / patch / step
 *
 * ONE CYCLE :
 * 1. list the backend inventory (fetching node details when the summary has none)
 * 2. normalise each node and upsert it into the registry
 * 3. match every pending request by MAC address, apply it, drop it once applied
 * 4. request one provision transition per eligible node
 * 5. write a final snapshot
 *
 * A failed inventory listing aborts the cycle; any other backend failure only
 * skips the node or operation concerned. Cycles never overlap: the loop task
 * runs them one after the other and skips the ticks it missed.
 */

use crate::backend::{BackendInterface, BackendNode, ProvisioningBackend};
use crate::error::BackendError;
use crate::health::CycleTracker;
use crate::lifecycle::{self, StepOutcome};
use crate::literal;
use crate::matcher;
use crate::models::{is_present, FieldSet, PendingEntry, ADDRESSES_FIELD, NAME_FIELD, NAME_FROM_ID_FIELD};
use crate::patch;
use crate::state::SharedStore;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Backend fields with no value for the registry.
const DROPPED_FIELDS: [&str; 2] = ["links", "ports"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub merged: usize,
    pub changed: usize,
    pub skipped: usize,
    pub matched: usize,
    pub patch_failures: usize,
    pub transitions_requested: usize,
    pub transition_failures: usize,
}

/// Backend node -> registry field set.
pub fn normalize_node(node: BackendNode, interfaces: Option<&[BackendInterface]>) -> FieldSet {
    let BackendNode { uuid, name, fields: attributes } = node;
    let mut fields = FieldSet::new();

    for (key, value) in attributes {
        if DROPPED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let value = if key == "extra" { reshape_extra(value) } else { value };
        fields.insert(key, value);
    }

    let (name, from_id) = match name {
        Some(name) => (name, false),
        None => (uuid, true),
    };
    fields.insert(NAME_FIELD.into(), Value::String(name));
    fields.insert(NAME_FROM_ID_FIELD.into(), Value::Bool(from_id));

    if let Some(interfaces) = interfaces {
        let addresses = interfaces
            .iter()
            .filter_map(|i| i.address.clone())
            .map(Value::String)
            .collect();
        fields.insert(ADDRESSES_FIELD.into(), Value::Array(addresses));
    }
    fields.insert("addressing_mode".into(), Value::String("dhcp".into()));
    fields
}

/// Keeps `extra.all` (deserialized when sent as text) and `extra.roles`.
fn reshape_extra(extra: Value) -> Value {
    let mut reshaped = FieldSet::new();
    if let Value::Object(mut extra) = extra {
        if let Some(all) = extra.remove("all").filter(is_present) {
            reshaped.insert("all".into(), parse_serialized(all));
        }
        if let Some(roles) = extra.remove("roles").filter(is_present) {
            reshaped.insert("roles".into(), roles);
        }
    }
    Value::Object(reshaped)
}

/// `extra.all` is written by external tooling as JSON or as a Python literal.
fn parse_serialized(all: Value) -> Value {
    let Value::String(text) = all else {
        return all;
    };
    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return value;
    }
    match literal::parse(&text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unreadable extra.all, kept as text");
            Value::String(text)
        }
    }
}

pub struct Reconciler {
    store: SharedStore,
    backend: Arc<dyn ProvisioningBackend>,
    tracker: CycleTracker,
}

impl Reconciler {
    pub fn new(
        store: SharedStore,
        backend: Arc<dyn ProvisioningBackend>,
        tracker: CycleTracker,
    ) -> Self {
        Self { store, backend, tracker }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, BackendError> {
        let mut report = CycleReport::default();
        self.merge_inventory(&mut report).await?;
        self.satisfy_pending(&mut report).await;
        self.step_lifecycles(&mut report).await;
        self.store.lock().persist();
        Ok(report)
    }

    async fn merge_inventory(&self, report: &mut CycleReport) -> Result<(), BackendError> {
        let nodes = self.backend.list_nodes().await?;
        debug!(count = nodes.len(), "inventory listed");

        for summary in nodes {
            let node = if summary.has_details() {
                summary
            } else {
                match self.backend.get_node(&summary.uuid).await {
                    Ok(node) => node,
                    Err(e) => {
                        warn!(node = %summary.uuid, error = %e, "node detail fetch failed, skipped");
                        report.skipped += 1;
                        continue;
                    }
                }
            };

            let interfaces = match self.backend.list_interfaces(&node.uuid).await {
                Ok(interfaces) => Some(interfaces),
                Err(e) => {
                    warn!(node = %node.uuid, error = %e, "port listing failed, known addresses kept");
                    None
                }
            };

            let id = node.uuid.clone();
            let fields = normalize_node(node, interfaces.as_deref());
            let changed = self.store.lock().upsert_registered(&id, fields);
            report.merged += 1;
            if !changed.is_empty() {
                report.changed += 1;
            }
        }
        Ok(())
    }

    async fn satisfy_pending(&self, report: &mut CycleReport) {
        let candidates = self.match_candidates();

        for (pending, entry_id) in candidates {
            match patch::apply(&self.store, self.backend.as_ref(), &entry_id, &pending).await {
                Ok(()) => {
                    if self.retire_pending(&pending) {
                        info!(request = %pending.request_id, node = %entry_id, "pending request satisfied");
                        report.matched += 1;
                    }
                }
                Err(_) => report.patch_failures += 1,
            }
        }
    }

    fn match_candidates(&self) -> Vec<(PendingEntry, String)> {
        let store = self.store.lock();
        store
            .all_pending()
            .values()
            .filter_map(|pending| {
                matcher::match_pending(&store, pending).map(|id| (pending.clone(), id))
            })
            .collect()
    }

    /// Drops the request unless it was re-submitted while being applied.
    fn retire_pending(&self, applied: &PendingEntry) -> bool {
        let mut store = self.store.lock();
        if store.get_pending(&applied.request_id) != Some(applied) {
            debug!(request = %applied.request_id, "request changed meanwhile, kept for next cycle");
            return false;
        }
        store.remove_pending(&applied.request_id).is_some()
    }

    async fn step_lifecycles(&self, report: &mut CycleReport) {
        let states: Vec<(String, Option<String>)> = self
            .store
            .lock()
            .all_registered()
            .values()
            .map(|entry| (entry.id.clone(), entry.provision_state.clone()))
            .collect();

        for (id, state) in states {
            match lifecycle::step(self.backend.as_ref(), &id, state.as_deref()).await {
                StepOutcome::Idle => {}
                StepOutcome::Requested(_) => report.transitions_requested += 1,
                StepOutcome::Failed(_) => report.transition_failures += 1,
            }
        }
    }

    /// Runs one cycle inside its own span and records the outcome.
    pub async fn run_tracked(&self) {
        let span = info_span!("cycle", cycle_id = %Uuid::new_v4());
        async {
            match self.run_cycle().await {
                Ok(report) => {
                    info!(?report, "reconciliation cycle done");
                    self.tracker.record_success(report);
                }
                Err(e) => {
                    error!(error = %e, "reconciliation cycle aborted");
                    self.tracker.record_failure(e.to_string());
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs a cycle every `period` until `shutdown` turns true. The first tick is
    /// one period away: the startup cycle runs before the loop is spawned.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(period_secs = period.as_secs(), "starting reconciliation loop");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_tracked().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciliation loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::state::new_state;
    use crate::store::RegistryStore;
    use serde_json::json;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn setup(store: RegistryStore) -> (Arc<StubBackend>, SharedStore, Reconciler) {
        let backend = Arc::new(StubBackend::new());
        let store = new_state(store);
        let reconciler = Reconciler::new(store.clone(), backend.clone(), CycleTracker::new());
        (backend, store, reconciler)
    }

    fn pending(v: Value) -> PendingEntry {
        serde_json::from_value(v).unwrap()
    }

    fn node(id: &str, state: &str) -> Value {
        json!({
            "uuid": id,
            "name": null,
            "provision_state": state,
            "properties": {"cpus": 2, "memory_mb": 4096},
            "links": [{"href": "http://backend/v1/nodes"}]
        })
    }

    #[test]
    fn normalization_reshapes_backend_fields() {
        let node: BackendNode = serde_json::from_value(json!({
            "uuid": "abc",
            "name": null,
            "provision_state": "enroll",
            "links": [],
            "ports": [],
            "extra": {
                "all": "{'macs': ['aa:bb:cc:dd:ee:ff'], 'interfaces': {'eth0': {'ip': '10.0.0.5'}}}",
                "roles": ["compute"],
                "scratch": 1
            }
        }))
        .unwrap();
        let interfaces = vec![
            BackendInterface { address: Some(MAC.into()), fields: Default::default() },
            BackendInterface { address: None, fields: Default::default() },
        ];

        let fields = normalize_node(node, Some(&interfaces));
        assert_eq!(fields["name"], "abc");
        assert_eq!(fields["name_from_uuid"], true);
        assert_eq!(fields["nics"], json!([MAC]));
        assert_eq!(fields["addressing_mode"], "dhcp");
        assert!(!fields.contains_key("links"));
        assert!(!fields.contains_key("ports"));
        assert_eq!(
            fields["extra"],
            json!({
                "all": {"macs": [MAC], "interfaces": {"eth0": {"ip": "10.0.0.5"}}},
                "roles": ["compute"]
            })
        );
    }

    #[test]
    fn json_extra_all_and_missing_ports() {
        let node: BackendNode = serde_json::from_value(json!({
            "uuid": "abc",
            "name": "node-1",
            "extra": {"all": "{\"macs\": []}"}
        }))
        .unwrap();
        let fields = normalize_node(node, None);
        assert_eq!(fields["name"], "node-1");
        assert_eq!(fields["name_from_uuid"], false);
        assert_eq!(fields["extra"], json!({"all": {"macs": []}}));
        assert!(!fields.contains_key("nics"));
    }

    fn extra_all(text: &str) -> Value {
        let node: BackendNode = serde_json::from_value(json!({
            "uuid": "abc",
            "name": "node-1",
            "extra": {"all": text}
        }))
        .unwrap();
        normalize_node(node, None)["extra"]["all"].clone()
    }

    #[test]
    fn python_literal_extra_all() {
        assert_eq!(
            extra_all("{'a': None, 'b': True, 'c': False}"),
            json!({"a": null, "b": true, "c": false})
        );
        assert_eq!(
            extra_all("{u'macs': [u'aa:bb:cc:dd:ee:ff'], u'interfaces': {u'eth0': {u'ip': u'10.0.0.5'}}}"),
            json!({"macs": [MAC], "interfaces": {"eth0": {"ip": "10.0.0.5"}}})
        );
        assert_eq!(extra_all("{'t': (1, 2), 'f': 1.5, 'n': -3}"), json!({"t": [1, 2], "f": 1.5, "n": -3}));
        assert_eq!(extra_all(r#"{"q": 'it\'s', b'raw': "x\ny"}"#), json!({"q": "it's", "raw": "x\ny"}));
    }

    #[test]
    fn unreadable_extra_all_is_kept_as_text() {
        assert_eq!(extra_all("{'a': frozenset()}"), json!("{'a': frozenset()}"));
        assert_eq!(extra_all("not: [valid"), json!("not: [valid"));
    }

    #[test]
    fn empty_backend_name_is_kept() {
        let node: BackendNode =
            serde_json::from_value(json!({"uuid": "abc", "name": ""})).unwrap();
        let fields = normalize_node(node, None);
        assert_eq!(fields["name"], "");
        assert_eq!(fields["name_from_uuid"], false);
    }

    #[tokio::test]
    async fn merging_the_same_inventory_twice_changes_nothing() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "active"), &[MAC]);
        backend.put_node(node("def", "active"), &["aa:bb:cc:dd:ee:00"]);

        let first = reconciler.run_cycle().await.unwrap();
        assert_eq!(first.merged, 2);
        assert_eq!(first.changed, 2);
        let before = store.lock().all_registered().clone();

        let second = reconciler.run_cycle().await.unwrap();
        assert_eq!(second.merged, 2);
        assert_eq!(second.changed, 0);

        let guard = store.lock();
        for (id, entry) in guard.all_registered() {
            assert_eq!(entry.last_modified_at, before[id].last_modified_at);
        }
    }

    #[tokio::test]
    async fn matched_request_is_applied_and_removed() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "active"), &[MAC]);
        store.lock().upsert_pending(pending(json!({
            "virt-uuid": "r1",
            "mac_addr": MAC,
            "name": "vm-1",
            "vnc_host": "kvm1",
            "vnc_port": 5901,
            "bmc_user": "admin",
            "roles": ["compute"]
        })));

        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.matched, 1);

        let guard = store.lock();
        assert!(guard.all_pending().is_empty());
        let entry = guard.get_registered("abc").unwrap();
        assert_eq!(entry.virtual_name.as_deref(), Some("vm-1"));
        assert_eq!(entry.virtual_link_id.as_deref(), Some("r1"));
        assert_eq!(entry.management_endpoint.as_deref(), Some("kvm1:5901"));

        let patches = backend.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "abc");
        assert!(patches[0].1.iter().all(|op| op.path != "/name"));
    }

    #[tokio::test]
    async fn unmatched_request_waits_indefinitely() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "active"), &[MAC]);
        store.lock().upsert_pending(pending(json!({"virt-uuid": "r1", "mac_addr": "00:11:22:33:44:55"})));
        store.lock().upsert_pending(pending(json!({"virt-uuid": "r2"})));

        for _ in 0..3 {
            let report = reconciler.run_cycle().await.unwrap();
            assert_eq!(report.matched, 0);
        }
        assert_eq!(store.lock().all_pending().len(), 2);
    }

    #[tokio::test]
    async fn provision_state_moves_only_when_backend_confirms() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "enroll"), &[MAC]);

        reconciler.run_cycle().await.unwrap();
        assert_eq!(backend.transitions(), vec![("abc".to_string(), "manage".to_string())]);
        assert_eq!(
            store.lock().get_registered("abc").unwrap().provision_state.as_deref(),
            Some("enroll")
        );

        // transition not finished yet: asked again, state still local truth
        reconciler.run_cycle().await.unwrap();
        assert_eq!(backend.transitions().len(), 2);
        assert_eq!(backend.transitions()[1].1, "manage");

        backend.set_provision_state("abc", "manageable");
        reconciler.run_cycle().await.unwrap();
        assert_eq!(backend.transitions()[2].1, "provide");
        assert_eq!(
            store.lock().get_registered("abc").unwrap().provision_state.as_deref(),
            Some("manageable")
        );

        backend.set_provision_state("abc", "active");
        reconciler.run_cycle().await.unwrap();
        assert_eq!(backend.transitions().len(), 3);
    }

    #[tokio::test]
    async fn restored_state_is_reconciled_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let mut store = RegistryStore::open(&path, None).unwrap();
            store.upsert_registered(
                "abc",
                json!({"name": "abc", "nics": [MAC], "provision_state": "active"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            );
            store.upsert_pending(pending(json!({"virt-uuid": "r1", "mac_addr": MAC, "name": "vm-1"})));
        }

        let (backend, store, reconciler) = setup(RegistryStore::open(&path, None).unwrap());
        backend.put_node(json!({"uuid": "abc", "name": "abc", "provision_state": "active"}), &[MAC]);

        reconciler.run_cycle().await.unwrap();

        let guard = store.lock();
        assert!(guard.all_pending().is_empty());
        let entry = guard.get_registered("abc").unwrap();
        assert_eq!(entry.virtual_link_id.as_deref(), Some("r1"));
        assert_eq!(entry.virtual_name.as_deref(), Some("vm-1"));
        drop(guard);

        let reopened = RegistryStore::open(&path, None).unwrap();
        assert!(reopened.all_pending().is_empty());
        assert_eq!(
            reopened.get_registered("abc").unwrap().virtual_name.as_deref(),
            Some("vm-1")
        );
    }

    #[tokio::test]
    async fn request_resubmitted_during_patch_is_kept() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "active"), &[MAC]);
        store.lock().upsert_pending(pending(json!({
            "virt-uuid": "r1", "mac_addr": MAC, "bmc_user": "admin"
        })));
        let resubmit = store.clone();
        backend.on_patch(move || {
            resubmit
                .lock()
                .upsert_pending(pending(json!({"virt-uuid": "r1", "bmc_user": "operator"})));
        });

        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.matched, 0);
        assert_eq!(report.patch_failures, 0);
        assert_eq!(
            store.lock().get_pending("r1").unwrap().changes.bmc_user.as_deref(),
            Some("operator")
        );

        // same content resubmitted: nothing changed, the request is retired
        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.matched, 1);
        assert!(store.lock().all_pending().is_empty());
        let patches = backend.patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].1[0].value, json!("operator"));
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_cycle() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "enroll"), &[MAC]);
        backend.set_listing_down(true);
        store.lock().upsert_pending(pending(json!({"virt-uuid": "r1", "mac_addr": MAC})));

        assert!(matches!(
            reconciler.run_cycle().await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(store.lock().all_registered().is_empty());
        assert_eq!(store.lock().all_pending().len(), 1);
        assert!(backend.transitions().is_empty());

        backend.set_listing_down(false);
        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.matched, 1);
    }

    #[tokio::test]
    async fn patch_failure_keeps_the_request() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "active"), &[MAC]);
        backend.break_operation("abc", "patch");
        store.lock().upsert_pending(pending(json!({
            "virt-uuid": "r1", "mac_addr": MAC, "name": "vm-1", "bmc_host": "10.0.0.1"
        })));

        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.patch_failures, 1);
        assert_eq!(report.matched, 0);

        let guard = store.lock();
        assert!(guard.get_pending("r1").is_some());
        assert_eq!(
            guard.get_registered("abc").unwrap().virtual_name.as_deref(),
            Some("vm-1")
        );
    }

    #[tokio::test]
    async fn one_failing_node_does_not_block_the_others() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "enroll"), &[MAC]);
        backend.put_node(node("def", "available"), &["aa:bb:cc:dd:ee:00"]);
        backend.put_node(json!({"uuid": "ghi", "name": "summary-only"}), &[]);
        backend.break_operation("abc", "provision");
        backend.break_operation("ghi", "get");

        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.merged, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.transition_failures, 1);
        assert_eq!(report.transitions_requested, 1);
        assert_eq!(backend.transitions(), vec![("def".to_string(), "active".to_string())]);
        assert!(store.lock().get_registered("ghi").is_none());
    }

    #[tokio::test]
    async fn port_listing_failure_keeps_known_addresses() {
        let (backend, store, reconciler) = setup(RegistryStore::in_memory());
        backend.put_node(node("abc", "active"), &[MAC]);
        reconciler.run_cycle().await.unwrap();

        backend.break_operation("abc", "ports");
        let report = reconciler.run_cycle().await.unwrap();
        assert_eq!(report.changed, 0);
        assert_eq!(
            store.lock().get_registered("abc").unwrap().hardware_addresses,
            vec![MAC.to_string()]
        );
    }

    #[tokio::test]
    async fn loop_runs_until_shutdown() {
        let backend = Arc::new(StubBackend::new());
        backend.put_node(node("abc", "active"), &[MAC]);
        let tracker = CycleTracker::new();
        let store = new_state(RegistryStore::in_memory());
        let reconciler = Arc::new(Reconciler::new(store.clone(), backend, tracker.clone()));

        let (tx, rx) = watch::channel(false);
        let handle = reconciler.spawn(Duration::from_millis(20), rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let health = tracker.get_health(&store.lock());
        assert!(health.cycles_completed >= 1);
        assert_eq!(health.registered, 1);
    }
}
