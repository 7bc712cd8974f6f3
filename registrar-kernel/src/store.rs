/**
 * REGISTRY STORE - Registered nodes + pending requests, written through to disk
 *
 * ROLE :
 * Sole owner of the two registry mappings. Every mutation persists a full
 * snapshot before returning; a failed write is logged and the in-memory state
 * stays authoritative for the running process.
 *
 * SNAPSHOT : one JSON document with `registered_machines` and `todo_machines`.
 * Written to a sibling temp file then renamed, so an interrupted write leaves
 * the previous snapshot intact. A snapshot that fails to parse at startup is an
 * error: it is never overwritten.
 *
 * BOOTSTRAP : without a snapshot, an optional legacy dump (display name ->
 * fields with `ironic-uuid`) is imported once and renamed out of the way.
 */

use crate::error::StoreError;
use crate::matcher;
use crate::models::{FieldSet, PendingEntry, RegisteredEntry};
use crate::patch::LocalUpdate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub type RegisteredMap = BTreeMap<String, RegisteredEntry>;
pub type PendingMap = BTreeMap<String, PendingEntry>;

const LEGACY_ID_FIELD: &str = "ironic-uuid";

#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    registered_machines: RegisteredMap,
    #[serde(default)]
    todo_machines: PendingMap,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    registered_machines: &'a RegisteredMap,
    todo_machines: &'a PendingMap,
}

/// Durable location of the registry snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::CorruptSnapshot {
                path: self.path.clone(),
                source,
            })
    }

    fn write(&self, snapshot: &SnapshotRef<'_>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RegistryStore {
    registered: RegisteredMap,
    pending: PendingMap,
    snapshot: Option<SnapshotFile>,
}

impl RegistryStore {
    /// A store that never touches the disk.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Restores the registry from `snapshot_path`, or bootstraps it from the
    /// legacy dump when no snapshot exists yet.
    pub fn open(snapshot_path: &Path, bootstrap: Option<&Path>) -> Result<Self, StoreError> {
        let file = SnapshotFile::new(snapshot_path);
        let mut store = Self {
            snapshot: Some(file.clone()),
            ..Self::default()
        };

        match file.load()? {
            Some(snapshot) => {
                store.registered = snapshot.registered_machines;
                store.pending = snapshot.todo_machines;
                info!(
                    path = %file.path().display(),
                    registered = store.registered.len(),
                    pending = store.pending.len(),
                    "restored registry snapshot"
                );
            }
            None => {
                info!(path = %file.path().display(), "no registry snapshot, starting fresh");
                if let Some(legacy) = bootstrap.filter(|p| p.exists()) {
                    let imported = store.import_legacy(legacy)?;
                    retire(legacy)?;
                    info!(path = %legacy.display(), imported, "imported legacy registrations");
                }
                store.persist();
            }
        }
        Ok(store)
    }

    fn import_legacy(&mut self, path: &Path) -> Result<usize, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        let dump: BTreeMap<String, FieldSet> = serde_json::from_str(&content)?;
        let now = OffsetDateTime::now_utc();
        let mut imported = 0;

        for (display_name, mut fields) in dump {
            let Some(Value::String(id)) = fields.remove(LEGACY_ID_FIELD) else {
                warn!(%display_name, "legacy entry without {LEGACY_ID_FIELD}, skipped");
                continue;
            };
            fields.insert("kvm-name".into(), Value::String(display_name.clone()));
            match RegisteredEntry::from_fields(&id, fields, now) {
                Ok(entry) => {
                    self.registered.insert(id, entry);
                    imported += 1;
                }
                Err(e) => warn!(%display_name, error = %e, "invalid legacy entry, skipped"),
            }
        }
        Ok(imported)
    }

    /// Writes the full snapshot. Failures are logged, never propagated.
    ///
    /// Blocking file I/O, run while the caller holds the store lock: the
    /// snapshot holds one small record per node and request.
    pub fn persist(&self) {
        let Some(file) = &self.snapshot else { return };
        let snapshot = SnapshotRef {
            registered_machines: &self.registered,
            todo_machines: &self.pending,
        };
        if let Err(e) = file.write(&snapshot) {
            error!(error = %e, "failed to persist registry snapshot");
        }
    }

    /// Merges `fields` into the entry `id`, creating it if unseen.
    /// Returns the changed field names (all of them for a new entry).
    pub fn upsert_registered(&mut self, id: &str, fields: FieldSet) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        let changed = match self.registered.get_mut(id) {
            Some(entry) => match entry.merge(fields, now) {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(%id, error = %e, "merge rejected, entry left unchanged");
                    return Vec::new();
                }
            },
            None => {
                let mut names: Vec<String> = fields.keys().cloned().collect();
                match RegisteredEntry::from_fields(id, fields, now) {
                    Ok(entry) => {
                        info!(%id, name = %entry.display_name, "new node registered");
                        self.registered.insert(id.to_string(), entry);
                        names.sort();
                        names
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "node fields rejected, not registered");
                        return Vec::new();
                    }
                }
            }
        };

        if !changed.is_empty() {
            debug!(%id, ?changed, "registered entry updated");
        }
        self.persist();
        changed
    }

    pub fn get_registered(&self, id: &str) -> Option<&RegisteredEntry> {
        self.registered.get(id)
    }

    pub fn find_by_hardware_address(&self, address: &str) -> Option<&RegisteredEntry> {
        matcher::find_entry(self.registered.values(), address)
    }

    pub fn all_registered(&self) -> &RegisteredMap {
        &self.registered
    }

    /// Forgets a node. Nothing on the HTTP surface calls this yet.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn remove_registered(&mut self, id: &str) -> Option<RegisteredEntry> {
        let removed = self.registered.remove(id);
        if removed.is_some() {
            info!(%id, "node unregistered");
            self.persist();
        }
        removed
    }

    /// Applies the registry-only part of a patch. `None` when `id` is unknown.
    pub fn apply_local_update(&mut self, id: &str, update: &LocalUpdate) -> Option<Vec<String>> {
        let entry = self.registered.get_mut(id)?;
        let mut changed = Vec::new();
        let now = OffsetDateTime::now_utc();

        for (field, target, value) in [
            ("kvm-name", &mut entry.virtual_name, &update.virtual_name),
            ("virt-uuid", &mut entry.virtual_link_id, &update.virtual_link_id),
            ("vnc-info", &mut entry.management_endpoint, &update.management_endpoint),
        ] {
            if value.is_some() && *target != *value {
                *target = value.clone();
                changed.push(field.to_string());
            }
        }

        if !changed.is_empty() {
            entry.last_modified_at = now;
            debug!(%id, ?changed, "registry-only fields updated");
            self.persist();
        }
        Some(changed)
    }

    /// Merges a registration request into the pending set; returns the changed fields.
    pub fn upsert_pending(&mut self, entry: PendingEntry) -> Vec<String> {
        let request_id = entry.request_id.clone();
        let changed = match self.pending.get_mut(&request_id) {
            Some(current) => match current.merge(entry) {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(%request_id, error = %e, "pending merge rejected");
                    return Vec::new();
                }
            },
            None => {
                self.pending.insert(request_id.clone(), entry);
                vec!["virt-uuid".to_string()]
            }
        };
        debug!(%request_id, ?changed, "pending request stored");
        self.persist();
        changed
    }

    pub fn get_pending(&self, request_id: &str) -> Option<&PendingEntry> {
        self.pending.get(request_id)
    }

    pub fn remove_pending(&mut self, request_id: &str) -> Option<PendingEntry> {
        let removed = self.pending.remove(request_id);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    pub fn all_pending(&self) -> &PendingMap {
        &self.pending
    }
}

/// Renames a consumed bootstrap file with a timestamp suffix so it is never reread.
fn retire(path: &Path) -> Result<PathBuf, StoreError> {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".imported-{}", OffsetDateTime::now_utc().unix_timestamp()));
    let target = PathBuf::from(name);
    std::fs::rename(path, &target).map_err(|e| StoreError::io(path, e))?;
    Ok(target)
}
