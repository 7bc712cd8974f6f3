/**
 * MODELS - Registry records
 *
 * RegisteredEntry : one bare-metal node known to the backend. Known contract
 * fields are typed, every other backend field lands verbatim in `attributes`.
 * PendingEntry : one registration request from the virtual side, waiting for a
 * node with the same MAC address to show up in the inventory.
 *
 * Wire names follow the historical JSON layout (`uuid`, `nics`, `kvm-name`,
 * `virt-uuid`, ...) so snapshots and API consumers keep working.
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Top-level field name -> value, the unit of every merge.
pub type FieldSet = Map<String, Value>;

/// Backend fields the registry does not model explicitly.
pub type Attributes = BTreeMap<String, Value>;

pub const ID_FIELD: &str = "uuid";
pub const NAME_FIELD: &str = "name";
pub const NAME_FROM_ID_FIELD: &str = "name_from_uuid";
pub const ADDRESSES_FIELD: &str = "nics";

/// Fields the registry owns; a merge never touches them.
const RESERVED_FIELDS: [&str; 4] = [ID_FIELD, "first_seen_at", "last_seen_at", "last_modified_at"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredEntry {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "name_from_uuid", default)]
    pub name_from_id: bool,
    #[serde(rename = "nics", default)]
    pub hardware_addresses: Vec<String>,
    #[serde(default)]
    pub provision_state: Option<String>,
    #[serde(default)]
    pub target_provision_state: Option<String>,
    /// Registry-only: UUID of the virtual machine bound to this node.
    #[serde(rename = "virt-uuid", default, skip_serializing_if = "Option::is_none")]
    pub virtual_link_id: Option<String>,
    /// Registry-only: `host:port` of the console endpoint.
    #[serde(rename = "vnc-info", default, skip_serializing_if = "Option::is_none")]
    pub management_endpoint: Option<String>,
    /// Registry-only: name requested by the virtual side, keys `/machines` and `/status`.
    #[serde(rename = "kvm-name", default, skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub last_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub last_modified_at: OffsetDateTime,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl RegisteredEntry {
    /// Creates an entry seen for the first time. A missing name is derived from the id.
    pub fn from_fields(
        id: &str,
        mut fields: FieldSet,
        now: OffsetDateTime,
    ) -> Result<Self, serde_json::Error> {
        strip_reserved(&mut fields);
        fields.insert(ID_FIELD.into(), Value::String(id.to_string()));
        let has_name = fields.get(NAME_FIELD).is_some_and(|v| v.is_string());
        if !has_name {
            fields.insert(NAME_FIELD.into(), Value::String(id.to_string()));
            fields.insert(NAME_FROM_ID_FIELD.into(), Value::Bool(true));
        }

        let mut entry: RegisteredEntry = serde_json::from_value(Value::Object(fields))?;
        entry.first_seen_at = now;
        entry.last_seen_at = now;
        entry.last_modified_at = now;
        Ok(entry)
    }

    pub fn to_fields(&self) -> Result<FieldSet, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(<serde_json::Error as serde::ser::Error>::custom(
                "registered entry did not serialize to an object",
            )),
        }
    }

    /// Field-level upsert of `fields` into this entry; returns the changed field names.
    /// The entry is left untouched when the merged record does not deserialize.
    pub fn merge(
        &mut self,
        mut fields: FieldSet,
        now: OffsetDateTime,
    ) -> Result<Vec<String>, serde_json::Error> {
        strip_reserved(&mut fields);
        let mut current = self.to_fields()?;
        let changed = crate::diff::merge_into(&mut current, fields);

        if !changed.is_empty() {
            let mut merged: RegisteredEntry = serde_json::from_value(Value::Object(current))?;
            merged.first_seen_at = self.first_seen_at;
            merged.last_modified_at = now;
            *self = merged;
        }
        self.last_seen_at = now;
        Ok(changed)
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.hardware_addresses
            .iter()
            .any(|a| same_address(a, address))
    }
}

fn strip_reserved(fields: &mut FieldSet) {
    for key in RESERVED_FIELDS {
        fields.remove(key);
    }
}

/// False for null and for empty strings, lists and objects.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// MAC addresses compare case-insensitively; an empty address matches nothing.
pub fn same_address(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

/// A port or similar value that clients send either as a number or as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(u64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Changes requested by the virtual side for the node it will be bound to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc_port: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Unrecognised request fields, kept as sent.
    #[serde(flatten)]
    pub extra: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    #[serde(rename = "virt-uuid")]
    pub request_id: String,
    #[serde(rename = "mac_addr", default, skip_serializing_if = "Option::is_none")]
    pub hardware_address: Option<String>,
    #[serde(flatten)]
    pub changes: ChangeRequest,
}

impl PendingEntry {
    /// Overlays a re-submitted request on this one; returns the changed field names.
    pub fn merge(&mut self, incoming: PendingEntry) -> Result<Vec<String>, serde_json::Error> {
        let Value::Object(mut current) = serde_json::to_value(&*self)? else {
            return Ok(Vec::new());
        };
        let Value::Object(fields) = serde_json::to_value(incoming)? else {
            return Ok(Vec::new());
        };
        let changed = crate::diff::merge_into(&mut current, fields);
        if !changed.is_empty() {
            *self = serde_json::from_value(Value::Object(current))?;
        }
        Ok(changed)
    }
}
