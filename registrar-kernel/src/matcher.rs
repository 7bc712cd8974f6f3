//! Pairs pending requests with registered nodes by MAC address.
//!
//! A request without an address never matches. Should two nodes report the
//! same address, the first one in registry order (sorted by node id) wins.

use crate::models::{PendingEntry, RegisteredEntry};
use crate::store::RegistryStore;

pub fn find_entry<'a>(
    entries: impl IntoIterator<Item = &'a RegisteredEntry>,
    address: &str,
) -> Option<&'a RegisteredEntry> {
    entries.into_iter().find(|entry| entry.has_address(address))
}

/// Id of the registered node `pending` should be applied to, if any.
pub fn match_pending(store: &RegistryStore, pending: &PendingEntry) -> Option<String> {
    let address = pending.hardware_address.as_deref()?;
    store
        .find_by_hardware_address(address)
        .map(|entry| entry.id.clone())
}
