use crate::store::RegistryStore;
use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

/// The registry is the only state shared between the HTTP handlers and the
/// reconciler. Guards must be dropped before any `.await`.
pub type SharedStore = Shared<RegistryStore>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
