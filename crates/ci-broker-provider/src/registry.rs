//! A process-wide registry of named provider implementations, mutated
//! only at startup under its own lock (see the design ledger's §5 on
//! shared resources). An out-of-tree microVM backend registers its
//! factory here under its own name; `hostctl` then selects one by name
//! via `--provider`. Tests construct a `FakeProvider` directly instead
//! of registering one, per the design notes.

use crate::Provider;
use ci_broker_slots::SlotPool;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

pub type ProviderFactory = Arc<dyn Fn(Arc<SlotPool>) -> Arc<dyn Provider> + Send + Sync>;

static REGISTRY: LazyLock<Mutex<HashMap<String, ProviderFactory>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert("null".to_string(), crate::null::factory());
    Mutex::new(map)
});

/// Register a named provider factory. Intended to be called once at
/// process startup, before any `build` call.
pub fn register(name: impl Into<String>, factory: ProviderFactory) {
    REGISTRY.lock().unwrap().insert(name.into(), factory);
}

/// Construct the named provider bound to `pool`. Fails if no factory
/// was registered under that name.
pub fn build(name: &str, pool: Arc<SlotPool>) -> anyhow::Result<Arc<dyn Provider>> {
    let registry = REGISTRY.lock().unwrap();
    let factory = registry
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("no provider registered under the name '{name}'"))?;
    Ok(factory(pool))
}

/// Names currently registered, for `--provider` help text and `/status`.
pub fn registered_names() -> Vec<String> {
    let mut names: Vec<_> = REGISTRY.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_registered_by_default() {
        assert!(registered_names().contains(&"null".to_string()));
    }

    #[test]
    fn build_unknown_name_fails() {
        let pool = Arc::new(SlotPool::new(1, std::env::temp_dir().join("registry-test")));
        assert!(build("does-not-exist", pool).is_err());
    }
}
