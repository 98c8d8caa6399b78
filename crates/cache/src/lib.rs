//! Trellis cache: small process-local state injected into every pass.
//!
//! Neither cache is authoritative. After a restart both are rebuilt from the store: pending
//! secrets are simply regenerated (nothing was written yet), host ports are re-reserved from the
//! env ConfigMaps that already carry them.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("host port range {lo}-{hi} exhausted")]
    Exhausted { lo: u16, hi: u16 },
}

/// Identity of one component inside one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentRef {
    pub namespace: String,
    pub cluster: String,
    pub component: String,
}

impl ComponentRef {
    pub fn new(namespace: &str, cluster: &str, component: &str) -> Self {
        Self { namespace: namespace.to_string(), cluster: cluster.to_string(), component: component.to_string() }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Passwords generated for account Secrets that have been staged but not yet observed.
///
/// Keeps a generated password stable across passes until the Secret shows up in the store.
#[derive(Default)]
pub struct PendingSecrets {
    map: Mutex<FxHashMap<(ComponentRef, String), String>>,
}

impl PendingSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pending password for `account`, generating one with `make` on first use.
    pub fn get_or_insert_with(&self, comp: &ComponentRef, account: &str, make: impl FnOnce() -> String) -> String {
        lock(&self.map).entry((comp.clone(), account.to_string())).or_insert_with(make).clone()
    }

    pub fn get(&self, comp: &ComponentRef, account: &str) -> Option<String> {
        lock(&self.map).get(&(comp.clone(), account.to_string())).cloned()
    }

    /// The Secret is in the store now; it is the source of truth from here on.
    pub fn forget(&self, comp: &ComponentRef, account: &str) {
        if lock(&self.map).remove(&(comp.clone(), account.to_string())).is_some() {
            debug!(cluster = %comp.cluster, component = %comp.component, account, "pending secret settled");
        }
    }

    pub fn forget_cluster(&self, namespace: &str, cluster: &str) {
        lock(&self.map).retain(|(c, _), _| !(c.namespace == namespace && c.cluster == cluster));
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key of one host port: component, container, named container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    pub comp: ComponentRef,
    pub container: String,
    pub port: String,
}

#[derive(Default)]
struct PortState {
    by_key: FxHashMap<PortKey, u16>,
    used: BTreeSet<u16>,
    next: u16,
    seeded: bool,
}

/// Hands out host ports from a fixed range, one per [`PortKey`].
pub struct HostPortAllocator {
    lo: u16,
    hi: u16,
    state: Mutex<PortState>,
}

impl HostPortAllocator {
    pub fn new((lo, hi): (u16, u16)) -> Self {
        Self { lo, hi, state: Mutex::new(PortState { next: lo, ..Default::default() }) }
    }

    pub fn get(&self, key: &PortKey) -> Option<u16> {
        lock(&self.state).by_key.get(key).copied()
    }

    /// True until [`seed`](Self::seed) has run once in this process.
    pub fn needs_seed(&self) -> bool {
        !lock(&self.state).seeded
    }

    /// Reserve every port recorded in the store, across all clusters, before anything is
    /// allocated. Conflicting records keep the first holder. Returns how many were reserved.
    pub fn seed(&self, recorded: impl IntoIterator<Item = (PortKey, u16)>) -> usize {
        let mut n = 0;
        for (key, port) in recorded {
            if self.reserve(key, port) {
                n += 1;
            }
        }
        lock(&self.state).seeded = true;
        debug!(reserved = n, "host ports seeded from the store");
        n
    }

    /// Record a port already in use (read back from the store). Returns false when another key
    /// holds it.
    pub fn reserve(&self, key: PortKey, port: u16) -> bool {
        let mut st = lock(&self.state);
        if let Some(&held) = st.by_key.get(&key) {
            return held == port;
        }
        if !st.used.insert(port) {
            warn!(port, container = %key.container, "host port already reserved by another component");
            return false;
        }
        st.by_key.insert(key, port);
        true
    }

    /// The port for `key`, allocating the next free one in range on first use.
    pub fn allocate(&self, key: &PortKey) -> Result<u16, CacheError> {
        let mut st = lock(&self.state);
        if let Some(&p) = st.by_key.get(key) {
            return Ok(p);
        }
        let span = u32::from(self.hi) - u32::from(self.lo) + 1;
        let mut candidate = st.next.clamp(self.lo, self.hi);
        for _ in 0..span {
            if !st.used.contains(&candidate) {
                st.used.insert(candidate);
                st.by_key.insert(key.clone(), candidate);
                st.next = if candidate == self.hi { self.lo } else { candidate + 1 };
                debug!(port = candidate, component = %key.comp.component, container = %key.container, "host port allocated");
                return Ok(candidate);
            }
            candidate = if candidate == self.hi { self.lo } else { candidate + 1 };
        }
        Err(CacheError::Exhausted { lo: self.lo, hi: self.hi })
    }

    /// Free every port held by a component.
    pub fn release_component(&self, comp: &ComponentRef) {
        let mut st = lock(&self.state);
        let freed: Vec<(PortKey, u16)> =
            st.by_key.iter().filter(|(k, _)| &k.comp == comp).map(|(k, p)| (k.clone(), *p)).collect();
        for (k, p) in freed {
            st.by_key.remove(&k);
            st.used.remove(&p);
        }
    }

    pub fn in_use(&self) -> usize {
        lock(&self.state).used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(c: &str) -> ComponentRef {
        ComponentRef::new("ns", "c", c)
    }

    fn key(c: &str, port: &str) -> PortKey {
        PortKey { comp: comp(c), container: "main".into(), port: port.into() }
    }

    #[test]
    fn pending_password_is_stable_until_forgotten() {
        let s = PendingSecrets::new();
        let a = s.get_or_insert_with(&comp("a"), "root", || "one".into());
        let b = s.get_or_insert_with(&comp("a"), "root", || "two".into());
        assert_eq!(a, b);
        s.forget(&comp("a"), "root");
        assert_eq!(s.get_or_insert_with(&comp("a"), "root", || "three".into()), "three");
        s.forget_cluster("ns", "c");
        assert!(s.is_empty());
    }

    #[test]
    fn allocation_is_sticky_and_skips_reserved_ports() {
        let ports = HostPortAllocator::new((100, 102));
        assert!(ports.reserve(key("a", "http"), 100));
        assert!(!ports.reserve(key("b", "http"), 100), "taken by a");
        assert_eq!(ports.allocate(&key("b", "http")).unwrap(), 101);
        assert_eq!(ports.allocate(&key("b", "http")).unwrap(), 101);
        assert_eq!(ports.allocate(&key("c", "http")).unwrap(), 102);
        assert_eq!(ports.allocate(&key("d", "http")), Err(CacheError::Exhausted { lo: 100, hi: 102 }));
        ports.release_component(&comp("b"));
        assert_eq!(ports.allocate(&key("d", "http")).unwrap(), 101);
        assert_eq!(ports.in_use(), 3);
    }

    #[test]
    fn seeded_ports_are_not_handed_out_again() {
        let ports = HostPortAllocator::new((100, 102));
        assert!(ports.needs_seed());
        assert_eq!(ports.seed([(key("a", "http"), 100), (key("b", "http"), 100), (key("a", "admin"), 101)]), 2);
        assert!(!ports.needs_seed());
        assert_eq!(ports.allocate(&key("c", "http")).unwrap(), 102);
        assert_eq!(ports.allocate(&key("a", "http")).unwrap(), 100);
    }
}
