//! Pending-operation ledger.
//!
//! The read cache can lag a just-issued create or delete by several
//! reconcile cycles. A fleet loop that recomputes counts from that cache
//! would over-create or re-delete. The ledger records every issued
//! operation per fleet and only reports the fleet as settled once the cache
//! reflects all of them.
//!
//! # Invariants
//!
//! - A fleet entry exists only while its pending set is non-empty
//! - The lock is never held across a cache probe

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Which operation a ledger tracks; decides what a probe result means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Confirmed once the instance appears in the cache.
    Creation,

    /// Confirmed once the instance is gone from the cache.
    Deletion,
}

impl PendingKind {
    fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Creation => "creation",
            PendingKind::Deletion => "deletion",
        }
    }
}

/// Per-fleet sets of instance names awaiting cache confirmation.
///
/// Shared by reference across concurrent fleet reconciles.
#[derive(Debug)]
pub struct PendingLedger {
    kind: PendingKind,
    entries: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl PendingLedger {
    pub fn new(kind: PendingKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn creations() -> Self {
        Self::new(PendingKind::Creation)
    }

    pub fn deletions() -> Self {
        Self::new(PendingKind::Deletion)
    }

    /// Add `instance` to the fleet's pending set.
    pub fn record(&self, fleet: &str, instance: &str) {
        self.lock()
            .entry(fleet.to_string())
            .or_default()
            .insert(instance.to_string());
    }

    /// Names still pending for the fleet, sorted.
    pub fn pending(&self, fleet: &str) -> Vec<String> {
        self.lock()
            .get(fleet)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the fleet has an entry at all.
    pub fn is_tracking(&self, fleet: &str) -> bool {
        self.lock().contains_key(fleet)
    }

    /// Remove the fleet's entry regardless of what is pending.
    pub fn forget(&self, fleet: &str) {
        self.lock().remove(fleet);
    }

    /// Probe the cache for each pending name and drop the confirmed ones.
    ///
    /// `exists` reports whether the named instance is visible in the read
    /// cache. Deletions scan every name; creations stop at the first name
    /// that is still missing. Returns whether the fleet is settled, meaning
    /// nothing is left pending. A probe error is returned as is, keeping
    /// whatever was confirmed before it.
    pub async fn resolve<F, Fut, E>(&self, fleet: &str, mut exists: F) -> Result<bool, E>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let names = self.pending(fleet);
        if names.is_empty() {
            return Ok(true);
        }

        for name in names {
            let present = exists(name.clone()).await?;
            let confirmed = match self.kind {
                PendingKind::Creation => present,
                PendingKind::Deletion => !present,
            };

            if confirmed {
                self.confirm(fleet, &name);
            } else if self.kind == PendingKind::Creation {
                debug!(fleet, instance = %name, "Creation not yet visible in cache");
                return Ok(false);
            }
        }

        let entries = self.lock();
        let settled = !entries.contains_key(fleet);
        if !settled {
            debug!(
                fleet,
                kind = self.kind.as_str(),
                pending = entries.get(fleet).map_or(0, BTreeSet::len),
                "Pending operations not yet visible in cache"
            );
        }
        Ok(settled)
    }

    fn confirm(&self, fleet: &str, instance: &str) {
        let mut entries = self.lock();
        if let Some(names) = entries.get_mut(fleet) {
            names.remove(instance);
            if names.is_empty() {
                entries.remove(fleet);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A concurrent set of keys, used to mark an object as having a create in
/// flight until the cache shows the result.
#[derive(Debug, Default)]
pub struct PendingSet {
    keys: Mutex<HashSet<String>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the key was already present.
    pub fn insert(&self, key: &str) -> bool {
        self.lock().insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Returns true if the key was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::sync::Arc;

    fn cache(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    async fn resolve_against(
        ledger: &PendingLedger,
        fleet: &str,
        cache: &HashSet<String>,
    ) -> bool {
        ledger
            .resolve(fleet, |name| {
                let present = cache.contains(&name);
                async move { Ok::<_, Infallible>(present) }
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_creation_settles_when_all_visible() {
        let ledger = PendingLedger::creations();
        for name in ["fleet-a-aaaaa", "fleet-a-bbbbb", "fleet-a-ccccc"] {
            ledger.record("games/fleet-a", name);
        }

        let visible = cache(&["fleet-a-aaaaa", "fleet-a-bbbbb", "fleet-a-ccccc"]);
        assert!(resolve_against(&ledger, "games/fleet-a", &visible).await);
        assert!(!ledger.is_tracking("games/fleet-a"));
    }

    #[tokio::test]
    async fn test_creation_not_settled_with_one_missing() {
        let ledger = PendingLedger::creations();
        for name in ["fleet-a-aaaaa", "fleet-a-bbbbb", "fleet-a-ccccc"] {
            ledger.record("games/fleet-a", name);
        }

        let visible = cache(&["fleet-a-aaaaa", "fleet-a-ccccc"]);
        assert!(!resolve_against(&ledger, "games/fleet-a", &visible).await);
        assert!(ledger.is_tracking("games/fleet-a"));
        assert!(ledger
            .pending("games/fleet-a")
            .contains(&"fleet-a-bbbbb".to_string()));
    }

    #[tokio::test]
    async fn test_creation_stops_at_first_missing() {
        let ledger = PendingLedger::creations();
        ledger.record("games/fleet-a", "fleet-a-aaaaa");
        ledger.record("games/fleet-a", "fleet-a-bbbbb");

        let probes = Mutex::new(Vec::new());
        let settled = ledger
            .resolve("games/fleet-a", |name| {
                probes.lock().unwrap().push(name);
                async { Ok::<_, Infallible>(false) }
            })
            .await
            .unwrap();

        assert!(!settled);
        assert_eq!(probes.lock().unwrap().len(), 1);
        assert_eq!(ledger.pending("games/fleet-a").len(), 2);
    }

    #[tokio::test]
    async fn test_deletion_scans_past_present_names() {
        let ledger = PendingLedger::deletions();
        ledger.record("games/fleet-a", "fleet-a-aaaaa");
        ledger.record("games/fleet-a", "fleet-a-bbbbb");
        ledger.record("games/fleet-a", "fleet-a-ccccc");

        let still_listed = cache(&["fleet-a-aaaaa"]);
        assert!(!resolve_against(&ledger, "games/fleet-a", &still_listed).await);
        assert_eq!(ledger.pending("games/fleet-a"), vec!["fleet-a-aaaaa"]);

        assert!(resolve_against(&ledger, "games/fleet-a", &cache(&[])).await);
        assert!(!ledger.is_tracking("games/fleet-a"));
    }

    #[tokio::test]
    async fn test_untracked_fleet_is_settled() {
        let ledger = PendingLedger::deletions();
        assert!(resolve_against(&ledger, "games/other", &cache(&[])).await);
    }

    #[tokio::test]
    async fn test_fleets_are_independent() {
        let ledger = PendingLedger::creations();
        ledger.record("games/fleet-a", "fleet-a-aaaaa");
        ledger.record("games/fleet-b", "fleet-b-aaaaa");

        let visible = cache(&["fleet-a-aaaaa"]);
        assert!(resolve_against(&ledger, "games/fleet-a", &visible).await);
        assert!(!resolve_against(&ledger, "games/fleet-b", &visible).await);
        assert!(ledger.is_tracking("games/fleet-b"));
    }

    #[tokio::test]
    async fn test_probe_error_keeps_prior_confirmations() {
        let ledger = PendingLedger::deletions();
        ledger.record("games/fleet-a", "fleet-a-aaaaa");
        ledger.record("games/fleet-a", "fleet-a-bbbbb");

        let result = ledger
            .resolve("games/fleet-a", |name| async move {
                if name == "fleet-a-aaaaa" {
                    Ok(false)
                } else {
                    Err("cache unavailable")
                }
            })
            .await;

        assert_eq!(result, Err("cache unavailable"));
        assert_eq!(ledger.pending("games/fleet-a"), vec!["fleet-a-bbbbb"]);
    }

    #[tokio::test]
    async fn test_concurrent_record_and_resolve() {
        let ledger = Arc::new(PendingLedger::deletions());

        let mut handles = Vec::new();
        for task in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let name = format!("fleet-a-{task}-{i}");
                    ledger.record("games/fleet-a", &name);
                    let _ = ledger
                        .resolve("games/fleet-a", |_| async { Ok::<_, Infallible>(false) })
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!ledger.is_tracking("games/fleet-a"));
    }

    #[tokio::test]
    async fn test_forget_drops_pending_names() {
        let ledger = PendingLedger::deletions();
        ledger.record("games/fleet-a", "fleet-a-aaaaa");
        ledger.record("games/fleet-b", "fleet-b-aaaaa");

        ledger.forget("games/fleet-a");

        assert!(!ledger.is_tracking("games/fleet-a"));
        assert!(ledger.is_tracking("games/fleet-b"));
        let visible = cache(&["fleet-a-aaaaa"]);
        assert!(resolve_against(&ledger, "games/fleet-a", &visible).await);
    }

    #[test]
    fn test_pending_set() {
        let set = PendingSet::new();
        assert!(set.insert("games/fleet-a-aaaaa"));
        assert!(!set.insert("games/fleet-a-aaaaa"));
        assert!(set.contains("games/fleet-a-aaaaa"));
        assert_eq!(set.len(), 1);

        assert!(set.remove("games/fleet-a-aaaaa"));
        assert!(!set.remove("games/fleet-a-aaaaa"));
        assert!(set.is_empty());
    }
}
