//! Per-organization admission control.
//!
//! A [`QuotaGuard`] gates new deployments against the number already in
//! flight for the same organization. Admission and increment happen in one
//! atomic [`QuotaStore::increment_if_below`] call, so two requests racing at
//! the limit cannot both be admitted. Each admission yields a
//! [`QuotaPermit`] that must be released exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::OrgId;

/// Backend holding in-flight counters.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Increment the counter for `org` if it is below `max`.
    ///
    /// Returns `true` when the slot was taken. Must be atomic with respect to
    /// concurrent calls for the same organization.
    async fn increment_if_below(&self, org: &OrgId, max: u32) -> PipelineResult<bool>;

    /// Decrement the counter for `org`, saturating at zero.
    async fn decrement(&self, org: &OrgId) -> PipelineResult<()>;

    /// Current in-flight count for `org`.
    async fn current(&self, org: &OrgId) -> PipelineResult<u32>;
}

/// In-process quota ledger.
///
/// Each organization's counter is updated under its DashMap shard lock, which
/// is never held across an await point.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    counters: DashMap<OrgId, u32>,
}

impl MemoryQuotaStore {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn increment_if_below(&self, org: &OrgId, max: u32) -> PipelineResult<bool> {
        match self.counters.entry(org.clone()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                if *count < max {
                    *count += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                if max == 0 {
                    return Ok(false);
                }
                entry.insert(1);
                Ok(true)
            }
        }
    }

    async fn decrement(&self, org: &OrgId) -> PipelineResult<()> {
        match self.counters.entry(org.clone()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                *count = count.saturating_sub(1);
                if *count == 0 {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => warn!(org = %org, "quota decrement below zero ignored"),
        }
        Ok(())
    }

    async fn current(&self, org: &OrgId) -> PipelineResult<u32> {
        Ok(self.counters.get(org).map_or(0, |c| *c))
    }
}

/// Admission gate for new deployments.
#[derive(Clone)]
pub struct QuotaGuard {
    store: Arc<dyn QuotaStore>,
    default_limit: u32,
    overrides: HashMap<OrgId, u32>,
}

impl QuotaGuard {
    /// Create a guard with a single limit for every organization.
    #[must_use]
    pub fn new(store: Arc<dyn QuotaStore>, default_limit: u32) -> Self {
        Self {
            store,
            default_limit,
            overrides: HashMap::new(),
        }
    }

    /// Create a guard from configuration.
    #[must_use]
    pub fn from_config(store: Arc<dyn QuotaStore>, config: &QuotaConfig) -> Self {
        let overrides = config
            .overrides
            .iter()
            .map(|(org, limit)| (OrgId::new(org.as_str()), *limit))
            .collect();
        Self {
            store,
            default_limit: config.max_in_flight,
            overrides,
        }
    }

    /// Override the limit for one organization.
    #[must_use]
    pub fn with_limit(mut self, org: OrgId, limit: u32) -> Self {
        self.overrides.insert(org, limit);
        self
    }

    /// Limit that applies to `org`.
    #[must_use]
    pub fn limit_for(&self, org: &OrgId) -> u32 {
        self.overrides.get(org).copied().unwrap_or(self.default_limit)
    }

    /// Try to admit a new deployment for `org`.
    ///
    /// Returns [`PipelineError::QuotaExceeded`] when the organization is at
    /// its limit.
    pub async fn try_admit(&self, org: &OrgId) -> PipelineResult<QuotaPermit> {
        let limit = self.limit_for(org);
        if self.store.increment_if_below(org, limit).await? {
            debug!(org = %org, limit, "deployment admitted");
            Ok(QuotaPermit {
                store: Some(Arc::clone(&self.store)),
                org: org.clone(),
            })
        } else {
            debug!(org = %org, limit, "deployment rejected by quota");
            Err(PipelineError::QuotaExceeded {
                org: org.clone(),
                limit,
            })
        }
    }

    /// Release a slot that is not backed by a live permit.
    ///
    /// Used when recovering runs that were interrupted by a restart.
    pub async fn release_orphaned(&self, org: &OrgId) -> PipelineResult<()> {
        self.store.decrement(org).await
    }

    /// Current in-flight count for `org`.
    pub async fn in_flight(&self, org: &OrgId) -> PipelineResult<u32> {
        self.store.current(org).await
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("default_limit", &self.default_limit)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

/// A held admission slot.
///
/// Call [`QuotaPermit::release`] on every exit path. A permit dropped without
/// release hands the decrement to the current Tokio runtime.
pub struct QuotaPermit {
    store: Option<Arc<dyn QuotaStore>>,
    org: OrgId,
}

impl QuotaPermit {
    /// Organization this permit belongs to.
    #[must_use]
    pub const fn org(&self) -> &OrgId {
        &self.org
    }

    /// Release the slot.
    pub async fn release(mut self) -> PipelineResult<()> {
        match self.store.take() {
            Some(store) => {
                debug!(org = %self.org, "releasing quota slot");
                store.decrement(&self.org).await
            }
            None => Ok(()),
        }
    }

    /// Release the slot, keeping the permit armed if the store call fails.
    ///
    /// Lets the caller retry. Once it succeeds the permit is inert.
    pub async fn try_release(&mut self) -> PipelineResult<()> {
        if let Some(store) = &self.store {
            store.decrement(&self.org).await?;
            debug!(org = %self.org, "quota slot released");
        }
        self.store = None;
        Ok(())
    }

    /// Whether the slot is still held.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.store.is_some()
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let org = self.org.clone();
        warn!(org = %org, "quota permit dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.decrement(&org).await {
                        warn!(org = %org, error = %e, "deferred quota release failed");
                    }
                });
            }
            Err(_) => warn!(org = %org, "no runtime available, quota slot leaked"),
        }
    }
}

impl std::fmt::Debug for QuotaPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaPermit")
            .field("org", &self.org)
            .field("held", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn guard(limit: u32) -> (QuotaGuard, Arc<MemoryQuotaStore>) {
        let store = Arc::new(MemoryQuotaStore::new());
        (QuotaGuard::new(store.clone(), limit), store)
    }

    #[tokio::test]
    async fn admits_until_limit() {
        let (guard, _) = guard(2);
        let org = OrgId::new("o1");

        let a = guard.try_admit(&org).await.unwrap();
        let _b = guard.try_admit(&org).await.unwrap();
        let rejected = guard.try_admit(&org).await;
        assert!(matches!(
            rejected,
            Err(PipelineError::QuotaExceeded { limit: 2, .. })
        ));

        a.release().await.unwrap();
        assert_eq!(guard.in_flight(&org).await.unwrap(), 1);
        assert!(guard.try_admit(&org).await.is_ok());
    }

    #[tokio::test]
    async fn organizations_are_independent() {
        let (guard, _) = guard(1);
        let _a = guard.try_admit(&OrgId::new("o1")).await.unwrap();
        assert!(guard.try_admit(&OrgId::new("o2")).await.is_ok());
        assert!(guard.try_admit(&OrgId::new("o1")).await.is_err());
    }

    #[tokio::test]
    async fn zero_limit_rejects_everything() {
        let (guard, store) = guard(0);
        let org = OrgId::new("o1");
        assert!(guard.try_admit(&org).await.is_err());
        assert_eq!(store.current(&org).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn override_takes_precedence() {
        let (guard, _) = guard(1);
        let guard = guard.with_limit(OrgId::new("big"), 3);
        let big = OrgId::new("big");
        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(guard.try_admit(&big).await.unwrap());
        }
        assert!(guard.try_admit(&big).await.is_err());
        assert_eq!(guard.limit_for(&OrgId::new("small")), 1);
    }

    #[tokio::test]
    async fn release_on_drop() {
        let (guard, store) = guard(1);
        let org = OrgId::new("o1");
        {
            let _permit = guard.try_admit(&org).await.unwrap();
            assert_eq!(store.current(&org).await.unwrap(), 1);
        }
        // The deferred release runs on the runtime.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.current(&org).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decrement_saturates() {
        let store = MemoryQuotaStore::new();
        let org = OrgId::new("o1");
        store.decrement(&org).await.unwrap();
        assert!(store.increment_if_below(&org, 1).await.unwrap());
        store.decrement(&org).await.unwrap();
        store.decrement(&org).await.unwrap();
        assert_eq!(store.current(&org).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_organizations_are_forgotten() {
        let (guard, store) = guard(2);
        for n in 0..50 {
            let org = OrgId::new(format!("org-{n}"));
            let permit = guard.try_admit(&org).await.unwrap();
            permit.release().await.unwrap();
        }
        assert!(store.counters.is_empty());

        let org = OrgId::new("o1");
        let first = guard.try_admit(&org).await.unwrap();
        let second = guard.try_admit(&org).await.unwrap();
        first.release().await.unwrap();
        assert_eq!(store.counters.len(), 1);
        second.release().await.unwrap();
        assert!(store.counters.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_respects_limit() {
        let (guard, store) = guard(3);
        let org = OrgId::new("o1");

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let guard = guard.clone();
                let org = org.clone();
                tokio::spawn(async move { guard.try_admit(&org).await })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            if let Ok(permit) = handle.await.unwrap() {
                admitted.push(permit);
            }
        }

        assert_eq!(admitted.len(), 3);
        assert_eq!(store.current(&org).await.unwrap(), 3);

        for permit in admitted {
            permit.release().await.unwrap();
        }
        assert_eq!(store.current(&org).await.unwrap(), 0);
    }
}
