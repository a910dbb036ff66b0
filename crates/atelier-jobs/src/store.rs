//! Storage and quota adapters consumed by the service.
//!
//! Both are traits so a deployment can back them with a database or an
//! accounting service; the in-memory implementations here are what the
//! bench tool and the tests use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use atelier_pipeline::AnalysisOutput;
use serde::{Deserialize, Serialize};

use crate::job::{OwnerId, ResultRef};

/// Errors from a [`ResultStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The owner's single result slot is already filled.
    #[error("owner {owner} already has a stored result ({existing})")]
    SlotOccupied {
        /// Whose slot.
        owner: OwnerId,
        /// What occupies it.
        existing: ResultRef,
    },

    /// No result is stored under this reference.
    #[error("no stored result {0}")]
    NotFound(ResultRef),

    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Persistent home of finished analysis outputs.
///
/// Each owner has exactly one slot: `put` must refuse while the owner
/// already has a stored result.
pub trait ResultStore: Send + Sync {
    /// Store `output` for `owner`.
    ///
    /// # Errors
    ///
    /// [`StoreError::SlotOccupied`] if the owner already has a result.
    fn put(&self, owner: &OwnerId, output: AnalysisOutput) -> Result<ResultRef, StoreError>;

    /// Load a stored result.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for unknown references.
    fn get(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, StoreError>;

    /// Remove a stored result, freeing its owner's slot.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for unknown references.
    fn delete(&self, result: ResultRef) -> Result<(), StoreError>;

    /// The owner's stored result, if any.
    fn find(&self, owner: &OwnerId) -> Option<ResultRef>;
}

impl<S: ResultStore + ?Sized> ResultStore for Arc<S> {
    fn put(&self, owner: &OwnerId, output: AnalysisOutput) -> Result<ResultRef, StoreError> {
        (**self).put(owner, output)
    }

    fn get(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, StoreError> {
        (**self).get(result)
    }

    fn delete(&self, result: ResultRef) -> Result<(), StoreError> {
        (**self).delete(result)
    }

    fn find(&self, owner: &OwnerId) -> Option<ResultRef> {
        (**self).find(owner)
    }
}

#[derive(Debug, Default)]
struct Slots {
    by_owner: HashMap<OwnerId, ResultRef>,
    outputs: HashMap<ResultRef, (OwnerId, Arc<AnalysisOutput>)>,
}

/// In-process single-slot [`ResultStore`].
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    slots: Mutex<Slots>,
}

impl InMemoryResultStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outputs
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for InMemoryResultStore {
    fn put(&self, owner: &OwnerId, output: AnalysisOutput) -> Result<ResultRef, StoreError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&existing) = slots.by_owner.get(owner) {
            return Err(StoreError::SlotOccupied {
                owner: owner.clone(),
                existing,
            });
        }
        let result = ResultRef::new();
        slots.by_owner.insert(owner.clone(), result);
        slots
            .outputs
            .insert(result, (owner.clone(), Arc::new(output)));
        Ok(result)
    }

    fn get(&self, result: ResultRef) -> Result<Arc<AnalysisOutput>, StoreError> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outputs
            .get(&result)
            .map(|(_, output)| Arc::clone(output))
            .ok_or(StoreError::NotFound(result))
    }

    fn delete(&self, result: ResultRef) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let (owner, _) = slots
            .outputs
            .remove(&result)
            .ok_or(StoreError::NotFound(result))?;
        slots.by_owner.remove(&owner);
        Ok(())
    }

    fn find(&self, owner: &OwnerId) -> Option<ResultRef> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_owner
            .get(owner)
            .copied()
    }
}

/// Remaining analyses for an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Submissions still allowed. `u32::MAX` means unlimited.
    pub remaining: u32,
}

impl Quota {
    /// Whether another submission would be accepted.
    #[must_use]
    pub const fn allows_submission(self) -> bool {
        self.remaining > 0
    }
}

/// Pre-submission gate on how many analyses an owner may run.
pub trait QuotaGate: Send + Sync {
    /// Current quota without consuming any.
    fn check(&self, owner: &OwnerId) -> Quota;

    /// Consume one submission. Returns `false` if none remain.
    fn try_consume(&self, owner: &OwnerId) -> bool;

    /// Give back a submission consumed for a job that never ran.
    fn refund(&self, owner: &OwnerId);
}

impl<Q: QuotaGate + ?Sized> QuotaGate for Arc<Q> {
    fn check(&self, owner: &OwnerId) -> Quota {
        (**self).check(owner)
    }

    fn try_consume(&self, owner: &OwnerId) -> bool {
        (**self).try_consume(owner)
    }

    fn refund(&self, owner: &OwnerId) {
        (**self).refund(owner);
    }
}

/// [`QuotaGate`] that always allows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl QuotaGate for Unlimited {
    fn check(&self, _owner: &OwnerId) -> Quota {
        Quota {
            remaining: u32::MAX,
        }
    }

    fn try_consume(&self, _owner: &OwnerId) -> bool {
        true
    }

    fn refund(&self, _owner: &OwnerId) {}
}

/// [`QuotaGate`] granting each owner the same fixed number of
/// submissions.
#[derive(Debug)]
pub struct FixedQuota {
    allowance: u32,
    used: Mutex<HashMap<OwnerId, u32>>,
}

impl FixedQuota {
    /// Quota allowing `allowance` submissions per owner.
    #[must_use]
    pub fn new(allowance: u32) -> Self {
        Self {
            allowance,
            used: Mutex::new(HashMap::new()),
        }
    }
}

impl QuotaGate for FixedQuota {
    fn check(&self, owner: &OwnerId) -> Quota {
        let used = self
            .used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .copied()
            .unwrap_or(0);
        Quota {
            remaining: self.allowance.saturating_sub(used),
        }
    }

    fn try_consume(&self, owner: &OwnerId) -> bool {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let count = used.entry(owner.clone()).or_insert(0);
        if *count >= self.allowance {
            return false;
        }
        *count += 1;
        true
    }

    fn refund(&self, owner: &OwnerId) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = used.get_mut(owner) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use atelier_pipeline::{BinaryThreshold, RgbImage};
    use image::Rgb;

    use super::*;

    fn output() -> AnalysisOutput {
        let image = RgbImage::from_pixel(4, 4, Rgb([200, 40, 40]));
        atelier_pipeline::run(&image, BinaryThreshold::L140).unwrap()
    }

    #[test]
    fn single_slot_per_owner() {
        let store = InMemoryResultStore::new();
        let owner = OwnerId::new("a");
        let first = store.put(&owner, output()).unwrap();
        assert_eq!(
            store.put(&owner, output()),
            Err(StoreError::SlotOccupied {
                owner: owner.clone(),
                existing: first,
            })
        );
        assert_eq!(store.find(&owner), Some(first));

        store.put(&OwnerId::new("b"), output()).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn delete_frees_slot() {
        let store = InMemoryResultStore::new();
        let owner = OwnerId::new("a");
        let first = store.put(&owner, output()).unwrap();
        assert!(store.get(first).is_ok());
        store.delete(first).unwrap();
        assert_eq!(store.get(first), Err(StoreError::NotFound(first)));
        assert_eq!(store.delete(first), Err(StoreError::NotFound(first)));
        assert!(store.find(&owner).is_none());
        assert!(store.put(&owner, output()).is_ok());
    }

    #[test]
    fn fixed_quota_counts_down() {
        let quota = FixedQuota::new(2);
        let owner = OwnerId::new("a");
        assert_eq!(quota.check(&owner).remaining, 2);
        assert!(quota.try_consume(&owner));
        assert!(quota.try_consume(&owner));
        assert!(!quota.try_consume(&owner));
        assert!(!quota.check(&owner).allows_submission());
        assert_eq!(quota.check(&OwnerId::new("b")).remaining, 2);

        quota.refund(&owner);
        assert_eq!(quota.check(&owner).remaining, 1);
        quota.refund(&OwnerId::new("b"));
        assert_eq!(quota.check(&OwnerId::new("b")).remaining, 2);
    }

    #[test]
    fn unlimited_always_allows() {
        let owner = OwnerId::new("a");
        assert!(Unlimited.try_consume(&owner));
        assert!(Unlimited.check(&owner).allows_submission());
    }
}
