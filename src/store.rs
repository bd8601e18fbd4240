//! Concurrent model store: the single source of truth for engine state.
//!
//! Models are kept in a [`DashMap`] keyed by [`Model::Kind`]. Every write
//! replaces one entry atomically while holding only that entry's shard
//! lock; there is no lock spanning several kinds, so two handlers writing
//! different kinds never contend and two handlers writing the same kind
//! resolve as last-writer-wins.
//!
//! The store does not notify anyone. Publishing an update after a write is
//! the engine's job.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::StoreError;
use crate::model::{Model, Variant};

/// A stored model plus its registration position, used to keep
/// [`ModelStore::all`] in a stable order.
#[derive(Debug)]
struct Slot<M> {
    seq: u64,
    model: M,
}

/// Mapping from model kind to the current model of that kind.
#[derive(Debug)]
pub struct ModelStore<M: Model> {
    models: DashMap<M::Kind, Slot<M>>,
    next_seq: AtomicU64,
}

fn not_found<K: std::fmt::Debug>(kind: K) -> StoreError {
    StoreError::NotFound {
        kind: format!("{kind:?}"),
    }
}

impl<M: Model> ModelStore<M> {
    /// Build a store from initial models and an optional restored set.
    ///
    /// Restored models replace initial models of the same kind. Restored
    /// kinds with no initial model are added after the initial ones.
    ///
    /// # Errors
    ///
    /// * [`StoreError::DuplicateInitializer`] -- two initial models share a kind.
    /// * [`StoreError::DuplicateRestored`] -- two restored models share a kind.
    pub fn new(initial: Vec<M>, restored: Option<Vec<M>>) -> Result<Self, StoreError> {
        let models: DashMap<M::Kind, Slot<M>> = DashMap::with_capacity(initial.len());
        let mut seq = 0u64;

        for model in initial {
            let kind = model.kind();
            if models.contains_key(&kind) {
                return Err(StoreError::DuplicateInitializer {
                    kind: format!("{kind:?}"),
                });
            }
            models.insert(kind, Slot { seq, model });
            seq += 1;
        }

        if let Some(restored) = restored {
            let mut seen = HashSet::with_capacity(restored.len());
            for model in restored {
                let kind = model.kind();
                if !seen.insert(kind) {
                    return Err(StoreError::DuplicateRestored {
                        kind: format!("{kind:?}"),
                    });
                }
                match models.get_mut(&kind) {
                    Some(mut slot) => slot.model = model,
                    None => {
                        models.insert(kind, Slot { seq, model });
                        seq += 1;
                    }
                }
            }
        }

        Ok(Self {
            models,
            next_seq: AtomicU64::new(seq),
        })
    }

    /// Snapshot of every current model, in registration order.
    pub fn all(&self) -> Vec<M> {
        let mut slots: Vec<(u64, M)> = self
            .models
            .iter()
            .map(|entry| (entry.seq, entry.model.clone()))
            .collect();
        slots.sort_unstable_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, model)| model).collect()
    }

    /// The current model of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no model of that kind exists.
    pub fn get(&self, kind: M::Kind) -> Result<M, StoreError> {
        self.models
            .get(&kind)
            .map(|slot| slot.model.clone())
            .ok_or_else(|| not_found(kind))
    }

    /// The current model of variant `V`, already projected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no model of `V::KIND` exists.
    pub fn get_as<V: Variant<M>>(&self) -> Result<V, StoreError> {
        self.get(V::KIND)
            .ok()
            .and_then(V::from_model)
            .ok_or_else(|| not_found(V::KIND))
    }

    /// Replace the model of `model.kind()`, returning the previous value.
    ///
    /// Always succeeds. A kind that was never registered is appended.
    pub fn put(&self, model: M) -> Option<M> {
        match self.models.entry(model.kind()) {
            Entry::Occupied(mut entry) => {
                Some(std::mem::replace(&mut entry.get_mut().model, model))
            }
            Entry::Vacant(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.insert(Slot { seq, model });
                None
            }
        }
    }

    /// Read-modify-write the model of variant `V` under its entry lock.
    ///
    /// `f` must not touch the store: it runs while the entry is locked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no model of `V::KIND` exists.
    pub fn modify<V, F>(&self, f: F) -> Result<V, StoreError>
    where
        V: Variant<M> + Clone,
        F: FnOnce(V) -> V,
    {
        let mut slot = self.models.get_mut(&V::KIND).ok_or_else(|| not_found(V::KIND))?;
        let current = V::from_model(slot.model.clone()).ok_or_else(|| not_found(V::KIND))?;
        let next = f(current);
        slot.model = next.clone().into();
        Ok(next)
    }

    /// Whether a model of `kind` exists.
    pub fn contains(&self, kind: M::Kind) -> bool {
        self.models.contains_key(&kind)
    }

    /// Number of models held.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the store holds no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::program::test_fixtures::{AppKind, AppModel, Counter, Sender};

    fn counter(value: u64) -> AppModel {
        AppModel::Counter(Counter { value })
    }

    #[test]
    fn all_returns_initial_models_in_order() {
        let store = ModelStore::new(vec![counter(0), AppModel::Sender(Sender::Idle)], None)
            .expect("unique kinds should build");
        assert_eq!(store.all(), vec![counter(0), AppModel::Sender(Sender::Idle)]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_initializer_is_rejected() {
        let err = ModelStore::new(vec![counter(0), counter(1)], None)
            .expect_err("duplicate kind must fail");
        assert_eq!(
            err,
            StoreError::DuplicateInitializer {
                kind: "Counter".to_string()
            }
        );
    }

    #[test]
    fn duplicate_restored_is_rejected() {
        let err = ModelStore::new(vec![counter(0)], Some(vec![counter(1), counter(2)]))
            .expect_err("duplicate restored kind must fail");
        assert!(matches!(err, StoreError::DuplicateRestored { .. }));
    }

    #[test]
    fn restored_overrides_initializer_and_keeps_position() {
        let store = ModelStore::new(
            vec![counter(0), AppModel::Sender(Sender::Idle)],
            Some(vec![counter(41)]),
        )
        .expect("should build");
        assert_eq!(store.all(), vec![counter(41), AppModel::Sender(Sender::Idle)]);
    }

    #[test]
    fn restored_only_kind_is_appended() {
        let store = ModelStore::new(vec![counter(0)], Some(vec![AppModel::Sender(Sender::Idle)]))
            .expect("should build");
        assert_eq!(store.all(), vec![counter(0), AppModel::Sender(Sender::Idle)]);
    }

    #[test]
    fn get_unknown_kind_is_not_found() {
        let store = ModelStore::new(vec![counter(0)], None).expect("should build");
        let err = store.get(AppKind::Job).expect_err("job was never registered");
        assert_eq!(
            err,
            StoreError::NotFound {
                kind: "Job".to_string()
            }
        );
        assert!(store.get_as::<Sender>().is_err());
    }

    #[test]
    fn put_replaces_and_returns_previous() {
        let store = ModelStore::new(vec![counter(0)], None).expect("should build");
        assert_eq!(store.put(counter(5)), Some(counter(0)));
        assert_eq!(store.get_as::<Counter>(), Ok(Counter { value: 5 }));
    }

    #[test]
    fn put_unregistered_kind_appends() {
        let store = ModelStore::new(vec![counter(0)], None).expect("should build");
        assert_eq!(store.put(AppModel::Sender(Sender::Idle)), None);
        assert!(store.contains(AppKind::Sender));
        assert_eq!(store.all().last(), Some(&AppModel::Sender(Sender::Idle)));
    }

    #[test]
    fn round_trip_through_restored_set() {
        let original = ModelStore::new(vec![counter(0), AppModel::Sender(Sender::Idle)], None)
            .expect("should build");
        original.put(counter(9));

        let copy = ModelStore::new(
            vec![counter(0), AppModel::Sender(Sender::Idle)],
            Some(original.all()),
        )
        .expect("should build");
        assert_eq!(copy.all(), original.all());
    }

    #[test]
    fn concurrent_modify_loses_no_increment() {
        let store = Arc::new(ModelStore::new(vec![counter(0)], None).expect("should build"));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .modify(|c: Counter| Counter { value: c.value + 1 })
                            .expect("counter exists");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread should not panic");
        }
        assert_eq!(store.get_as::<Counter>(), Ok(Counter { value: 800 }));
    }
}
