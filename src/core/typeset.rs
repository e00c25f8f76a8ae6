// Pending constant-type entries awaiting emission, keyed by type id.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::core::error::{Error, poisoned};
use crate::core::relation::{RelationWriter, TypeId};

pub type ClassId = u64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeSetEntry {
    pub key: u64,
    pub value: Vec<u8>,
    /// Class whose unloading invalidates this entry.
    pub referent: Option<ClassId>,
}

#[derive(Debug, Default)]
pub struct TypeSetRegistry {
    pending: Mutex<BTreeMap<TypeId, Vec<TypeSetEntry>>>,
}

impl TypeSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> Result<MutexGuard<'_, BTreeMap<TypeId, Vec<TypeSetEntry>>>, Error> {
        self.pending.lock().map_err(|_| poisoned("type set"))
    }

    pub fn register(
        &self,
        type_id: TypeId,
        key: u64,
        value: impl Into<Vec<u8>>,
        referent: Option<ClassId>,
    ) -> Result<(), Error> {
        self.pending()?.entry(type_id).or_default().push(TypeSetEntry {
            key,
            value: value.into(),
            referent,
        });
        Ok(())
    }

    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.pending()?.values().map(Vec::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// One relation per type id, leaving the registry untouched.
    pub fn snapshot(&self) -> Result<Vec<RelationWriter>, Error> {
        Ok(to_relations(&*self.pending()?))
    }

    /// One relation per type id; the registry is left empty.
    pub fn take(&self) -> Result<Vec<RelationWriter>, Error> {
        let drained = std::mem::take(&mut *self.pending()?);
        Ok(to_relations(&drained))
    }

    /// Discards every pending entry and reports how many there were.
    pub fn clear(&self) -> Result<usize, Error> {
        let drained = std::mem::take(&mut *self.pending()?);
        Ok(drained.values().map(Vec::len).sum())
    }

    /// Removes entries referring to any class in `unloading`.
    pub fn purge(&self, unloading: &HashSet<ClassId>) -> Result<usize, Error> {
        if unloading.is_empty() {
            return Ok(0);
        }
        let mut pending = self.pending()?;
        let mut removed = 0;
        pending.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| {
                entry
                    .referent
                    .is_none_or(|class| !unloading.contains(&class))
            });
            removed += before - entries.len();
            !entries.is_empty()
        });
        Ok(removed)
    }
}

fn to_relations(pending: &BTreeMap<TypeId, Vec<TypeSetEntry>>) -> Vec<RelationWriter> {
    pending
        .iter()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(type_id, entries)| {
            let mut relation = RelationWriter::new(*type_id);
            for entry in entries {
                relation.add(entry.key, &entry.value);
            }
            relation
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::TypeSetRegistry;
    use crate::core::relation::{TYPE_CLASS, TYPE_SYMBOL};
    use std::collections::HashSet;

    #[test]
    fn snapshot_keeps_entries_and_take_drains() {
        let registry = TypeSetRegistry::new();
        registry.register(TYPE_SYMBOL, 1, b"a".to_vec(), None).expect("register");
        registry.register(TYPE_CLASS, 2, b"b".to_vec(), Some(9)).expect("register");
        registry.register(TYPE_SYMBOL, 3, b"c".to_vec(), None).expect("register");

        let snapshot = registry.snapshot().expect("snapshot");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].type_id(), TYPE_CLASS);
        assert_eq!(snapshot[1].count(), 2);
        assert_eq!(registry.len().expect("len"), 3);

        let taken = registry.take().expect("take");
        assert_eq!(taken.len(), 2);
        assert!(registry.is_empty().expect("empty"));
    }

    #[test]
    fn purge_removes_only_unloading_referents() {
        let registry = TypeSetRegistry::new();
        for key in 0..10u64 {
            let referent = if key < 3 { Some(100 + key) } else { Some(500) };
            registry
                .register(TYPE_CLASS, key, key.to_le_bytes().to_vec(), referent)
                .expect("register");
        }
        let unloading: HashSet<u64> = [100, 101, 102].into_iter().collect();
        assert_eq!(registry.purge(&unloading).expect("purge"), 3);
        assert_eq!(registry.len().expect("len"), 7);
        assert_eq!(registry.purge(&HashSet::new()).expect("noop"), 0);
    }

    #[test]
    fn clear_reports_discarded_entries() {
        let registry = TypeSetRegistry::new();
        registry.register(TYPE_SYMBOL, 1, b"x".to_vec(), None).expect("register");
        assert_eq!(registry.clear().expect("clear"), 1);
        assert_eq!(registry.clear().expect("clear"), 0);
    }
}
