use std::collections::BTreeMap;

use ruint::aliases::U256;
use serde::{Deserialize, Serialize};

use crate::providers::Store;
use crate::types::Word;

/// In-memory store with deterministic (key-ordered) iteration.
///
/// Serialized as a list of `[key, value]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(Word, Word)>", into = "Vec<(Word, Word)>")]
pub struct MemStore {
    entries: BTreeMap<Word, Word>,
}

impl From<Vec<(Word, Word)>> for MemStore {
    fn from(pairs: Vec<(Word, Word)>) -> Self {
        let mut store = Self::default();
        for (k, v) in pairs {
            store.set(k, v);
        }
        store
    }
}

impl From<MemStore> for Vec<(Word, Word)> {
    fn from(store: MemStore) -> Self {
        store.entries.into_iter().collect()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Word, &Word)> {
        self.entries.iter()
    }
}

impl Store for MemStore {
    fn get(&self, key: &Word) -> Word {
        self.entries.get(key).copied().unwrap_or(U256::ZERO)
    }

    fn set(&mut self, key: Word, value: Word) {
        // zero is the default, keep the map sparse
        if value.is_zero() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }
}
