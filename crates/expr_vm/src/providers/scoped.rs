use ruint::aliases::U256;

use crate::providers::Store;
use crate::types::Word;

/// Scopes every key of an inner store to one caller.
///
/// The physical key is `BLAKE3(namespace || key)`, both as 32-byte big-endian words, so two
/// callers never observe each other's values.
pub struct ScopedStore<S> {
    namespace: Word,
    inner: S,
}

impl<S: Store> ScopedStore<S> {
    pub fn new(namespace: Word, inner: S) -> Self {
        Self { namespace, inner }
    }

    pub fn namespace(&self) -> &Word {
        &self.namespace
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn physical(&self, key: &Word) -> Word {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.namespace.to_be_bytes::<32>());
        hasher.update(&key.to_be_bytes::<32>());
        U256::from_be_bytes(*hasher.finalize().as_bytes())
    }
}

impl<S: Store> Store for ScopedStore<S> {
    fn get(&self, key: &Word) -> Word {
        self.inner.get(&self.physical(key))
    }

    fn set(&mut self, key: Word, value: Word) {
        let k = self.physical(&key);
        self.inner.set(k, value);
    }
}
