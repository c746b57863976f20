use crate::types::Word;

/// Durable key-value store backing `Get`/`Set`/`Storage`.
///
/// Evaluation only reads through this interface; writes are buffered per call and handed
/// back to the host, which decides when to apply them.
pub trait Store {
    /// Value at `key`; unset keys read as zero.
    fn get(&self, key: &Word) -> Word;
    fn set(&mut self, key: Word, value: Word);
}

impl<S: Store + ?Sized> Store for &mut S {
    fn get(&self, key: &Word) -> Word {
        (**self).get(key)
    }
    fn set(&mut self, key: Word, value: Word) {
        (**self).set(key, value)
    }
}

pub mod mem;
pub mod scoped;

pub use mem::MemStore;
pub use scoped::ScopedStore;
