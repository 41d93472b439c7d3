//! Code to transfer registry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use webrelay_transfer::{ShortCode, Transfer};

/// Active transfers keyed by download code.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<ShortCode, Arc<dyn Transfer>>,
}

/// Identity of a transfer allocation, comparable across `dyn` pointers.
fn identity(transfer: &Arc<dyn Transfer>) -> usize {
    Arc::as_ptr(transfer).cast::<()>() as usize
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `transfer` under a fresh code.
    ///
    /// Draws codes until one is free; existing entries are never
    /// overwritten.
    pub fn insert(&self, transfer: Arc<dyn Transfer>) -> ShortCode {
        loop {
            let code = ShortCode::generate();
            if let Entry::Vacant(slot) = self.entries.entry(code.clone()) {
                slot.insert(transfer);
                return code;
            }
            tracing::trace!(%code, "code collision, retrying");
        }
    }

    pub fn get(&self, code: &ShortCode) -> Option<Arc<dyn Transfer>> {
        self.entries.get(code).map(|e| Arc::clone(e.value()))
    }

    /// Removes `code` only if it still maps to `transfer`.
    pub fn remove(&self, code: &ShortCode, transfer: &Arc<dyn Transfer>) -> bool {
        let id = identity(transfer);
        self.remove_by_identity(code, id)
    }

    pub(crate) fn remove_by_identity(&self, code: &ShortCode, id: usize) -> bool {
        self.entries
            .remove_if(code, |_, existing| identity(existing) == id)
            .is_some()
    }

    pub(crate) fn identity_of(transfer: &Arc<dyn Transfer>) -> usize {
        identity(transfer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
