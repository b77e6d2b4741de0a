//! Shared handle over the replicated registry store.
//!
//! The store itself is single-owner logic; this wraps it for concurrent
//! access from the gossip engine, the dispatch handlers and local
//! registration callers (e.g. an HTTP layer). Every operation completes
//! synchronously under the lock, so partial updates are never observable.

use registry_core::peer_id::PeerId;
use registry_core::store::{Digest, DigestDiff, RecordDraft, RegistryStore, ServiceRecord};
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<RwLock<RegistryStore>>,
}

impl RegistryHandle {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryStore::new(self_id))),
        }
    }

    /// Register or update a service locally. Returns whether the record
    /// was applied (a stale explicit version is a no-op).
    pub fn upsert_local(&self, draft: RecordDraft) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .upsert_local(draft)
    }

    /// Register or update several services at once.
    pub fn upsert_many_local(&self, drafts: Vec<RecordDraft>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .upsert_many_local(drafts)
    }

    /// Every known record.
    pub fn get_all(&self) -> Vec<ServiceRecord> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get_all()
    }

    /// One record by service id.
    pub fn get_by_id(&self, id: &str) -> Option<ServiceRecord> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// The local anti-entropy summary.
    pub fn digest(&self) -> Digest {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .digest()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn diff(&self, remote: &Digest) -> DigestDiff {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .diff(remote)
    }

    pub(crate) fn records_for(&self, ids: &[String]) -> Vec<ServiceRecord> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records_for(ids)
    }

    pub(crate) fn merge_remote(&self, records: Vec<ServiceRecord>) -> usize {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .merge_remote(records)
    }
}
