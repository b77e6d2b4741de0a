//! Replicated service-registry state.
//!
//! The single owner of the `serviceId -> record` map. All mutation goes
//! through the upsert/merge operations, which enforce monotonic versioning
//! per record: a record's version never decreases, and a remote record is
//! applied only while it is still strictly newer than the local copy.
//!
//! Records live for the process lifetime; there is no deletion path.

use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Compact anti-entropy summary: `serviceId -> version` for every record a
/// node knows about. Lets two nodes detect staleness without shipping the
/// full record set.
pub type Digest = BTreeMap<String, u64>;

/// One replicated service-registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique service id (e.g. a UUID chosen by the registering client).
    pub id: String,
    /// Human-readable service name ("orders-api", "auth-service", ...).
    pub name: String,
    /// Monotonically growing record version, starts at 1.
    pub version: u64,
    /// Advertised `host:port` of the service instance.
    pub host: String,
    /// Peer that authored the record.
    pub owner_id: PeerId,
    /// Free-form extra fields.
    pub meta: Option<BTreeMap<String, String>>,
}

/// A record handed to local registration; version and owner may be left
/// for the store to fill in.
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    pub id: String,
    pub name: String,
    pub host: String,
    pub version: Option<u64>,
    pub owner_id: Option<PeerId>,
    pub meta: Option<BTreeMap<String, String>>,
}

/// The two halves of a digest comparison: records we should push to the
/// peer, and record ids we should fetch from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestDiff {
    /// Ids where our copy is fresher than the peer's digest (or the peer
    /// has no entry at all).
    pub push_ids: Vec<String>,
    /// Ids where the peer's digest is fresher than our copy (or unknown
    /// to us entirely).
    pub pull_ids: Vec<String>,
}

impl DigestDiff {
    pub fn is_empty(&self) -> bool {
        self.push_ids.is_empty() && self.pull_ids.is_empty()
    }
}

/// The replicated state map plus the rules that keep it convergent.
pub struct RegistryStore {
    self_id: PeerId,
    state: HashMap<String, ServiceRecord>,
}

impl RegistryStore {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            state: HashMap::new(),
        }
    }

    /// Register or update a service locally.
    ///
    /// A draft without an explicit version gets `stored + 1` (or 1 for a
    /// new record). An explicit version that is not strictly greater than
    /// the stored one is rejected as a no-op. The owner defaults to this
    /// node. Returns whether the record was applied.
    pub fn upsert_local(&mut self, draft: RecordDraft) -> bool {
        let current = self.state.get(&draft.id);

        if let (Some(version), Some(record)) = (draft.version, current) {
            if version <= record.version {
                return false;
            }
        }

        let version = draft
            .version
            .unwrap_or_else(|| current.map(|r| r.version + 1).unwrap_or(1));

        let record = ServiceRecord {
            id: draft.id,
            name: draft.name,
            version,
            host: draft.host,
            owner_id: draft.owner_id.unwrap_or_else(|| self.self_id.clone()),
            meta: draft.meta,
        };

        debug!("Local service {} updated -> version {}", record.id, record.version);
        self.state.insert(record.id.clone(), record);
        true
    }

    /// Register or update several services at once.
    pub fn upsert_many_local(&mut self, drafts: Vec<RecordDraft>) {
        for draft in drafts {
            self.upsert_local(draft);
        }
    }

    /// Every known record.
    pub fn get_all(&self) -> Vec<ServiceRecord> {
        self.state.values().cloned().collect()
    }

    /// One record by service id.
    pub fn get(&self, id: &str) -> Option<&ServiceRecord> {
        self.state.get(id)
    }

    /// Number of known records.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// The `serviceId -> version` summary for the anti-entropy exchange.
    pub fn digest(&self) -> Digest {
        self.state
            .values()
            .map(|r| (r.id.clone(), r.version))
            .collect()
    }

    /// Compare a peer's digest against local state.
    ///
    /// An id missing from the peer's digest counts as version 0 on their
    /// side, and vice versa, so new records flow in both directions.
    pub fn diff(&self, remote: &Digest) -> DigestDiff {
        let mut push_ids: Vec<String> = self
            .state
            .values()
            .filter(|r| r.version > remote.get(&r.id).copied().unwrap_or(0))
            .map(|r| r.id.clone())
            .collect();
        push_ids.sort();

        let mut pull_ids: Vec<String> = remote
            .iter()
            .filter(|(id, version)| {
                **version > self.state.get(*id).map(|r| r.version).unwrap_or(0)
            })
            .map(|(id, _)| id.clone())
            .collect();
        pull_ids.sort();

        DigestDiff { push_ids, pull_ids }
    }

    /// The full records backing the given ids; unknown ids are skipped.
    pub fn records_for(&self, ids: &[String]) -> Vec<ServiceRecord> {
        ids.iter()
            .filter_map(|id| self.state.get(id).cloned())
            .collect()
    }

    /// Merge records received from a peer. Returns how many were applied.
    ///
    /// Each record is re-checked against the local copy at application
    /// time: a record that was strictly newer when requested may have been
    /// overtaken by a concurrent local update, in which case it is
    /// silently dropped. Two records carrying the same version for the
    /// same id are resolved deterministically: the one authored by the
    /// lexicographically greater owner wins, so every replica picks the
    /// same winner.
    pub fn merge_remote(&mut self, records: Vec<ServiceRecord>) -> usize {
        let mut applied = 0;

        for record in records {
            let accept = match self.state.get(&record.id) {
                None => true,
                Some(current) if record.version > current.version => true,
                Some(current) => {
                    record.version == current.version && record.owner_id > current.owner_id
                }
            };

            if accept {
                debug!("Merged service {} at version {}", record.id, record.version);
                self.state.insert(record.id.clone(), record);
                applied += 1;
            } else {
                debug!("Skipped stale record {} at version {}", record.id, record.version);
            }
        }

        applied
    }
}
