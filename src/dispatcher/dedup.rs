use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Result of an atomic dedup claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// The fingerprint was unclaimed; the candidate now owns it
    New,
    /// Equivalent work is already registered under this record id
    Existing(Uuid),
}

/// Index guaranteeing at-most-one active record per normalized fingerprint.
///
/// Multiple workers may race to decompose equivalent work concurrently, so
/// the check-then-insert is a single atomic operation on the map entry.
/// Entries for failed or canceled records are released so a retry can
/// resubmit fresh work; successful entries stay, letting later submitters
/// reuse the completed record and its memoized result.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: DashMap<String, Uuid>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim a fingerprint for `candidate`, or report the record
    /// that already holds it.
    pub fn claim(&self, fingerprint: &str, candidate: Uuid) -> DedupOutcome {
        match self.entries.entry(fingerprint.to_string()) {
            Entry::Occupied(entry) => DedupOutcome::Existing(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(candidate);
                DedupOutcome::New
            }
        }
    }

    /// Release a fingerprint, but only if `id` still owns it
    pub fn release(&self, fingerprint: &str, id: Uuid) {
        self.entries
            .remove_if(fingerprint, |_, owner| *owner == id);
    }

    /// Record currently holding the fingerprint, if any
    pub fn holder(&self, fingerprint: &str) -> Option<Uuid> {
        self.entries.get(fingerprint).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
