use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use log::trace;

use super::store::FilterRecord;

/// Identifies one diff request.
///
/// For full diffs `from` is always 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiffKey {
    pub name: String,
    pub full: bool,
    pub epoch: u32,
    pub from: u32,
    pub to: u32,
}

impl DiffKey {
    pub fn full(name: impl Into<String>, epoch: u32, to: u32) -> Self {
        Self {
            name: name.into(),
            full: true,
            epoch,
            from: 0,
            to,
        }
    }

    pub fn incremental(name: impl Into<String>, epoch: u32, from: u32, to: u32) -> Self {
        Self {
            name: name.into(),
            full: false,
            epoch,
            from,
            to,
        }
    }
}

/// Membership changes between two versions, address to "is added".
///
/// `records` must only contain changes within the requested range. The
/// change with the highest version decides an address; on equal versions the
/// later record wins. A full diff only keeps the addresses that end up
/// added.
pub fn compute_diff(records: &[FilterRecord], full: bool) -> BTreeMap<String, bool> {
    let mut latest: BTreeMap<&str, (u32, bool)> = BTreeMap::new();
    for record in records {
        let entry = latest
            .entry(record.address.as_str())
            .or_insert((record.version, record.added));
        if record.version >= entry.0 {
            *entry = (record.version, record.added);
        }
    }
    latest
        .into_iter()
        .filter(|(_, (_, added))| !full || *added)
        .map(|(address, (_, added))| (address.to_string(), added))
        .collect()
}

/// Memoized diff payloads.
///
/// Every invalidation starts a new generation; a result computed during an
/// older generation is refused, as the data it was built from may be
/// outdated.
#[derive(Debug, Default)]
pub struct DiffCache {
    entries: HashMap<DiffKey, Bytes>,
    generation: u64,
}

impl DiffCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DiffKey) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    /// Stores `payload` if it was computed in the current generation.
    pub fn insert(&mut self, key: DiffKey, payload: Bytes, generation: u64) -> bool {
        if generation != self.generation {
            trace!("Not caching diff {key:?} from generation {generation}");
            return false;
        }
        self.entries.insert(key, payload);
        true
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
