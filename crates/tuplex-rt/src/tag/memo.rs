use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fxhash::FxBuildHasher;

use crate::types::Tag;

/// Most step collections one tag collection can prescribe.
pub(crate) const MAX_PRESCRIPTIONS: usize = 64;

/// Result of recording a put in the memo table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    /// First time this tag was seen.
    pub fresh: bool,
    /// Prescriptions this put must launch.
    pub newly: u64,
}

/// Per-tag bitmask of the step collections already launched for it.
pub(crate) struct MemoTable<T> {
    map: DashMap<T, u64, FxBuildHasher>,
}

impl<T: Tag> MemoTable<T> {
    pub fn new() -> Self {
        MemoTable {
            map: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Marks every bit of `all` as launched for `tag`, returning the bits
    /// that were not set before.
    pub fn claim(&self, tag: &T, all: u64) -> Claim {
        match self.map.entry(tag.clone()) {
            Entry::Occupied(mut e) => {
                let prev = *e.get();
                *e.get_mut() = prev | all;
                Claim {
                    fresh: false,
                    newly: all & !prev,
                }
            }
            Entry::Vacant(e) => {
                e.insert(all);
                Claim {
                    fresh: true,
                    newly: all,
                }
            }
        }
    }

    /// Sets `bit` on every known tag and returns the tags that lacked it.
    pub fn mark_all(&self, bit: u64) -> Vec<T> {
        let mut missing = Vec::new();
        for mut entry in self.map.iter_mut() {
            if *entry.value() & bit == 0 {
                *entry.value_mut() |= bit;
                missing.push(entry.key().clone());
            }
        }
        missing
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn tags(&self) -> Vec<T> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Mask with the lowest `n` bits set.
pub(crate) fn mask(n: usize) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_claims_launch_nothing() {
        let memo = MemoTable::new();
        assert_eq!(memo.claim(&"a", mask(2)), Claim { fresh: true, newly: 0b11 });
        assert_eq!(memo.claim(&"a", mask(2)), Claim { fresh: false, newly: 0 });
        // A third prescription added later.
        assert_eq!(memo.claim(&"a", mask(3)), Claim { fresh: false, newly: 0b100 });
    }

    #[test]
    fn mark_all_replays_once() {
        let memo = MemoTable::new();
        memo.claim(&1u32, mask(1));
        memo.claim(&2u32, mask(1));
        let mut replay = memo.mark_all(0b10);
        replay.sort();
        assert_eq!(replay, vec![1, 2]);
        assert!(memo.mark_all(0b10).is_empty());
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn mask_edges() {
        assert_eq!(mask(0), 0);
        assert_eq!(mask(64), u64::MAX);
    }
}
