//! Key to shard mapping.
//!
//! Keys are hashed into a fixed number of virtual shards. Physical shards
//! are contiguous ranges of virtual shards, so changing the physical shard
//! count regroups virtual shards without moving any key between them.
//!
//! ```text
//! key ──xxh64(shard field) mod 100──▶ virtual shard ──range lookup──▶ physical shard
//! ```

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::PipelineError;
use crate::types::RecordKey;

/// Number of virtual shards. Fixed for the lifetime of a ledger.
pub const VIRTUAL_SHARD_COUNT: u32 = 100;

/// Virtual shard of a key.
pub fn virtual_shard_of(key: &RecordKey) -> u32 {
    (xxh64(key.shard_field().as_bytes(), 0) % VIRTUAL_SHARD_COUNT as u64) as u32
}

/// A physical shard: the virtual shards `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    /// Physical shard index.
    pub index: u32,
    /// First virtual shard (inclusive).
    pub start: u32,
    /// Last virtual shard (exclusive).
    pub end: u32,
}

impl ShardRange {
    /// Range covering every virtual shard.
    pub fn all() -> Self {
        Self { index: 0, start: 0, end: VIRTUAL_SHARD_COUNT }
    }

    /// Whether a virtual shard belongs to this range.
    pub fn contains(&self, virtual_shard: u32) -> bool {
        self.start <= virtual_shard && virtual_shard < self.end
    }

    /// Whether a key belongs to this range.
    pub fn contains_key(&self, key: &RecordKey) -> bool {
        self.contains(virtual_shard_of(key))
    }

    /// Number of virtual shards in the range.
    pub fn width(&self) -> u32 {
        self.end - self.start
    }
}

/// Partition name for a physical shard: `{base}_{start}_{last}`.
pub fn shard_name(base: &str, range: &ShardRange) -> String {
    format!("{}_{}_{}", base, range.start, range.end - 1)
}

/// Groups virtual shards into a fixed number of physical shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPartitioner {
    ranges: Vec<ShardRange>,
}

impl ShardPartitioner {
    /// Create a partitioner with `num_physical` shards (1 to 100).
    ///
    /// The first `100 mod n` ranges are one virtual shard wider than the rest.
    pub fn new(num_physical: u32) -> Result<Self, PipelineError> {
        if num_physical == 0 || num_physical > VIRTUAL_SHARD_COUNT {
            return Err(PipelineError::Config(format!(
                "physical shard count must be between 1 and {}, got {}",
                VIRTUAL_SHARD_COUNT, num_physical
            )));
        }
        let k = VIRTUAL_SHARD_COUNT / num_physical;
        let m = VIRTUAL_SHARD_COUNT % num_physical;
        let ranges = (0..num_physical)
            .map(|i| ShardRange {
                index: i,
                start: i * k + i.min(m),
                end: (i + 1) * k + (i + 1).min(m),
            })
            .collect();
        Ok(Self { ranges })
    }

    /// Physical shard ranges in index order.
    pub fn ranges(&self) -> &[ShardRange] {
        &self.ranges
    }

    /// Number of physical shards.
    pub fn num_shards(&self) -> u32 {
        self.ranges.len() as u32
    }

    /// Range owning a virtual shard.
    pub fn range_of_virtual(&self, virtual_shard: u32) -> ShardRange {
        // Ranges are contiguous and sorted; the last range absorbs anything out of bounds.
        let idx = self
            .ranges
            .partition_point(|r| r.end <= virtual_shard)
            .min(self.ranges.len() - 1);
        self.ranges[idx]
    }

    /// Physical shard index of a key.
    pub fn shard_of(&self, key: &RecordKey) -> u32 {
        self.range_of_virtual(virtual_shard_of(key)).index
    }

    /// Split items into one bucket per physical shard, preserving input order within a bucket.
    pub fn partition<T>(&self, items: Vec<T>, key_of: impl Fn(&T) -> &RecordKey) -> Vec<Vec<T>> {
        let mut buckets: Vec<Vec<T>> = (0..self.ranges.len()).map(|_| Vec::new()).collect();
        for item in items {
            let idx = self.shard_of(key_of(&item)) as usize;
            buckets[idx].push(item);
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ranges_cover_all_virtual_shards() {
        for n in [1, 3, 7, 16, 100] {
            let p = ShardPartitioner::new(n).unwrap();
            let ranges = p.ranges();
            assert_eq!(ranges.len(), n as usize);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[ranges.len() - 1].end, VIRTUAL_SHARD_COUNT);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn test_uneven_split_widens_leading_ranges() {
        let p = ShardPartitioner::new(3).unwrap();
        let widths: Vec<_> = p.ranges().iter().map(ShardRange::width).collect();
        assert_eq!(widths, vec![34, 33, 33]);
    }

    #[test]
    fn test_shard_name_uses_inclusive_last() {
        let p = ShardPartitioner::new(4).unwrap();
        assert_eq!(shard_name("blacklist", &p.ranges()[0]), "blacklist_0_24");
        assert_eq!(shard_name("blacklist", &p.ranges()[3]), "blacklist_75_99");
    }

    #[test]
    fn test_rejects_invalid_counts() {
        assert!(ShardPartitioner::new(0).is_err());
        assert!(ShardPartitioner::new(101).is_err());
    }

    #[test]
    fn test_composite_keys_share_device_shard() {
        let a = RecordKey::from(vec!["35000000000001", "310150000000001"]);
        let b = RecordKey::from(vec!["35000000000001", "310150000000002"]);
        assert_eq!(virtual_shard_of(&a), virtual_shard_of(&b));
    }

    proptest! {
        #[test]
        fn prop_virtual_shard_independent_of_physical_count(
            key in "[0-9]{14}",
            n1 in 1u32..=100,
            n2 in 1u32..=100,
        ) {
            let key = RecordKey::single(key);
            let v = virtual_shard_of(&key);
            prop_assert!(v < VIRTUAL_SHARD_COUNT);

            let p1 = ShardPartitioner::new(n1).unwrap();
            let p2 = ShardPartitioner::new(n2).unwrap();
            prop_assert!(p1.ranges()[p1.shard_of(&key) as usize].contains(v));
            prop_assert!(p2.ranges()[p2.shard_of(&key) as usize].contains(v));
        }

        #[test]
        fn prop_partition_preserves_items(keys in proptest::collection::vec("[a-z0-9]{1,12}", 0..64), n in 1u32..=16) {
            let p = ShardPartitioner::new(n).unwrap();
            let items: Vec<RecordKey> = keys.iter().cloned().map(RecordKey::single).collect();
            let buckets = p.partition(items.clone(), |k| k);
            prop_assert_eq!(buckets.iter().map(Vec::len).sum::<usize>(), items.len());
            for (idx, bucket) in buckets.iter().enumerate() {
                for key in bucket {
                    prop_assert_eq!(p.shard_of(key) as usize, idx);
                }
            }
        }
    }
}
