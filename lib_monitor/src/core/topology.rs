//! # Node Pool Topology
//!
//! Fixed roles for one monitor run: rank 0 is the collecting node, every other
//! rank is a processing node. Rank and pool size are assigned at startup and
//! never change for the lifetime of the process.
//!
//! The module also owns the static sharding rule for list-based event sources:
//! each processing node takes one contiguous slice of `ceil(L / (P - 1))` items,
//! and the last node simply gets whatever is left.

use std::ops::Range;

use crate::errors::ConfigurationError;

/// Identifier of a node inside one node pool, `0 <= rank < pool_size`.
pub type Rank = usize;

/// Rank of the collecting node.
pub const COLLECTOR_RANK: Rank = 0;

/// Role of a node, derived from its rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Rank 0: receives envelopes and runs the aggregation.
    Collector,
    /// Ranks 1..pool_size: pull events and run the processing.
    Worker,
}

/// # Topology
///
/// Immutable `(rank, pool_size)` pair, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    rank: Rank,
    pool_size: usize,
}

impl Topology {
    /// Validates and builds a topology.
    ///
    /// # Errors
    /// `InvalidPoolSize` when `pool_size < 2`, `InvalidRank` when `rank >= pool_size`.
    pub fn new(rank: Rank, pool_size: usize) -> Result<Self, ConfigurationError> {
        if pool_size < 2 {
            return Err(ConfigurationError::InvalidPoolSize(pool_size));
        }
        if rank >= pool_size {
            return Err(ConfigurationError::InvalidRank { rank, pool_size });
        }
        Ok(Self { rank, pool_size })
    }

    /// This node's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Total number of nodes, collector included.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of processing nodes.
    pub fn num_workers(&self) -> usize {
        self.pool_size - 1
    }

    /// Role of this node.
    pub fn role(&self) -> NodeRole {
        role_of(self.rank)
    }

    /// Ranks of every processing node, in ascending order.
    pub fn worker_ranks(&self) -> Range<Rank> {
        1..self.pool_size
    }

    /// This node's slice of a flat, ordered work list. Empty on the collector.
    pub fn shard<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        &items[shard_range(items.len(), self.rank, self.pool_size)]
    }
}

/// Role for a rank: `0` collects, everything else processes.
pub fn role_of(rank: Rank) -> NodeRole {
    if rank == COLLECTOR_RANK {
        NodeRole::Collector
    } else {
        NodeRole::Worker
    }
}

/// Index range of the items assigned to `rank` out of a list of `len` items.
///
/// Worker `r` gets `[(r-1)*n, r*n)` clipped to `len`, with `n = ceil(len / (pool_size-1))`.
/// The collector, and any worker past the end of the list, gets an empty range.
pub fn shard_range(len: usize, rank: Rank, pool_size: usize) -> Range<usize> {
    if rank == COLLECTOR_RANK || pool_size < 2 {
        return 0..0;
    }
    let per_node = len.div_ceil(pool_size - 1);
    let start = ((rank - 1) * per_node).min(len);
    let end = (rank * per_node).min(len);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_follow_rank() {
        let collector = Topology::new(0, 4).unwrap();
        assert_eq!(collector.role(), NodeRole::Collector);
        for rank in collector.worker_ranks() {
            assert_eq!(Topology::new(rank, 4).unwrap().role(), NodeRole::Worker);
        }
        assert_eq!(collector.num_workers(), 3);
    }

    #[test]
    fn test_pool_needs_a_collector_and_a_worker() {
        assert!(matches!(
            Topology::new(0, 1),
            Err(ConfigurationError::InvalidPoolSize(1))
        ));
        assert!(matches!(
            Topology::new(0, 0),
            Err(ConfigurationError::InvalidPoolSize(0))
        ));
        assert!(matches!(
            Topology::new(5, 3),
            Err(ConfigurationError::InvalidRank { rank: 5, pool_size: 3 })
        ));
    }

    #[test]
    fn test_shards_cover_every_item_exactly_once() {
        for pool_size in 2..9 {
            for len in 0..40 {
                let items: Vec<usize> = (0..len).collect();
                let mut seen = Vec::new();
                for rank in 1..pool_size {
                    let topology = Topology::new(rank, pool_size).unwrap();
                    seen.extend_from_slice(topology.shard(&items));
                }
                assert_eq!(seen, items, "pool_size={} len={}", pool_size, len);
            }
        }
    }

    #[test]
    fn test_last_worker_may_get_fewer_items() {
        // 10 items over 3 workers: 4, 4, 2.
        assert_eq!(shard_range(10, 1, 4), 0..4);
        assert_eq!(shard_range(10, 2, 4), 4..8);
        assert_eq!(shard_range(10, 3, 4), 8..10);
        // 3 items over 4 workers leaves the last one empty.
        assert_eq!(shard_range(3, 4, 5), 3..3);
        assert_eq!(shard_range(10, 0, 4), 0..0);
    }
}
