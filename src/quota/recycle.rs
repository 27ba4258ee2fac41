use crate::types::Lsn;

/// Inputs to one GC pass over a data stream.
#[derive(Debug, Clone, Copy)]
pub struct RecycleRequest {
    pub min_block_id: u64,
    pub max_block_id: u64,
    pub block_size: u64,
    pub tail: Lsn,
    /// Lowest position the caller still needs.
    pub base_lsn: Lsn,
    pub used_bytes: u64,
    pub recycle_trigger_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecycleDecision {
    /// Oldest-first block ids to delete.
    pub deletable_blocks: Vec<u64>,
    /// Why the pass stopped, when it stopped short of the usage target.
    pub stopped_by: Option<RecycleSkipReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleSkipReason {
    BelowTrigger { used_bytes: u64, trigger_bytes: u64 },
    BaseLsnFloor { block_id: u64, base_lsn: Lsn },
    TailBlock { block_id: u64 },
}

/// Picks the blocks GC may delete: oldest first, entirely below `base_lsn`,
/// never the newest block or the block holding the tail, and only while
/// usage stays above the recycle trigger.
pub fn plan_recycle(request: &RecycleRequest) -> RecycleDecision {
    let mut deletable_blocks = Vec::new();
    let mut used = request.used_bytes;
    let tail_block = request.tail.block_id(request.block_size);
    let mut block_id = request.min_block_id;
    let stopped_by = loop {
        if used <= request.recycle_trigger_bytes {
            break deletable_blocks.is_empty().then_some(RecycleSkipReason::BelowTrigger {
                used_bytes: used,
                trigger_bytes: request.recycle_trigger_bytes,
            });
        }
        if block_id >= request.max_block_id || block_id >= tail_block {
            break Some(RecycleSkipReason::TailBlock { block_id });
        }
        if Lsn::block_start(block_id + 1, request.block_size) > request.base_lsn {
            break Some(RecycleSkipReason::BaseLsnFloor {
                block_id,
                base_lsn: request.base_lsn,
            });
        }
        deletable_blocks.push(block_id);
        used = used.saturating_sub(request.block_size);
        block_id += 1;
    };
    RecycleDecision {
        deletable_blocks,
        stopped_by,
    }
}
