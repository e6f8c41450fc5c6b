//! Per-block assignment index and known block summaries.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{Assignment, BlockIndex, BlockSummary, CaseId, Phase};

/// Completion counts for one block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockProgress {
    pub pre: u32,
    pub post: u32,
    pub total: u32,
    pub percent_complete: f64,
}

impl BlockProgress {
    /// Every assignment of a non-empty block has its POST phase done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.post == self.total
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Default)]
pub struct BlockLedger {
    assignments: BTreeMap<BlockIndex, Vec<Assignment>>,
    observed_sizes: HashMap<BlockIndex, usize>,
    summaries: Vec<BlockSummary>,
}

impl BlockLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a block's assignment list, ordered by display order.
    pub fn set_assignments(&mut self, block: BlockIndex, mut assignments: Vec<Assignment>) {
        assignments.sort_by_key(|a| a.display_order);
        self.observe_size(block, assignments.len());
        self.assignments.insert(block, assignments);
    }

    /// Add one assignment to its block unless an assignment with the same id is
    /// already tracked; in that case only missing completion stamps are copied
    /// over. Returns `true` when a new assignment was added.
    pub fn insert_assignment(&mut self, block: BlockIndex, assignment: Assignment) -> bool {
        let list = self.assignments.entry(block).or_default();
        if let Some(existing) = list.iter_mut().find(|a| a.id == assignment.id) {
            existing.started_at = existing.started_at.or(assignment.started_at);
            existing.completed_pre_at = existing.completed_pre_at.or(assignment.completed_pre_at);
            existing.completed_post_at =
                existing.completed_post_at.or(assignment.completed_post_at);
            return false;
        }
        list.push(assignment);
        list.sort_by_key(|a| a.display_order);
        let len = list.len();
        self.observe_size(block, len);
        true
    }

    fn observe_size(&mut self, block: BlockIndex, size: usize) {
        let known = self.observed_sizes.entry(block).or_insert(0);
        if size > *known {
            *known = size;
        }
    }

    #[must_use]
    pub fn block_assignments(&self, block: BlockIndex) -> &[Assignment] {
        self.assignments.get(&block).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_tracked(&self, block: BlockIndex) -> bool {
        self.assignments.contains_key(&block)
    }

    #[must_use]
    pub fn has_any_assignments(&self) -> bool {
        !self.assignments.is_empty()
    }

    /// Every block with a known assignment list, ascending.
    #[must_use]
    pub fn tracked_blocks(&self) -> Vec<BlockIndex> {
        self.assignments.keys().copied().collect()
    }

    /// Lowest tracked block that still has an assignment without POST.
    #[must_use]
    pub fn first_incomplete_block(&self) -> Option<BlockIndex> {
        self.assignments
            .iter()
            .find(|(_, list)| list.iter().any(|a| !a.is_post_completed()))
            .map(|(block, _)| *block)
    }

    #[must_use]
    pub fn has_incomplete_block(&self) -> bool {
        self.first_incomplete_block().is_some()
    }

    /// Highest block index known from assignments or summaries.
    #[must_use]
    pub fn latest_block_index(&self) -> Option<BlockIndex> {
        let from_assignments = self.assignments.keys().next_back().copied();
        let from_summaries = self.summaries.last().map(|s| s.block_index);
        from_assignments.max(from_summaries)
    }

    /// Progress using the larger of the current list length and the largest
    /// size ever observed for the block.
    #[must_use]
    pub fn block_progress(&self, block: BlockIndex) -> BlockProgress {
        let list = self.block_assignments(block);
        let observed = self.observed_sizes.get(&block).copied().unwrap_or(0);
        let total = count(list.len().max(observed));
        if total == 0 {
            return BlockProgress::default();
        }
        let pre = count(list.iter().filter(|a| a.is_pre_completed()).count());
        let post = count(list.iter().filter(|a| a.is_post_completed()).count());
        BlockProgress {
            pre,
            post,
            total,
            percent_complete: f64::from(post.saturating_mul(100)) / f64::from(total),
        }
    }

    /// Stamp a local phase completion on the assignment for `case_id`, searching
    /// the newest block first. Returns the block that holds the case.
    pub fn stamp(&mut self, case_id: CaseId, phase: Phase, at: DateTime<Utc>) -> Option<BlockIndex> {
        for (block, list) in self.assignments.iter_mut().rev() {
            if let Some(assignment) = list.iter_mut().find(|a| a.case_id == case_id) {
                assignment.stamp_completed(phase, at);
                return Some(*block);
            }
        }
        None
    }

    /// Undo a local stamp for `case_id` after the server denied `phase`,
    /// searching the newest block first. Returns the block when a stamp was
    /// removed.
    pub fn clear_stamp(&mut self, case_id: CaseId, phase: Phase) -> Option<BlockIndex> {
        for (block, list) in self.assignments.iter_mut().rev() {
            if let Some(assignment) = list.iter_mut().find(|a| a.case_id == case_id) {
                return assignment.clear_completed(phase).then_some(*block);
            }
        }
        None
    }

    /// Register an empty summary for `block` unless one is already known.
    pub fn ensure_placeholder(&mut self, block: BlockIndex) -> bool {
        if self.summary(block).is_some() {
            return false;
        }
        self.upsert_summary(BlockSummary::placeholder(block));
        true
    }

    /// Insert or replace the summary for its block, keeping ascending order.
    pub fn upsert_summary(&mut self, summary: BlockSummary) {
        match self
            .summaries
            .binary_search_by_key(&summary.block_index, |s| s.block_index)
        {
            Ok(idx) => self.summaries[idx] = summary,
            Err(idx) => self.summaries.insert(idx, summary),
        }
    }

    pub fn merge_summaries(&mut self, summaries: impl IntoIterator<Item = BlockSummary>) {
        for summary in summaries {
            self.upsert_summary(summary);
        }
    }

    #[must_use]
    pub fn summary(&self, block: BlockIndex) -> Option<&BlockSummary> {
        self.summaries
            .binary_search_by_key(&block, |s| s.block_index)
            .ok()
            .map(|idx| &self.summaries[idx])
    }

    #[must_use]
    pub fn summaries(&self) -> &[BlockSummary] {
        &self.summaries
    }
}
