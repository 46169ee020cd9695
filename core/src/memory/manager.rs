use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::util::{head_tail, truncate_chars};

use super::block::{BlockId, BlockStatus, MemoryBlock};
use super::tokens::TokenEstimator;

const SUMMARY_HEAD_CHARS: usize = 200;
const SUMMARY_TAIL_CHARS: usize = 100;
const SUMMARY_MARKER: &str = "...[TRUNCATED]...";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub live_blocks: usize,
    pub raw_blocks: usize,
    pub compressed_blocks: usize,
    pub evicted_blocks: usize,
    pub pinned_blocks: usize,
    pub live_tokens: usize,
}

/// Scores, evicts and condenses context blocks so the working context stays within a
/// token budget. Pinned blocks and the newest `window` blocks are never altered.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    /// Creation order, with condensed blocks taking the slot of the first block they replace.
    blocks: Vec<MemoryBlock>,
    next_id: u64,
    clock: u64,
    window: usize,
    max_tokens: usize,
}

impl MemoryManager {
    pub fn new(window: usize, max_tokens: usize) -> Self {
        Self {
            blocks: Vec::new(),
            next_id: 0,
            clock: 0,
            window,
            max_tokens: max_tokens.max(1),
        }
    }

    pub fn from_config(cfg: &MemoryConfig) -> Self {
        Self::new(cfg.window_size, cfg.max_tokens)
    }

    pub fn ingest(&mut self, label: Option<&str>, text: impl Into<String>) -> BlockId {
        self.push(label, text.into(), false)
    }

    pub fn ingest_pinned(&mut self, label: Option<&str>, text: impl Into<String>) -> BlockId {
        self.push(label, text.into(), true)
    }

    /// Record a use of the block; raises its frequency and recency.
    pub fn reference(&mut self, id: BlockId) -> bool {
        self.clock += 1;
        let clock = self.clock;
        match self.find_mut(id) {
            Some(b) => {
                b.references += 1;
                b.last_touched = clock;
                true
            }
            None => false,
        }
    }

    pub fn pin(&mut self, id: BlockId) -> bool {
        match self.find_mut(id) {
            Some(b) => {
                b.pinned = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.iter().find(|b| b.id == id && b.is_live())
    }

    /// Live blocks in render order.
    pub fn view(&self) -> Vec<&MemoryBlock> {
        self.blocks.iter().filter(|b| b.is_live()).collect()
    }

    pub fn live_tokens(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.is_live())
            .map(|b| b.tokens)
            .sum()
    }

    pub fn stats(&self) -> MemoryStats {
        let mut s = MemoryStats::default();
        for b in &self.blocks {
            match b.status {
                BlockStatus::Raw => s.raw_blocks += 1,
                BlockStatus::Compressed => s.compressed_blocks += 1,
                BlockStatus::Evicted => {
                    s.evicted_blocks += 1;
                    continue;
                }
            }
            s.live_blocks += 1;
            s.live_tokens += b.tokens;
            if b.pinned {
                s.pinned_blocks += 1;
            }
        }
        s
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Render all live blocks without compressing.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.is_live())
            .map(MemoryBlock::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Importance: recency x frequency, with pinned blocks above everything.
    pub fn score(&self, id: BlockId) -> Option<f64> {
        let live: Vec<&MemoryBlock> = self.view();
        let block = live.iter().find(|b| b.id == id)?;
        Some(Self::score_in(block, &live))
    }

    fn score_in(block: &MemoryBlock, live: &[&MemoryBlock]) -> f64 {
        if block.pinned {
            return f64::INFINITY;
        }
        let n = live.len().max(1) as f64;
        // Rank by last touch, creation order breaking ties.
        let rank = live
            .iter()
            .filter(|b| (b.last_touched, b.id) < (block.last_touched, block.id))
            .count() as f64;
        let recency = (rank + 1.0) / n;
        let frequency = 1.0 + (1.0 + block.references as f64).ln();
        recency * frequency
    }

    /// Bring the context within `target_budget` tokens and return the rendered result.
    ///
    /// Lowest-scored unprotected Raw blocks are evicted first until the live total is under
    /// the eviction threshold. If it is still over the target, the remaining unprotected
    /// blocks are merged into one condensed block. Protected blocks are returned verbatim
    /// even when they alone exceed the target.
    pub fn compress(&mut self, target_budget: usize) -> String {
        let protected = self.protected_ids();

        let mut candidates: Vec<(f64, BlockId)> = {
            let live = self.view();
            live.iter()
                .filter(|b| b.status == BlockStatus::Raw && !protected.contains(&b.id))
                .map(|b| (Self::score_in(b, &live), b.id))
                .collect()
        };
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut evicted = 0usize;
        for (_, id) in candidates {
            if self.live_tokens() <= self.max_tokens {
                break;
            }
            if let Some(b) = self.find_mut(id) {
                b.status = BlockStatus::Evicted;
                b.content.clear();
                b.tokens = 0;
                evicted += 1;
            }
        }

        let mut condensed = 0usize;
        if self.live_tokens() > target_budget {
            condensed = self.condense(&protected, target_budget);
        }

        tracing::debug!(
            target: "autopilot.flow",
            evicted,
            condensed,
            live_tokens = self.live_tokens(),
            target_budget,
            "memory compressed"
        );
        self.render()
    }

    fn condense(&mut self, protected: &HashSet<BlockId>, target_budget: usize) -> usize {
        let merge: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_live() && !protected.contains(&b.id))
            .map(|(i, _)| i)
            .collect();
        if merge.is_empty() {
            return 0;
        }

        let protected_tokens: usize = self
            .blocks
            .iter()
            .filter(|b| b.is_live() && protected.contains(&b.id))
            .map(|b| b.tokens)
            .sum();
        let room = target_budget.saturating_sub(protected_tokens).max(1);

        let mut summary = merge
            .iter()
            .map(|&i| {
                let b = &self.blocks[i];
                let excerpt = head_tail(&b.content, SUMMARY_HEAD_CHARS, SUMMARY_TAIL_CHARS, SUMMARY_MARKER);
                match &b.label {
                    Some(label) => format!("- {label}: {excerpt}"),
                    None => format!("- {excerpt}"),
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        if TokenEstimator::estimate(&summary) > room {
            summary = truncate_chars(&summary, TokenEstimator::chars_for(room)).to_string();
        }

        let slot = merge[0];
        for &i in &merge {
            let b = &mut self.blocks[i];
            b.status = BlockStatus::Evicted;
            b.content.clear();
            b.tokens = 0;
        }

        let id = BlockId(self.next_id);
        self.next_id += 1;
        let tokens = TokenEstimator::estimate(&summary);
        self.blocks.insert(
            slot,
            MemoryBlock {
                id,
                label: Some("condensed context".to_string()),
                content: summary,
                tokens,
                pinned: false,
                references: 0,
                last_touched: self.clock,
                status: BlockStatus::Compressed,
            },
        );
        merge.len()
    }

    /// Pinned blocks plus the newest `window` live blocks by creation.
    fn protected_ids(&self) -> HashSet<BlockId> {
        let mut ids: HashSet<BlockId> = self
            .blocks
            .iter()
            .filter(|b| b.is_live() && b.pinned)
            .map(|b| b.id)
            .collect();
        let mut recent: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|b| b.is_live() && b.status == BlockStatus::Raw)
            .map(|b| b.id)
            .collect();
        recent.sort_unstable();
        ids.extend(recent.into_iter().rev().take(self.window));
        ids
    }

    fn push(&mut self, label: Option<&str>, content: String, pinned: bool) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.clock += 1;
        self.blocks.push(MemoryBlock {
            id,
            label: label.map(str::to_string),
            tokens: TokenEstimator::estimate(&content),
            content,
            pinned,
            references: 0,
            last_touched: self.clock,
            status: BlockStatus::Raw,
        });
        id
    }

    fn find_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        self.blocks.iter_mut().find(|b| b.id == id && b.is_live())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn filler(tag: usize, chars: usize) -> String {
        format!("block-{tag}:{}", "x".repeat(chars))
    }

    #[test]
    fn pinned_and_window_blocks_survive_byte_identical() {
        let mut m = MemoryManager::new(2, 200);
        let goal = m.ingest_pinned(Some("goal"), "Build the report exactly as asked.");
        let mut contents = Vec::new();
        for i in 0..10 {
            let c = filler(i, 400);
            m.ingest(Some("step"), c.clone());
            contents.push(c);
        }

        let out = m.compress(150);

        assert!(out.contains("Build the report exactly as asked."));
        assert!(out.contains(&contents[8]));
        assert!(out.contains(&contents[9]));
        assert!(!out.contains(&contents[0]));
        assert!(m.get(goal).is_some());
    }

    #[test]
    fn eviction_prefers_low_score_then_creation_order() {
        let mut m = MemoryManager::new(1, 250);
        let a = m.ingest(None, filler(0, 400));
        let b = m.ingest(None, filler(1, 400));
        let c = m.ingest(None, filler(2, 400));
        let _d = m.ingest(None, filler(3, 400));
        m.reference(a);
        m.reference(a);

        m.compress(1_000);

        // b is the coldest unprotected block, so it goes first; then c.
        assert!(m.get(b).is_none());
        assert!(m.get(c).is_none());
        assert!(m.get(a).is_some());
        assert!(m.live_tokens() <= 250);
    }

    #[test]
    fn revisited_block_outlives_newer_sibling() {
        let build = |revisit: bool| {
            let mut m = MemoryManager::new(0, 150);
            let old = m.ingest(Some("step a"), filler(0, 400));
            let new = m.ingest(Some("step b"), filler(1, 400));
            if revisit {
                m.reference(old);
            }
            m.compress(10_000);
            (m.get(old).is_some(), m.get(new).is_some())
        };
        assert_eq!(build(false), (false, true));
        assert_eq!(build(true), (true, false));
    }

    #[test]
    fn condensing_merges_unprotected_blocks_into_one() {
        let mut m = MemoryManager::new(1, 10_000);
        for i in 0..4 {
            m.ingest(Some("note"), filler(i, 600));
        }
        let out = m.compress(200);

        let stats = m.stats();
        assert_eq!(stats.compressed_blocks, 1);
        assert_eq!(stats.raw_blocks, 1);
        assert!(out.contains(SUMMARY_MARKER) || out.contains("condensed context"));
        assert!(out.ends_with(&filler(3, 600)));
    }

    #[test]
    fn compress_is_deterministic() {
        let build = || {
            let mut m = MemoryManager::new(2, 100);
            for i in 0..6 {
                m.ingest(None, filler(i, 200));
            }
            m
        };
        assert_eq!(build().compress(80), build().compress(80));
    }

    #[test]
    fn under_budget_is_untouched() {
        let mut m = MemoryManager::new(3, 4_000);
        m.ingest(Some("a"), "alpha");
        m.ingest(None, "beta");
        assert_eq!(m.compress(1_000), "[a]\nalpha\n\nbeta");
        assert_eq!(m.stats().evicted_blocks, 0);
    }

    #[test]
    fn scores_rank_pinned_highest() {
        let mut m = MemoryManager::new(3, 4_000);
        let a = m.ingest(None, "a");
        let b = m.ingest(None, "b");
        m.pin(a);
        assert!(m.score(a).unwrap() > m.score(b).unwrap());
        m.reference(b);
        assert!(m.score(b).unwrap() > 0.0);
    }
}
