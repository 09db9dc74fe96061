//! Dominator sets and natural loops.

use std::collections::BTreeSet;

use serde::Serialize;

use super::{BlockId, ControlFlowGraph};
use crate::arch::LoopHeuristic;

/// A loop identified by one back edge `tail -> header`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NaturalLoop {
    pub header: BlockId,
    pub tail: BlockId,
    /// Blocks in the loop, header and tail included
    pub body: BTreeSet<BlockId>,
}

impl NaturalLoop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.contains(&block)
    }
}

impl ControlFlowGraph {
    /// Iterative fixed point: `Dom(entry) = {entry}`,
    /// `Dom(n) = {n} ∪ ⋂ Dom(p)` over the reachable predecessors of `n`.
    ///
    /// Blocks unreachable from the entry only dominate themselves.
    /// Returns the number of passes until nothing changed.
    pub fn compute_dominators(&mut self) -> usize {
        let count = self.blocks.len();
        self.dominators = Vec::with_capacity(count);
        let Some(entry) = self.entry_block else {
            return 0;
        };

        let reachable = self.reachable_from(entry);
        let all: BTreeSet<BlockId> = (0..count).collect();
        for id in 0..count {
            if id == entry || !reachable.contains(&id) {
                self.dominators.push(BTreeSet::from([id]));
            } else {
                self.dominators.push(all.clone());
            }
        }

        let mut passes = 0;
        let mut changed = true;
        while changed {
            changed = false;
            passes += 1;
            for id in 0..count {
                if id == entry || !reachable.contains(&id) {
                    continue;
                }
                let mut new_set: Option<BTreeSet<BlockId>> = None;
                for &pred in &self.blocks[id].predecessors {
                    if !reachable.contains(&pred) {
                        continue;
                    }
                    let pred_set = &self.dominators[pred];
                    new_set = Some(match new_set {
                        None => pred_set.clone(),
                        Some(acc) => acc.intersection(pred_set).copied().collect(),
                    });
                }
                let mut new_set = new_set.unwrap_or_default();
                new_set.insert(id);

                if new_set != self.dominators[id] {
                    self.dominators[id] = new_set;
                    changed = true;
                }
            }
        }

        log::debug!("Dominators converged after {} passes", passes);
        passes
    }

    /// True if `a` dominates `b`. Requires [`Self::compute_dominators`].
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.dominators
            .get(b)
            .map(|set| set.contains(&a))
            .unwrap_or(false)
    }

    /// Find back edges and collect the natural loop of each.
    pub fn detect_loops(&mut self, heuristic: LoopHeuristic) -> &[NaturalLoop] {
        if heuristic == LoopHeuristic::Dominance && self.dominators.len() != self.blocks.len() {
            self.compute_dominators();
        }

        let mut loops = Vec::new();
        for block in &self.blocks {
            for &succ in &block.successors {
                let back_edge = match heuristic {
                    LoopHeuristic::Dominance => self.dominates(succ, block.id),
                    LoopHeuristic::AddressOrder => {
                        self.blocks[succ].start_address <= block.start_address
                    }
                };
                if back_edge {
                    loops.push(self.natural_loop(succ, block.id));
                }
            }
        }

        log::debug!("Detected {} loops ({:?})", loops.len(), heuristic);
        self.loops = loops;
        &self.loops
    }

    /// Headers of all detected loops
    pub fn loop_headers(&self) -> BTreeSet<BlockId> {
        self.loops.iter().map(|l| l.header).collect()
    }

    pub fn has_loops(&self) -> bool {
        !self.loops.is_empty()
    }

    fn natural_loop(&self, header: BlockId, tail: BlockId) -> NaturalLoop {
        let mut body = BTreeSet::from([header]);
        let mut worklist = Vec::new();
        if body.insert(tail) {
            worklist.push(tail);
        }
        while let Some(id) = worklist.pop() {
            for &pred in &self.blocks[id].predecessors {
                if body.insert(pred) {
                    worklist.push(pred);
                }
            }
        }
        NaturalLoop { header, tail, body }
    }

    fn reachable_from(&self, start: BlockId) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::from([start]);
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            for &succ in &self.blocks[id].successors {
                if seen.insert(succ) {
                    stack.push(succ);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, Instruction};

    fn insn(address: Address, mnemonic: &str, operands: &[&str]) -> Instruction {
        Instruction::new(
            address,
            0,
            mnemonic,
            operands.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Counted loop: the `bne` block branches back to itself.
    fn counted_loop() -> ControlFlowGraph {
        ControlFlowGraph::from_instructions(&[
            insn(0x0, "movi", &["a2", "0"]),
            insn(0x4, "addi", &["a2", "a2", "1"]),
            insn(0x8, "bne", &["a2", "a3", "0x4"]),
            insn(0xc, "ret", &[]),
        ])
    }

    /// A backward jump into a block the jumping block does not dominate.
    fn backward_non_loop() -> ControlFlowGraph {
        ControlFlowGraph::from_instructions(&[
            insn(0x0, "beq", &["a2", "a3", "0xc"]),
            insn(0x4, "movi", &["a2", "1"]),
            insn(0x8, "j", &["0x10"]),
            insn(0xc, "j", &["0x4"]),
            insn(0x10, "ret", &[]),
        ])
    }

    #[test]
    fn test_dominator_reflexivity() {
        for mut cfg in [counted_loop(), backward_non_loop()] {
            cfg.compute_dominators();
            assert_eq!(cfg.dominators[0], BTreeSet::from([0]));
            for id in 0..cfg.block_count() {
                assert!(cfg.dominates(id, id));
            }
        }
    }

    #[test]
    fn test_join_dominated_by_branch_only() {
        let mut cfg = backward_non_loop();
        cfg.compute_dominators();
        let b1 = cfg.block_at(0x4).unwrap();
        let b2 = cfg.block_at(0xc).unwrap();
        assert_eq!(cfg.dominators[b1], BTreeSet::from([0, b1]));
        assert!(!cfg.dominates(b2, b1));
    }

    #[test]
    fn test_self_loop_detected() {
        let mut cfg = counted_loop();
        let loops = cfg.detect_loops(LoopHeuristic::Dominance).to_vec();
        assert_eq!(loops.len(), 1);
        let header = cfg.block_at(0x4).unwrap();
        assert_eq!(loops[0].header, header);
        assert_eq!(loops[0].tail, header);
        assert_eq!(loops[0].body, BTreeSet::from([header]));
    }

    #[test]
    fn test_heuristics_disagree_on_backward_jump() {
        let mut cfg = backward_non_loop();
        assert!(cfg.detect_loops(LoopHeuristic::Dominance).is_empty());

        let loops = cfg.detect_loops(LoopHeuristic::AddressOrder).to_vec();
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].header, cfg.block_at(0x4).unwrap());
        assert_eq!(loops[0].tail, cfg.block_at(0xc).unwrap());
    }

    #[test]
    fn test_unreachable_block_dominates_only_itself() {
        let mut cfg = ControlFlowGraph::from_instructions(&[
            insn(0x0, "ret", &[]),
            insn(0x4, "movi", &["a2", "1"]),
            insn(0x8, "ret", &[]),
        ]);
        cfg.compute_dominators();
        let orphan = cfg.block_at(0x4).unwrap();
        assert_eq!(cfg.dominators[orphan], BTreeSet::from([orphan]));
    }

    #[test]
    fn test_empty_graph() {
        let mut cfg = ControlFlowGraph::default();
        assert_eq!(cfg.compute_dominators(), 0);
        assert!(cfg.detect_loops(LoopHeuristic::Dominance).is_empty());
    }
}
