//! Basic blocks and per-function control flow graphs.
//!
//! Blocks live in an arena (`ControlFlowGraph::blocks`) and refer to each
//! other by [`BlockId`]; edges are always recorded on both ends.

mod dominators;

pub use self::dominators::NaturalLoop;

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::dataflow::DataFlowResult;
use crate::{Address, Instruction, INSTRUCTION_WIDTH};

/// Index of a block in its graph's arena
pub type BlockId = usize;

/// One basic block: a maximal straight-line run of instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Address of the first instruction
    pub start_address: Address,
    /// Address of the last instruction
    pub end_address: Address,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

impl BasicBlock {
    fn new(id: BlockId, start_address: Address) -> Self {
        Self {
            id,
            start_address,
            end_address: start_address,
            instructions: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    fn push(&mut self, insn: Instruction) {
        self.end_address = insn.address;
        self.instructions.push(insn);
    }

    /// Get the last instruction in the block
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Address the block falls through to
    pub fn fall_through_address(&self) -> Address {
        self.end_address.wrapping_add(INSTRUCTION_WIDTH)
    }

    pub fn is_return(&self) -> bool {
        self.terminator().map(|t| t.is_return()).unwrap_or(false)
    }
}

/// Control flow graph of one function.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlFlowGraph {
    /// Block arena; `blocks[0]` is the entry block
    pub blocks: Vec<BasicBlock>,
    pub entry_block: Option<BlockId>,
    pub exit_blocks: Vec<BlockId>,
    /// `dominators[b]` = blocks dominating `b`; empty until computed
    pub dominators: Vec<BTreeSet<BlockId>>,
    pub loops: Vec<NaturalLoop>,
    pub reaching_definitions: DataFlowResult,
    pub live_variables: DataFlowResult,
    #[serde(skip)]
    block_at: HashMap<Address, BlockId>,
}

impl ControlFlowGraph {
    /// Build a graph from a linear instruction listing.
    pub fn from_instructions(instructions: &[Instruction]) -> Self {
        let mut cfg = Self::default();
        cfg.build_from_instructions(instructions);
        cfg
    }

    /// Two-pass leader algorithm. Replaces any previous contents; an empty
    /// listing leaves the graph empty.
    pub fn build_from_instructions(&mut self, instructions: &[Instruction]) {
        *self = Self::default();
        if instructions.is_empty() {
            return;
        }

        // Pass 1: leaders
        let leaders = find_leaders(instructions);

        // Pass 2: partition
        let mut current: Option<BasicBlock> = None;
        for insn in instructions {
            if leaders.contains(&insn.address) {
                if let Some(block) = current.take() {
                    self.push_block(block);
                }
            }
            let block = current.get_or_insert_with(|| BasicBlock::new(0, insn.address));
            block.push(insn.clone());
        }
        if let Some(block) = current {
            self.push_block(block);
        }

        self.link_edges();

        self.entry_block = Some(0);
        self.exit_blocks = self
            .blocks
            .iter()
            .filter(|b| b.successors.is_empty() || b.is_return())
            .map(|b| b.id)
            .collect();

        log::debug!(
            "Built CFG: {} blocks, {} edges, {} exits",
            self.blocks.len(),
            self.edge_count(),
            self.exit_blocks.len()
        );
    }

    fn push_block(&mut self, mut block: BasicBlock) {
        block.id = self.blocks.len();
        self.block_at.insert(block.start_address, block.id);
        self.blocks.push(block);
    }

    fn link_edges(&mut self) {
        let mut edges = Vec::new();
        for block in &self.blocks {
            let Some(last) = block.terminator() else {
                continue;
            };
            let fall_through = self.block_at.get(&block.fall_through_address()).copied();

            if last.is_return() {
                continue;
            }
            if last.is_jump() {
                // Indirect jumps have no resolvable target
                if let Some(target) = last.branch_target().and_then(|t| self.block_at(t)) {
                    edges.push((block.id, target));
                }
            } else if last.is_branch() {
                if let Some(target) = last.branch_target().and_then(|t| self.block_at(t)) {
                    edges.push((block.id, target));
                }
                if let Some(next) = fall_through {
                    edges.push((block.id, next));
                }
            } else if last.is_call() {
                // A callee starting a block here is the successor; otherwise
                // execution resumes after the call
                match last.branch_target().and_then(|t| self.block_at(t)) {
                    Some(target) => edges.push((block.id, target)),
                    None => edges.extend(fall_through.map(|next| (block.id, next))),
                }
            } else if let Some(next) = fall_through {
                edges.push((block.id, next));
            }
        }
        for (from, to) in edges {
            self.add_edge(from, to);
        }
    }

    /// Record `from -> to` on both blocks. Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if self.blocks[from].successors.contains(&to) {
            return;
        }
        self.blocks[from].successors.push(to);
        self.blocks[to].predecessors.push(from);
    }

    /// Block starting exactly at `address`
    pub fn block_at(&self, address: Address) -> Option<BlockId> {
        self.block_at.get(&address).copied()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    pub fn entry(&self) -> Option<&BasicBlock> {
        self.entry_block.and_then(|id| self.blocks.get(id))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.blocks.iter().map(|b| b.successors.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// All instructions in block order
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    /// Mutable access for annotation passes
    pub fn instructions_mut(&mut self) -> impl Iterator<Item = &mut Instruction> {
        self.blocks.iter_mut().flat_map(|b| b.instructions.iter_mut())
    }
}

/// First instruction, every branch/jump target and every instruction after a
/// branch, jump, call or return.
fn find_leaders(instructions: &[Instruction]) -> BTreeSet<Address> {
    let mut leaders = BTreeSet::new();
    leaders.insert(instructions[0].address);

    for insn in instructions {
        if insn.is_branch() || insn.is_jump() || insn.is_call() || insn.is_return() {
            leaders.insert(insn.address.wrapping_add(INSTRUCTION_WIDTH));
        }
        if insn.is_branch() || insn.is_jump() {
            if let Some(target) = insn.branch_target() {
                leaders.insert(target);
            }
        }
    }

    leaders
}
