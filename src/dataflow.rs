//! Reaching definitions, live variables and type inference over one CFG.
//!
//! Variables are register operands (`a0`..`a15`). An instruction defines its
//! first register operand unless it is a store or a control transfer, and
//! uses the remaining register operands; see
//! [`Instruction::defined_operand`] and [`Instruction::used_operands`].
//!
//! - `GEN[B]` = `KILL[B]` = variables defined in B
//! - `USE[B]` = variables used in B before any definition in B
//! - Reaching: `OUT[B] = GEN[B] ∪ (IN[B] − KILL[B])`, `IN[B] = ∪ OUT[P]`
//! - Live: `IN[B] = USE[B] ∪ (OUT[B] − DEF[B])`, `OUT[B] = ∪ IN[S]`

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::cfg::{BasicBlock, ControlFlowGraph};
use crate::Instruction;

/// Set of variable names
pub type VariableSet = BTreeSet<String>;

const INT_OPS: &[&str] = &[
    "add", "sub", "and", "or", "xor", "mull", "sll", "srl", "neg", "mov", "movi", "addi",
    "slli", "srli", "l32r",
];
const FLOAT_OPS: &[&str] = &["add.s", "sub.s", "mul.s", "div.s"];
const NARROW_MEMORY_OPS: &[&str] = &["l8ui", "s8i"];
const WIDE_MEMORY_OPS: &[&str] = &["l32i", "s32i"];

/// Per-block IN/OUT sets of one analysis, indexed by `BlockId`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataFlowResult {
    pub in_sets: Vec<VariableSet>,
    pub out_sets: Vec<VariableSet>,
}

impl DataFlowResult {
    fn with_blocks(count: usize) -> Self {
        Self {
            in_sets: vec![VariableSet::new(); count],
            out_sets: vec![VariableSet::new(); count],
        }
    }

    pub fn in_set(&self, block: usize) -> Option<&VariableSet> {
        self.in_sets.get(block)
    }

    pub fn out_set(&self, block: usize) -> Option<&VariableSet> {
        self.out_sets.get(block)
    }

    pub fn is_empty(&self) -> bool {
        self.in_sets.is_empty()
    }
}

/// Dataflow state for one function.
///
/// Each analysis keeps its IN/OUT sets between calls, so re-running an
/// analysis on a converged graph finishes in one pass without changes.
#[derive(Debug)]
pub struct DataFlowAnalysis<'a> {
    cfg: &'a ControlFlowGraph,
    reaching: DataFlowResult,
    live: DataFlowResult,
    variable_types: BTreeMap<String, String>,
}

impl<'a> DataFlowAnalysis<'a> {
    pub fn new(cfg: &'a ControlFlowGraph) -> Self {
        let count = cfg.block_count();
        Self {
            cfg,
            reaching: DataFlowResult::with_blocks(count),
            live: DataFlowResult::with_blocks(count),
            variable_types: BTreeMap::new(),
        }
    }

    /// Forward analysis. Returns the number of passes until no set changed.
    pub fn compute_reaching_definitions(&mut self) -> usize {
        let cfg = self.cfg;
        let gen_sets: Vec<VariableSet> = cfg.blocks.iter().map(block_defs).collect();

        let mut passes = 0;
        let mut changed = true;
        while changed {
            changed = false;
            passes += 1;
            for block in &cfg.blocks {
                let id = block.id;
                let mut in_set = VariableSet::new();
                for &pred in &block.predecessors {
                    in_set.extend(self.reaching.out_sets[pred].iter().cloned());
                }

                let mut out_set: VariableSet = in_set.difference(&gen_sets[id]).cloned().collect();
                out_set.extend(gen_sets[id].iter().cloned());

                if in_set != self.reaching.in_sets[id] || out_set != self.reaching.out_sets[id] {
                    self.reaching.in_sets[id] = in_set;
                    self.reaching.out_sets[id] = out_set;
                    changed = true;
                }
            }
        }

        log::debug!("Reaching definitions converged after {} passes", passes);
        passes
    }

    /// Backward analysis, visiting blocks in reverse order. Returns the number
    /// of passes until no set changed.
    pub fn compute_live_variables(&mut self) -> usize {
        let cfg = self.cfg;
        let (uses, defs): (Vec<VariableSet>, Vec<VariableSet>) =
            cfg.blocks.iter().map(block_uses_and_defs).unzip();

        let mut passes = 0;
        let mut changed = true;
        while changed {
            changed = false;
            passes += 1;
            for block in cfg.blocks.iter().rev() {
                let id = block.id;
                let mut out_set = VariableSet::new();
                for &succ in &block.successors {
                    out_set.extend(self.live.in_sets[succ].iter().cloned());
                }

                let mut in_set: VariableSet = out_set.difference(&defs[id]).cloned().collect();
                in_set.extend(uses[id].iter().cloned());

                if in_set != self.live.in_sets[id] || out_set != self.live.out_sets[id] {
                    self.live.in_sets[id] = in_set;
                    self.live.out_sets[id] = out_set;
                    changed = true;
                }
            }
        }

        log::debug!("Live variables converged after {} passes", passes);
        passes
    }

    /// Single forward scan assigning a coarse C type to every register
    /// operand. Operands no rule covers default to `int`.
    pub fn infer_types(&mut self) -> &BTreeMap<String, String> {
        let mut types = BTreeMap::new();
        for insn in self.cfg.instructions() {
            infer_instruction(insn, &mut types);
        }
        for insn in self.cfg.instructions() {
            for op in insn.operands.iter().filter(|op| crate::is_register(op)) {
                types.entry(op.clone()).or_insert_with(|| "int".to_string());
            }
        }

        self.variable_types = types;
        &self.variable_types
    }

    pub fn reaching_definitions(&self) -> &DataFlowResult {
        &self.reaching
    }

    pub fn live_variables(&self) -> &DataFlowResult {
        &self.live
    }

    pub fn variable_types(&self) -> &BTreeMap<String, String> {
        &self.variable_types
    }

    /// Release the graph borrow, keeping the results
    pub fn into_results(self) -> (DataFlowResult, DataFlowResult, BTreeMap<String, String>) {
        (self.reaching, self.live, self.variable_types)
    }
}

/// Run all three analyses and store the IN/OUT sets on the graph.
/// Returns the inferred variable types.
pub fn analyze(cfg: &mut ControlFlowGraph) -> BTreeMap<String, String> {
    let mut analysis = DataFlowAnalysis::new(cfg);
    analysis.compute_reaching_definitions();
    analysis.compute_live_variables();
    analysis.infer_types();
    let (reaching, live, types) = analysis.into_results();

    cfg.reaching_definitions = reaching;
    cfg.live_variables = live;
    types
}

fn block_defs(block: &BasicBlock) -> VariableSet {
    block
        .instructions
        .iter()
        .filter_map(|insn| insn.defined_operand())
        .map(str::to_string)
        .collect()
}

/// Upward-exposed uses and definitions of one block
fn block_uses_and_defs(block: &BasicBlock) -> (VariableSet, VariableSet) {
    let mut uses = VariableSet::new();
    let mut defs = VariableSet::new();
    for insn in &block.instructions {
        for var in insn.used_operands() {
            if !defs.contains(var) {
                uses.insert(var.to_string());
            }
        }
        if let Some(var) = insn.defined_operand() {
            defs.insert(var.to_string());
        }
    }
    (uses, defs)
}

fn infer_instruction(insn: &Instruction, types: &mut BTreeMap<String, String>) {
    let mnemonic = insn.mnemonic.as_str();
    let mut assign = |op: Option<&String>, ty: &str| {
        if let Some(op) = op.filter(|op| crate::is_register(op)) {
            types.insert(op.clone(), ty.to_string());
        }
    };

    if INT_OPS.contains(&mnemonic) {
        assign(insn.operands.first(), "int");
    } else if FLOAT_OPS.contains(&mnemonic) {
        assign(insn.operands.first(), "float");
    } else if NARROW_MEMORY_OPS.contains(&mnemonic) {
        assign(insn.operands.first(), "uint8_t");
    } else if WIDE_MEMORY_OPS.contains(&mnemonic) {
        assign(insn.operands.first(), "uint32_t");
        assign(insn.operands.get(1), "uint32_t*");
    } else if insn.is_branch() {
        for op in insn.used_operands() {
            types
                .entry(op.to_string())
                .or_insert_with(|| "bool".to_string());
        }
    }

    if insn.comment().is_some_and(|c| c.contains("GPIO")) {
        // The pin is the first argument of a GPIO call
        let pin = if insn.is_call() {
            insn.argument_register(0)
        } else {
            insn.operands.first().cloned()
        };
        if let Some(pin) = pin.filter(|op| crate::is_register(op)) {
            types.insert(pin, "gpio_num_t".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    fn insn(address: Address, mnemonic: &str, operands: &[&str]) -> Instruction {
        Instruction::new(
            address,
            0,
            mnemonic,
            operands.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn set(vars: &[&str]) -> VariableSet {
        vars.iter().map(|s| s.to_string()).collect()
    }

    /// B0: movi a2 / beq a2, a3 -> B2; B1: add a4 / j B3; B2: sub a5; B3: ret
    fn diamond() -> ControlFlowGraph {
        ControlFlowGraph::from_instructions(&[
            insn(0x0, "movi", &["a2", "10"]),
            insn(0x4, "beq", &["a2", "a3", "0x10"]),
            insn(0x8, "add", &["a4", "a2", "a6"]),
            insn(0xc, "j", &["0x14"]),
            insn(0x10, "sub", &["a5", "a2", "a7"]),
            insn(0x14, "ret", &[]),
        ])
    }

    /// B0: movi a2; B1: addi a2, a2, 1 / bne a2, a3 -> B1; B2: ret
    fn counted_loop() -> ControlFlowGraph {
        ControlFlowGraph::from_instructions(&[
            insn(0x0, "movi", &["a2", "0"]),
            insn(0x4, "addi", &["a2", "a2", "1"]),
            insn(0x8, "bne", &["a2", "a3", "0x4"]),
            insn(0xc, "ret", &[]),
        ])
    }

    #[test]
    fn test_reaching_definitions_merge_at_join() {
        let cfg = diamond();
        let mut analysis = DataFlowAnalysis::new(&cfg);
        analysis.compute_reaching_definitions();

        let join = cfg.block_at(0x14).unwrap();
        let reaching = analysis.reaching_definitions();
        assert_eq!(reaching.in_sets[join], set(&["a2", "a4", "a5"]));
        assert_eq!(reaching.in_sets[0], VariableSet::new());
        assert_eq!(reaching.out_sets[0], set(&["a2"]));
    }

    #[test]
    fn test_live_variables_are_upward_exposed() {
        let cfg = diamond();
        let mut analysis = DataFlowAnalysis::new(&cfg);
        analysis.compute_live_variables();

        let live = analysis.live_variables();
        // a2 is defined before use in the entry block
        assert_eq!(live.in_sets[0], set(&["a3", "a6", "a7"]));
        assert_eq!(live.out_sets[0], set(&["a2", "a6", "a7"]));
    }

    #[test]
    fn test_loop_converges() {
        let cfg = counted_loop();
        let mut analysis = DataFlowAnalysis::new(&cfg);
        assert!(analysis.compute_reaching_definitions() >= 2);
        assert!(analysis.compute_live_variables() >= 2);

        let header = cfg.block_at(0x4).unwrap();
        assert!(analysis.live_variables().in_sets[header].contains("a3"));
        assert!(analysis.live_variables().out_sets[header].contains("a2"));
    }

    #[test]
    fn test_rerun_is_idempotent() {
        for cfg in [diamond(), counted_loop()] {
            let mut analysis = DataFlowAnalysis::new(&cfg);
            analysis.compute_reaching_definitions();
            analysis.compute_live_variables();
            let reaching = analysis.reaching_definitions().clone();
            let live = analysis.live_variables().clone();

            assert_eq!(analysis.compute_reaching_definitions(), 1);
            assert_eq!(analysis.compute_live_variables(), 1);
            assert_eq!(analysis.reaching_definitions(), &reaching);
            assert_eq!(analysis.live_variables(), &live);
        }
    }

    #[test]
    fn test_type_rules() {
        let mut call = insn(0x18, "call8", &["gpio_set_level"]);
        call.set_comment("ESP32 GPIO API: gpio_set_level");
        let cfg = ControlFlowGraph::from_instructions(&[
            insn(0x0, "l8ui", &["a2", "a3", "0"]),
            insn(0x4, "l32i", &["a4", "a5", "8"]),
            insn(0x8, "add.s", &["a6", "a7", "a8"]),
            insn(0xc, "bne", &["a9", "a10", "0x14"]),
            insn(0x10, "movi", &["a11", "1"]),
            insn(0x14, "entry", &["a1", "32"]),
            call,
        ]);
        let mut analysis = DataFlowAnalysis::new(&cfg);
        let types = analysis.infer_types();

        assert_eq!(types["a4"], "uint32_t");
        assert_eq!(types["a5"], "uint32_t*");
        assert_eq!(types["a6"], "float");
        assert_eq!(types["a9"], "bool");
        assert_eq!(types["a11"], "int");
        // call8 passes the pin in a10
        assert_eq!(types["a10"], "gpio_num_t");
        assert_eq!(types["a2"], "uint8_t");
        assert_eq!(types["a3"], "int");
        assert_eq!(types["a1"], "int");
    }

    #[test]
    fn test_gpio_pin_register_depends_on_call_window() {
        let mut call0 = insn(0x4, "call0", &["gpio_set_level"]);
        call0.set_comment("ESP32 GPIO API: gpio_set_level");
        let mut call12 = insn(0xc, "call12", &["gpio_set_direction"]);
        call12.set_comment("ESP32 GPIO API: gpio_set_direction");
        let cfg = ControlFlowGraph::from_instructions(&[
            insn(0x0, "movi", &["a2", "5"]),
            call0,
            insn(0x8, "movi", &["a14", "4"]),
            call12,
        ]);
        let mut analysis = DataFlowAnalysis::new(&cfg);
        let types = analysis.infer_types();

        assert_eq!(types["a2"], "gpio_num_t");
        assert_eq!(types["a14"], "gpio_num_t");
        assert!(!types.contains_key("a10"));
    }

    #[test]
    fn test_bool_only_when_untyped() {
        let cfg = ControlFlowGraph::from_instructions(&[
            insn(0x0, "movi", &["a2", "1"]),
            insn(0x4, "beqz", &["a2", "0x8"]),
            insn(0x8, "ret", &[]),
        ]);
        let mut analysis = DataFlowAnalysis::new(&cfg);
        assert_eq!(analysis.infer_types()["a2"], "int");
    }

    #[test]
    fn test_analyze_stores_results_on_graph() {
        let mut cfg = diamond();
        let types = analyze(&mut cfg);
        assert_eq!(cfg.reaching_definitions.in_sets.len(), cfg.block_count());
        assert_eq!(cfg.live_variables.out_sets.len(), cfg.block_count());
        assert_eq!(types["a2"], "int");
    }

    #[test]
    fn test_empty_graph() {
        let cfg = ControlFlowGraph::default();
        let mut analysis = DataFlowAnalysis::new(&cfg);
        assert_eq!(analysis.compute_reaching_definitions(), 1);
        assert!(analysis.infer_types().is_empty());
    }
}
