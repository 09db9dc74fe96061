//! C-like pseudo-code generation.
//!
//! The walk over the CFG is depth-first from the entry block, driven by an
//! explicit work stack. A block is emitted at most once; reaching it again
//! emits a comment naming the block instead.

use std::collections::HashSet;
use std::fmt::Write;

use crate::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::Function;
use crate::patterns::PatternMatcher;
use crate::{parse_address, Instruction};

const INDENT: &str = "    ";

enum Task {
    Block { id: BlockId, depth: usize },
    Line { text: String, depth: usize },
}

/// Renders functions as pseudo-code, consulting a pattern library first.
#[derive(Debug, Clone, Copy)]
pub struct CodeGenerator<'a> {
    matcher: &'a PatternMatcher,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(matcher: &'a PatternMatcher) -> Self {
        Self { matcher }
    }

    /// Full function: annotations, signature, locals and body.
    pub fn generate_pseudo_code(&self, function: &Function) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "// {} @ 0x{:08x}-0x{:08x}",
            function.name, function.start_address, function.end_address
        );
        if function.is_isr {
            out.push_str("// ISR\n");
        }
        if function.is_task {
            match function.task_priority {
                Some(priority) => {
                    let _ = writeln!(out, "// FreeRTOS task (priority {})", priority);
                }
                None => out.push_str("// FreeRTOS task\n"),
            }
        }

        let params = if function.parameters.is_empty() {
            "void".to_string()
        } else {
            function
                .parameters
                .iter()
                .map(|p| format!("{} {}", p.ty, p.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(out, "{} {}({}) {{", function.return_type, function.name, params);

        for local in &function.local_variables {
            let _ = writeln!(out, "{}{} {};", INDENT, local.ty, local.name);
        }
        if !function.local_variables.is_empty() {
            out.push('\n');
        }

        let returns_value = function.return_type != "void";
        for line in self.structured_lines(&function.cfg, returns_value, 1) {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }

    /// Body statements of `cfg`, one per line, without a function wrapper.
    pub fn generate_structured_code(&self, cfg: &ControlFlowGraph) -> String {
        self.structured_lines(cfg, false, 0).join("\n")
    }

    fn structured_lines(
        &self,
        cfg: &ControlFlowGraph,
        returns_value: bool,
        base_depth: usize,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        let Some(entry) = cfg.entry_block else {
            lines.push(indented(base_depth, "// no code"));
            return lines;
        };

        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut stack = vec![Task::Block {
            id: entry,
            depth: base_depth,
        }];

        while let Some(task) = stack.pop() {
            let (id, depth) = match task {
                Task::Line { text, depth } => {
                    lines.push(indented(depth, &text));
                    continue;
                }
                Task::Block { id, depth } => (id, depth),
            };
            let Some(block) = cfg.block(id) else {
                continue;
            };
            if !visited.insert(id) {
                lines.push(indented(
                    depth,
                    &format!("// continues at 0x{:08x}", block.start_address),
                ));
                continue;
            }

            let terminator = block.terminator().filter(|t| t.is_control_flow());
            let body_len = block.instructions.len() - usize::from(terminator.is_some());
            self.emit_body(&block.instructions[..body_len], depth, &mut lines);

            let Some(last) = terminator else {
                // Fall-through or returning call
                if let Some(&next) = block.successors.first() {
                    stack.push(Task::Block { id: next, depth });
                }
                continue;
            };

            if last.is_return() {
                let text = if returns_value { "return a2;" } else { "return;" };
                lines.push(indented(depth, text));
            } else if last.is_branch() {
                let condition = branch_condition(last);
                match block.successors.as_slice() {
                    [taken, fall_through] => {
                        // Pushed in reverse emission order
                        stack.push(Task::Line { text: "}".to_string(), depth });
                        stack.push(Task::Block { id: *fall_through, depth: depth + 1 });
                        stack.push(Task::Line { text: "} else {".to_string(), depth });
                        stack.push(Task::Block { id: *taken, depth: depth + 1 });
                        lines.push(indented(depth, &format!("if ({}) {{", condition)));
                    }
                    [only] => {
                        lines.push(indented(depth, &format!("// if ({})", condition)));
                        stack.push(Task::Block { id: *only, depth });
                    }
                    _ => lines.push(indented(depth, &format!("if ({}) return;", condition))),
                }
            } else {
                let target = last.branch_target().and_then(|t| cfg.block_at(t));
                match target {
                    Some(target) if cfg.blocks[target].start_address <= block.start_address => {
                        lines.push(indented(depth, "while (true) {"));
                        stack.push(Task::Line { text: "}".to_string(), depth });
                        stack.push(Task::Block { id: target, depth: depth + 1 });
                    }
                    Some(target) => stack.push(Task::Block { id: target, depth }),
                    None => {
                        if let Some(text) = translate_instruction(last) {
                            lines.push(indented(depth, &text));
                        }
                    }
                }
            }
        }

        lines
    }

    fn emit_body(&self, body: &[Instruction], depth: usize, lines: &mut Vec<String>) {
        let mut i = 0;
        while i < body.len() {
            if let Some((statement, consumed)) = self.matcher.match_window(&body[i..]) {
                lines.push(indented(depth, &statement));
                i += consumed.max(1);
                continue;
            }

            let insn = &body[i];
            if let Some(mut text) = translate_instruction(insn) {
                if let Some(comment) = insn.comment().filter(|_| !insn.is_call()) {
                    let _ = write!(text, "  // {}", comment);
                }
                lines.push(indented(depth, &text));
            }
            i += 1;
        }
    }
}

fn indented(depth: usize, text: &str) -> String {
    format!("{}{}", INDENT.repeat(depth), text)
}

fn operand(insn: &Instruction, index: usize) -> &str {
    insn.operands.get(index).map(|s| s.as_str()).unwrap_or("?")
}

/// `base + offset`, or just `base` for a zero offset
fn address_expr(base: &str, offset: &str) -> String {
    if parse_address(offset) == Some(0) {
        base.to_string()
    } else {
        format!("{} + {}", base, offset)
    }
}

/// Condition under which a conditional branch is taken.
pub fn branch_condition(insn: &Instruction) -> String {
    let a = operand(insn, 0);
    let b = operand(insn, 1);
    match insn.mnemonic.as_str() {
        "beq" => format!("{} == {}", a, b),
        "bne" => format!("{} != {}", a, b),
        "blt" => format!("{} < {}", a, b),
        "bge" => format!("{} >= {}", a, b),
        "bltu" => format!("(unsigned){} < (unsigned){}", a, b),
        "bgeu" => format!("(unsigned){} >= (unsigned){}", a, b),
        "beqz" => format!("{} == 0", a),
        "bnez" => format!("{} != 0", a),
        _ => format!("{} == {}", a, b),
    }
}

/// Statement for a single instruction.
///
/// Returns `None` for instructions with no source-level effect (`nop`,
/// `entry`). Unknown mnemonics come back as a comment holding the
/// instruction text.
pub fn translate_instruction(insn: &Instruction) -> Option<String> {
    let d = operand(insn, 0);
    let s = operand(insn, 1);
    let t = operand(insn, 2);

    let binary = |op: &str| format!("{} = {} {} {};", d, s, op, t);
    let text = match insn.mnemonic.as_str() {
        "nop" | "entry" => return None,
        "add" | "add.s" => binary("+"),
        "sub" | "sub.s" => binary("-"),
        "mull" | "mul.s" => binary("*"),
        "div.s" => binary("/"),
        "and" => binary("&"),
        "or" => binary("|"),
        "xor" => binary("^"),
        "sll" | "slli" => binary("<<"),
        "srl" | "srli" => binary(">>"),
        "addi" => match t.strip_prefix('-') {
            Some(magnitude) => format!("{} = {} - {};", d, s, magnitude),
            None => binary("+"),
        },
        "neg" => format!("{} = -{};", d, s),
        "mov" | "movi" | "l32r" => format!("{} = {};", d, s),
        "l8ui" | "l32i" => format!("{} = *({});", d, address_expr(s, t)),
        "s8i" | "s32i" => format!("*({}) = {};", address_expr(s, t), d),
        "call0" | "call4" | "call8" | "call12" => match insn.display_name() {
            Some(name) => format!("{}();", name),
            None => match insn.branch_target() {
                Some(target) => format!("func_{:08x}();", target),
                None => format!("(*{})();", d),
            },
        },
        "callx0" | "callx8" => format!("(*{})();", d),
        "ret" | "retw" | "rfe" => "return;".to_string(),
        "j" => format!("goto {};", d),
        "jx" => format!("goto *{};", d),
        "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" | "beqz" | "bnez" => {
            format!(
                "if ({}) goto {};",
                branch_condition(insn),
                insn.operands.last().map(|s| s.as_str()).unwrap_or("?")
            )
        }
        "memw" => "memory_barrier();".to_string(),
        "waiti" => "wait_for_interrupt();".to_string(),
        _ => {
            if insn.operands.is_empty() {
                format!("// {}", insn.mnemonic)
            } else {
                format!("// {} {}", insn.mnemonic, insn.operands.join(", "))
            }
        }
    };
    Some(text)
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

    fn generate(listing: &[Instruction]) -> String {
        let matcher = PatternMatcher::new();
        let cfg = ControlFlowGraph::from_instructions(listing);
        CodeGenerator::new(&matcher).generate_structured_code(&cfg)
    }

    #[test]
    fn test_straight_line() {
        let code = generate(&[
            insn(0x0, "movi", &["a2", "10"]),
            insn(0x4, "add", &["a2", "a2", "a4"]),
            insn(0x8, "ret", &[]),
        ]);
        assert_eq!(code, "a2 = 10;\na2 = a2 + a4;\nreturn;");
    }

    #[test]
    fn test_if_else() {
        let code = generate(&[
            insn(0x0, "movi", &["a2", "10"]),
            insn(0x4, "bne", &["a2", "a3", "0x10"]),
            insn(0x8, "add", &["a2", "a2", "a4"]),
            insn(0xc, "j", &["0x14"]),
            insn(0x10, "sub", &["a2", "a2", "a4"]),
            insn(0x14, "ret", &[]),
        ]);
        assert!(code.contains("if (a2 != a3) {"));
        assert!(code.contains("} else {"));
        assert!(code.contains("a2 = a2 - a4;"));
        assert!(code.contains("a2 = a2 + a4;"));
        // The join block is emitted once
        assert_eq!(code.matches("return;").count(), 1);
    }

    #[test]
    fn test_backward_jump_is_bounded_loop() {
        let code = generate(&[
            insn(0x0, "movi", &["a2", "0"]),
            insn(0x4, "addi", &["a2", "a2", "1"]),
            insn(0x8, "call8", &["vTaskDelay"]),
            insn(0xc, "j", &["0x4"]),
        ]);
        assert_eq!(code.matches("while (true) {").count(), 1);
        assert!(code.contains("vTaskDelay();"));
        assert!(code.lines().count() < 10);
    }

    #[test]
    fn test_self_loop_terminates() {
        let code = generate(&[insn(0x0, "j", &["0x0"])]);
        assert_eq!(code, "while (true) {\n    // continues at 0x00000000\n}");
    }

    #[test]
    fn test_patterns_take_precedence() {
        let mut matcher = PatternMatcher::new();
        matcher.register_pattern(&["movi", "s32i"], "A();");
        let cfg = ControlFlowGraph::from_instructions(&[
            insn(0x0, "movi", &["a2", "1"]),
            insn(0x4, "s32i", &["a2", "a3", "0"]),
            insn(0x8, "nop", &[]),
            insn(0xc, "ret", &[]),
        ]);
        let code = CodeGenerator::new(&matcher).generate_structured_code(&cfg);
        assert_eq!(code, "A();\nreturn;");
    }

    #[test]
    fn test_translate_table() {
        let cases = [
            (insn(0, "sub", &["a2", "a3", "a4"]), Some("a2 = a3 - a4;")),
            (insn(0, "addi", &["a2", "a3", "-1"]), Some("a2 = a3 - 1;")),
            (insn(0, "slli", &["a2", "a3", "4"]), Some("a2 = a3 << 4;")),
            (insn(0, "l32i", &["a2", "a3", "8"]), Some("a2 = *(a3 + 8);")),
            (insn(0, "s8i", &["a2", "a3", "0"]), Some("*(a3) = a2;")),
            (insn(0, "call0", &["0x400d0100"]), Some("func_400d0100();")),
            (insn(0, "callx8", &["a8"]), Some("(*a8)();")),
            (insn(0, "rfe", &[]), Some("return;")),
            (insn(0, "entry", &["a1", "32"]), None),
            (insn(0, "nop", &[]), None),
            (insn(0, "wsr", &["a2", "ps"]), Some("// wsr a2, ps")),
            (insn(0, "add", &[]), Some("? = ? + ?;")),
        ];
        for (insn, expected) in cases {
            assert_eq!(translate_instruction(&insn).as_deref(), expected, "{}", insn);
        }
    }

    #[test]
    fn test_call_prefers_annotation() {
        let mut call = insn(0, "call8", &["0x4000d080"]);
        call.set_comment("FreeRTOS Task API: vTaskDelay");
        assert_eq!(translate_instruction(&call).as_deref(), Some("vTaskDelay();"));
    }

    #[test]
    fn test_branch_polarity() {
        let cases = [
            ("beq", "a2 == a3"),
            ("bge", "a2 >= a3"),
            ("bltu", "(unsigned)a2 < (unsigned)a3"),
        ];
        for (mnemonic, expected) in cases {
            assert_eq!(branch_condition(&insn(0, mnemonic, &["a2", "a3", "0x10"])), expected);
        }
        assert_eq!(branch_condition(&insn(0, "bnez", &["a5", "0x10"])), "a5 != 0");
    }

    #[test]
    fn test_empty_cfg() {
        assert_eq!(generate(&[]), "// no code");
    }
}
