//! Idiom recognition over short instruction windows.
//!
//! Two tiers, tried in order: registered exact mnemonic sequences (first
//! registered wins), then a few hard-coded shapes keyed on the annotation of
//! the last instruction.

use crate::{parse_address, Instruction};

/// A fixed mnemonic sequence and the statement it stands for.
///
/// The replacement may reference window operands as `{i.j}` (operand `j` of
/// instruction `i`); a reference that does not resolve rejects the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub mnemonics: Vec<String>,
    pub replacement: String,
}

impl Pattern {
    pub fn new(mnemonics: &[&str], replacement: &str) -> Self {
        Self {
            mnemonics: mnemonics.iter().map(|m| m.to_string()).collect(),
            replacement: replacement.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.mnemonics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mnemonics.is_empty()
    }

    fn matches(&self, window: &[Instruction]) -> bool {
        !self.is_empty()
            && window.len() >= self.len()
            && self
                .mnemonics
                .iter()
                .zip(window)
                .all(|(m, insn)| *m == insn.mnemonic)
    }

    fn render(&self, window: &[Instruction]) -> Option<String> {
        let mut out = String::with_capacity(self.replacement.len());
        let mut rest = self.replacement.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let close = open + rest[open..].find('}')?;
            let (insn, operand) = rest[open + 1..close].split_once('.')?;
            let insn: usize = insn.parse().ok()?;
            let operand: usize = operand.parse().ok()?;
            out.push_str(window.get(insn)?.operands.get(operand)?);
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        Some(out)
    }
}

/// Ordered pattern library plus the built-in shape rules.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
}

impl PatternMatcher {
    /// Empty library; only the shape rules apply
    pub fn new() -> Self {
        Self::default()
    }

    /// Library preloaded with common idioms
    pub fn with_default_idioms() -> Self {
        let mut matcher = Self::new();
        // Read-modify-write of a memory word
        matcher.register_pattern(&["l32i", "addi", "s32i"], "*({0.1} + {0.2}) += {1.2};");
        matcher
    }

    /// Append a pattern; earlier registrations take priority.
    pub fn register_pattern(&mut self, mnemonics: &[&str], replacement: &str) {
        self.patterns.push(Pattern::new(mnemonics, replacement));
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Statement for the instructions at the start of `window`, if any
    /// idiom matches.
    pub fn match_pattern(&self, window: &[Instruction]) -> Option<String> {
        self.match_window(window).map(|(statement, _)| statement)
    }

    /// Like [`Self::match_pattern`], also returning how many instructions
    /// the statement replaces.
    pub fn match_window(&self, window: &[Instruction]) -> Option<(String, usize)> {
        for pattern in &self.patterns {
            if !pattern.matches(window) {
                continue;
            }
            if let Some(statement) = pattern.render(window) {
                return Some((statement, pattern.len()));
            }
        }
        match_gpio_call(window)
            .or_else(|| match_register_write(window))
            .or_else(|| match_primitive_call(window))
    }
}

fn is_load_immediate(insn: &Instruction) -> bool {
    matches!(insn.mnemonic.as_str(), "movi" | "l32r") && insn.operands.len() >= 2
}

fn register_index(operand: &str) -> u32 {
    operand
        .strip_prefix('a')
        .and_then(|index| index.parse().ok())
        .unwrap_or(u32::MAX)
}

fn comment_contains(insn: &Instruction, needle: &str) -> bool {
    insn.comment()
        .map(|c| c.to_ascii_lowercase().contains(needle))
        .unwrap_or(false)
}

/// movi; movi; call <gpio api>  ->  name(pin, level);
fn match_gpio_call(window: &[Instruction]) -> Option<(String, usize)> {
    let [first, second, call, ..] = window else {
        return None;
    };
    if !is_load_immediate(first) || !is_load_immediate(second) || !call.is_call() {
        return None;
    }
    if !comment_contains(call, "gpio") {
        return None;
    }

    // Arguments in register order
    let (a, b) = if register_index(&first.operands[0]) <= register_index(&second.operands[0]) {
        (first, second)
    } else {
        (second, first)
    };
    let name = call.display_name().unwrap_or("gpio_set_level");
    Some((
        format!("{}({}, {});", name, a.operands[1], b.operands[1]),
        3,
    ))
}

/// movi/l32r; s8i/s32i <register>  ->  REG_WRITE(address, value);
fn match_register_write(window: &[Instruction]) -> Option<(String, usize)> {
    let [load, store, ..] = window else {
        return None;
    };
    if !is_load_immediate(load) || !store.is_store() || store.operands.len() < 3 {
        return None;
    }
    if !comment_contains(store, "register") {
        return None;
    }

    let loaded = &load.operands[0];
    let immediate = &load.operands[1];
    let (value, base, offset) = (&store.operands[0], &store.operands[1], &store.operands[2]);

    let statement = if base == loaded {
        match (parse_address(immediate), parse_address(offset)) {
            (Some(imm), Some(off)) => {
                format!("REG_WRITE(0x{:08x}, {});", imm.wrapping_add(off), value)
            }
            _ => format!("REG_WRITE({} + {}, {});", immediate, offset, value),
        }
    } else if value == loaded {
        format!("REG_WRITE({} + {}, {});", base, offset, immediate)
    } else {
        format!("REG_WRITE({} + {}, {});", base, offset, value)
    };
    Some((statement, 2))
}

/// movi/l32r; call <delay|print|connect>  ->  name(imm); / name();
fn match_primitive_call(window: &[Instruction]) -> Option<(String, usize)> {
    let [load, call, ..] = window else {
        return None;
    };
    if !is_load_immediate(load) || !call.is_call() {
        return None;
    }

    let argument = &load.operands[1];
    let statement = if comment_contains(call, "delay") {
        format!("{}({});", call.display_name().unwrap_or("delay"), argument)
    } else if comment_contains(call, "print") {
        format!("{}({});", call.display_name().unwrap_or("printf"), argument)
    } else if comment_contains(call, "connect") {
        format!("{}();", call.display_name().unwrap_or("wifi_connect"))
    } else {
        return None;
    };
    Some((statement, 2))
}
