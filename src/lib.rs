//! Core IR, traits and error type for the firmware decompiler.
//!
//! The decompiler takes a flat firmware image (no container format) mapped at
//! the flash base of an [`arch::ArchitectureConfig`], discovers functions,
//! recovers a control flow graph per function, runs dataflow and type
//! inference over it and finally emits C-like pseudo-code.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use firmware_decompiler::{arch::ArchitectureConfig, decompiler::Decompiler};
//!
//! let mut decompiler = Decompiler::new(ArchitectureConfig::esp32());
//! decompiler.load_firmware("firmware.bin").unwrap();
//!
//! // Runs every stage in order and returns the whole-image pseudo-code
//! let pseudo = decompiler.decompile_all(|percent, stage| {
//!     eprintln!("[{:>3}%] {}", percent, stage);
//! }).unwrap();
//! println!("{}", pseudo);
//!
//! for function in decompiler.functions() {
//!     println!("{} @ 0x{:08x}", function.name, function.start_address);
//! }
//! ```

pub mod arch;
pub mod cfg;
pub mod codegen;
pub mod dataflow;
pub mod decoder;
pub mod decompiler;
pub mod detect;
pub mod discovery;
pub mod format;
pub mod patterns;

use std::fmt;

use serde::Serialize;

/// Represents an address in the 32-bit virtual address space
pub type Address = u32;

/// Every instruction of the supported encoding is one 32-bit word
pub const INSTRUCTION_WIDTH: Address = 4;

/// Mnemonic of the placeholder produced for gaps and undecodable words
pub const NOP_MNEMONIC: &str = "nop";

const BRANCH_MNEMONICS: &[&str] = &[
    "beq", "bne", "blt", "bge", "bltu", "bgeu", "beqz", "bnez",
];
const JUMP_MNEMONICS: &[&str] = &["j", "jx"];
const CALL_MNEMONICS: &[&str] = &["call0", "call4", "call8", "call12", "callx0", "callx8"];
const RETURN_MNEMONICS: &[&str] = &["ret", "retw", "rfe"];
const STORE_MNEMONICS: &[&str] = &["s8i", "s32i"];

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// Address of the instruction
    pub address: Address,
    /// Raw 32-bit instruction word
    pub opcode: u32,
    /// Instruction mnemonic (e.g., "movi", "add")
    pub mnemonic: String,
    /// Operands: registers (`a2`), immediates (`10`), or resolved targets
    /// (`0x400d0010` / `gpio_set_level`)
    pub operands: Vec<String>,
    /// Annotation set by the API detection passes
    comment: Option<String>,
}

impl Instruction {
    /// Create a new instruction without annotation
    pub fn new(address: Address, opcode: u32, mnemonic: &str, operands: Vec<String>) -> Self {
        Self {
            address,
            opcode,
            mnemonic: mnemonic.to_string(),
            operands,
            comment: None,
        }
    }

    /// The placeholder returned for addresses outside the image
    pub fn nop(address: Address) -> Self {
        Self::new(address, 0, NOP_MNEMONIC, Vec::new())
    }

    /// Returns true for conditional branches
    pub fn is_branch(&self) -> bool {
        BRANCH_MNEMONICS.contains(&self.mnemonic.as_str())
    }

    /// Returns true for unconditional jumps (direct or indirect)
    pub fn is_jump(&self) -> bool {
        JUMP_MNEMONICS.contains(&self.mnemonic.as_str())
    }

    /// Returns true for calls (direct or indirect)
    pub fn is_call(&self) -> bool {
        CALL_MNEMONICS.contains(&self.mnemonic.as_str())
    }

    /// Returns true for return instructions, including return-from-interrupt
    pub fn is_return(&self) -> bool {
        RETURN_MNEMONICS.contains(&self.mnemonic.as_str())
    }

    /// Returns true for instructions that end structured code emission
    pub fn is_control_flow(&self) -> bool {
        self.is_branch() || self.is_jump() || self.is_return()
    }

    pub fn is_store(&self) -> bool {
        STORE_MNEMONICS.contains(&self.mnemonic.as_str())
    }

    pub fn is_nop(&self) -> bool {
        self.mnemonic == NOP_MNEMONIC
    }

    /// Resolved target of a direct branch, jump or call.
    ///
    /// The target is the last operand; it is parsed back with the tolerant
    /// [`parse_address`], so symbolic or malformed operands yield `None`.
    pub fn branch_target(&self) -> Option<Address> {
        if !(self.is_branch() || self.is_jump() || self.is_call()) {
            return None;
        }
        self.operands.last().and_then(|op| parse_address(op))
    }

    /// Attach an annotation. The first write wins; returns false if the
    /// instruction was already annotated.
    pub fn set_comment(&mut self, comment: impl Into<String>) -> bool {
        if self.comment.is_some() {
            return false;
        }
        self.comment = Some(comment.into());
        true
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Name used when rendering a call.
    ///
    /// Annotations have the shape `<class>: <name>`; the name part is
    /// preferred, then the symbolic call operand.
    pub fn display_name(&self) -> Option<&str> {
        if let Some(comment) = self.comment() {
            let name = comment.rsplit(": ").next().unwrap_or(comment).trim();
            if is_identifier(name) {
                return Some(name);
            }
        }
        self.operands
            .last()
            .map(|op| op.as_str())
            .filter(|op| is_identifier(op) && !is_register(op))
    }

    /// Stores and control transfers only read their register operands
    fn writes_first_operand(&self) -> bool {
        !(self.is_store() || self.is_branch() || self.is_jump() || self.is_call())
    }

    /// Variable defined by this instruction (the first register operand)
    pub fn defined_operand(&self) -> Option<&str> {
        if !self.writes_first_operand() {
            return None;
        }
        self.operands
            .first()
            .map(|op| op.as_str())
            .filter(|op| is_register(op))
    }

    /// Variables used by this instruction (register operands after the
    /// definition)
    pub fn used_operands(&self) -> impl Iterator<Item = &str> {
        let skip = usize::from(self.writes_first_operand());
        self.operands
            .iter()
            .skip(skip)
            .map(|op| op.as_str())
            .filter(|op| is_register(op))
    }

    /// Register holding argument `index` at this call site.
    ///
    /// Windowed calls rotate the register file by the window size, so the
    /// caller places arguments from `a(2 + window)` upwards.
    pub fn argument_register(&self, index: usize) -> Option<String> {
        let window = match self.mnemonic.as_str() {
            "call0" | "callx0" => 0,
            "call4" => 4,
            "call8" | "callx8" => 8,
            "call12" => 12,
            _ => return None,
        };
        Some(format!("a{}", 2 + window + index))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{}\t{}", self.mnemonic, self.operands.join(", "))
        }
    }
}

/// Decoder trait: turns the word at `address` into an [`Instruction`].
///
/// Decoding is total: addresses outside the image and unknown encodings
/// degrade to a `nop` placeholder instead of failing.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction at `address`.
    ///
    /// # Arguments
    /// * `image` - The firmware image, mapped at the flash base
    /// * `address` - Virtual address of the instruction
    fn decode(&self, image: &[u8], address: Address) -> Instruction;
}

/// Tolerant integer parse for operand text.
///
/// Accepts `0x`-prefixed hex, plain decimal and negative decimal (wrapped to
/// 32 bits). Anything else, including symbol names, returns `None`.
pub fn parse_address(text: &str) -> Option<Address> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(negative) = text.strip_prefix('-') {
        return negative.parse::<u32>().ok().map(|v| v.wrapping_neg());
    }
    text.parse::<u32>().ok()
}

/// Returns true for register operands (`a0`..`a15`)
pub fn is_register(operand: &str) -> bool {
    operand
        .strip_prefix('a')
        .map(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Error type for decompiler operations
#[derive(Debug, thiserror::Error)]
pub enum DecompilerError {
    /// I/O error (firmware or config file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid architecture descriptor
    #[error("Invalid architecture configuration: {0}")]
    Config(String),

    /// Output formatting failed
    #[error("Formatting error: {0}")]
    Format(String),

    /// A stage was invoked before its prerequisites
    #[error("Invalid decompiler state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(mnemonic: &str, operands: &[&str]) -> Instruction {
        Instruction::new(
            0x1000,
            0,
            mnemonic,
            operands.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_classification() {
        assert!(insn("beq", &["a2", "a3", "0x1010"]).is_branch());
        assert!(insn("j", &["0x1000"]).is_jump());
        assert!(insn("call8", &["gpio_set_level"]).is_call());
        assert!(insn("ret", &[]).is_return());
        assert!(insn("rfe", &[]).is_return());

        let add = insn("add", &["a2", "a3", "a4"]);
        assert!(!add.is_branch() && !add.is_jump() && !add.is_call() && !add.is_return());
        assert!(!insn("call0", &["0x1000"]).is_control_flow());
    }

    #[test]
    fn test_branch_target() {
        assert_eq!(insn("beq", &["a2", "a3", "0x1010"]).branch_target(), Some(0x1010));
        assert_eq!(insn("call8", &["gpio_set_level"]).branch_target(), None);
        assert_eq!(insn("jx", &["a3"]).branch_target(), None);
        assert_eq!(insn("movi", &["a2", "16"]).branch_target(), None);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x400d0010"), Some(0x400d0010));
        assert_eq!(parse_address(" 42 "), Some(42));
        assert_eq!(parse_address("-4"), Some(0xffff_fffc));
        assert_eq!(parse_address("gpio_set_level"), None);
        assert_eq!(parse_address("0xzz"), None);
        assert_eq!(parse_address(""), None);
    }

    #[test]
    fn test_comment_first_write_wins() {
        let mut call = insn("call8", &["gpio_set_level"]);
        assert!(call.set_comment("ESP32 GPIO API: gpio_set_level"));
        assert!(!call.set_comment("something else"));
        assert_eq!(call.comment(), Some("ESP32 GPIO API: gpio_set_level"));
        assert_eq!(call.display_name(), Some("gpio_set_level"));
    }

    #[test]
    fn test_display_name_falls_back_to_symbol() {
        assert_eq!(insn("call0", &["app_main"]).display_name(), Some("app_main"));
        assert_eq!(insn("call0", &["0x400d0100"]).display_name(), None);
        assert_eq!(insn("callx0", &["a8"]).display_name(), None);
    }

    #[test]
    fn test_defs_and_uses() {
        let add = insn("add", &["a2", "a3", "a4"]);
        assert_eq!(add.defined_operand(), Some("a2"));
        assert_eq!(add.used_operands().collect::<Vec<_>>(), vec!["a3", "a4"]);

        let movi = insn("movi", &["a5", "10"]);
        assert_eq!(movi.defined_operand(), Some("a5"));
        assert_eq!(movi.used_operands().count(), 0);

        let call = insn("call8", &["gpio_set_level"]);
        assert_eq!(call.defined_operand(), None);

        let store = insn("s32i", &["a3", "a4", "8"]);
        assert_eq!(store.defined_operand(), None);
        assert_eq!(store.used_operands().collect::<Vec<_>>(), vec!["a3", "a4"]);

        let branch = insn("bne", &["a2", "a3", "0x1010"]);
        assert_eq!(branch.defined_operand(), None);
        assert_eq!(branch.used_operands().count(), 2);
    }

    #[test]
    fn test_argument_registers_follow_call_window() {
        assert_eq!(insn("call0", &["f"]).argument_register(0).as_deref(), Some("a2"));
        assert_eq!(insn("call4", &["f"]).argument_register(0).as_deref(), Some("a6"));
        assert_eq!(insn("call8", &["f"]).argument_register(1).as_deref(), Some("a11"));
        assert_eq!(insn("callx8", &["a8"]).argument_register(4).as_deref(), Some("a14"));
        assert_eq!(insn("call12", &["f"]).argument_register(0).as_deref(), Some("a14"));
        assert_eq!(insn("movi", &["a2", "1"]).argument_register(0), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(insn("movi", &["a2", "10"]).to_string(), "movi\ta2, 10");
        assert_eq!(insn("ret", &[]).to_string(), "ret");
    }
}
