//! Decoder for the fixed-width 32-bit firmware encoding.
//!
//! Word layout (little-endian):
//!
//! ```text
//!  31        24 23  20 19  16 15  12 11   8 7    4 3    0
//! +------------+------+------+------+------+------+------+
//! |            |  op2 |  op1 |   r  |   s  |   t  |  op0 |
//! +------------+------+------+------+------+------+------+
//!                 imm8 = bits 16..24     offset24 = bits 8..32
//! ```
//!
//! `op0` selects the format, a secondary nibble (`op1`, `r` or `t` depending
//! on the format) selects the operation. Branch, jump, call and literal
//! targets are resolved here: `address + 4 + sext(offset) * 4`.

use std::collections::HashMap;
use std::fmt;

use crate::arch::ArchitectureConfig;
use crate::{Address, Decoder, Instruction, INSTRUCTION_WIDTH, NOP_MNEMONIC};

/// Why a word could not be decoded. Never surfaced to callers of
/// [`Decoder::decode`], which degrade to a `nop` placeholder instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Address lies outside the loaded image
    #[error("Address 0x{0:08x} is outside the image bounds")]
    OutOfRange(Address),

    /// Address is not word aligned
    #[error("Address 0x{0:08x} is not word aligned")]
    Misaligned(Address),

    /// Fewer than four bytes remain at the address
    #[error("Truncated instruction word at 0x{0:08x}")]
    Truncated(Address),
}

/// Stateless decoder bound to one architecture descriptor.
#[derive(Debug, Clone)]
pub struct FirmwareDecoder {
    flash_base: Address,
    symbols: HashMap<Address, String>,
}

impl FirmwareDecoder {
    /// Build a decoder for `arch`, indexing its known-function table by address.
    pub fn new(arch: &ArchitectureConfig) -> Self {
        let symbols = arch
            .known_functions
            .iter()
            .map(|(name, &addr)| (addr, name.clone()))
            .collect();
        Self {
            flash_base: arch.flash_base,
            symbols,
        }
    }

    pub fn flash_base(&self) -> Address {
        self.flash_base
    }

    /// Read the little-endian word at `address`.
    pub fn read_word(&self, image: &[u8], address: Address) -> Result<u32, DecodeError> {
        if address % INSTRUCTION_WIDTH != 0 {
            return Err(DecodeError::Misaligned(address));
        }
        let offset = address
            .checked_sub(self.flash_base)
            .ok_or(DecodeError::OutOfRange(address))? as usize;
        if offset >= image.len() {
            return Err(DecodeError::OutOfRange(address));
        }
        let bytes = image
            .get(offset..offset + 4)
            .ok_or(DecodeError::Truncated(address))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decode with the failure reason preserved.
    pub fn try_decode(&self, image: &[u8], address: Address) -> Result<Instruction, DecodeError> {
        let word = self.read_word(image, address)?;
        Ok(self.decode_word(image, address, word))
    }

    /// Decode an already-fetched word. Unknown encodings become `nop`.
    pub fn decode_word(&self, image: &[u8], address: Address, word: u32) -> Instruction {
        if word == 0 {
            return Instruction::new(address, 0, NOP_MNEMONIC, Vec::new());
        }

        let op0 = word & 0xf;
        let t = (word >> 4) & 0xf;
        let s = (word >> 8) & 0xf;
        let r = (word >> 12) & 0xf;
        let op1 = (word >> 16) & 0xf;
        let imm8 = (word >> 16) & 0xff;

        let decoded: Option<(&str, Vec<String>)> = match op0 {
            0x0 => {
                let name = match op1 {
                    0x0 => "add",
                    0x1 => "sub",
                    0x2 => "and",
                    0x3 => "or",
                    0x4 => "xor",
                    0x5 => "mull",
                    0x6 => "sll",
                    0x7 => "srl",
                    0x8 => "neg",
                    0x9 => "mov",
                    _ => "",
                };
                match name {
                    "" => None,
                    "neg" => Some((name, vec![reg(r), reg(t)])),
                    "mov" => Some((name, vec![reg(r), reg(s)])),
                    _ => Some((name, vec![reg(r), reg(s), reg(t)])),
                }
            }
            0x1 => {
                // l32r: literal lives before or after the code, value shown when readable
                let offset = sign_extend((word >> 8) & 0xffff, 16);
                let literal = relative_target(address, offset);
                let shown = self.read_word(image, literal).unwrap_or(literal);
                Some(("l32r", vec![reg(t), hex(shown)]))
            }
            0x2 => match r {
                0x0 => Some(("l8ui", vec![reg(t), reg(s), imm8.to_string()])),
                0x2 => Some(("l32i", vec![reg(t), reg(s), (imm8 * 4).to_string()])),
                0x4 => Some(("s8i", vec![reg(t), reg(s), imm8.to_string()])),
                0x6 => Some(("s32i", vec![reg(t), reg(s), (imm8 * 4).to_string()])),
                0x8 => Some(("slli", vec![reg(t), reg(s), (imm8 & 0x1f).to_string()])),
                0x9 => Some(("srli", vec![reg(t), reg(s), (imm8 & 0x1f).to_string()])),
                0xa => {
                    let imm12 = sign_extend((s << 8) | imm8, 12);
                    Some(("movi", vec![reg(t), imm12.to_string()]))
                }
                0xc => {
                    let imm = sign_extend(imm8, 8);
                    Some(("addi", vec![reg(t), reg(s), imm.to_string()]))
                }
                _ => None,
            },
            0x5 => {
                let name = match t {
                    0x0 => "call0",
                    0x1 => "call4",
                    0x2 => "call8",
                    0x3 => "call12",
                    _ => "",
                };
                if name.is_empty() {
                    None
                } else {
                    let target = relative_target(address, sign_extend(word >> 8, 24));
                    Some((name, vec![self.target_operand(target)]))
                }
            }
            0x6 => match t {
                0x0 => {
                    let target = relative_target(address, sign_extend(word >> 8, 24));
                    Some(("j", vec![self.target_operand(target)]))
                }
                0x3 => {
                    let frame = ((word >> 12) & 0xfff) * 8;
                    Some(("entry", vec![reg(s), frame.to_string()]))
                }
                _ => None,
            },
            0x7 => {
                let target = relative_target(address, sign_extend(imm8, 8));
                let target = self.target_operand(target);
                match r {
                    0x0 => Some(("beq", vec![reg(s), reg(t), target])),
                    0x1 => Some(("bne", vec![reg(s), reg(t), target])),
                    0x2 => Some(("blt", vec![reg(s), reg(t), target])),
                    0x3 => Some(("bge", vec![reg(s), reg(t), target])),
                    0x4 => Some(("bltu", vec![reg(s), reg(t), target])),
                    0x5 => Some(("bgeu", vec![reg(s), reg(t), target])),
                    0x6 => Some(("beqz", vec![reg(s), target])),
                    0x7 => Some(("bnez", vec![reg(s), target])),
                    _ => None,
                }
            }
            0x8 => {
                let name = match op1 {
                    0x0 => "add.s",
                    0x1 => "sub.s",
                    0x2 => "mul.s",
                    0x3 => "div.s",
                    _ => "",
                };
                if name.is_empty() {
                    None
                } else {
                    Some((name, vec![reg(r), reg(s), reg(t)]))
                }
            }
            0xd => match t {
                0x0 => Some(("ret", Vec::new())),
                0x1 => Some(("retw", Vec::new())),
                0x2 => Some(("rfe", Vec::new())),
                0x3 => Some(("jx", vec![reg(s)])),
                0x4 => Some(("callx0", vec![reg(s)])),
                0x5 => Some(("callx8", vec![reg(s)])),
                0x6 => Some(("memw", Vec::new())),
                0x7 => Some(("waiti", vec![s.to_string()])),
                _ => None,
            },
            _ => None,
        };

        match decoded {
            Some((mnemonic, operands)) => Instruction::new(address, word, mnemonic, operands),
            None => {
                log::trace!("Unknown encoding 0x{:08x} at 0x{:08x}", word, address);
                Instruction::new(address, word, NOP_MNEMONIC, Vec::new())
            }
        }
    }

    /// Known symbol name for `target`, otherwise the numeric literal
    fn target_operand(&self, target: Address) -> String {
        self.symbols
            .get(&target)
            .cloned()
            .unwrap_or_else(|| hex(target))
    }
}

impl fmt::Display for FirmwareDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareDecoder@0x{:08x}", self.flash_base)
    }
}

impl Decoder for FirmwareDecoder {
    fn decode(&self, image: &[u8], address: Address) -> Instruction {
        match self.try_decode(image, address) {
            Ok(insn) => insn,
            Err(e) => {
                log::trace!("{}", e);
                Instruction::nop(address)
            }
        }
    }
}

/// Decode every word in `[start, end)`.
pub fn disassemble_range(
    decoder: &dyn Decoder,
    image: &[u8],
    start: Address,
    end: Address,
) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut at = start;
    while at < end {
        instructions.push(decoder.decode(image, at));
        at = match at.checked_add(INSTRUCTION_WIDTH) {
            Some(next) => next,
            None => break,
        };
    }
    instructions
}

fn reg(index: u32) -> String {
    format!("a{}", index)
}

fn hex(value: u32) -> String {
    format!("0x{:x}", value)
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn relative_target(address: Address, words: i32) -> Address {
    address
        .wrapping_add(INSTRUCTION_WIDTH)
        .wrapping_add((words as u32).wrapping_mul(4))
}

/// Instruction encoders used by tests to write listings instead of raw words.
#[cfg(test)]
pub(crate) mod asm {
    use crate::Address;

    fn rrr(op0: u32, op1: u32, r: u32, s: u32, t: u32) -> u32 {
        op0 | (t << 4) | (s << 8) | (r << 12) | (op1 << 16)
    }

    fn rri8(sub: u32, t: u32, s: u32, imm8: u32) -> u32 {
        0x2 | (t << 4) | (s << 8) | (sub << 12) | ((imm8 & 0xff) << 16)
    }

    fn words_between(from: Address, to: Address) -> u32 {
        (to.wrapping_sub(from).wrapping_sub(4) as i32 / 4) as u32
    }

    pub fn add(r: u32, s: u32, t: u32) -> u32 {
        rrr(0x0, 0x0, r, s, t)
    }

    pub fn sub(r: u32, s: u32, t: u32) -> u32 {
        rrr(0x0, 0x1, r, s, t)
    }

    pub fn mov(r: u32, s: u32) -> u32 {
        rrr(0x0, 0x9, r, s, 0)
    }

    pub fn add_s(r: u32, s: u32, t: u32) -> u32 {
        rrr(0x8, 0x0, r, s, t)
    }

    pub fn movi(t: u32, imm: i32) -> u32 {
        let imm = (imm as u32) & 0xfff;
        rri8(0xa, t, imm >> 8, imm & 0xff)
    }

    pub fn addi(t: u32, s: u32, imm: i32) -> u32 {
        rri8(0xc, t, s, imm as u32)
    }

    pub fn l8ui(t: u32, s: u32, off: u32) -> u32 {
        rri8(0x0, t, s, off)
    }

    pub fn l32i(t: u32, s: u32, off: u32) -> u32 {
        rri8(0x2, t, s, off / 4)
    }

    pub fn s8i(t: u32, s: u32, off: u32) -> u32 {
        rri8(0x4, t, s, off)
    }

    pub fn s32i(t: u32, s: u32, off: u32) -> u32 {
        rri8(0x6, t, s, off / 4)
    }

    pub fn l32r(t: u32, at: Address, literal: Address) -> u32 {
        0x1 | (t << 4) | ((words_between(at, literal) & 0xffff) << 8)
    }

    fn branch(sub: u32, s: u32, t: u32, at: Address, target: Address) -> u32 {
        0x7 | (t << 4) | (s << 8) | (sub << 12) | ((words_between(at, target) & 0xff) << 16)
    }

    pub fn beq(s: u32, t: u32, at: Address, target: Address) -> u32 {
        branch(0x0, s, t, at, target)
    }

    pub fn bne(s: u32, t: u32, at: Address, target: Address) -> u32 {
        branch(0x1, s, t, at, target)
    }

    pub fn blt(s: u32, t: u32, at: Address, target: Address) -> u32 {
        branch(0x2, s, t, at, target)
    }

    pub fn bnez(s: u32, at: Address, target: Address) -> u32 {
        branch(0x7, s, 0, at, target)
    }

    pub fn j(at: Address, target: Address) -> u32 {
        0x6 | ((words_between(at, target) & 0xff_ffff) << 8)
    }

    pub fn call0(at: Address, target: Address) -> u32 {
        0x5 | ((words_between(at, target) & 0xff_ffff) << 8)
    }

    pub fn call8(at: Address, target: Address) -> u32 {
        0x5 | (0x2 << 4) | ((words_between(at, target) & 0xff_ffff) << 8)
    }

    pub fn entry(s: u32, frame: u32) -> u32 {
        0x6 | (0x3 << 4) | (s << 8) | ((frame / 8) << 12)
    }

    pub fn ret() -> u32 {
        0xd
    }

    pub fn rfe() -> u32 {
        0xd | (0x2 << 4)
    }

    pub fn jx(s: u32) -> u32 {
        0xd | (0x3 << 4) | (s << 8)
    }

    pub fn nop() -> u32 {
        0
    }

    /// Little-endian image bytes for a word listing
    pub fn image(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
