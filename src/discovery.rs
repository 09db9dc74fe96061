//! Function discovery: candidate collection and bounding.

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::arch::ArchitectureConfig;
use crate::{Address, Decoder, Instruction, INSTRUCTION_WIDTH};

/// Maximum number of reset-vector trampolines followed from the entry
pub const MAX_ENTRY_HOPS: usize = 4;

/// Range and name of one discovered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBounds {
    pub start: Address,
    /// Exclusive end
    pub end: Address,
    pub name: String,
}

/// Follow unconditional `j` hops from `entry` to the real reset handler.
pub fn follow_entry(decoder: &dyn Decoder, image: &[u8], entry: Address) -> Address {
    let mut address = entry;
    for _ in 0..MAX_ENTRY_HOPS {
        let insn = decoder.decode(image, address);
        if insn.mnemonic != "j" {
            break;
        }
        match insn.branch_target() {
            Some(target) if target != address => {
                log::debug!("Entry trampoline 0x{:08x} -> 0x{:08x}", address, target);
                address = target;
            }
            _ => break,
        }
    }
    address
}

/// Scan every word of the image in parallel for `entry` prologues and
/// direct call targets.
pub fn scan_candidates(decoder: &dyn Decoder, image: &[u8], base: Address) -> BTreeSet<Address> {
    let words = image.len() / INSTRUCTION_WIDTH as usize;
    let candidates: BTreeSet<Address> = (0..words)
        .into_par_iter()
        .filter_map(|index| {
            let address = word_address(base, index)?;
            let insn = decoder.decode(image, address);
            if insn.mnemonic == "entry" {
                Some(address)
            } else if insn.is_call() {
                insn.branch_target()
            } else {
                None
            }
        })
        .collect();

    log::debug!(
        "Scanned {} words, {} prologue/call-target candidates",
        words,
        candidates.len()
    );
    candidates
}

/// Addresses following a return and at least one padding word.
pub fn padding_candidates(decoder: &dyn Decoder, image: &[u8], base: Address) -> Vec<Address> {
    let words = image.len() / INSTRUCTION_WIDTH as usize;
    let mut candidates = Vec::new();
    let mut after_return = false;
    let mut padding = 0usize;

    for index in 0..words {
        let Some(address) = word_address(base, index) else {
            break;
        };
        let insn: Instruction = decoder.decode(image, address);
        if insn.is_nop() {
            if after_return {
                padding += 1;
            }
            continue;
        }
        if after_return && padding > 0 {
            candidates.push(address);
        }
        after_return = insn.is_return();
        padding = 0;
    }

    candidates
}

/// Collect, filter, sort and bound function candidates.
///
/// Sources are the resolved entry, the image-wide scan, post-return padding
/// and the known-function table. Candidates outside the image are dropped.
/// At most `arch.analysis.max_functions` functions are returned.
pub fn discover_functions(
    decoder: &dyn Decoder,
    image: &[u8],
    arch: &ArchitectureConfig,
    entry: Address,
) -> Vec<FunctionBounds> {
    let base = arch.flash_base;
    let image_end = base.saturating_add(image.len() as u32);
    let in_image = |address: Address| {
        address >= base && address < image_end && address % INSTRUCTION_WIDTH == 0
    };

    let mut candidates = scan_candidates(decoder, image, base);
    candidates.extend(padding_candidates(decoder, image, base));
    candidates.insert(entry);
    candidates.extend(arch.known_functions.values().copied());
    candidates.retain(|&address| in_image(address));

    let sorted: Vec<Address> = candidates.into_iter().collect();
    let limit = arch.analysis.max_functions;
    if sorted.len() > limit {
        log::warn!(
            "Found {} function candidates, keeping the first {}",
            sorted.len(),
            limit
        );
    }

    let window = arch.analysis.last_function_window;
    let functions: Vec<FunctionBounds> = sorted
        .iter()
        .enumerate()
        .take(limit)
        .map(|(i, &start)| {
            let end = match sorted.get(i + 1) {
                Some(&next) => next,
                None => start.saturating_add(window).min(image_end),
            };
            let name = arch
                .symbol_at(start)
                .map(str::to_string)
                .unwrap_or_else(|| format!("func_{:08x}", start));
            FunctionBounds { start, end, name }
        })
        .collect();

    log::debug!("Discovered {} functions", functions.len());
    functions
}

fn word_address(base: Address, index: usize) -> Option<Address> {
    let offset = u32::try_from(index).ok()?.checked_mul(INSTRUCTION_WIDTH)?;
    base.checked_add(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{asm, FirmwareDecoder};

    const BASE: Address = 0x400d_0000;

    fn setup(words: &[u32]) -> (FirmwareDecoder, ArchitectureConfig, Vec<u8>) {
        let arch = ArchitectureConfig::esp32();
        (FirmwareDecoder::new(&arch), arch, asm::image(words))
    }

    #[test]
    fn test_follow_entry_hops() {
        let (decoder, _, image) = setup(&[
            asm::j(BASE, BASE + 8),
            asm::nop(),
            asm::j(BASE + 8, BASE + 12),
            asm::entry(1, 32),
        ]);
        assert_eq!(follow_entry(&decoder, &image, BASE), BASE + 12);
    }

    #[test]
    fn test_follow_entry_stops_on_self_loop_and_hop_limit() {
        let (decoder, _, image) = setup(&[asm::j(BASE, BASE)]);
        assert_eq!(follow_entry(&decoder, &image, BASE), BASE);

        let chain: Vec<u32> = (0..8)
            .map(|i| asm::j(BASE + i * 4, BASE + (i + 1) * 4))
            .collect();
        let (decoder, _, image) = setup(&chain);
        assert_eq!(
            follow_entry(&decoder, &image, BASE),
            BASE + MAX_ENTRY_HOPS as Address * 4
        );
    }

    #[test]
    fn test_scan_finds_prologues_and_call_targets() {
        let (decoder, _, image) = setup(&[
            asm::entry(1, 32),
            asm::call8(BASE + 4, BASE + 16),
            asm::ret(),
            asm::nop(),
            asm::entry(1, 16),
        ]);
        let found = scan_candidates(&decoder, &image, BASE);
        assert_eq!(found, BTreeSet::from([BASE, BASE + 16]));
    }

    #[test]
    fn test_padding_candidates() {
        let (decoder, _, image) = setup(&[
            asm::ret(),
            asm::nop(),
            asm::nop(),
            asm::movi(2, 1),
            asm::ret(),
            asm::movi(2, 2),
        ]);
        assert_eq!(padding_candidates(&decoder, &image, BASE), vec![BASE + 12]);
    }

    #[test]
    fn test_bounds_and_names() {
        let (decoder, mut arch, image) = setup(&[
            asm::entry(1, 32),
            asm::ret(),
            asm::entry(1, 32),
            asm::ret(),
        ]);
        arch.known_functions.insert("app_main".to_string(), BASE + 8);

        let functions = discover_functions(&decoder, &image, &arch, BASE);
        assert_eq!(
            functions,
            vec![
                FunctionBounds {
                    start: BASE,
                    end: BASE + 8,
                    name: format!("func_{:08x}", BASE),
                },
                FunctionBounds {
                    start: BASE + 8,
                    end: BASE + 16,
                    name: "app_main".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_rom_symbols_are_not_functions() {
        let (decoder, arch, image) = setup(&[asm::call8(BASE, 0x4000_9040), asm::ret()]);
        let functions = discover_functions(&decoder, &image, &arch, BASE);
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].start, BASE);
    }

    #[test]
    fn test_empty_image() {
        let (decoder, arch, _) = setup(&[]);
        assert!(discover_functions(&decoder, &[], &arch, BASE).is_empty());
    }
}
