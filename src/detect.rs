//! Heuristic classification passes: API call annotation, peripheral register
//! tagging, FreeRTOS task and interrupt handler detection.
//!
//! Annotations go through [`Instruction::set_comment`], so the first pass to
//! tag an instruction wins.

use std::collections::{BTreeMap, HashMap};

use crate::arch::ArchitectureConfig;
use crate::cfg::BasicBlock;
use crate::decompiler::Function;
use crate::{parse_address, Address, Instruction};

/// Register constants known at a point inside one block.
#[derive(Debug, Default)]
struct RegisterConstants {
    values: HashMap<String, Address>,
}

impl RegisterConstants {
    fn get(&self, register: &str) -> Option<Address> {
        self.values.get(register).copied()
    }

    /// Update after `insn` executes
    fn step(&mut self, insn: &Instruction) {
        let Some(dest) = insn.defined_operand() else {
            return;
        };
        let value = match insn.mnemonic.as_str() {
            "movi" | "l32r" => insn.operands.get(1).and_then(|op| parse_address(op)),
            _ => None,
        };
        match value {
            Some(value) => {
                self.values.insert(dest.to_string(), value);
            }
            None => {
                self.values.remove(dest);
            }
        }
    }
}

/// Visit every instruction of a block with the constants known before it.
fn walk_block<F>(block: &BasicBlock, mut visit: F)
where
    F: FnMut(&Instruction, &RegisterConstants),
{
    let mut constants = RegisterConstants::default();
    for insn in &block.instructions {
        visit(insn, &constants);
        constants.step(insn);
    }
}

/// Name of a direct call target, resolving numeric targets through the
/// known-function table.
fn call_target_name<'a>(insn: &'a Instruction, arch: &'a ArchitectureConfig) -> Option<&'a str> {
    if !insn.is_call() {
        return None;
    }
    match insn.branch_target() {
        Some(address) => arch.symbol_at(address),
        None => insn.display_name(),
    }
}

/// Tag calls into known API families and stores into peripheral windows.
/// Returns the number of instructions annotated.
pub fn detect_esp32_apis(functions: &mut [Function], arch: &ArchitectureConfig) -> usize {
    let mut tagged = 0;
    for function in functions.iter_mut() {
        for block in function.cfg.blocks.iter_mut() {
            let mut constants = RegisterConstants::default();
            for insn in block.instructions.iter_mut() {
                let comment = if let Some(name) = call_target_name(insn, arch) {
                    arch.api_class(name)
                        .map(|class| format!("{}: {}", class, name))
                } else if insn.is_store() {
                    peripheral_store(insn, &constants, arch)
                } else {
                    None
                };
                if let Some(comment) = comment {
                    if insn.set_comment(comment) {
                        tagged += 1;
                    }
                }
                constants.step(insn);
            }
        }
    }

    log::debug!("Annotated {} API calls and register accesses", tagged);
    tagged
}

fn peripheral_store(
    insn: &Instruction,
    constants: &RegisterConstants,
    arch: &ArchitectureConfig,
) -> Option<String> {
    let base = constants.get(insn.operands.get(1)?)?;
    let offset = parse_address(insn.operands.get(2)?)?;
    let region = arch.peripheral_at(base.wrapping_add(offset))?;
    Some(format!("{} {} register", arch.name, region.name))
}

/// Constant passed as argument `index` of the call `insn`
fn argument_constant(
    insn: &Instruction,
    constants: &RegisterConstants,
    index: usize,
) -> Option<Address> {
    constants.get(&insn.argument_register(index)?)
}

/// Mark task entry functions.
///
/// A function is a task when an `xTaskCreate*` call site passes its address
/// as the first argument (priority from a constant fifth argument), or when
/// it loops and calls a FreeRTOS API. Returns the number of tasks found.
pub fn detect_freertos_tasks(functions: &mut [Function], arch: &ArchitectureConfig) -> usize {
    let mut created: BTreeMap<Address, Option<u32>> = BTreeMap::new();
    for function in functions.iter() {
        for block in &function.cfg.blocks {
            walk_block(block, |insn, constants| {
                let is_create = call_target_name(insn, arch)
                    .map(|name| name.starts_with("xTaskCreate"))
                    .unwrap_or(false);
                if !is_create {
                    return;
                }
                if let Some(entry) = argument_constant(insn, constants, 0) {
                    created.insert(entry, argument_constant(insn, constants, 4));
                }
            });
        }
    }

    let mut count = 0;
    for function in functions.iter_mut() {
        if let Some(&priority) = created.get(&function.start_address) {
            function.is_task = true;
            function.task_priority = priority;
        } else if function.cfg.has_loops() && calls_freertos(function) {
            function.is_task = true;
        }
        if function.is_task {
            count += 1;
        }
    }

    log::debug!("Detected {} FreeRTOS tasks", count);
    count
}

fn calls_freertos(function: &Function) -> bool {
    function
        .cfg
        .instructions()
        .any(|insn| insn.is_call() && insn.comment().is_some_and(|c| c.contains("FreeRTOS")))
}

/// Argument position of the handler in an interrupt registration call:
/// `esp_intr_alloc(source, flags, handler, ...)`, otherwise
/// `gpio_isr_handler_add(pin, handler, ...)` style.
fn handler_argument(api: &str) -> usize {
    if api.starts_with("esp_intr_alloc") {
        2
    } else {
        1
    }
}

/// Mark interrupt service routines: functions returning with `rfe`,
/// functions registered as handlers through an interrupt API and functions
/// whose name contains `isr`. Returns the number found.
pub fn detect_interrupt_handlers(functions: &mut [Function], arch: &ArchitectureConfig) -> usize {
    let mut registered: Vec<Address> = Vec::new();
    for function in functions.iter() {
        for block in &function.cfg.blocks {
            walk_block(block, |insn, constants| {
                let Some(api) = call_target_name(insn, arch) else {
                    return;
                };
                let is_interrupt_api = arch
                    .api_class(api)
                    .is_some_and(|class| class.contains("Interrupt"));
                if !is_interrupt_api {
                    return;
                }
                if let Some(handler) = argument_constant(insn, constants, handler_argument(api)) {
                    registered.push(handler);
                }
            });
        }
    }

    let mut count = 0;
    for function in functions.iter_mut() {
        let returns_from_interrupt = function.cfg.instructions().any(|insn| insn.mnemonic == "rfe");
        if returns_from_interrupt
            || registered.contains(&function.start_address)
            || function.name.to_ascii_lowercase().contains("isr")
        {
            function.is_isr = true;
            count += 1;
        }
    }

    log::debug!("Detected {} interrupt handlers", count);
    count
}

/// Call-site count per annotated API function across all functions.
pub fn api_usage(functions: &[Function]) -> BTreeMap<String, usize> {
    let mut usage = BTreeMap::new();
    for insn in functions.iter().flat_map(|f| f.cfg.instructions()) {
        if !insn.is_call() || insn.comment().is_none() {
            continue;
        }
        if let Some(name) = insn.display_name() {
            *usage.entry(name.to_string()).or_insert(0) += 1;
        }
    }
    usage
}
