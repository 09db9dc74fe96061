//! Decompilation session: firmware loading, the stage pipeline and the
//! whole-image views.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::arch::ArchitectureConfig;
use crate::cfg::ControlFlowGraph;
use crate::codegen::CodeGenerator;
use crate::decoder::{disassemble_range, FirmwareDecoder};
use crate::format::{AsmFormatter, DecompilationFormatter, PseudoFormatter};
use crate::patterns::PatternMatcher;
use crate::{dataflow, detect, discovery, Address, DecompilerError};

/// Argument registers, in order
const ARGUMENT_REGISTERS: &[&str] = &["a2", "a3", "a4", "a5", "a6", "a7"];
/// Return address and stack pointer are never declared
const RESERVED_REGISTERS: &[&str] = &["a0", "a1"];

/// Session state; each stage advances it by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DecompilerState {
    Unloaded,
    Loaded,
    EntryAnalyzed,
    FunctionsDiscovered,
    FunctionsAnalyzed,
    Decompiled,
}

impl fmt::Display for DecompilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompilerState::Unloaded => write!(f, "unloaded"),
            DecompilerState::Loaded => write!(f, "loaded"),
            DecompilerState::EntryAnalyzed => write!(f, "entry analyzed"),
            DecompilerState::FunctionsDiscovered => write!(f, "functions discovered"),
            DecompilerState::FunctionsAnalyzed => write!(f, "functions analyzed"),
            DecompilerState::Decompiled => write!(f, "decompiled"),
        }
    }
}

/// A typed register variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// One discovered function and everything inferred about it.
#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub start_address: Address,
    /// Exclusive end: next function's start, or the last-function window
    pub end_address: Address,
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<Variable>,
    pub local_variables: Vec<Variable>,
    #[serde(skip)]
    pub cfg: ControlFlowGraph,
    pub pseudo_code: String,
    pub is_isr: bool,
    pub is_task: bool,
    pub task_priority: Option<u32>,
}

impl Function {
    /// A function with only its range known
    pub fn new(start_address: Address, end_address: Address, name: impl Into<String>) -> Self {
        Self {
            start_address,
            end_address,
            name: name.into(),
            return_type: "void".to_string(),
            parameters: Vec::new(),
            local_variables: Vec::new(),
            cfg: ControlFlowGraph::default(),
            pseudo_code: String::new(),
            is_isr: false,
            is_task: false,
            task_priority: None,
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start_address && address < self.end_address
    }

    /// Build the CFG and run the structural and dataflow analyses.
    fn analyze(&mut self, decoder: &FirmwareDecoder, image: &[u8], arch: &ArchitectureConfig) {
        let instructions = disassemble_range(decoder, image, self.start_address, self.end_address);
        self.cfg = ControlFlowGraph::from_instructions(&instructions);
        self.cfg.compute_dominators();
        self.cfg.detect_loops(arch.analysis.loop_heuristic);
        self.infer_signature();
    }

    /// Rerun dataflow and derive parameters, return type and locals.
    ///
    /// Parameters are argument registers live into the entry block. The
    /// return type is the type of `a2` when a definition of `a2` reaches a
    /// return, otherwise `void`. Every other typed register is a local.
    fn infer_signature(&mut self) {
        let types = dataflow::analyze(&mut self.cfg);
        let type_of = |name: &str| {
            types
                .get(name)
                .cloned()
                .unwrap_or_else(|| "int".to_string())
        };

        let live_in = self
            .cfg
            .entry_block
            .and_then(|entry| self.cfg.live_variables.in_set(entry));
        self.parameters = ARGUMENT_REGISTERS
            .iter()
            .filter(|reg| live_in.is_some_and(|set| set.contains(**reg)))
            .map(|&reg| Variable::new(reg, type_of(reg)))
            .collect();

        let returns_a2 = self.cfg.exit_blocks.iter().any(|&exit| {
            self.cfg.blocks[exit].is_return()
                && self
                    .cfg
                    .reaching_definitions
                    .out_set(exit)
                    .is_some_and(|set| set.contains("a2"))
        });
        self.return_type = if returns_a2 {
            type_of("a2")
        } else {
            "void".to_string()
        };

        let parameters = &self.parameters;
        self.local_variables = types
            .iter()
            .filter(|(name, _)| !RESERVED_REGISTERS.contains(&name.as_str()))
            .filter(|(name, _)| !parameters.iter().any(|p| &p.name == *name))
            .map(|(name, ty)| Variable::new(name.clone(), ty.clone()))
            .collect();
    }
}

/// One firmware image and its analysis results.
#[derive(Debug)]
pub struct Decompiler {
    arch: ArchitectureConfig,
    decoder: FirmwareDecoder,
    matcher: PatternMatcher,
    image: Vec<u8>,
    entry_point: Address,
    functions: Vec<Function>,
    state: DecompilerState,
}

impl Decompiler {
    pub fn new(arch: ArchitectureConfig) -> Self {
        let decoder = FirmwareDecoder::new(&arch);
        let entry_point = arch.entry();
        Self {
            arch,
            decoder,
            matcher: PatternMatcher::with_default_idioms(),
            image: Vec::new(),
            entry_point,
            functions: Vec::new(),
            state: DecompilerState::Unloaded,
        }
    }

    /// Read a raw firmware image from disk.
    pub fn load_firmware(&mut self, path: impl AsRef<Path>) -> Result<(), DecompilerError> {
        let path = path.as_ref();
        let image = fs::read(path)?;
        log::info!("Loaded {} ({} bytes)", path.display(), image.len());
        self.load_bytes(image);
        Ok(())
    }

    /// Use an in-memory image, discarding any previous results.
    pub fn load_bytes(&mut self, image: impl Into<Vec<u8>>) {
        self.image = image.into();
        self.functions.clear();
        self.entry_point = self.arch.entry();
        self.state = DecompilerState::Loaded;
    }

    fn require(&self, needed: DecompilerState) -> Result<(), DecompilerError> {
        if self.state < needed {
            return Err(DecompilerError::InvalidState(format!(
                "stage needs state '{}', session is '{}'",
                needed, self.state
            )));
        }
        Ok(())
    }

    fn advance(&mut self, state: DecompilerState) {
        log::info!("Decompiler state: {} -> {}", self.state, state);
        self.state = state;
    }

    fn image_end(&self) -> Address {
        self.arch.flash_base.saturating_add(self.image.len() as u32)
    }

    /// Resolve the reset entry through jump trampolines.
    pub fn analyze_entry_point(&mut self) -> Result<Address, DecompilerError> {
        self.require(DecompilerState::Loaded)?;

        let configured = self.arch.entry();
        if configured < self.arch.flash_base || configured >= self.image_end() {
            log::warn!("Entry point 0x{:08x} lies outside the image", configured);
        }
        self.entry_point = discovery::follow_entry(&self.decoder, &self.image, configured);
        log::debug!("Resolved entry point 0x{:08x}", self.entry_point);

        if self.state < DecompilerState::EntryAnalyzed {
            self.advance(DecompilerState::EntryAnalyzed);
        }
        Ok(self.entry_point)
    }

    /// Find function candidates and bound them. Replaces any previous list.
    pub fn discover_functions(&mut self) -> Result<usize, DecompilerError> {
        self.require(DecompilerState::EntryAnalyzed)?;

        self.functions =
            discovery::discover_functions(&self.decoder, &self.image, &self.arch, self.entry_point)
                .into_iter()
                .map(|bounds| Function::new(bounds.start, bounds.end, bounds.name))
                .collect();

        self.advance(DecompilerState::FunctionsDiscovered);
        Ok(self.functions.len())
    }

    /// Per-function pipeline: disassembly, CFG, dominators, loops, dataflow
    /// and type inference. `progress` receives a percentage across the
    /// function list.
    pub fn analyze_functions<F>(&mut self, mut progress: F) -> Result<(), DecompilerError>
    where
        F: FnMut(u8, &str),
    {
        self.require(DecompilerState::FunctionsDiscovered)?;

        let total = self.functions.len();
        for (index, function) in self.functions.iter_mut().enumerate() {
            function.analyze(&self.decoder, &self.image, &self.arch);
            let percent = ((index + 1) * 100 / total.max(1)) as u8;
            progress(percent, &function.name);
        }

        self.advance(DecompilerState::FunctionsAnalyzed);
        Ok(())
    }

    /// Annotate API calls and peripheral stores, then refresh types so
    /// annotation-driven rules apply.
    pub fn detect_esp32_apis(&mut self) -> Result<usize, DecompilerError> {
        self.require(DecompilerState::FunctionsAnalyzed)?;
        let tagged = detect::detect_esp32_apis(&mut self.functions, &self.arch);
        for function in &mut self.functions {
            function.infer_signature();
        }
        Ok(tagged)
    }

    pub fn detect_freertos_tasks(&mut self) -> Result<usize, DecompilerError> {
        self.require(DecompilerState::FunctionsAnalyzed)?;
        Ok(detect::detect_freertos_tasks(&mut self.functions, &self.arch))
    }

    pub fn detect_interrupt_handlers(&mut self) -> Result<usize, DecompilerError> {
        self.require(DecompilerState::FunctionsAnalyzed)?;
        Ok(detect::detect_interrupt_handlers(&mut self.functions, &self.arch))
    }

    /// Pseudo-code for one function using this session's pattern library
    pub fn generate_pseudo_code(&self, function: &Function) -> String {
        CodeGenerator::new(&self.matcher).generate_pseudo_code(function)
    }

    /// Run every stage in order and return the whole-image pseudo-code.
    ///
    /// `progress` receives `(percent, stage description)`.
    pub fn decompile_all<F>(&mut self, mut progress: F) -> Result<String, DecompilerError>
    where
        F: FnMut(u8, &str),
    {
        progress(0, "Analyzing entry point");
        self.analyze_entry_point()?;

        progress(5, "Discovering functions");
        let count = self.discover_functions()?;
        log::info!("Discovered {} functions", count);

        self.analyze_functions(|percent, name| {
            let scaled = 10 + (percent as u32 * 70 / 100) as u8;
            progress(scaled, &format!("Analyzing {}", name));
        })?;

        progress(85, "Detecting APIs, tasks and interrupt handlers");
        self.detect_esp32_apis()?;
        self.detect_freertos_tasks()?;
        self.detect_interrupt_handlers()?;

        progress(90, "Generating pseudo-code");
        let generator = CodeGenerator::new(&self.matcher);
        for function in &mut self.functions {
            function.pseudo_code = generator.generate_pseudo_code(function);
        }
        self.advance(DecompilerState::Decompiled);

        progress(100, "Done");
        self.pseudo_code_listing()
    }

    /// Header comment plus every function's pseudo-code
    pub fn pseudo_code_listing(&self) -> Result<String, DecompilerError> {
        PseudoFormatter::new(&self.arch.name).format(&self.functions)
    }

    /// One line per instruction with address, operands and annotation
    pub fn annotated_assembly(&self) -> Result<String, DecompilerError> {
        AsmFormatter.format(&self.functions)
    }

    /// Printable ASCII runs of at least the configured length.
    pub fn extract_strings(&self) -> Vec<(Address, String)> {
        extract_strings(
            &self.image,
            self.arch.flash_base,
            self.arch.analysis.min_string_length,
        )
    }

    /// Aligned words that look like small constants or RAM pointers.
    pub fn extract_constants(&self) -> Vec<(Address, u32)> {
        self.image
            .chunks_exact(4)
            .enumerate()
            .filter_map(|(index, bytes)| {
                let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let address = self
                    .arch
                    .flash_base
                    .checked_add(u32::try_from(index * 4).ok()?)?;
                (value < 0x1000 || self.arch.is_ram_address(value)).then_some((address, value))
            })
            .collect()
    }

    /// Call-site count per detected API function
    pub fn api_usage(&self) -> BTreeMap<String, usize> {
        detect::api_usage(&self.functions)
    }

    /// Register additional idioms before decompiling
    pub fn pattern_matcher_mut(&mut self) -> &mut PatternMatcher {
        &mut self.matcher
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Function whose range contains `address`
    pub fn function_at(&self, address: Address) -> Option<&Function> {
        self.functions.iter().find(|f| f.contains(address))
    }

    pub fn state(&self) -> DecompilerState {
        self.state
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn arch(&self) -> &ArchitectureConfig {
        &self.arch
    }
}

/// Linear scan for runs of printable ASCII (space through `~`, plus tab).
pub fn extract_strings(data: &[u8], base: Address, min_length: usize) -> Vec<(Address, String)> {
    let mut strings = Vec::new();
    let mut start = 0;
    let mut current = String::new();

    for (offset, &byte) in data.iter().enumerate() {
        if byte == b'\t' || (0x20..0x7f).contains(&byte) {
            if current.is_empty() {
                start = offset;
            }
            current.push(byte as char);
            continue;
        }
        if current.len() >= min_length {
            strings.push((base.wrapping_add(start as u32), std::mem::take(&mut current)));
        }
        current.clear();
    }
    if current.len() >= min_length {
        strings.push((base.wrapping_add(start as u32), current));
    }

    strings
}
