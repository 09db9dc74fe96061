//! Output format module implementation

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use crate::decompiler::Function;
use crate::DecompilerError;
use clap::ValueEnum;
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

/// Supported output formats for decompilation results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// C-like pseudo-code listing (default)
    #[default]
    Pseudo,
    /// Annotated assembly, one line per instruction
    Asm,
    /// JSON summary of every function
    Json,
    /// CSV, one row per instruction
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Pseudo => write!(f, "pseudo"),
            OutputFormat::Asm => write!(f, "asm"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pseudo" | "c" => Ok(OutputFormat::Pseudo),
            "asm" | "assembly" => Ok(OutputFormat::Asm),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Pseudo,
            OutputFormat::Asm,
            OutputFormat::Json,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format; `target` names the
    /// architecture in listing headers.
    pub fn get_formatter(&self, target: &str) -> Box<dyn DecompilationFormatter> {
        match self {
            OutputFormat::Pseudo => Box::new(PseudoFormatter::new(target)),
            OutputFormat::Asm => Box::new(AsmFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for decompilation output
pub trait DecompilationFormatter {
    /// Format every function of a session
    fn format(&self, functions: &[Function]) -> Result<String, DecompilerError>;
}

/// Whole-image pseudo-code listing
pub struct PseudoFormatter {
    target: String,
}

/// Annotated assembly
pub struct AsmFormatter;

/// Format functions as a JSON document
pub struct JsonFormatter;

/// Format instructions as CSV rows
pub struct CsvFormatter;

impl PseudoFormatter {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }
}

fn write_error(e: fmt::Error) -> DecompilerError {
    DecompilerError::Format(e.to_string())
}

impl DecompilationFormatter for PseudoFormatter {
    fn format(&self, functions: &[Function]) -> Result<String, DecompilerError> {
        let mut output = String::new();
        writeln!(
            output,
            "// Generated by fwdecomp {}",
            env!("CARGO_PKG_VERSION")
        )
        .map_err(write_error)?;
        writeln!(output, "// Target: {}", self.target).map_err(write_error)?;
        writeln!(output, "// Functions: {}", functions.len()).map_err(write_error)?;

        for function in functions {
            output.push('\n');
            if function.pseudo_code.is_empty() {
                writeln!(
                    output,
                    "// {} @ 0x{:08x}: not decompiled",
                    function.name, function.start_address
                )
                .map_err(write_error)?;
            } else {
                output.push_str(&function.pseudo_code);
            }
        }

        Ok(output)
    }
}

impl DecompilationFormatter for AsmFormatter {
    fn format(&self, functions: &[Function]) -> Result<String, DecompilerError> {
        let mut output = String::new();

        for function in functions {
            writeln!(
                output,
                "{}:  ; 0x{:08x}-0x{:08x}",
                function.name, function.start_address, function.end_address
            )
            .map_err(write_error)?;

            for insn in function.cfg.instructions() {
                let line = format!(
                    "  0x{:08x}: {:<8} {:<24}",
                    insn.address,
                    insn.mnemonic,
                    insn.operands.join(", ")
                );
                let written = match insn.comment() {
                    Some(comment) => writeln!(output, "{} ; {}", line, comment),
                    None => writeln!(output, "{}", line.trim_end()),
                };
                written.map_err(write_error)?;
            }
            output.push('\n');
        }

        Ok(output)
    }
}
