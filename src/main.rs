use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;

use firmware_decompiler::arch::{ArchitectureConfig, LoopHeuristic};
use firmware_decompiler::decompiler::Decompiler;
use firmware_decompiler::format::OutputFormat;
use firmware_decompiler::parse_address;

/// Decompile a raw firmware image into C-like pseudo-code.
#[derive(Debug, Parser)]
#[command(name = "fwdecomp", version, about)]
struct Cli {
    /// Raw firmware image, mapped at the flash base
    firmware: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Pseudo)]
    format: OutputFormat,

    /// Architecture descriptor (JSON); the built-in ESP32 profile otherwise
    #[arg(short, long)]
    arch: Option<PathBuf>,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Back-edge test for loop detection; overrides the descriptor
    #[arg(long, value_enum, value_name = "HEURISTIC")]
    loop_heuristic: Option<LoopHeuristic>,

    /// Only emit the function containing this address
    #[arg(long, value_name = "ADDR")]
    function: Option<String>,

    /// Append printable strings found in the image
    #[arg(long)]
    strings: bool,

    /// Append small and RAM-pointer constants found in the image
    #[arg(long)]
    constants: bool,

    /// Append per-API call counts
    #[arg(long)]
    api_summary: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("firmware_decompiler", level)
        .filter_module("fwdecomp", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let mut arch = match &cli.arch {
        Some(path) => ArchitectureConfig::from_json_file(path)
            .with_context(|| format!("loading architecture {}", path.display()))?,
        None => ArchitectureConfig::esp32(),
    };
    if let Some(heuristic) = cli.loop_heuristic {
        arch.analysis.loop_heuristic = heuristic;
    }

    let mut decompiler = Decompiler::new(arch);
    decompiler
        .load_firmware(&cli.firmware)
        .with_context(|| format!("loading firmware {}", cli.firmware.display()))?;

    decompiler
        .decompile_all(|percent, stage| log::debug!("[{:>3}%] {}", percent, stage))
        .context("decompilation failed")?;

    let selected = match &cli.function {
        Some(text) => {
            let address =
                parse_address(text).ok_or_else(|| anyhow!("invalid address '{}'", text))?;
            let function = decompiler
                .function_at(address)
                .ok_or_else(|| anyhow!("no function contains 0x{:08x}", address))?;
            vec![function.clone()]
        }
        None => decompiler.functions().to_vec(),
    };

    let mut output = cli
        .format
        .get_formatter(&decompiler.arch().name)
        .format(&selected)
        .with_context(|| format!("formatting {} output", cli.format))?;

    if cli.strings {
        output.push_str("\n// Strings\n");
        for (address, text) in decompiler.extract_strings() {
            writeln!(output, "// 0x{:08x}: {:?}", address, text)?;
        }
    }
    if cli.constants {
        output.push_str("\n// Constants\n");
        for (address, value) in decompiler.extract_constants() {
            writeln!(output, "// 0x{:08x}: 0x{:08x}", address, value)?;
        }
    }
    if cli.api_summary {
        output.push_str("\n// API usage\n");
        for (name, count) in decompiler.api_usage() {
            writeln!(output, "// {:<32} {}", name, count)?;
        }
    }

    match &cli.output {
        Some(path) => {
            fs::write(path, &output)
                .with_context(|| format!("writing output {}", path.display()))?;
            log::info!("Wrote {} bytes to {}", output.len(), path.display());
        }
        None => print!("{}", output),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_heuristic_flag() {
        let cli = Cli::try_parse_from(["fwdecomp", "fw.bin"]).unwrap();
        assert_eq!(cli.loop_heuristic, None);

        let cli =
            Cli::try_parse_from(["fwdecomp", "fw.bin", "--loop-heuristic", "address-order"])
                .unwrap();
        assert_eq!(cli.loop_heuristic, Some(LoopHeuristic::AddressOrder));

        assert!(Cli::try_parse_from(["fwdecomp", "fw.bin", "--loop-heuristic", "nope"]).is_err());
    }
}
