//! CSV output formatter

use super::DecompilationFormatter;
use crate::decompiler::Function;
use crate::DecompilerError;

const HEADER: [&str; 6] = ["function", "address", "opcode", "mnemonic", "operands", "comment"];

fn csv_error(e: impl std::fmt::Display) -> DecompilerError {
    DecompilerError::Format(format!("CSV error: {}", e))
}

impl DecompilationFormatter for super::CsvFormatter {
    fn format(&self, functions: &[Function]) -> Result<String, DecompilerError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(HEADER).map_err(csv_error)?;

        for function in functions {
            for insn in function.cfg.instructions() {
                writer
                    .write_record([
                        function.name.as_str(),
                        format!("0x{:08x}", insn.address).as_str(),
                        format!("0x{:08x}", insn.opcode).as_str(),
                        insn.mnemonic.as_str(),
                        insn.operands.join(", ").as_str(),
                        insn.comment().unwrap_or(""),
                    ])
                    .map_err(csv_error)?;
            }
        }

        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}
