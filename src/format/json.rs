//! JSON output formatter

use serde::Serialize;

use super::DecompilationFormatter;
use crate::decompiler::{Function, Variable};
use crate::DecompilerError;

/// Serializable function summary for JSON output
#[derive(Serialize)]
struct FunctionJson<'a> {
    name: &'a str,
    /// Start address as hex string
    start: String,
    /// Exclusive end address as hex string
    end: String,
    return_type: &'a str,
    parameters: &'a [Variable],
    local_variables: &'a [Variable],
    is_isr: bool,
    is_task: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_priority: Option<u32>,
    /// Shape of the recovered control flow graph
    blocks: usize,
    edges: usize,
    loops: usize,
    pseudo_code: &'a str,
}

/// Serializable decompilation result for JSON output
#[derive(Serialize)]
struct DecompilationJson<'a> {
    functions: Vec<FunctionJson<'a>>,
}

impl DecompilationFormatter for super::JsonFormatter {
    fn format(&self, functions: &[Function]) -> Result<String, DecompilerError> {
        let result = DecompilationJson {
            functions: functions.iter().map(function_to_json).collect(),
        };

        serde_json::to_string_pretty(&result)
            .map_err(|e| DecompilerError::Format(format!("JSON serialization error: {}", e)))
    }
}

/// Convert a function to its JSON summary
fn function_to_json(function: &Function) -> FunctionJson<'_> {
    FunctionJson {
        name: &function.name,
        start: format!("0x{:08x}", function.start_address),
        end: format!("0x{:08x}", function.end_address),
        return_type: &function.return_type,
        parameters: &function.parameters,
        local_variables: &function.local_variables,
        is_isr: function.is_isr,
        is_task: function.is_task,
        task_priority: function.task_priority,
        blocks: function.cfg.block_count(),
        edges: function.cfg.edge_count(),
        loops: function.cfg.loops.len(),
        pseudo_code: &function.pseudo_code,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample_functions;
    use super::super::JsonFormatter;
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_json_summary() {
        let mut functions = sample_functions();
        functions[1].is_task = true;
        functions[1].task_priority = Some(5);

        let output = JsonFormatter.format(&functions).unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        let list = value["functions"].as_array().unwrap();
        assert_eq!(list.len(), 2);

        assert_eq!(list[0]["name"], "func_400d0000");
        assert_eq!(list[0]["start"], "0x400d0000");
        assert_eq!(list[0]["end"], "0x400d000c");
        assert_eq!(list[0]["return_type"], "void");
        assert_eq!(list[0]["blocks"], 2);
        assert_eq!(list[0]["edges"], 1);
        assert!(list[0].get("task_priority").is_none());

        assert_eq!(list[1]["is_task"], true);
        assert_eq!(list[1]["task_priority"], 5);
        assert_eq!(list[1]["return_type"], "int");
    }

    #[test]
    fn test_variables_use_type_key() {
        let mut functions = sample_functions();
        functions[0].parameters = vec![Variable::new("a2", "uint32_t*")];

        let output = JsonFormatter.format(&functions).unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        let param = &value["functions"][0]["parameters"][0];
        assert_eq!(param["name"], "a2");
        assert_eq!(param["type"], "uint32_t*");
    }
}
