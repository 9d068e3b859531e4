//! Argument Mapping (§4.7): converts a sandbox binding's positional argument
//! vector into the named-parameter mapping a tool server expects. Advisory
//! only — the server is the ultimate authority on acceptance.

use serde_json::{Map, Value};

/// Maps `tool_name` to the parameter names its positional arguments bind to,
/// in order. Unknown tools fall through to `generic_mapping`.
fn known_parameter_names(tool_name: &str) -> Option<&'static [&'static str]> {
    match tool_name {
        "store_memory" => Some(&["content", "importance", "tags"]),
        "search_memory" => Some(&["query", "limit"]),
        "read_file" => Some(&["path"]),
        "write_file" => Some(&["path", "content"]),
        _ => None,
    }
}

/// Build the named-parameter object a `tools/call` request should carry for
/// `tool_name` given a positional argument vector.
pub fn map_arguments(tool_name: &str, args: Vec<Value>) -> Value {
    if let Some(names) = known_parameter_names(tool_name) {
        let mut map = Map::new();
        for (name, value) in names.iter().zip(args) {
            map.insert((*name).to_string(), value);
        }
        return Value::Object(map);
    }
    generic_mapping(args)
}

/// Fallback for tools with no known parameter table: a single mapping
/// argument passes through unchanged; anything else is synthesized into
/// `{arg0, arg1, ...}`.
fn generic_mapping(mut args: Vec<Value>) -> Value {
    if args.len() == 1 {
        if let Some(Value::Object(_)) = args.first() {
            return args.remove(0);
        }
    }
    let mut map = Map::new();
    for (i, value) in args.into_iter().enumerate() {
        map.insert(format!("arg{i}"), value);
    }
    Value::Object(map)
}
