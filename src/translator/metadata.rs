//! Manifest formats for the translation pipeline. Both files are JSON and
//! loaded once at startup; rule order is significant and preserved.

use serde::Deserialize;

/// `{"commands":[{"input_pattern","output_pattern","matcher_array"},...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandManifest {
    pub commands: Vec<CommandMetadata>,
}

impl CommandManifest {
    pub fn empty() -> Self {
        CommandManifest {
            commands: Vec::new(),
        }
    }
}

/// A user-definable meta-command: statements matching `input_pattern` are
/// replaced by `output_pattern` with captured groups substituted in
/// `matcher_array` order.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandMetadata {
    pub input_pattern: String,
    pub output_pattern: String,
    /// Capture-group indices, as strings, in substitution order.
    pub matcher_array: Vec<String>,
}

/// One entry of the query-rewrites file: regex search-and-replace applied
/// in declared order.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRewrite {
    pub input_pattern: String,
    pub output_pattern: String,
}

pub fn load_command_manifest(path: &str) -> Result<CommandManifest, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read command metadata file {path}: {e}"))?;
    serde_json::from_str(&data).map_err(|e| format!("malformed command metadata file {path}: {e}"))
}

pub fn load_query_rewrites(path: &str) -> Result<Vec<QueryRewrite>, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read query rewrites file {path}: {e}"))?;
    serde_json::from_str(&data).map_err(|e| format!("malformed query rewrites file {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_manifest() {
        let manifest: CommandManifest = serde_json::from_str(
            r#"{"commands":[{"input_pattern":"^\\\\d (.+)$",
                             "output_pattern":"SELECT * FROM information_schema.columns WHERE table_name = '%s'",
                             "matcher_array":["1"]}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.commands.len(), 1);
        assert_eq!(manifest.commands[0].matcher_array, vec!["1"]);
        assert_eq!(manifest.commands[0].input_pattern, "^\\\\d (.+)$");
    }

    #[test]
    fn parses_rewrite_list() {
        let rewrites: Vec<QueryRewrite> = serde_json::from_str(
            r#"[{"input_pattern":"(?i)\\bNOW\\(\\)","output_pattern":"CURRENT_TIMESTAMP"}]"#,
        )
        .unwrap();
        assert_eq!(rewrites.len(), 1);
    }
}
