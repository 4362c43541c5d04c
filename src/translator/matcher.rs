//! Runtime-generated meta-commands. Each matcher turns a psql-style
//! shortcut (`\d users`) into backend SQL by substituting captured groups
//! into an output template.

use super::metadata::CommandMetadata;
use crate::PgBridgeError;
use regex::Regex;

pub struct DynamicCommand {
    regex: Regex,
    output_pattern: String,
    matcher_order: Vec<usize>,
}

impl DynamicCommand {
    pub fn compile(metadata: &CommandMetadata) -> Result<DynamicCommand, String> {
        // Matching covers the full trimmed statement, so the pattern is
        // anchored regardless of how the manifest wrote it.
        let anchored = format!("^(?:{})$", metadata.input_pattern);
        let regex = Regex::new(&anchored)
            .map_err(|e| format!("invalid input_pattern \"{}\": {e}", metadata.input_pattern))?;
        let matcher_order = metadata
            .matcher_array
            .iter()
            .map(|index| {
                index.parse::<usize>().map_err(|_| {
                    format!("matcher_array entry \"{index}\" is not a group index")
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DynamicCommand {
            regex,
            output_pattern: metadata.output_pattern.clone(),
            matcher_order,
        })
    }

    /// Returns the translated SQL when this command matches the statement.
    pub fn translate(&self, sql: &str) -> Option<Result<String, PgBridgeError>> {
        let captures = self.regex.captures(sql)?;
        Some(self.substitute(&captures))
    }

    fn substitute(&self, captures: &regex::Captures<'_>) -> Result<String, PgBridgeError> {
        let parts: Vec<&str> = self.output_pattern.split("%s").collect();
        let placeholders = parts.len() - 1;
        if placeholders > self.matcher_order.len() {
            return Err(PgBridgeError::Translator(format!(
                "output pattern has {placeholders} placeholders but matcher_array provides {}",
                self.matcher_order.len()
            )));
        }
        let mut out = String::with_capacity(self.output_pattern.len());
        for (i, part) in parts.iter().enumerate() {
            out.push_str(part);
            if i < placeholders {
                let group = self.matcher_order[i];
                let text = captures
                    .get(group)
                    .ok_or_else(|| {
                        PgBridgeError::Translator(format!("no capture group {group} in match"))
                    })?
                    .as_str();
                out.push_str(text);
            }
        }
        Ok(out)
    }
}
