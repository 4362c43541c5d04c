//! Per-statement SQL translation: meta-command matching first, then the
//! ordered regex rewrite list. Pure given its rule tables; rule order is
//! preserved exactly as loaded.

pub mod matcher;
pub mod metadata;

use crate::config::Config;
use crate::PgBridgeError;
use matcher::DynamicCommand;
use metadata::{CommandManifest, QueryRewrite};
use regex::Regex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationKind {
    MetaCommand,
    Rewritten,
    Identity,
}

#[derive(Debug)]
pub struct Translation {
    pub sql: String,
    pub kind: TranslationKind,
}

struct CompiledRewrite {
    regex: Regex,
    replacement: String,
}

pub struct QueryTranslator {
    commands: Vec<DynamicCommand>,
    rewrites: Vec<CompiledRewrite>,
}

impl QueryTranslator {
    pub fn new(
        manifest: &CommandManifest,
        rewrites: &[QueryRewrite],
    ) -> Result<QueryTranslator, String> {
        let commands = manifest
            .commands
            .iter()
            .map(DynamicCommand::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let rewrites = rewrites
            .iter()
            .map(|rewrite| {
                Regex::new(&rewrite.input_pattern)
                    .map(|regex| CompiledRewrite {
                        regex,
                        replacement: rewrite.output_pattern.clone(),
                    })
                    .map_err(|e| {
                        format!("invalid rewrite pattern \"{}\": {e}", rewrite.input_pattern)
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryTranslator { commands, rewrites })
    }

    /// Identity translator, used when psql mode is off and no rewrites file
    /// is configured.
    pub fn identity() -> QueryTranslator {
        QueryTranslator {
            commands: Vec::new(),
            rewrites: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<QueryTranslator, String> {
        let manifest = if config.psql_mode {
            let path = config.command_metadata_path();
            match metadata::load_command_manifest(path) {
                Ok(manifest) => manifest,
                Err(e) if !std::path::Path::new(path).exists() => {
                    // Commands only matter in psql mode; a missing manifest
                    // must not take the proxy down.
                    warn!("{e}; continuing with an empty command set");
                    CommandManifest::empty()
                }
                Err(e) => return Err(e),
            }
        } else {
            CommandManifest::empty()
        };

        let rewrites = match config.query_rewrites_file {
            Some(ref path) => metadata::load_query_rewrites(path)?,
            None => Vec::new(),
        };

        QueryTranslator::new(&manifest, &rewrites)
    }

    /// Translate one statement. The first matching meta-command wins and
    /// short-circuits the rewrite list; rewrites compose left to right.
    pub fn translate(&self, sql: &str) -> Result<Translation, PgBridgeError> {
        let trimmed = sql.trim();
        for command in &self.commands {
            if let Some(result) = command.translate(trimmed) {
                let translated = result?;
                debug!("meta-command matched: {trimmed} -> {translated}");
                return Ok(Translation {
                    sql: translated,
                    kind: TranslationKind::MetaCommand,
                });
            }
        }

        let mut current = sql.to_string();
        let mut changed = false;
        for rewrite in &self.rewrites {
            let replaced = rewrite
                .regex
                .replace_all(&current, rewrite.replacement.as_str());
            if replaced != current {
                changed = true;
                current = replaced.into_owned();
            }
        }

        Ok(Translation {
            sql: current,
            kind: if changed {
                TranslationKind::Rewritten
            } else {
                TranslationKind::Identity
            },
        })
    }
}
