//! SET and SHOW touch session-local runtime parameters and never reach the
//! backend.

use crate::backend::BackendError;
use crate::protocol::{BackendMessage, FieldDescription, PostgresCodec};
use crate::session::SessionState;
use crate::types::PgType;
use crate::PgBridgeError;
use futures::SinkExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio_util::codec::Framed;
use tracing::debug;

static SET_TIMEZONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*SET\s+TIME\s+ZONE\s+(.+?)\s*$").unwrap());

static SET_PARAMETER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*SET\s+(?:SESSION\s+|LOCAL\s+)?(\w+)\s+(?:TO|=)\s+(.+?)\s*$").unwrap());

static SHOW_PARAMETER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*SHOW\s+(.+?)\s*$").unwrap());

pub struct SetHandler;

impl SetHandler {
    pub fn is_set_command(query: &str) -> bool {
        let trimmed = query.trim_start();
        let head: String = trimmed.chars().take(5).collect::<String>().to_uppercase();
        head.starts_with("SET ") || head.starts_with("SHOW ")
    }

    /// Handle a SET or SHOW statement, queueing the response messages.
    /// `describe_sent` suppresses RowDescription when the extended protocol
    /// already described the portal.
    pub async fn handle<T>(
        framed: &mut Framed<T, PostgresCodec>,
        session: &Arc<SessionState>,
        query: &str,
        describe_sent: bool,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if let Some(caps) = SET_TIMEZONE_PATTERN.captures(query) {
            let value = unquote(&caps[1]);
            Self::set_parameter(session, "TimeZone", &value).await;
            framed
                .feed(BackendMessage::CommandComplete {
                    tag: "SET".to_string(),
                })
                .await?;
            return Ok(());
        }

        if let Some(caps) = SET_PARAMETER_PATTERN.captures(query) {
            let name = caps[1].to_string();
            let value = unquote(&caps[2]);
            Self::set_parameter(session, &name, &value).await;
            framed
                .feed(BackendMessage::CommandComplete {
                    tag: "SET".to_string(),
                })
                .await?;
            return Ok(());
        }

        if let Some(caps) = SHOW_PARAMETER_PATTERN.captures(query) {
            let name = caps[1].trim().to_string();
            let value = Self::get_parameter(session, &name).await.ok_or_else(|| {
                PgBridgeError::Backend(
                    BackendError::new(format!("unrecognized configuration parameter \"{name}\""))
                        .with_sqlstate("42704"),
                )
            })?;
            if !describe_sent {
                framed
                    .feed(BackendMessage::RowDescription(vec![FieldDescription::new(
                        name.to_lowercase(),
                        PgType::Text.to_oid(),
                        PgType::Text.type_size(),
                        0,
                    )]))
                    .await?;
            }
            framed
                .feed(BackendMessage::DataRow(vec![Some(value.into_bytes())]))
                .await?;
            framed
                .feed(BackendMessage::CommandComplete {
                    tag: "SHOW".to_string(),
                })
                .await?;
            return Ok(());
        }

        Err(PgBridgeError::Protocol(format!(
            "unrecognized SET syntax: {query}"
        )))
    }

    async fn set_parameter(session: &Arc<SessionState>, name: &str, value: &str) {
        debug!("SET {name} = {value}");
        let mut parameters = session.parameters.write().await;
        // Parameter names are case-insensitive; keep the original spelling
        // of a known key.
        let key = parameters
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        parameters.insert(key, value.to_string());
    }

    async fn get_parameter(session: &Arc<SessionState>, name: &str) -> Option<String> {
        let parameters = session.parameters.read().await;
        parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        trimmed[1..trimmed.len() - 1].replace("''", "'")
    } else {
        trimmed.to_string()
    }
}
