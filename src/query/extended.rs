//! Extended-query protocol handlers. Responses are queued into the send
//! buffer and only reach the socket on Sync, Flush, or an explicit flush by
//! the connection handler; errors propagate to the handler, which owns the
//! skip-until-Sync discipline.

use super::SetHandler;
use crate::backend::{BackendError, ExecutionResult};
use crate::protocol::{BackendMessage, PostgresCodec};
use crate::session::QueryContext;
use crate::statements::{
    command_tag, field_descriptions, resolve_parameter_types, resolve_result_format,
    select_item_cast_hints, Portal, PortalState, PreparedStatement,
};
use crate::types::value_codec::{decode_parameter, encode_value, Format};
use crate::types::PgType;
use crate::PgBridgeError;
use futures::SinkExt;
use tokio_util::codec::Framed;
use tracing::debug;

pub struct ExtendedQueryHandler;

impl ExtendedQueryHandler {
    pub async fn handle_parse<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        name: String,
        query: String,
        declared_types: Vec<i32>,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if !name.is_empty() && ctx.session.prepared_statements.read().await.contains_key(&name) {
            return Err(PgBridgeError::Backend(
                BackendError::new(format!("prepared statement \"{name}\" already exists"))
                    .with_sqlstate("42P05"),
            ));
        }

        let statement = Self::parse_statement(ctx, &query, &declared_types)?;
        debug!("parsed statement \"{name}\": {}", statement.translated_sql);
        ctx.session
            .prepared_statements
            .write()
            .await
            .insert(name, statement);
        framed.feed(BackendMessage::ParseComplete).await?;
        Ok(())
    }

    fn parse_statement(
        ctx: &QueryContext,
        query: &str,
        declared_types: &[i32],
    ) -> Result<PreparedStatement, PgBridgeError> {
        use crate::backend::StatementInfo;

        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(PreparedStatement {
                sql: String::new(),
                translated_sql: String::new(),
                param_types: Vec::new(),
                info: StatementInfo {
                    columns: Vec::new(),
                    parameter_count: 0,
                    returns_rows: false,
                },
                result_hints: Vec::new(),
            });
        }

        if SetHandler::is_set_command(trimmed) {
            // SET and SHOW stay session-local; there is nothing for the
            // backend to prepare.
            let is_show = trimmed
                .trim_start()
                .get(..4)
                .map(|head| head.eq_ignore_ascii_case("show"))
                .unwrap_or(false);
            let columns = if is_show {
                vec![crate::backend::BackendColumn {
                    name: trimmed
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("setting")
                        .to_lowercase(),
                    ty: Some(crate::backend::BackendType::Text),
                }]
            } else {
                Vec::new()
            };
            return Ok(PreparedStatement {
                sql: trimmed.to_string(),
                translated_sql: trimmed.to_string(),
                param_types: Vec::new(),
                info: StatementInfo {
                    returns_rows: is_show,
                    parameter_count: 0,
                    columns,
                },
                result_hints: Vec::new(),
            });
        }

        let translation = ctx.translator.translate(query)?;
        let info = ctx.client.prepare(&translation.sql)?;
        let param_types = resolve_parameter_types(&translation.sql, declared_types);
        let result_hints = select_item_cast_hints(&translation.sql);
        Ok(PreparedStatement {
            sql: query.to_string(),
            translated_sql: translation.sql,
            param_types,
            info,
            result_hints,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn handle_bind<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        portal: String,
        statement: String,
        formats: Vec<i16>,
        values: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let param_types = {
            let statements = ctx.session.prepared_statements.read().await;
            let stmt = statements.get(&statement).ok_or_else(|| {
                Self::missing_statement(&statement)
            })?;
            stmt.param_types.clone()
        };

        if values.len() != param_types.len() {
            return Err(PgBridgeError::Protocol(format!(
                "bind message supplies {} parameters, but prepared statement \"{statement}\" requires {}",
                values.len(),
                param_types.len()
            )));
        }
        if formats.len() > 1 && formats.len() != values.len() {
            return Err(PgBridgeError::Protocol(format!(
                "bind message has {} parameter formats but {} parameters",
                formats.len(),
                values.len()
            )));
        }

        if !portal.is_empty() && ctx.session.portals.read().await.contains_key(&portal) {
            return Err(PgBridgeError::Backend(
                BackendError::new(format!("cursor \"{portal}\" already exists"))
                    .with_sqlstate("42P03"),
            ));
        }

        let mut params = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let format = match formats.len() {
                0 => Format::Text,
                1 => Format::from_code(formats[0])?,
                _ => Format::from_code(formats[i])?,
            };
            params.push(decode_parameter(
                value.as_deref(),
                param_types[i],
                format,
            )?);
        }

        ctx.session.portals.write().await.insert(
            portal,
            Portal {
                statement_name: statement,
                params,
                result_formats,
                state: PortalState::Pending,
            },
        );
        framed.feed(BackendMessage::BindComplete).await?;
        Ok(())
    }

    pub async fn handle_describe<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        typ: u8,
        name: String,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match typ {
            b'S' => {
                let statements = ctx.session.prepared_statements.read().await;
                let stmt = statements
                    .get(&name)
                    .ok_or_else(|| Self::missing_statement(&name))?;
                let param_oids = stmt.describe_param_oids();
                let row_description = Self::statement_row_description(stmt, &[], Format::Text)?;
                drop(statements);

                framed
                    .feed(BackendMessage::ParameterDescription(param_oids))
                    .await?;
                framed.feed(row_description).await?;
            }
            b'P' => {
                let portals = ctx.session.portals.read().await;
                let portal = portals
                    .get(&name)
                    .ok_or_else(|| Self::missing_portal(&name))?;
                let statement_name = portal.statement_name.clone();
                let result_formats = portal.result_formats.clone();
                drop(portals);

                let statements = ctx.session.prepared_statements.read().await;
                let stmt = statements
                    .get(&statement_name)
                    .ok_or_else(|| Self::missing_statement(&statement_name))?;
                let row_description = Self::statement_row_description(
                    stmt,
                    &result_formats,
                    ctx.default_result_format(),
                )?;
                drop(statements);

                framed.feed(row_description).await?;
            }
            other => {
                return Err(PgBridgeError::Protocol(format!(
                    "invalid describe type '{}'",
                    other as char
                )))
            }
        }
        Ok(())
    }

    fn statement_row_description(
        stmt: &PreparedStatement,
        result_formats: &[i16],
        default_format: Format,
    ) -> Result<BackendMessage, PgBridgeError> {
        if !stmt.info.returns_rows {
            return Ok(BackendMessage::NoData);
        }
        let pg_types = stmt.column_pg_types();
        let fields =
            field_descriptions(&stmt.info.columns, &pg_types, result_formats, default_format)?;
        Ok(BackendMessage::RowDescription(fields))
    }

    pub async fn handle_execute<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        portal_name: String,
        max_rows: i32,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut portal = ctx
            .session
            .portals
            .write()
            .await
            .remove(&portal_name)
            .ok_or_else(|| Self::missing_portal(&portal_name))?;

        let stmt = {
            let statements = ctx.session.prepared_statements.read().await;
            statements
                .get(&portal.statement_name)
                .cloned()
                .ok_or_else(|| Self::missing_statement(&portal.statement_name))?
        };

        let outcome = Self::run_portal(framed, ctx, &stmt, &mut portal, max_rows).await;
        // The portal survives Execute; Sync and Close decide its fate.
        ctx.session
            .portals
            .write()
            .await
            .insert(portal_name, portal);
        outcome
    }

    async fn run_portal<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        stmt: &PreparedStatement,
        portal: &mut Portal,
        max_rows: i32,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if stmt.sql.is_empty() {
            portal.state = PortalState::Drained;
            framed.feed(BackendMessage::EmptyQueryResponse).await?;
            return Ok(());
        }

        if SetHandler::is_set_command(&stmt.sql) {
            portal.state = PortalState::Drained;
            return SetHandler::handle(framed, &ctx.session, &stmt.sql, true).await;
        }

        let (result, offset) = match std::mem::replace(&mut portal.state, PortalState::Drained) {
            PortalState::Pending => {
                let result = ctx.client.execute(&stmt.translated_sql, &portal.params)?;
                if !result.returns_rows {
                    framed
                        .feed(BackendMessage::CommandComplete {
                            tag: command_tag(&stmt.sql, &result, 0),
                        })
                        .await?;
                    return Ok(());
                }
                (result, 0usize)
            }
            PortalState::Suspended { result, offset } => (result, offset),
            PortalState::Drained => {
                framed
                    .feed(BackendMessage::CommandComplete {
                        tag: command_tag(
                            &stmt.sql,
                            &ExecutionResult {
                                columns: Vec::new(),
                                rows: Vec::new(),
                                rows_affected: 0,
                                returns_rows: true,
                            },
                            0,
                        ),
                    })
                    .await?;
                return Ok(());
            }
        };

        let pg_types = Self::execute_column_types(stmt, &result);
        let default_format = ctx.default_result_format();
        let limit = if max_rows <= 0 {
            usize::MAX
        } else {
            max_rows as usize
        };

        let mut cursor = offset;
        let mut sent = 0usize;
        while cursor < result.rows.len() && sent < limit {
            let row = &result.rows[cursor];
            let encoded = row
                .iter()
                .zip(pg_types.iter())
                .enumerate()
                .map(|(i, (value, ty))| {
                    let format =
                        resolve_result_format(&portal.result_formats, i, default_format)?;
                    encode_value(value, *ty, format, ctx.config.text_format)
                })
                .collect::<Result<Vec<_>, _>>()?;
            framed.feed(BackendMessage::DataRow(encoded)).await?;
            cursor += 1;
            sent += 1;
        }

        if cursor < result.rows.len() {
            portal.state = PortalState::Suspended { result, offset: cursor };
            framed.feed(BackendMessage::PortalSuspended).await?;
        } else {
            let tag = command_tag(&stmt.sql, &result, cursor as u64);
            portal.state = PortalState::Drained;
            framed.feed(BackendMessage::CommandComplete { tag }).await?;
        }
        Ok(())
    }

    /// Column types at execute time. The described types must match what
    /// rows encode as, so the priority is the same as Describe: backend
    /// prepare metadata, then cast hints, then text.
    fn execute_column_types(stmt: &PreparedStatement, result: &ExecutionResult) -> Vec<PgType> {
        result
            .columns
            .iter()
            .enumerate()
            .map(|(i, _)| {
                if let Some(column) = stmt.info.columns.get(i) {
                    if let Some(ty) = column.ty {
                        return ty.pg_type();
                    }
                }
                if let Some(Some(hint)) = stmt.result_hints.get(i) {
                    return *hint;
                }
                PgType::Text
            })
            .collect()
    }

    pub async fn handle_close<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        typ: u8,
        name: String,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match typ {
            // Closing something that does not exist is not an error.
            b'S' => ctx.session.close_statement(&name).await,
            b'P' => ctx.session.close_portal(&name).await,
            other => {
                return Err(PgBridgeError::Protocol(format!(
                    "invalid close type '{}'",
                    other as char
                )))
            }
        }
        framed.feed(BackendMessage::CloseComplete).await?;
        Ok(())
    }

    fn missing_statement(name: &str) -> PgBridgeError {
        PgBridgeError::Backend(
            BackendError::new(format!("prepared statement \"{name}\" does not exist"))
                .with_sqlstate("26000"),
        )
    }

    fn missing_portal(name: &str) -> PgBridgeError {
        PgBridgeError::Backend(
            BackendError::new(format!("portal \"{name}\" does not exist"))
                .with_sqlstate("34000"),
        )
    }
}
