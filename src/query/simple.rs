//! Simple-query execution: translate, run, stream rows in text format.

use super::{split_statements, SetHandler};
use crate::protocol::{BackendMessage, PostgresCodec};
use crate::session::QueryContext;
use crate::statements::{command_tag, field_descriptions, select_item_cast_hints};
use crate::types::value_codec::{encode_value, Format};
use crate::types::PgType;
use crate::PgBridgeError;
use futures::SinkExt;
use tokio_util::codec::Framed;
use tracing::{debug, info};

pub struct QueryExecutor;

impl QueryExecutor {
    /// Run one simple-query batch. Statement errors are reported on the
    /// wire and abort the rest of the batch; only fatal errors propagate.
    /// The caller sends the closing ReadyForQuery.
    pub async fn execute_query<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        sql: &str,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let statements = split_statements(sql);
        if statements.is_empty() {
            framed.feed(BackendMessage::EmptyQueryResponse).await?;
            return Ok(());
        }

        for statement in statements {
            let outcome = if SetHandler::is_set_command(statement) {
                SetHandler::handle(framed, &ctx.session, statement, false).await
            } else {
                Self::execute_statement(framed, ctx, statement).await
            };
            if let Err(err) = outcome {
                if err.is_fatal() {
                    return Err(err);
                }
                info!("query failed: {err}");
                ctx.session.record_error(ctx.client.as_ref());
                framed
                    .feed(BackendMessage::ErrorResponse(Box::new(
                        err.to_error_response(),
                    )))
                    .await?;
                break;
            }
        }
        Ok(())
    }

    async fn execute_statement<T>(
        framed: &mut Framed<T, PostgresCodec>,
        ctx: &QueryContext,
        statement: &str,
    ) -> Result<(), PgBridgeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let translation = ctx.translator.translate(statement)?;
        debug!("simple query ({:?}): {}", translation.kind, translation.sql);
        let result = ctx.client.execute(&translation.sql, &[])?;

        if !result.returns_rows {
            framed
                .feed(BackendMessage::CommandComplete {
                    tag: command_tag(statement, &result, 0),
                })
                .await?;
            return Ok(());
        }

        let hints = select_item_cast_hints(&translation.sql);
        let pg_types: Vec<PgType> = result
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                column
                    .ty
                    .map(|ty| ty.pg_type())
                    .or_else(|| hints.get(i).copied().flatten())
                    .unwrap_or(PgType::Text)
            })
            .collect();

        // Simple-query results are always text, whatever the session's
        // extended-query default is.
        let fields = field_descriptions(&result.columns, &pg_types, &[], Format::Text)?;
        framed.feed(BackendMessage::RowDescription(fields)).await?;

        let mut rows_sent: u64 = 0;
        for row in &result.rows {
            let encoded = row
                .iter()
                .zip(pg_types.iter())
                .map(|(value, ty)| {
                    encode_value(value, *ty, Format::Text, ctx.config.text_format)
                })
                .collect::<Result<Vec<_>, _>>()?;
            framed.feed(BackendMessage::DataRow(encoded)).await?;
            rows_sent += 1;
        }

        framed
            .feed(BackendMessage::CommandComplete {
                tag: command_tag(statement, &result, rows_sent),
            })
            .await?;
        Ok(())
    }
}
