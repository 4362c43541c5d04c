//! The per-connection state machine: startup negotiation, authentication,
//! then the message loop dispatching simple and extended query flows.

use super::{QueryContext, SessionState};
use crate::backend;
use crate::error::admin_shutdown_response;
use crate::protocol::{
    AuthenticationMessage, BackendMessage, ErrorResponse, FrontendMessage, PostgresCodec,
};
use crate::query::{ExtendedQueryHandler, QueryExecutor};
use crate::server::ServerState;
use crate::PgBridgeError;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    server: Arc<ServerState>,
) -> Result<(), PgBridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, PostgresCodec::new());

    let startup = loop {
        match framed.next().await {
            None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(FrontendMessage::SslRequest)) | Some(Ok(FrontendMessage::GssEncRequest)) => {
                // Politely refuse encryption negotiation; the client is free
                // to retry a plaintext startup on the same socket.
                framed.get_mut().write_all(b"N").await?;
                framed.get_mut().flush().await?;
            }
            Some(Ok(FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            })) => {
                // No response travels on a cancel connection, match or not.
                let matched = server.registry.cancel(process_id, secret_key);
                debug!("cancel request for backend {process_id}: matched={matched}");
                return Ok(());
            }
            Some(Ok(FrontendMessage::StartupMessage(startup))) => break startup,
            Some(Ok(other)) => {
                let err = PgBridgeError::Protocol(format!(
                    "expected startup message, got {other:?}"
                ));
                let mut response = err.to_error_response();
                response.severity = "FATAL".to_string();
                let _ = framed
                    .send(BackendMessage::ErrorResponse(Box::new(response)))
                    .await;
                return Err(err);
            }
        }
    };

    if startup.protocol_version >> 16 != 3 {
        let response = ErrorResponse::fatal(
            "08P01",
            format!(
                "unsupported frontend protocol {}.{}",
                startup.protocol_version >> 16,
                startup.protocol_version & 0xffff
            ),
        );
        framed
            .send(BackendMessage::ErrorResponse(Box::new(response)))
            .await?;
        return Ok(());
    }

    let user = startup.user().unwrap_or("postgres").to_string();
    let database = startup.database().unwrap_or(user.as_str()).to_string();
    info!("startup from {peer}: user={user} database={database}");

    if server.config.authenticate {
        framed
            .send(BackendMessage::Authentication(
                AuthenticationMessage::CleartextPassword,
            ))
            .await?;
        let password = match framed.next().await {
            Some(Ok(FrontendMessage::Password(password))) => password,
            Some(Ok(FrontendMessage::Terminate)) | None => return Ok(()),
            Some(Ok(other)) => {
                let err = PgBridgeError::Protocol(format!(
                    "expected password message, got {other:?}"
                ));
                let mut response = err.to_error_response();
                response.severity = "FATAL".to_string();
                let _ = framed
                    .send(BackendMessage::ErrorResponse(Box::new(response)))
                    .await;
                return Err(err);
            }
            Some(Err(e)) => return Err(e.into()),
        };
        let accepted = server
            .credentials
            .as_ref()
            .map(|credentials| credentials.verify(&user, &password))
            .unwrap_or(false);
        if !accepted {
            warn!("authentication failed for {user} from {peer}");
            let response = ErrorResponse::fatal(
                "28P01",
                format!("password authentication failed for user \"{user}\""),
            );
            framed
                .send(BackendMessage::ErrorResponse(Box::new(response)))
                .await?;
            return Ok(());
        }
    }

    let client = match backend::connect(&server.config.connection_url()) {
        Ok(client) => client,
        Err(err) => {
            let response = ErrorResponse::fatal("08006", err.message.clone());
            framed
                .send(BackendMessage::ErrorResponse(Box::new(response)))
                .await?;
            return Err(PgBridgeError::Backend(err));
        }
    };

    let session = Arc::new(SessionState::new(database, user));
    let (process_id, secret_key) = server.registry.register(client.interrupt_handle());

    framed
        .feed(BackendMessage::Authentication(AuthenticationMessage::Ok))
        .await?;
    let mut parameters: Vec<(String, String)> = session
        .parameters
        .read()
        .await
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    parameters.sort();
    for (name, value) in parameters {
        framed
            .feed(BackendMessage::ParameterStatus { name, value })
            .await?;
    }
    framed
        .feed(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
        .await?;
    framed
        .send(BackendMessage::ReadyForQuery {
            status: crate::protocol::TransactionStatus::Idle,
        })
        .await?;

    let ctx = QueryContext {
        session,
        client,
        translator: server.translator.clone(),
        config: server.config.clone(),
    };

    let result = message_loop(&mut framed, &ctx, &server).await;
    server.registry.deregister(process_id, secret_key);
    if let Err(ref err) = result {
        // Best-effort error packet before the socket closes; all errors
        // that reach this point are fatal to the session.
        if !matches!(err, PgBridgeError::Io(_)) {
            let mut response = err.to_error_response();
            response.severity = "FATAL".to_string();
            let _ = framed
                .send(BackendMessage::ErrorResponse(Box::new(response)))
                .await;
        }
    }
    info!("connection from {peer} closed");
    result
}

async fn message_loop<S>(
    framed: &mut Framed<S, PostgresCodec>,
    ctx: &QueryContext,
    server: &Arc<ServerState>,
) -> Result<(), PgBridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // After an error inside an extended batch, everything up to the next
    // Sync is discarded; exactly one ErrorResponse leaves the session.
    let mut skip_until_sync = false;

    loop {
        let next = tokio::select! {
            _ = server.shutdown.cancelled() => None,
            message = framed.next() => Some(message),
        };
        let message = match next {
            None => {
                let _ = framed
                    .send(BackendMessage::ErrorResponse(Box::new(
                        admin_shutdown_response(),
                    )))
                    .await;
                return Ok(());
            }
            Some(None) => return Ok(()),
            Some(Some(Err(e))) => return Err(e.into()),
            Some(Some(Ok(message))) => message,
        };

        match message {
            FrontendMessage::Query(sql) => {
                // A simple Query ends any extended-error sequence.
                skip_until_sync = false;
                QueryExecutor::execute_query(framed, ctx, &sql).await?;
                let status = ctx.session.transaction_status(ctx.client.as_ref());
                framed
                    .send(BackendMessage::ReadyForQuery { status })
                    .await?;
            }
            FrontendMessage::Parse { .. }
            | FrontendMessage::Bind { .. }
            | FrontendMessage::Describe { .. }
            | FrontendMessage::Execute { .. }
            | FrontendMessage::Close { .. }
            | FrontendMessage::Unsupported { .. }
                if skip_until_sync =>
            {
                debug!("discarding {message:?} until Sync");
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                let outcome =
                    ExtendedQueryHandler::handle_parse(framed, ctx, name, query, param_types)
                        .await;
                skip_until_sync |= report_extended_error(framed, ctx, outcome).await?;
            }
            FrontendMessage::Bind {
                portal,
                statement,
                formats,
                values,
                result_formats,
            } => {
                let outcome = ExtendedQueryHandler::handle_bind(
                    framed,
                    ctx,
                    portal,
                    statement,
                    formats,
                    values,
                    result_formats,
                )
                .await;
                skip_until_sync |= report_extended_error(framed, ctx, outcome).await?;
            }
            FrontendMessage::Describe { typ, name } => {
                let outcome =
                    ExtendedQueryHandler::handle_describe(framed, ctx, typ, name).await;
                skip_until_sync |= report_extended_error(framed, ctx, outcome).await?;
            }
            FrontendMessage::Execute { portal, max_rows } => {
                let outcome =
                    ExtendedQueryHandler::handle_execute(framed, ctx, portal, max_rows).await;
                skip_until_sync |= report_extended_error(framed, ctx, outcome).await?;
            }
            FrontendMessage::Close { typ, name } => {
                let outcome = ExtendedQueryHandler::handle_close(framed, ctx, typ, name).await;
                skip_until_sync |= report_extended_error(framed, ctx, outcome).await?;
            }
            FrontendMessage::Sync => {
                skip_until_sync = false;
                // The unnamed portal does not survive Sync.
                ctx.session.close_portal("").await;
                let status = ctx.session.transaction_status(ctx.client.as_ref());
                framed
                    .send(BackendMessage::ReadyForQuery { status })
                    .await?;
            }
            FrontendMessage::Flush => {
                framed.flush().await?;
            }
            FrontendMessage::Terminate => return Ok(()),
            FrontendMessage::Unsupported { tag } => {
                // Same discipline as a failing extended message: one
                // ErrorResponse, then discard until the client syncs.
                // ReadyForQuery only ever answers a Sync.
                let err = PgBridgeError::NotSupported(format!(
                    "message type '{}' is not supported by this server",
                    tag as char
                ));
                skip_until_sync |= report_extended_error(framed, ctx, Err(err)).await?;
            }
            other => {
                return Err(PgBridgeError::Protocol(format!(
                    "unexpected message {other:?}"
                )));
            }
        }
    }
}

/// Report an extended-protocol error on the wire. Returns true when the
/// session must discard messages until the next Sync.
async fn report_extended_error<S>(
    framed: &mut Framed<S, PostgresCodec>,
    ctx: &QueryContext,
    outcome: Result<(), PgBridgeError>,
) -> Result<bool, PgBridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match outcome {
        Ok(()) => Ok(false),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            debug!("extended query error: {err}");
            ctx.session.record_error(ctx.client.as_ref());
            framed
                .feed(BackendMessage::ErrorResponse(Box::new(
                    err.to_error_response(),
                )))
                .await?;
            Ok(true)
        }
    }
}
