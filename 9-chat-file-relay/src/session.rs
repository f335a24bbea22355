//! One task per accepted connection.
//!
//! A session reads the username line, registers it, then reads fixed-size
//! frame buffers until the peer goes away or the server is stopped. Cleanup
//! runs on every exit path once the session has been registered.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::RelayConfig,
    error::LineError,
    event::{EventSender, ServerEvent},
    frame::{self, FIELD_SEPARATOR},
    registry::{BoxedWriter, SessionHandle},
    relay::Relay,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registering,
    Active,
    Closing,
    Closed,
}

/// Why a session task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Rejected(&'static str),
    HandshakeTimedOut,
    PeerClosed,
    Cancelled,
}

/// Everything a session needs from the server, shared across all sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub relay: Relay,
    pub events: EventSender,
    pub config: Arc<RelayConfig>,
}

enum Handshake {
    Accepted(SessionHandle),
    Finished(SessionExit),
}

/// Drives a connection from handshake to close.
///
/// Returns `Err` only for transport failures; the registry entry and the
/// connection have already been released by then.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    ctx: &SessionContext,
    cancel: CancellationToken,
) -> io::Result<SessionExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut state = SessionState::Connecting;
    let mut reader = BufReader::with_capacity(ctx.config.frame_size, reader);

    advance(&mut state, SessionState::Registering, peer);
    let session = match handshake(&mut reader, Box::new(writer), peer, ctx, cancel).await? {
        Handshake::Accepted(session) => session,
        Handshake::Finished(exit) => {
            advance(&mut state, SessionState::Closing, peer);
            advance(&mut state, SessionState::Closed, peer);
            return Ok(exit);
        }
    };
    advance(&mut state, SessionState::Active, peer);

    info!(?peer, username = session.username(), "user connected");
    ctx.events.emit(ServerEvent::UserJoined {
        username: session.username().to_string(),
    });

    let exit = run_loop(&mut reader, &session, ctx).await;

    advance(&mut state, SessionState::Closing, peer);
    cleanup(&session, ctx, &exit).await;
    advance(&mut state, SessionState::Closed, peer);

    exit
}

async fn handshake<R>(
    reader: &mut R,
    mut writer: BoxedWriter,
    peer: Option<SocketAddr>,
    ctx: &SessionContext,
    cancel: CancellationToken,
) -> io::Result<Handshake>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let line = select! {
        _ = cancel.cancelled() => return Ok(Handshake::Finished(SessionExit::Cancelled)),
        line = timeout(
            ctx.config.handshake_timeout(),
            frame::read_line(reader, ctx.config.max_username_len),
        ) => line,
    };

    let Ok(line) = line else {
        debug!(?peer, "handshake timed out");
        if let Err(err) = writer.shutdown().await {
            debug!(?peer, ?err, "writer shutdown failed");
        }
        return Ok(Handshake::Finished(SessionExit::HandshakeTimedOut));
    };

    let username = match line {
        Ok(line) => line.unwrap_or_default().trim().to_string(),
        Err(LineError::TooLong { .. }) => {
            return reject(writer, peer, ctx, frame::USERNAME_TOO_LONG).await;
        }
        Err(LineError::Io(err)) => return Err(err),
    };
    if username.is_empty() {
        return reject(writer, peer, ctx, frame::EMPTY_USERNAME).await;
    }
    if username.as_bytes().contains(&FIELD_SEPARATOR) {
        return reject(writer, peer, ctx, frame::INVALID_USERNAME).await;
    }

    let session = SessionHandle::new(username, peer, writer, cancel);
    let mut outbound = session.lock_writer().await;

    if !ctx.relay.registry().try_register(session.clone()) {
        debug!(?peer, username = session.username(), "username already registered");
        ctx.events.emit(ServerEvent::Rejected {
            peer,
            reason: frame::DUPLICATE_USERNAME,
        });
        frame::write_line(&mut *outbound, frame::DUPLICATE_USERNAME).await?;
        outbound.shutdown().await?;
        return Ok(Handshake::Finished(SessionExit::Rejected(
            frame::DUPLICATE_USERNAME,
        )));
    }

    if let Err(err) = frame::write_line(&mut *outbound, frame::ACCEPTED).await {
        drop(outbound);
        ctx.relay.registry().remove_if_same(&session);
        return Err(err);
    }
    drop(outbound);

    Ok(Handshake::Accepted(session))
}

async fn reject(
    mut writer: BoxedWriter,
    peer: Option<SocketAddr>,
    ctx: &SessionContext,
    reason: &'static str,
) -> io::Result<Handshake> {
    debug!(?peer, reason, "handshake rejected");
    ctx.events.emit(ServerEvent::Rejected { peer, reason });
    frame::write_line(&mut writer, reason).await?;
    writer.shutdown().await?;
    Ok(Handshake::Finished(SessionExit::Rejected(reason)))
}

async fn run_loop<R>(
    reader: &mut R,
    session: &SessionHandle,
    ctx: &SessionContext,
) -> io::Result<SessionExit>
where
    R: AsyncRead + Unpin,
{
    let cancel = session.cancel_token().clone();
    let mut buffer = vec![0u8; ctx.config.frame_size];

    loop {
        let read = select! {
            _ = cancel.cancelled() => return Ok(SessionExit::Cancelled),
            read = reader.read(&mut buffer) => read?,
        };
        if read == 0 {
            return Ok(SessionExit::PeerClosed);
        }

        if let Err(err) = dispatch(&buffer[..read], session, ctx).await {
            if cancel.is_cancelled() {
                return Ok(SessionExit::Cancelled);
            }
            return Err(err);
        }
    }
}

async fn dispatch(raw: &[u8], session: &SessionHandle, ctx: &SessionContext) -> io::Result<()> {
    let frame = match frame::decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(username = session.username(), %err, "skipping frame");
            return Ok(());
        }
    };

    if frame.kind.is_file() {
        ctx.relay
            .relay_file_chunk(session.username(), &frame.username, frame.kind, raw)
            .await;
        return Ok(());
    }

    ctx.relay
        .relay_text(session, &frame.username, &frame.payload)
        .await
}

async fn cleanup(session: &SessionHandle, ctx: &SessionContext, exit: &io::Result<SessionExit>) {
    ctx.relay.registry().remove_if_same(session);
    session.close().await;

    let peer = session.peer();
    match exit {
        Ok(reason) => info!(?peer, username = session.username(), ?reason, "user disconnected"),
        Err(err) => info!(?peer, username = session.username(), %err, "user disconnected"),
    }
    ctx.events.emit(ServerEvent::UserLeft {
        username: session.username().to_string(),
    });
}

fn advance(state: &mut SessionState, next: SessionState, peer: Option<SocketAddr>) {
    debug!(?peer, from = ?*state, to = ?next, "session state");
    *state = next;
}
