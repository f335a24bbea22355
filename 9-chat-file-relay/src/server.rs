use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    config::RelayConfig,
    error::ServerError,
    event::{EventSender, ServerEvent},
    registry::Registry,
    relay::Relay,
    session::{self, SessionContext},
};

pub struct Server {
    listener: TcpListener,
    ctx: SessionContext,
    shutdown: CancellationToken,
}

/// Clonable control surface for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    events: EventSender,
    registry: Arc<Registry>,
}

impl ServerHandle {
    /// Asks the server to stop. Calling it more than once has no extra effect.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Server {
    pub async fn bind(config: RelayConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self::from_listener(listener, config))
    }

    /// Wraps an already bound listener; `config.listen` is ignored.
    pub fn from_listener(listener: TcpListener, config: RelayConfig) -> Self {
        let events = EventSender::new(config.event_capacity);
        let registry = Arc::new(Registry::new());
        Self {
            listener,
            ctx: SessionContext {
                relay: Relay::new(registry, events.clone()),
                events,
                config: Arc::new(config),
            },
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            events: self.ctx.events.clone(),
            registry: Arc::clone(self.ctx.relay.registry()),
        }
    }

    /// Accepts connections until [`ServerHandle::stop`] is called, then closes
    /// every session and waits for their tasks to finish.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            ctx,
            shutdown,
        } = self;
        let addr = listener.local_addr()?;
        let sessions = TaskTracker::new();

        info!(%addr, "relay listening");
        ctx.events.emit(ServerEvent::Started { addr });

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &ctx, &shutdown, &sessions);
                }
            }
        }

        drop(listener);
        shutdown_sessions(&ctx, &sessions).await;
        ctx.events.emit(ServerEvent::Stopped);
        info!(%addr, "relay stopped");

        Ok(())
    }

    pub async fn run_until<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle();
        let watcher = tokio::spawn(async move {
            signal.await;
            handle.stop();
        });
        let result = self.run().await;
        watcher.abort();
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    ctx: &SessionContext,
    shutdown: &CancellationToken,
    sessions: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, ctx, shutdown, sessions),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &SessionContext,
    shutdown: &CancellationToken,
    sessions: &TaskTracker,
) {
    let ctx = ctx.clone();
    let cancel = shutdown.child_token();
    sessions.spawn(
        async move {
            let (reader, writer) = stream.into_split();
            match session::serve(reader, writer, Some(peer), &ctx, cancel).await {
                Ok(exit) => debug!(?exit, "session finished"),
                Err(err) => warn!(error = ?err, "session closed with error"),
            }
        }
        .instrument(info_span!("session", %peer)),
    );
}

/// Closes every registered session concurrently and waits for all session
/// tasks, giving up after `shutdown_timeout` so one stalled peer cannot hold
/// the server open.
async fn shutdown_sessions(ctx: &SessionContext, sessions: &TaskTracker) {
    let active = ctx.relay.registry().snapshot();
    info!(count = active.len(), "closing active sessions");
    for session in active {
        sessions.spawn(async move { session.close().await });
    }

    sessions.close();
    if timeout(ctx.config.shutdown_timeout(), sessions.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = sessions.len(),
            "sessions still running after shutdown timeout"
        );
    }
}
