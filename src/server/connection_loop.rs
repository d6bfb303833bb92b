// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use super::stream::AnyStream;
use crate::connection;
use crate::core::metrics;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The main server loop that accepts connections and handles graceful shutdown.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut client_tasks = JoinSet::new();

    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                let (socket, addr) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();

                let Ok(permit) = ctx.connection_permits.clone().try_acquire_owned() else {
                    metrics::CONNECTIONS_REJECTED_TOTAL
                        .with_label_values(&["max_clients"])
                        .inc();
                    warn!("Rejecting connection from {}: max_clients reached.", addr);
                    continue;
                };
                debug!("Accepted new connection from: {}", addr);

                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                let state = ctx.state.clone();
                let global_shutdown_rx = ctx.shutdown_tx.subscribe();
                let acceptor = ctx.acceptor.clone();

                client_tasks.spawn(async move {
                    let _permit = permit;
                    let stream = match acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls_stream) => {
                                debug!("TLS handshake successful for {addr}");
                                AnyStream::Tls(Box::new(tls_stream))
                            }
                            Err(e) => {
                                metrics::CONNECTIONS_REJECTED_TOTAL
                                    .with_label_values(&["tls"])
                                    .inc();
                                warn!("TLS handshake error for {addr}: {e}");
                                return;
                            }
                        },
                        None => AnyStream::Tcp(socket),
                    };
                    if let Err(e) = connection::serve(stream, addr, state, global_shutdown_rx).await {
                        warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                    }
                });
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        debug!("No task was listening for the shutdown signal.");
    }

    // Sessions get a moment to close their WebSockets and release adapters.
    if tokio::time::timeout(Duration::from_secs(5), async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for sessions to close; aborting the rest.");
        client_tasks.shutdown().await;
    }
    info!("All client connections closed.");

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
    Ok(())
}
