// src/server/initialization.rs

//! Handles server initialization: shared state, TLS, and the client listener.

use super::context::ServerContext;
use crate::config::{BackboneConfig, Config};
use crate::core::state::BridgeState;
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config)?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let scheme = if acceptor.is_some() { "wss" } else { "ws" };
    info!(
        "topicbridge listening on {}://{}:{}",
        scheme, config.host, config.port
    );

    let connection_permits = Arc::new(Semaphore::new(config.max_clients));
    let state = BridgeState::initialize(config);
    info!("Bridge state initialized.");

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        acceptor,
        connection_permits,
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Accepting up to {} concurrent sessions. Unrecognized actions go to '{}'.",
        config.max_clients, config.system_topic
    );
    match &config.backbone {
        BackboneConfig::Local(local) => info!(
            "Using the in-process backbone (channel capacity {}).",
            local.channel_capacity
        ),
        BackboneConfig::Resp(resp) => {
            info!("Using the RESP backbone at {}:{}.", resp.host, resp.port)
        }
    }
    if config.session.error_replies {
        info!("Dropped frames are reported to clients with error frames.");
    }
    if !config.tls.enabled && config.host != "127.0.0.1" && config.host != "localhost" {
        warn!("WARNING: TLS is disabled while listening on {}.", config.host);
    }
}
