//! Serving lifecycle supervisor.
//!
//! Binds the HTTP server (stepping through ports when the requested one is
//! taken), registers the instance in the shared registry, runs the
//! background ingest watcher and the registry heartbeat, and coordinates
//! cooperative shutdown: SIGINT/SIGTERM and `POST /api/shutdown` all set
//! one process-global flag that every loop polls at ≤100 ms granularity.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::auth::AdminAuth;
use crate::ingest::IngestEngine;
use crate::metrics::Metrics;
use crate::registry::{InstanceRegistry, HEARTBEAT_INTERVAL_SECS};
use crate::server::{build_router, AppState};

/// How many ports above the requested one are tried before falling back to
/// an OS-chosen ephemeral port.
const PORT_PROBE_RANGE: u16 = 20;

/// Poll granularity for shutdown-responsive sleeps.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Process-global cooperative shutdown flag.
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, so a request landing in
            // between cannot be missed.
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind to `port`, trying up to [`PORT_PROBE_RANGE`] successors, then an
/// ephemeral port. Returns the listener and the port actually bound.
pub async fn bind_to_port_incremental(port: u16) -> Result<(TcpListener, u16)> {
    if port != 0 {
        for candidate in port..port.saturating_add(PORT_PROBE_RANGE) {
            match TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => return Ok((listener, candidate)),
                Err(_) => continue,
            }
        }
        warn!(
            "Unable to bind any port in [{}..{}], falling back to ephemeral",
            port,
            port.saturating_add(PORT_PROBE_RANGE)
        );
    }
    let listener = TcpListener::bind(("0.0.0.0", 0))
        .await
        .context("Failed to bind an ephemeral port")?;
    let bound = listener.local_addr()?.port();
    Ok((listener, bound))
}

/// Run the server until shutdown: HTTP + watcher + heartbeat.
pub async fn run_serve(
    engine: Arc<IngestEngine>,
    auth: Arc<AdminAuth>,
    app_key: String,
    port: u16,
    watch: bool,
    interval_secs: u64,
    info_file: Option<PathBuf>,
) -> Result<()> {
    let shutdown = Arc::new(Shutdown::new());
    install_signal_handlers(Arc::clone(&shutdown));

    let (listener, bound_port) = bind_to_port_incremental(port).await?;

    if let Some(info_file) = &info_file {
        let info = serde_json::json!({
            "port": bound_port,
            "timestamp": chrono::Utc::now().timestamp(),
            "watch_enabled": watch,
            "watch_interval": interval_secs,
            "pid": std::process::id(),
            "exec": std::env::current_exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        });
        match std::fs::write(info_file, serde_json::to_string_pretty(&info)?) {
            Ok(()) => info!(path = %info_file.display(), "Instance info saved to --info-file"),
            Err(e) => warn!(path = %info_file.display(), error = %e, "Unable to write info file"),
        }
    }

    let settings = engine.settings().await;
    let registry = Arc::new(InstanceRegistry::open(None).await?);
    registry
        .register(bound_port, if watch { interval_secs } else { 0 }, &settings)
        .await?;

    let heartbeat_handle = {
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let period = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
            let mut next = Instant::now() + period;
            while !shutdown.is_requested() {
                if Instant::now() < next {
                    tokio::time::sleep(POLL_SLICE).await;
                    continue;
                }
                if let Err(e) = registry.heartbeat().await {
                    warn!(error = %e, "Heartbeat update failed");
                }
                next = Instant::now() + period;
            }
        })
    };

    let watcher_handle = if watch {
        info!("Auto-update: enabled (every {}s)", interval_secs);
        let engine = Arc::clone(&engine);
        let shutdown = Arc::clone(&shutdown);
        Some(tokio::spawn(async move {
            info!("[Watch] Background monitoring started (interval: {}s)", interval_secs);
            let period = Duration::from_secs(interval_secs.max(1));
            let mut next = Instant::now() + period;
            while !shutdown.is_requested() {
                if Instant::now() < next {
                    tokio::time::sleep(POLL_SLICE).await;
                    continue;
                }
                if let Err(e) = engine.update().await {
                    error!(error = %e, "[Watch] Error during update");
                }
                next = Instant::now() + period;
            }
            info!("[Watch] Background monitoring stopped");
        }))
    } else {
        info!("Auto-update: disabled");
        None
    };

    let state = AppState {
        engine: Arc::clone(&engine),
        auth,
        metrics: Arc::new(Metrics::new()),
        registry: Some(Arc::clone(&registry)),
        shutdown: Arc::clone(&shutdown),
        app_key,
    };
    let app = build_router(state);

    info!("Starting HTTP API server on port {}...", bound_port);
    info!("Press Ctrl+C to stop");

    let server_shutdown = Arc::clone(&shutdown);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { server_shutdown.wait().await })
    .await
    .context("HTTP server failed")?;

    info!("Shutting down gracefully...");
    if let Err(e) = registry.unregister().await {
        warn!(error = %e, "Failed to unregister instance");
    }
    if let Err(e) = engine.store().persist() {
        warn!(error = %e, "Failed to persist the index on shutdown");
    }
    let _ = heartbeat_handle.await;
    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }
    info!("Shutdown complete.");
    Ok(())
}

fn install_signal_handlers(shutdown: Arc<Shutdown>) {
    let ctrl_c_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_shutdown.request();
        }
    });
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let Ok(mut sigterm) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };
            sigterm.recv().await;
            shutdown.request();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_requested_or_successor_port() {
        // Occupy a port, then ask for it again.
        let (first, port) = bind_to_port_incremental(0).await.unwrap();
        let _hold = first;
        let (second, bound) = bind_to_port_incremental(port).await.unwrap();
        drop(second);
        assert_ne!(bound, port, "occupied port must not be handed out again");
    }

    #[tokio::test]
    async fn ephemeral_bind_returns_nonzero_port() {
        let (listener, port) = bind_to_port_incremental(0).await.unwrap();
        assert!(port > 0);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn shutdown_flag_wakes_waiters() {
        let shutdown = Arc::new(Shutdown::new());
        assert!(!shutdown.is_requested());

        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake after request")
            .unwrap();
        assert!(shutdown.is_requested());
    }
}
