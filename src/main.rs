//! HaziVault server binary.
//!
//! Self-hosted file storage confined to a switchable storage root. The
//! main entry point loads the persisted root and account, builds the Axum
//! router, and starts the HTTP listener plus HTTPS when a certificate is
//! configured.

mod atomic;
mod auth;
mod background;
mod bulk;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod paths;
mod root;
mod stats;
mod storage;
mod tls;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::{AuthSettings, Authenticator};
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::{RequestScheme, build_cors_layer, resolve_client_ip};
use crate::root::RootRegistry;
use crate::stats::{HostStats, SystemStats};
use crate::upload::UploadConfig;

shadow!(build);

/// Starts the HaziVault server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let registry = Arc::new(
        RootRegistry::load(
            PathBuf::from(&args.config_file),
            PathBuf::from(&args.storage_dir),
        )
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?,
    );
    let auth = Arc::new(
        Authenticator::load(
            PathBuf::from(&args.credentials_file),
            AuthSettings {
                session_ttl: Duration::from_secs(args.session_ttl_secs),
                login_window: Duration::from_secs(args.login_window_secs),
                login_max_attempts: args.login_max_attempts,
                login_lockout: Duration::from_secs(args.login_lockout_secs),
                trust_proxy: args.trust_proxy,
            },
        )
        .await?,
    );
    let upload_config = Arc::new(UploadConfig {
        max_total_size: args.upload_max_size,
        max_files: args.upload_max_files,
        staging_ttl: Duration::from_secs(args.staging_ttl_secs),
    });
    let stats: Arc<dyn SystemStats> = Arc::new(HostStats::default());
    let trust_proxy = args.trust_proxy;

    let mut app = Router::new()
        .route(
            "/api/files",
            get(files::list_files).delete(files::delete_entry),
        )
        .route("/api/files/download", get(files::download_file))
        .route("/api/files/folder", post(files::create_folder))
        .route("/api/files/delete", post(files::delete_entries))
        .route("/api/files/rename", post(files::rename_entry))
        .route(
            "/api/upload",
            post(upload::upload_files).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/storage/root",
            get(files::get_storage_root).put(files::set_storage_root),
        )
        .route("/api/storage/volumes", get(stats::list_volumes))
        .route("/api/system", get(stats::system_overview))
        .route("/api/auth/exists", get(auth::auth_exists))
        .route("/api/auth/register", post(auth::auth_register))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip, trust_proxy)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(registry.clone()))
        .layer(Extension(auth.clone()))
        .layer(Extension(upload_config.clone()))
        .layer(Extension(stats));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    spawn_background_tasks(registry, auth, upload_config);

    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());
    info!("starting HTTP server at {}", http_addr);

    match tls_config {
        Some(tls_config) => {
            let https_addr = SocketAddr::new(host, args.https_port);
            let https_app = app.layer(Extension(RequestScheme::Https));
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(https_app.into_make_service_with_connect_info::<SocketAddr>());
            info!("starting HTTPS server at {}", https_addr);

            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
