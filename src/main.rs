//! vfs-gateway server binary.
//!
//! Every authenticated caller owns one workspace directory under a shared
//! base. The gateway resolves caller paths strictly inside that workspace and
//! serializes each tenant's mutations through a per-tenant reader/writer lock,
//! while different tenants proceed independently.

mod atomic;
mod auth;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod paths;
mod tenant_lock;
mod tls;
mod version;
mod workspace;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::AuthConfig;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::files::FsConfig;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::tenant_lock::TenantLocks;
use crate::workspace::Workspaces;

shadow!(build);

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_filter);

    if args.service_token.trim().is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "service token must not be empty",
        ));
    }

    let workspaces = Arc::new(Workspaces::new(std::path::absolute(&args.workspace_base)?));
    workspaces.ensure_base().await?;
    let locks = Arc::new(TenantLocks::new());
    let fs_config = Arc::new(FsConfig::from_secs(args.lock_wait_secs));
    let auth_config = Arc::new(AuthConfig {
        service_token: args.service_token.clone(),
    });
    info!(
        workspace_base = %workspaces.base_path().display(),
        lock_wait = ?fs_config.lock_wait,
        "workspace gateway configured"
    );

    let app = build_router(&args, workspaces, locks, fs_config, auth_config);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    tokio::select! {
        result = http_server => result?,
        result = serve_https(&args, host, handle.clone(), app) => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

fn build_router(
    args: &Args,
    workspaces: Arc<Workspaces>,
    locks: Arc<TenantLocks>,
    fs_config: Arc<FsConfig>,
    auth_config: Arc<AuthConfig>,
) -> Router {
    let files_api = Router::new()
        .route("/stat", get(files::stat_entry))
        .route("/readdir", get(files::read_dir))
        .route("/read", get(files::read_file))
        .route("/read-binary", get(files::read_file_binary))
        .route("/mkdir", post(files::make_dir))
        .route("/write", post(files::write_file))
        .route("/write-binary", post(files::write_file_binary))
        .route("/remove", delete(files::remove_entry))
        .route("/rename", post(files::rename_entry));

    let mut app = Router::new()
        .nest("/api/v1/files", files_api)
        .route("/api/v1/version", get(version::get_version_info))
        .route("/healthz", get(version::healthz))
        .layer(DefaultBodyLimit::max(args.max_body_bytes))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                        tenant = tracing::field::Empty,
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(workspaces))
        .layer(Extension(locks))
        .layer(Extension(fs_config))
        .layer(Extension(auth_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }
    app
}

/// HTTPS 监听；未配置端口时永不返回，只由 HTTP 监听与关停信号驱动 select。
async fn serve_https(
    args: &Args,
    host: IpAddr,
    handle: Handle,
    app: Router,
) -> Result<(), std::io::Error> {
    let Some(port) = args.https_port else {
        return std::future::pending().await;
    };
    let tls_config = tls::build_rustls_config(args, host).await?;
    let https_addr = SocketAddr::new(host, port);
    info!("Starting HTTPS server at {}", https_addr);
    axum_server::bind_rustls(https_addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
