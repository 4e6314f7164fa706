//! picbin 服务入口。
//!
//! 小型图床：上传经过校验，可选共享 TOTP 密钥保护，平铺存放在同一资源目录，
//! 并作为静态文件输出。入口负责构建 Axum 路由并运行 HTTP 监听直到关闭。

mod assets;
mod atomic;
mod auth;
mod config;
mod credential;
mod error;
mod etag;
mod extensions;
mod http;
mod logging;
mod pages;
mod routes;
mod storage;
mod upload;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::middleware;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::assets::NotFoundPage;
use crate::auth::AuthConfig;
use crate::config::Args;
use crate::credential::CredentialStore;
use crate::extensions::AllowedExtensions;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::pages::PageConfig;
use crate::routes::{AppContext, build_router};
use crate::storage::AssetStore;
use crate::upload::UploadConfig;

shadow!(build);

/// 启动服务并阻塞直到关闭。
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let extensions = AllowedExtensions::from_config(args.allowed_extensions.as_deref());
    let not_found = NotFoundPage::new(PathBuf::from(&args.not_found_page));
    let assets = AssetStore::new(
        PathBuf::from(&args.asset_dir),
        extensions.clone(),
        not_found.reserved_name(),
    );
    assets.ensure_root().await?;

    let auth = AuthConfig {
        enabled: !args.disable_totp,
        issuer: args.totp_issuer.clone(),
        account: args.totp_account.clone(),
        credentials: CredentialStore::new(PathBuf::from(&args.credential_file)),
    };
    if auth.needs_setup().await {
        info!("no TOTP secret found, complete setup at {}", config::SETUP_PATH);
    }

    let ctx = AppContext {
        assets: Arc::new(assets),
        auth: Arc::new(auth),
        upload: Arc::new(UploadConfig {
            naming: args.naming,
            memory_threshold: args.upload_memory_threshold,
        }),
        pages: Arc::new(PageConfig {
            upload_page: !args.disable_upload_page,
            accept: extensions.accept_list(),
        }),
        not_found: Arc::new(not_found),
        upload_max_size: args.upload_max_size,
    };

    let mut app = build_router(ctx)
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
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        asset_dir = %args.asset_dir,
        naming = ?args.naming,
        totp = !args.disable_totp,
        "🚀 Starting HTTP server at {}",
        addr
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::spawn(shutdown_signal(handle));
    server.await?;

    Ok(())
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
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
