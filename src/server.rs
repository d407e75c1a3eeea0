//! HTTP 服务器
//!
//! 把报告访问路由挂载到应用上，附加追踪和 CORS 中间件，并负责监听与优雅关闭。

use crate::config::AppConfig;
use crate::error::{Error, Result};
use axum::{Router, http::Request};
use report_access::AccessState;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::CorsLayer,
    trace::{MakeSpan, TraceLayer},
};
use tracing::{Span, error, info, info_span};

#[cfg(feature = "opentelemetry")]
use opentelemetry::{Context, propagation::Extractor, trace::TraceContextExt};
#[cfg(feature = "opentelemetry")]
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub type HttpTraceLayer = TraceLayer<SharedClassifier<ServerErrorsAsFailures>, HttpMakeSpan>;

pub fn http_trace_layer() -> HttpTraceLayer {
    TraceLayer::new_for_http().make_span_with(HttpMakeSpan)
}

#[derive(Clone, Debug, Default)]
pub struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let span = info_span!(
            "http.request",
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version()
        );

        #[cfg(feature = "opentelemetry")]
        if let Some(context) = extract_remote_context(request.headers()) {
            let _ = span.set_parent(context);
        }

        span
    }
}

#[cfg(feature = "opentelemetry")]
fn extract_remote_context(headers: &axum::http::HeaderMap) -> Option<Context> {
    struct HeaderExtractor<'a>(&'a axum::http::HeaderMap);

    impl<'a> Extractor for HeaderExtractor<'a> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).and_then(|value| value.to_str().ok())
        }

        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(|name| name.as_str()).collect()
        }
    }

    let context = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });
    if context.span().span_context().is_valid() {
        Some(context)
    } else {
        None
    }
}

/// 构建完整的应用路由
pub fn build_app(state: AccessState) -> Router {
    report_access::create_router(state)
        .layer(http_trace_layer())
        .layer(CorsLayer::permissive())
}

/// 绑定监听地址
pub async fn bind(config: &AppConfig) -> Result<tokio::net::TcpListener> {
    let addr: SocketAddr = config.bind.http.socket_addr().map_err(|e| {
        Error::service_startup(format!(
            "Invalid bind address {}:{}: {e}",
            config.bind.http.ip, config.bind.http.port
        ))
    })?;

    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::service_startup(format!("Failed to bind to address '{addr}': {e}")))
}

/// 运行 HTTP 服务，直到收到关闭信号
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!("HTTP server listening on {}", local_addr);

    let mut shutdown_rx = shutdown_tx.subscribe();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        info!("HTTP server received shutdown signal");
    });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
        let _ = shutdown_tx.send(());
        return Err(Error::Io(e));
    }

    info!("HTTP server stopped");
    Ok(())
}
