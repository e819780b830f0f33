use anyhow::Result;
use bff_core::GatewayConfig;
use bff_proxy::{Gateway, GatewayBody};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Span};
use tracing_subscriber::EnvFilter;

/// How long open connections (including SSE relays) get to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting bff-gateway...");

    let config = GatewayConfig::from_env();
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let cors = cors_layer(&config.cors_allowed_origins);

    let gateway = Arc::new(Gateway::new(config)?);
    let cleanup = gateway.rate_limiter().spawn_cleanup_task();
    info!("Rate limiter cleanup task started");

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        connections.spawn(connection_task(
            gateway.clone(),
            cors.clone(),
            stream,
            peer_addr,
            shutdown_rx.clone(),
        ));

        // Reap finished connection tasks so the set stays small
        while connections.try_join_next().is_some() {}
    }

    info!(open_connections = connections.len(), "Stopped accepting connections, draining");
    let _ = shutdown_tx.send(true);
    cleanup.abort();

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "Drain timeout elapsed, closing remaining connections");
        connections.shutdown().await;
    }

    info!("bff-gateway stopped");
    Ok(())
}

/// Serve one connection until it closes or shutdown is signalled
fn connection_task(
    gateway: Arc<Gateway>,
    cors: CorsLayer,
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> impl Future<Output = ()> + Send + 'static {
    let service = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http().make_span_with(make_span))
        .layer(cors)
        .service_fn(move |req: Request<Incoming>| {
            let gateway = gateway.clone();
            async move { Ok::<_, Infallible>(gateway.handle(req, Some(peer_addr)).await) }
        });
    // Erase the layered future and body types so `Send` is proven here, not inside hyper's connection
    let service = BoxCloneService::new(service.map_response(|res: Response<_>| res.map(GatewayBody::new)));
    let io = TokioIo::new(stream);

    async move {
        let shutdown: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            let _ = shutdown_rx.changed().await;
        });

        let conn = http1::Builder::new().serve_connection(io, TowerToHyperService::new(service));
        tokio::pin!(conn);

        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                }
            }
            _ = shutdown => {
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.await {
                    debug!("Error draining HTTP connection from {}: {}", peer_addr, e);
                }
            }
        }
    }
}

/// Span fields stay to method and path: query strings can carry message text
fn make_span(req: &Request<Incoming>) -> Span {
    tracing::debug_span!("http", method = %req.method(), path = %req.uri().path())
}

/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    info!(origins = ?allowed_origins, "CORS configured");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(Duration::from_secs(600))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn accepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer_addr) = listener.accept().await.unwrap();
        (client, server, peer_addr)
    }

    fn test_gateway() -> Arc<Gateway> {
        Arc::new(Gateway::new(GatewayConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_connection_task_serves_requests() {
        let (mut client, server, peer_addr) = accepted_pair().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_task(test_gateway(), cors_layer(&[]), server, peer_addr, shutdown_rx));

        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("bff_active_streams"));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_task_stops_on_shutdown() {
        let (_client, server, peer_addr) = accepted_pair().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_task(test_gateway(), cors_layer(&[]), server, peer_addr, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("idle connection closes after shutdown")
            .unwrap();
    }
}
