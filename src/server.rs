
use crate::state::AppState;
use crate::{admin, metrics, pipeline};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn serve_http(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, state, remote_addr).await) }
            }))
        }
    });

    let server = Server::bind(&addr).tcp_nodelay(true).serve(make_svc);
    let graceful = server.with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    graceful.await?;
    Ok(())
}

async fn handle(
    req: Request<Body>,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Response<Body> {
    let path = req.uri().path();

    if req.method() == hyper::Method::GET && path == "/health" {
        return Response::new(Body::from("OK"));
    }

    if req.method() == hyper::Method::GET && path == "/metrics" {
        return metrics::render();
    }

    if path.starts_with("/admin") {
        return admin::handle_admin(req, state).await;
    }

    pipeline::handle(req, state, client_addr).await
}
