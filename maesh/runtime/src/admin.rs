//! The read-only admin HTTP server: `/ready`, `/configuration`, `/deploys`,
//! `/metrics`.
//!
//! Hand-rolled on `hyper` + `hyper-util` rather than `kubert`'s built-in admin
//! bundle, the way the teacher's own `src/admin.rs` predates `kubert`'s
//! admin-server helper: this mesh needs three routes `kubert::AdminArgs`
//! doesn't know about.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use maesh_core::DeployLog;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

type Body = Full<Bytes>;

/// The values the admin server reads; never mutates any of them.
pub struct AdminState {
    pub ready: watch::Receiver<bool>,
    pub last_configuration: watch::Receiver<Option<serde_json::Value>>,
    pub deploy_log: Arc<DeployLog>,
    pub registry: Registry,
}

#[instrument(skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, state: Arc<AdminState>, shutdown: drain::Watch) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");

    loop {
        let accept = tokio::select! {
            res = listener.accept() => res,
            handle = shutdown.signaled() => {
                drop(handle);
                return Ok(());
            }
        };

        let (stream, _peer) = match accept {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "failed to accept admin connection");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(&state, req)) }
            });
            if let Err(error) = ConnBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                warn!(%error, "admin connection error");
            }
        });
    }
}

fn route(state: &AdminState, req: Request<Incoming>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/ready") | (&Method::HEAD, "/ready") => handle_ready(state),
        (&Method::GET, "/configuration") => handle_configuration(state),
        (&Method::GET, "/deploys") => handle_deploys(state),
        (&Method::GET, "/metrics") => handle_metrics(state),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found\n".into()),
    }
}

fn handle_ready(state: &AdminState) -> Response<Body> {
    if *state.ready.borrow() {
        respond(StatusCode::OK, "text/plain", "ready\n".into())
    } else {
        respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "not ready\n".into())
    }
}

fn handle_configuration(state: &AdminState) -> Response<Body> {
    match state.last_configuration.borrow().clone() {
        Some(config) => match serde_json::to_vec(&config) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(error) => {
                warn!(%error, "failed to encode last deployed configuration");
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode error\n".into())
            }
        },
        None => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::default())
            .expect("response with no body is always valid"),
    }
}

fn handle_deploys(state: &AdminState) -> Response<Body> {
    let mut records = state.deploy_log.snapshot();
    records.reverse();
    match serde_json::to_vec(&records) {
        Ok(body) => respond(StatusCode::OK, "application/json", body),
        Err(error) => {
            warn!(%error, "failed to encode deploy log");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode error\n".into())
        }
    }
}

fn handle_metrics(state: &AdminState) -> Response<Body> {
    let mut buf = String::new();
    match encode(&mut buf, &state.registry) {
        Ok(()) => respond(
            StatusCode::OK,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
            buf.into_bytes(),
        ),
        Err(error) => {
            warn!(%error, "failed to encode metrics");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode error\n".into())
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Body::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maesh_core::DeployLog;

    fn state(ready: bool) -> AdminState {
        let (_tx, ready_rx) = watch::channel(ready);
        let (_cfg_tx, cfg_rx) = watch::channel(None);
        AdminState {
            ready: ready_rx,
            last_configuration: cfg_rx,
            deploy_log: Arc::new(DeployLog::new(10)),
            registry: Registry::default(),
        }
    }

    #[test]
    fn ready_flag_drives_status_code() {
        assert_eq!(handle_ready(&state(true)).status(), StatusCode::OK);
        assert_eq!(handle_ready(&state(false)).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn configuration_is_no_content_before_first_deploy() {
        assert_eq!(handle_configuration(&state(true)).status(), StatusCode::NO_CONTENT);
    }
}
