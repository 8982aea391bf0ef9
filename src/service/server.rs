// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info};

use super::config::HttpConfig;
use super::{AppError, AppResult, Shutdown};
use crate::ingest::SupervisorState;
use crate::log_store::QueryLimit;
use crate::usecase::GetLogs;

const LOGS_PATH: &str = "/logs";
const HEALTH_PATH: &str = "/";

pub type HttpResponse = Response<Full<Bytes>>;

/// Parameters of `GET /logs`, validated before they reach the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsQuery {
    pub service: Option<String>,
    pub level: Option<String>,
    pub limit: QueryLimit,
}

impl LogsQuery {
    pub fn parse(query: Option<&str>) -> Result<LogsQuery, String> {
        let mut parsed = LogsQuery {
            service: None,
            level: None,
            limit: QueryLimit::DEFAULT,
        };
        let Some(query) = query else {
            return Ok(parsed);
        };
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                // an empty filter means no filter
                "service" => parsed.service = Some(value.into_owned()).filter(|v| !v.is_empty()),
                "level" => parsed.level = Some(value.into_owned()).filter(|v| !v.is_empty()),
                "limit" => {
                    let n: i64 = value
                        .parse()
                        .map_err(|_| format!("limit must be an integer, got '{value}'"))?;
                    parsed.limit = QueryLimit::new(n).ok_or_else(|| {
                        format!(
                            "limit must be between {} and {}, got {n}",
                            QueryLimit::MIN,
                            QueryLimit::MAX
                        )
                    })?;
                }
                _ => {}
            }
        }
        Ok(parsed)
    }
}

/// Shared state of the request handlers.
pub struct QueryContext {
    get_logs: GetLogs,
    allowed_hosts: Vec<String>,
    pipeline_state: watch::Receiver<SupervisorState>,
}

impl QueryContext {
    pub fn new(
        get_logs: GetLogs,
        allowed_hosts: Vec<String>,
        pipeline_state: watch::Receiver<SupervisorState>,
    ) -> Self {
        QueryContext {
            get_logs,
            allowed_hosts,
            pipeline_state,
        }
    }

    fn host_allowed<B>(&self, req: &Request<B>) -> bool {
        if self.allowed_hosts.is_empty() {
            return true;
        }
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host());
        match host.map(strip_port) {
            Some(host) => self.allowed_hosts.iter().any(|allowed| allowed == host),
            None => false,
        }
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [::1]:8000
        return host.split_inclusive(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

fn json_response(status: StatusCode, body: Vec<u8>) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Full::new(Bytes::from(body)))
}

/// Logs `message` and wraps it as `{"message": ...}`.
fn log_and_create_http_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!("{message}");
    } else {
        debug!("{message}");
    }
    json_response(status, json!({ "message": message }).to_string().into_bytes())
}

/// Routes one request. The body is never read, so any body type will do.
pub async fn handle_request<B>(ctx: &QueryContext, req: Request<B>) -> http::Result<HttpResponse> {
    if !ctx.host_allowed(&req) {
        return log_and_create_http_response("Invalid host header", StatusCode::BAD_REQUEST);
    }
    match (req.method(), req.uri().path()) {
        (&Method::GET, LOGS_PATH) => {
            let query = match LogsQuery::parse(req.uri().query()) {
                Ok(query) => query,
                Err(message) => {
                    return log_and_create_http_response(&message, StatusCode::UNPROCESSABLE_ENTITY)
                }
            };
            match ctx
                .get_logs
                .execute(query.service, query.level, query.limit)
                .await
            {
                Ok(records) => match serde_json::to_vec(&records) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(err) => log_and_create_http_response(
                        &format!("failed to encode logs: {err}"),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ),
                },
                Err(err) => {
                    error!(cause = %err, "error fetching logs");
                    log_and_create_http_response(
                        "An internal error occurred while querying the logs.",
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            }
        }
        (&Method::GET, HEALTH_PATH) => {
            let state = *ctx.pipeline_state.borrow();
            let body = json!({
                "status": "log service is up and healthy",
                "pipeline": state.to_string(),
            });
            json_response(StatusCode::OK, body.to_string().into_bytes())
        }
        (_, LOGS_PATH) | (_, HEALTH_PATH) => {
            log_and_create_http_response("method not allowed", StatusCode::METHOD_NOT_ALLOWED)
        }
        _ => log_and_create_http_response("not found", StatusCode::NOT_FOUND),
    }
}

/// HTTP/1 query server over the shared log store.
pub struct QueryServer {
    listener: TcpListener,
    context: Arc<QueryContext>,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl QueryServer {
    pub async fn bind(
        config: &HttpConfig,
        context: QueryContext,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<QueryServer> {
        let listen_address = format!("{}:{}", config.ip, config.port);
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind query server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!("query server binding to {} for listening", &listen_address);
        Ok(QueryServer {
            listener,
            context: Arc::new(context),
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until the shutdown broadcast; open connections are dropped.
    pub async fn run(self) -> AppResult<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());

        loop {
            let conn = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("query server received shutdown signal");
                    break;
                }
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("query server accept error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                Some(finished) = joinset.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("connection handler panicked: {:?}", e);
                        }
                    }
                    continue;
                }
            };

            let context = self.context.clone();
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let context = context.clone();
                async move { handle_request(&context, req).await }
            });
            let conn = TokioIo::new(conn);
            let server = server.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("connection error: {e}");
                }
            });
        }
        joinset.shutdown().await;
        info!("query server stopped");
        Ok(())
    }
}
