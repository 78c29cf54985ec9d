//! Per-request dispatch.
//!
//! One call per HTTP request: match the path, build the request context,
//! then walk the chain `[global middlewares, endpoint middlewares, handler]`
//! as an index-advancing loop. The `sent` latch is re-checked after every
//! step; a step that fails routes into the error-sender exactly once, and a
//! step that halts without sending becomes a 500.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http_body_util::Full;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::ammo::{Ammo, Reply, RequestInfo};
use crate::body::{self, BodyLimits};
use crate::config::Config;
use crate::error::HttpError;
use crate::middleware::Flow;
use crate::router::{Endpoint, Registry};

/// Served for `/` when no endpoint claims it.
const ENTRY_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>tejas</title></head>\n\
<body>\n<h1>tejas</h1>\n<p>The server is up. Register a target to replace this page.</p>\n\
</body>\n</html>\n";

/// Everything the dispatcher needs, assembled once at takeoff.
pub struct AppState {
    pub registry: Registry,
    pub config: Config,
}

/// Handles one request end to end. Infallible by design: every failure is
/// converted into a status-coded response here.
pub async fn dispatch<B>(
    state: Arc<AppState>,
    req: http::Request<B>,
    remote_addr: SocketAddr,
) -> http::Response<Full<Bytes>>
where
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();
    let (parts, incoming) = req.into_parts();
    let raw_path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let Some((endpoint, params)) = state.registry.find(&raw_path) else {
        if raw_path == "/" {
            return html_response(200, ENTRY_PAGE);
        }
        let response = plain_error(&HttpError::not_found());
        log_request(&state.config, parts.method.as_str(), &raw_path, 404, started);
        return response;
    };

    let info = enhance(&parts, &raw_path, query.as_deref(), remote_addr);

    // Payload precedence, lowest first: query, body, route params.
    let mut payload: Map<String, Value> = Map::new();
    if let Some(q) = &query {
        for (key, value) in form_urlencoded::parse(q.as_bytes()) {
            payload.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_length: u64 = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // The body parser runs whenever the request announces a body; a bare
    // GET with neither header skips it.
    if content_type.is_some() || content_length > 0 {
        let limits = BodyLimits {
            max_size: state.config.body_max_size,
            timeout_ms: state.config.body_timeout_ms,
        };
        match body::parse(content_type.as_deref(), incoming, &limits).await {
            Ok(decoded) => {
                for (key, value) in decoded {
                    payload.insert(key, value);
                }
            }
            Err(err) => {
                let (status, _) = err.resolve();
                if state.config.log_exceptions {
                    error!(path = %raw_path, status, "body parse failed: {}", err);
                }
                let response = plain_error(&err);
                log_request(&state.config, parts.method.as_str(), &raw_path, status, started);
                return response;
            }
        }
    }

    for (name, value) in params {
        payload.insert(name, Value::String(value));
    }

    let method = parts.method.clone();
    let ammo = Ammo::new(info, payload);
    run_chain(&ammo, &state.registry, endpoint, state.config.log_exceptions).await;

    let reply = ammo.responder().take_reply().unwrap_or_else(|| Reply {
        status: 500,
        content_type: "text/plain".to_string(),
        body: Bytes::from_static(b"Internal Server Error"),
        headers: Vec::new(),
    });
    let status = reply.status;
    let response = to_http_response(reply);
    log_request(&state.config, method.as_str(), &raw_path, status, started);
    response
}

/// Fills the request head: forwarded headers override the socket-level view.
fn enhance(
    parts: &http::request::Parts,
    raw_path: &str,
    query: Option<&str>,
    remote_addr: SocketAddr,
) -> RequestInfo {
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let ip = header("x-forwarded-for")
        .map(first_value)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote_addr.ip().to_string());

    let protocol = header("x-forwarded-proto")
        .map(first_value)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "http".to_string());

    let hostname = header("x-forwarded-host")
        .map(first_value)
        .filter(|v| !v.is_empty())
        .map(strip_port)
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(strip_port)
        })
        .unwrap_or_default();

    let path = match query {
        Some(q) => format!("{}?{}", raw_path, q),
        None => raw_path.to_string(),
    };
    let full_url = format!("{}://{}{}", protocol, hostname, path);

    RequestInfo {
        method: parts.method.clone(),
        path,
        endpoint: raw_path.to_string(),
        ip,
        protocol,
        hostname,
        full_url,
        headers,
    }
}

async fn run_chain(ammo: &Ammo, registry: &Registry, endpoint: &Endpoint, log_exceptions: bool) {
    let global = registry.global();
    let local = endpoint.middlewares();
    let total = global.len() + local.len();

    for index in 0..total {
        let step = if index < global.len() {
            &global[index]
        } else {
            &local[index - global.len()]
        };
        match step.run(ammo).await {
            Ok(Flow::Continue) => {
                if ammo.sent() {
                    return;
                }
            }
            Ok(Flow::Halt) => {
                if !ammo.sent() {
                    ammo.throw(HttpError::internal());
                }
                return;
            }
            Err(err) => {
                capture_error(ammo, err, log_exceptions);
                return;
            }
        }
    }

    match endpoint.handler().run(ammo).await {
        Ok(_) => {
            if !ammo.sent() {
                ammo.throw(HttpError::internal());
            }
        }
        Err(err) => capture_error(ammo, err, log_exceptions),
    }
}

/// Routes a chain failure into the error-sender once. Errors raised after
/// the response latched are logged and dropped.
fn capture_error(ammo: &Ammo, err: HttpError, log_exceptions: bool) {
    if ammo.sent() {
        if log_exceptions {
            error!("error after response was sent, dropping: {}", err);
        }
        return;
    }
    if log_exceptions {
        error!("request failed: {}", err);
    }
    ammo.throw(err);
}

fn first_value(raw: &str) -> &str {
    raw.split(',').next().unwrap_or("").trim()
}

/// Drops a `:port` suffix; bracketed IPv6 literals keep their brackets.
fn strip_port(host: &str) -> String {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return format!("[{}]", &rest[..end]);
        }
    }
    host.split(':').next().unwrap_or(host).to_string()
}

fn to_http_response(reply: Reply) -> http::Response<Full<Bytes>> {
    let mut response = http::Response::new(Full::new(reply.body));
    *response.status_mut() = http::StatusCode::from_u16(reply.status)
        .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&reply.content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "dropping invalid response header"),
        }
    }
    response
}

fn plain_error(err: &HttpError) -> http::Response<Full<Bytes>> {
    let (status, message) = err.resolve();
    let reply = Reply {
        status,
        content_type: "text/plain".to_string(),
        body: Bytes::from(message),
        headers: Vec::new(),
    };
    to_http_response(reply)
}

fn html_response(status: u16, html: &'static str) -> http::Response<Full<Bytes>> {
    to_http_response(Reply {
        status,
        content_type: "text/html".to_string(),
        body: Bytes::from_static(html.as_bytes()),
        headers: Vec::new(),
    })
}

fn log_request(config: &Config, method: &str, path: &str, status: u16, started: Instant) {
    if config.log_http_requests {
        info!(
            method,
            path,
            status,
            duration_ms = started.elapsed().as_millis() as u64,
            "request"
        );
    }
}
