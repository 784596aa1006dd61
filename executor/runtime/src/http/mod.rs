//! HTTP server dispatcher: route table, CORS, JWT, static files and
//! handler-script execution on worker threads.

pub mod jwt;
pub mod request;
pub mod routes;

use std::future::IntoFuture;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use log::{error, info, warn};
use mime::TEXT_PLAIN_UTF_8;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::compression::CompressionLayer;

use crate::context::{self, Frame, FrameReason, RequestContext};
use crate::error::{Error, Result};
use crate::eval::Evaluator;
use crate::interpreter::Interpreter;
use crate::metrics;
use crate::modules;
use crate::store;
use crate::value::Value;

use self::jwt::JwtConfig;
use self::request::RequestData;
use self::routes::{compile_pattern, Route, RouteTable};

/// Request bodies (including multipart forms) are capped at 32 MiB.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Slack granted past the handler deadline before the dispatcher gives up on
/// the worker and answers 504 itself.
const HANDLER_JOIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub tls: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Socket timeouts in seconds; applied where the HTTP stack exposes them.
    pub read_timeout: f64,
    pub write_timeout: f64,
    /// Per-request budget for handler scripts, in seconds.
    pub handler_timeout: f64,
    pub directory_listing: bool,
    pub index_files: Vec<String>,
    /// Drain window for in-flight handlers on shutdown, in seconds.
    pub shutdown_grace: f64,
    pub cors: Option<CorsConfig>,
    pub jwt: Option<JwtConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            tls: false,
            cert_file: None,
            key_file: None,
            read_timeout: 30.0,
            write_timeout: 30.0,
            handler_timeout: 30.0,
            directory_listing: false,
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
            shutdown_grace: 30.0,
            cors: None,
            jwt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub credentials: bool,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            origins: vec!["*".to_string()],
            methods: vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            credentials: false,
            max_age: 600,
        }
    }
}

/// Parse the script-value configuration of `http_server({...})`.
pub fn config_from_value(value: &Value) -> Result<ServerConfig> {
    match value {
        Value::Nil => Ok(ServerConfig::default()),
        other => serde_json::from_value(other.to_json())
            .map_err(|e| Error::type_error(format!("http_server: invalid config - {e}"))),
    }
}

pub(crate) struct ServerState {
    interp: Interpreter,
    config: ServerConfig,
    routes: RwLock<RouteTable>,
}

/// One HTTP server instance; the script-facing handle object wraps this.
#[derive(Clone)]
pub struct HttpServer {
    state: Arc<ServerState>,
}

impl HttpServer {
    pub fn new(interp: Interpreter, config: ServerConfig) -> HttpServer {
        HttpServer {
            state: Arc::new(ServerState {
                interp,
                config,
                routes: RwLock::new(RouteTable::default()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Directory of the script performing a registration; handler paths
    /// resolve relative to it.
    fn registrant_dir(&self) -> PathBuf {
        context::current_frame()
            .map(|f| f.dir().to_path_buf())
            .unwrap_or_else(|| self.state.interp.config().script_dir.clone())
    }

    pub fn register_route(&self, method: &str, path: &str, handler: &str) -> Result<()> {
        let (pattern, param_names) = compile_pattern(path)?;
        self.state.routes.write().register(Route {
            method: method.to_uppercase(),
            path: path.to_string(),
            pattern,
            param_names,
            handler: handler.to_string(),
            script_dir: self.registrant_dir(),
            static_dir: None,
        });
        Ok(())
    }

    /// `static(prefix, dir)`: a GET + HEAD route pair marked static.
    pub fn register_static(&self, prefix: &str, dir: &str) -> Result<()> {
        let base = self.registrant_dir();
        let dir = if Path::new(dir).is_absolute() {
            PathBuf::from(dir)
        } else {
            base.join(dir)
        };
        let mut routes = self.state.routes.write();
        for method in ["GET", "HEAD"] {
            routes.register(Route {
                method: method.to_string(),
                path: prefix.to_string(),
                pattern: None,
                param_names: Vec::new(),
                handler: String::new(),
                script_dir: base.clone(),
                static_dir: Some(dir.clone()),
            });
        }
        Ok(())
    }

    pub fn unregister(&self, method: &str, path: &str) -> bool {
        self.state.routes.write().unregister(&method.to_uppercase(), path)
    }

    pub fn route_count(&self) -> usize {
        self.state.routes.read().len()
    }

    /// Bind and serve until an interrupt/terminate signal arrives, then
    /// drain in-flight handlers within the configured grace window. Blocks
    /// the calling thread.
    pub fn start(&self) -> Result<()> {
        if self.state.config.tls {
            return Err(Error::io(
                "tls termination is not built in; terminate tls at a fronting proxy",
            ));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::io(format!("failed to start http runtime: {e}")))?;
        runtime.block_on(serve(self.state.clone()))
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .fallback(move |req: Request<Body>| {
            let state = state.clone();
            async move { handle_request(state, req).await }
        })
        .layer(CompressionLayer::new())
}

async fn serve(state: Arc<ServerState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.bind, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::io(format!("bind {addr}: {e}")))?;
    if let Ok(local) = listener.local_addr() {
        info!("http server listening on {local}");
    }
    let grace = Duration::from_secs_f64(state.config.shutdown_grace.max(0.0));
    let app = router(state);

    let draining = Arc::new(Notify::new());
    let drain_started = draining.clone();
    let graceful = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received; draining in-flight handlers");
            drain_started.notify_one();
        })
        .into_future();

    tokio::select! {
        result = graceful => {
            result.map_err(|e| Error::io(format!("http server failed: {e}")))?;
        }
        _ = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("drain window elapsed; dropping remaining connections");
        }
    }
    store::registry().shutdown();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Response under construction: what a handler worker returns to the
/// dispatcher.
struct BuiltResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl BuiltResponse {
    fn text(status: u16, body: impl Into<String>) -> BuiltResponse {
        BuiltResponse {
            status,
            headers: vec![(
                "Content-Type".to_string(),
                TEXT_PLAIN_UTF_8.to_string(),
            )],
            body: body.into().into_bytes(),
        }
    }

    fn empty(status: u16) -> BuiltResponse {
        BuiltResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// The per-request pipeline.
pub(crate) async fn handle_request(state: Arc<ServerState>, req: Request<Body>) -> Response<Body> {
    metrics::record_http_request();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let origin = req
        .headers()
        .get(http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let cors = cors_headers(state.config.cors.as_ref(), origin.as_deref());

    // preflight requests are answered here and never reach a handler
    if method == Method::OPTIONS {
        if let (Some(cfg), Some(headers)) = (state.config.cors.as_ref(), cors.as_ref()) {
            let mut preflight = headers.clone();
            preflight.push((
                "Access-Control-Allow-Methods".to_string(),
                cfg.methods.join(", "),
            ));
            preflight.push((
                "Access-Control-Allow-Headers".to_string(),
                cfg.headers.join(", "),
            ));
            preflight.push(("Access-Control-Max-Age".to_string(), cfg.max_age.to_string()));
            return finish(BuiltResponse::empty(204), &Some(preflight));
        }
    }

    let matched = state.routes.read().match_route(method.as_str(), &path);
    let Some((route, params)) = matched else {
        return finish(BuiltResponse::text(404, "not found"), &cors);
    };

    // JWT verification, ahead of static service and handler dispatch alike
    let mut claims = None;
    if let Some(cfg) = &state.config.jwt {
        if cfg.enabled {
            let token = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(jwt::bearer_token);
            match token.map(|t| jwt::verify(&cfg.secret, t)) {
                Some(Ok(verified)) => claims = Some(verified),
                Some(Err(e)) if cfg.required => {
                    return finish(BuiltResponse::text(401, e.to_string()), &cors)
                }
                None if cfg.required => {
                    return finish(BuiltResponse::text(401, "missing bearer token"), &cors)
                }
                _ => {}
            }
        }
    }

    if route.is_static() {
        let built = serve_static(&state, &route, &path, method == Method::HEAD);
        return finish(built, &cors);
    }

    // handler script, through the module waterfall with the AST cache
    let handler_spec = if Path::new(&route.handler).is_absolute()
        || route.handler.starts_with(modules::STORE_PREFIX)
        || route.handler.starts_with(modules::EMBED_PREFIX)
    {
        route.handler.clone()
    } else {
        route.script_dir.join(&route.handler).display().to_string()
    };
    let (handler_path, program) =
        match state.interp.loader().resolve_and_parse(&state.interp, &handler_spec) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("handler '{}': {e}", route.handler);
                return finish(BuiltResponse::text(500, e.to_string()), &cors);
            }
        };

    // request data: body read once and cached, forms decoded here
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return finish(BuiltResponse::text(413, "request body too large"), &cors),
    };
    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let form = parse_form(content_type.as_deref(), &bytes).await;
    let query = parts
        .uri
        .query()
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let data = Arc::new(RequestData {
        method: method.as_str().to_string(),
        path: path.clone(),
        headers,
        query,
        form,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    });

    let frame = Frame::new(
        handler_path,
        FrameReason::HttpRoute,
        format!("{method} {path}"),
        None,
    );
    let ctx = RequestContext::for_request(
        frame,
        params,
        claims,
        state.config.jwt.as_ref().map(|j| j.secret.clone()),
        data,
    );

    let timeout = Duration::from_secs_f64(state.config.handler_timeout.max(0.1));
    let interp = state.interp.clone();
    let script_dir = route.script_dir.clone();
    let worker = tokio::task::spawn_blocking(move || {
        run_handler(interp, program, ctx, script_dir, Instant::now() + timeout)
    });

    let built = match tokio::time::timeout(timeout + HANDLER_JOIN_GRACE, worker).await {
        Ok(Ok(built)) => built,
        Ok(Err(join_err)) => {
            error!("handler worker panicked: {join_err}");
            BuiltResponse::text(500, "handler failed")
        }
        Err(_) => BuiltResponse::text(504, "handler timed out"),
    };
    finish(built, &cors)
}

/// Execute a handler program on a worker thread and build its response.
fn run_handler(
    interp: Interpreter,
    program: Arc<crate::ast::Program>,
    ctx: Arc<RequestContext>,
    script_dir: PathBuf,
    deadline: Instant,
) -> BuiltResponse {
    let _frame_guard = context::push_frame(ctx.frame.clone());
    let getter_ctx = ctx.clone();
    let _ctx_guard =
        context::register_context(ctx.clone(), Arc::new(move || getter_ctx.data.clone()));

    let env = interp.root_env();
    let request_ctx = ctx.clone();
    env.define(
        "request",
        Value::native("request", move |_, _| {
            Ok(request::request_value(&request_ctx))
        }),
    );
    let helper = request::response_helper(ctx.clone(), &script_dir);
    env.define(
        "response",
        Value::native("response", move |_, _| Ok(helper.clone())),
    );

    let mut eval = Evaluator::with_deadline(interp.clone(), Some(deadline));
    let result = eval.run_program(&program, &env);

    if ctx.close().is_err() {
        return BuiltResponse::text(500, "response already written");
    }
    match result {
        Ok(value) => build_response(&interp, &script_dir, value),
        Err(e) if e.is_timeout() => BuiltResponse::text(504, "handler timed out"),
        Err(e) => {
            error!("handler {}: {e}", ctx.frame.file.display());
            BuiltResponse::text(500, e.to_string())
        }
    }
}

/// Build the HTTP response from a handler's exit value:
/// `{status, headers, body}` or `{status, filename, scriptDir}`; anything
/// else answers 204.
fn build_response(interp: &Interpreter, script_dir: &Path, value: Value) -> BuiltResponse {
    let Value::Object(map) = value else {
        return BuiltResponse::empty(204);
    };
    let map = map.lock().clone();
    let status = map
        .get("status")
        .and_then(Value::as_num)
        .map(|n| n as u16)
        .filter(|s| (100..=599).contains(s))
        .unwrap_or(200);

    if let Some(Value::Str(filename)) = map.get("filename") {
        let base = match map.get("scriptDir") {
            Some(Value::Str(dir)) => PathBuf::from(dir),
            _ => script_dir.to_path_buf(),
        };
        let spec = if Path::new(filename).is_absolute()
            || filename.starts_with(modules::STORE_PREFIX)
            || filename.starts_with(modules::EMBED_PREFIX)
        {
            filename.clone()
        } else {
            base.join(filename).display().to_string()
        };
        return match modules::read_file(interp, &spec) {
            Ok((path, bytes)) => BuiltResponse {
                status,
                headers: vec![("Content-Type".to_string(), mime_of(&path))],
                body: bytes,
            },
            Err(e) => BuiltResponse::text(404, e.to_string()),
        };
    }

    let mut headers = Vec::new();
    if let Some(Value::Object(header_map)) = map.get("headers") {
        for (name, value) in header_map.lock().iter() {
            headers.push((name.clone(), value.to_display_string()));
        }
    }
    let body = match map.get("body") {
        Some(Value::Str(s)) => s.clone().into_bytes(),
        Some(Value::Nil) | None => Vec::new(),
        Some(other) => other.to_display_string().into_bytes(),
    };
    BuiltResponse {
        status,
        headers,
        body,
    }
}

fn mime_of(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

/// Serve a static route: a file beneath the prefix, an index file for
/// directories, or a generated listing when enabled.
fn serve_static(state: &ServerState, route: &Route, path: &str, head: bool) -> BuiltResponse {
    let Some(static_dir) = &route.static_dir else {
        return BuiltResponse::text(500, "route is not static");
    };
    let rest = path
        .strip_prefix(route.path.as_str())
        .unwrap_or("")
        .trim_start_matches('/');
    let rel = Path::new(rest);
    // no path traversal out of the served directory
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return BuiltResponse::text(404, "not found");
    }
    let full = static_dir.join(rel);
    let caps = state.interp.caps();

    if let Ok(bytes) = caps.read_file(&full) {
        return BuiltResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), mime_of(&full))],
            body: if head { Vec::new() } else { bytes },
        };
    }

    for index in &state.config.index_files {
        let candidate = full.join(index);
        if let Ok(bytes) = caps.read_file(&candidate) {
            return BuiltResponse {
                status: 200,
                headers: vec![("Content-Type".to_string(), mime_of(&candidate))],
                body: if head { Vec::new() } else { bytes },
            };
        }
    }

    if state.config.directory_listing {
        if let Ok(entries) = caps.read_dir(&full) {
            let mut html = String::from("<html><body><ul>\n");
            for entry in entries {
                let suffix = if entry.is_dir { "/" } else { "" };
                html.push_str(&format!(
                    "<li><a href=\"{0}{1}\">{0}{1}</a></li>\n",
                    entry.name, suffix
                ));
            }
            html.push_str("</ul></body></html>\n");
            return BuiltResponse {
                status: 200,
                headers: vec![(
                    "Content-Type".to_string(),
                    mime::TEXT_HTML_UTF_8.to_string(),
                )],
                body: if head { Vec::new() } else { html.into_bytes() },
            };
        }
    }

    BuiltResponse::text(404, "not found")
}

/// CORS headers for a permitted origin, `None` when CORS is off or the
/// origin is not allowed.
fn cors_headers(config: Option<&CorsConfig>, origin: Option<&str>) -> Option<Vec<(String, String)>> {
    let config = config?;
    let origin = origin?;
    let wildcard = config.origins.iter().any(|o| o == "*");
    if !wildcard && !config.origins.iter().any(|o| o == origin) {
        return None;
    }
    let mut headers = Vec::new();
    if wildcard && !config.credentials {
        headers.push(("Access-Control-Allow-Origin".to_string(), "*".to_string()));
    } else {
        headers.push((
            "Access-Control-Allow-Origin".to_string(),
            origin.to_string(),
        ));
        headers.push(("Vary".to_string(), "Origin".to_string()));
    }
    if config.credentials {
        headers.push((
            "Access-Control-Allow-Credentials".to_string(),
            "true".to_string(),
        ));
    }
    Some(headers)
}

async fn parse_form(content_type: Option<&str>, bytes: &Bytes) -> Vec<(String, String)> {
    let Some(content_type) = content_type else {
        return Vec::new();
    };
    if content_type.starts_with("application/x-www-form-urlencoded") {
        return form_urlencoded::parse(bytes).into_owned().collect();
    }
    if content_type.starts_with("multipart/form-data") {
        let Ok(boundary) = multer::parse_boundary(content_type) else {
            return Vec::new();
        };
        let stream =
            tokio_stream::once(Ok::<Bytes, std::convert::Infallible>(bytes.clone()));
        let mut multipart = multer::Multipart::new(stream, boundary);
        let mut out = Vec::new();
        while let Ok(Some(field)) = multipart.next_field().await {
            let name = field.name().map(String::from).unwrap_or_default();
            if let Ok(text) = field.text().await {
                out.push((name, text));
            }
        }
        return out;
    }
    Vec::new()
}

fn finish(built: BuiltResponse, cors: &Option<Vec<(String, String)>>) -> Response<Body> {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(built.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &built.headers {
        builder = builder.header(name, value);
    }
    if let Some(cors) = cors {
        for (name, value) in cors {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(built.body))
        .unwrap_or_else(|e| {
            error!("failed to build response: {e}");
            Response::new(Body::empty())
        })
}
