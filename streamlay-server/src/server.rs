use crate::store::OverlayStore;

use super::ServerError;
use super::ServerOpt;
use http_body_util::BodyExt;
use log::*;
use regex::Regex;
use std::sync::Arc;
use streamlay::{StreamId, StreamManager};

mod files;
mod gc;
mod overlays;
mod streams;

pub(crate) type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

pub(crate) struct ServerGlobal {
    config: ServerConfig,
    store: Arc<dyn OverlayStore>,
    streams: StreamManager,
}

impl ServerGlobal {
    /// Public URL of a stream's playlist
    fn playlist_url(&self, id: &StreamId) -> String {
        format!(
            "{}{}/{}",
            self.config.public_prefix,
            id,
            streamlay::session::PLAYLIST_NAME
        )
    }

    fn json_response(
        &self,
        status: hyper::StatusCode,
        value: &serde_json::Value,
    ) -> Result<HttpResponse, ServerError> {
        Ok(hyper::Response::builder()
            .status(status)
            .header("Access-Control-Allow-Origin", &self.config.cors_allow_origin)
            .header("Content-Type", "application/json")
            .body(http_body_util::Full::new(hyper::body::Bytes::from(
                value.to_string(),
            )))?)
    }
}

#[derive(serde::Deserialize, Debug)]
#[serde(default)]
pub(crate) struct ServerConfig {
    /// Prefix of playlist URLs handed to clients, e.g. `/static/streams/` or
    /// `https://cdn.example.com/streams/`
    public_prefix: String,
    cors_allow_origin: String,
    /// Seconds between orphan sweeps, 0 disables the sweeper
    gc_period: i64,
    /// Minimum age in seconds of an unregistered stream directory before it is swept
    orphan_min_age: u64,
    /// Remove every stream directory left over by a previous run at startup
    sweep_on_start: bool,
    stream: streamlay::StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            public_prefix: "/static/streams/".to_string(),
            cors_allow_origin: "*".to_string(),
            gc_period: 0,
            orphan_min_age: 60,
            sweep_on_start: true,
            stream: streamlay::StreamConfig::default(),
        }
    }
}

fn parse_config(config_string: &str) -> Result<ServerConfig, ServerError> {
    let config: ServerConfig = toml::from_str(config_string).map_err(|e: toml::de::Error| {
        ServerError::General(format!("Failed to parse config file: {}", e))
    })?;

    // Validate the config
    if !config.public_prefix.ends_with('/') {
        return Err(ServerError::General(
            "public_prefix must end with /".to_string(),
        ));
    }
    if hyper::header::HeaderValue::from_str(&config.cors_allow_origin).is_err() {
        return Err(ServerError::General(
            "cors_allow_origin is not a valid header value".to_string(),
        ));
    }
    if config.gc_period < 0 {
        return Err(ServerError::General(
            "gc_period must not be negative".to_string(),
        ));
    }
    config.stream.validate()?;

    Ok(config)
}

fn load_config(path: Option<&String>) -> Result<ServerConfig, ServerError> {
    let path = match path {
        Some(path) => path,
        None => return Ok(ServerConfig::default()),
    };
    let config_string = std::fs::read_to_string(path)
        .map_err(|e| ServerError::General(format!("Failed to read config file: {}", e)))?;
    parse_config(&config_string)
}

pub(crate) async fn cmd_server(
    store: Arc<dyn OverlayStore>,
    opt: ServerOpt,
) -> Result<(), ServerError> {
    use hyper::server::conn::http1;
    use hyper_util::rt::TokioIo;

    let config = load_config(opt.config.as_ref())?;
    store.ensure_schema().await?;
    let streams = StreamManager::new(config.stream.clone())?;
    let global = Arc::new(ServerGlobal {
        config,
        store,
        streams,
    });

    if global.config.sweep_on_start {
        let removed = global
            .streams
            .sweep_orphans(std::time::Duration::ZERO)
            .await?;
        if removed > 0 {
            info!("Removed {} stream directories left by a previous run", removed);
        }
    }

    let addr = std::net::SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, opt.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::General(format!("Failed to bind to {}: {}", addr, e)))?;

    if global.config.gc_period > 0 {
        let global_gc = global.clone();
        tokio::task::spawn(async move {
            if let Err(err) = gc::gc_main(global_gc).await {
                error!("Garbage collector failed: {:?}", err);
            }
        });
    }

    println!("Opened streamlay server on {}", addr);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (stream, client_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(ok) => ok,
                Err(err) => {
                    warn!("Error accepting connection: {:?}", err);
                    continue;
                }
            },
            res = &mut shutdown => {
                if let Err(err) = res {
                    error!("Failed to listen for ctrl-c: {}", err);
                }
                info!("Shutting down, stopping {} streams", global.streams.list().len());
                global.streams.shutdown().await;
                return Ok(());
            }
        };
        trace!("Accepted connection from {}", client_addr);

        let io = TokioIo::new(stream);
        let global = global.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    io,
                    hyper::service::service_fn(|req| http_req_error_handler(req, global.clone())),
                )
                .await
            {
                debug!("Dropped connection: {:?}", err);
            }
        });
    }
}

async fn http_req_error_handler(
    req: hyper::Request<impl hyper::body::Body>,
    global: Arc<ServerGlobal>,
) -> Result<HttpResponse, std::convert::Infallible> {
    let method_copy_for_err = req.method().clone();
    let uri_copy_for_err = req.uri().clone();
    match http_req(req, global.clone()).await {
        Ok(ok) => Ok(ok),
        Err(err) => {
            let (status, message) = match &err {
                ServerError::Validation(msg) => (hyper::StatusCode::BAD_REQUEST, msg.clone()),
                ServerError::NotFound(msg) => (hyper::StatusCode::NOT_FOUND, msg.clone()),
                ServerError::Conflict(msg) => (hyper::StatusCode::CONFLICT, msg.clone()),
                ServerError::Stream(e) if e.is_validation() => {
                    (hyper::StatusCode::BAD_REQUEST, e.to_string())
                }
                ServerError::Stream(streamlay::Error::NotFound(_)) => {
                    (hyper::StatusCode::NOT_FOUND, "Stream not found".to_string())
                }
                ServerError::Stream(streamlay::Error::Launch(_)) => (
                    hyper::StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to launch encoder".to_string(),
                ),
                // Do not leak anything else to the client
                _ => (
                    hyper::StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                ),
            };
            if status.is_server_error() {
                error!(
                    "Error handling request {} {}: {:?}",
                    method_copy_for_err, &uri_copy_for_err, err
                );
            } else {
                debug!(
                    "Rejected request {} {}: {}",
                    method_copy_for_err, &uri_copy_for_err, err
                );
            }
            let body = serde_json::json!({ "error": message });
            Ok(global.json_response(status, &body).unwrap_or_else(|_| {
                let mut res = hyper::Response::new(http_body_util::Full::new(
                    hyper::body::Bytes::from("Internal server error"),
                ));
                *res.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
                res
            }))
        }
    }
}

#[derive(Debug, PartialEq)]
enum Route {
    Preflight,
    Index,
    StreamHealth,
    StartStream,
    ListStreams,
    GetStream(StreamId),
    StopStream(StreamId),
    ListOverlays,
    CreateOverlay,
    GetOverlay(String),
    UpdateOverlay(String),
    DeleteOverlay(String),
    StreamFile(StreamId, String),
    NotFound,
}

fn route(method: &hyper::Method, path: &str) -> Result<Route, ServerError> {
    let stream_re = Regex::new(r"^/api/streams/([0-9a-f]{16})$").unwrap();
    let overlay_re = Regex::new(r"^/api/overlays/([^/]+)$").unwrap();
    let file_re =
        Regex::new(r"^/static/streams/([0-9a-f]{16})/(stream\.m3u8|stream_[0-9]+\.ts)$").unwrap();

    let stream_id = stream_re
        .captures(path)
        .and_then(|c| StreamId::parse(&c[1]));
    let overlay_name = match overlay_re.captures(path) {
        Some(c) => Some(
            urlencoding::decode(&c[1])
                .map_err(|_| ServerError::Validation("Invalid overlay name".to_string()))?
                .into_owned(),
        ),
        None => None,
    };

    let route = match (method.clone(), path) {
        (hyper::Method::OPTIONS, _) => Route::Preflight,
        (hyper::Method::GET, "/") => Route::Index,
        (hyper::Method::GET, "/api/stream-health") => Route::StreamHealth,
        (hyper::Method::POST, "/api/start-stream") => Route::StartStream,
        (hyper::Method::GET, "/api/streams") => Route::ListStreams,
        (hyper::Method::GET, "/api/overlays" | "/api/overlays/") => Route::ListOverlays,
        (hyper::Method::POST, "/api/overlays" | "/api/overlays/") => Route::CreateOverlay,
        (hyper::Method::GET, _) if stream_id.is_some() => {
            stream_id.map_or(Route::NotFound, Route::GetStream)
        }
        (hyper::Method::DELETE, _) if stream_id.is_some() => {
            stream_id.map_or(Route::NotFound, Route::StopStream)
        }
        (hyper::Method::GET, _) if overlay_name.is_some() => {
            overlay_name.map_or(Route::NotFound, Route::GetOverlay)
        }
        (hyper::Method::PUT, _) if overlay_name.is_some() => {
            overlay_name.map_or(Route::NotFound, Route::UpdateOverlay)
        }
        (hyper::Method::DELETE, _) if overlay_name.is_some() => {
            overlay_name.map_or(Route::NotFound, Route::DeleteOverlay)
        }
        (hyper::Method::GET, _) if file_re.is_match(path) => {
            let captures = file_re.captures(path);
            match captures.as_ref().and_then(|c| StreamId::parse(&c[1])) {
                Some(id) => Route::StreamFile(
                    id,
                    captures.map(|c| c[2].to_string()).unwrap_or_default(),
                ),
                None => Route::NotFound,
            }
        }
        _ => Route::NotFound,
    };
    Ok(route)
}

async fn http_req(
    req: hyper::Request<impl hyper::body::Body>,
    global: Arc<ServerGlobal>,
) -> Result<HttpResponse, ServerError> {
    let uri = req.uri().path().to_string();
    let method = req.method().clone();

    match route(&method, &uri)? {
        Route::Preflight => Ok(hyper::Response::builder()
            .status(hyper::StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", &global.config.cors_allow_origin)
            .header(
                "Access-Control-Allow-Methods",
                "GET, POST, PUT, DELETE, OPTIONS",
            )
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(http_body_util::Full::new(hyper::body::Bytes::new()))?),
        Route::Index => global.json_response(
            hyper::StatusCode::OK,
            &serde_json::json!({
                "message": format!("streamlay-server v{}", env!("CARGO_PKG_VERSION")),
            }),
        ),
        Route::StreamHealth => streams::health(global).await,
        Route::StartStream => streams::start_stream(req, global).await,
        Route::ListStreams => streams::list_streams(global).await,
        Route::GetStream(id) => streams::get_stream(global, &id).await,
        Route::StopStream(id) => streams::stop_stream(global, &id).await,
        Route::ListOverlays => overlays::list_overlays(global).await,
        Route::CreateOverlay => overlays::create_overlay(req, global).await,
        Route::GetOverlay(name) => overlays::get_overlay(global, &name).await,
        Route::UpdateOverlay(name) => overlays::update_overlay(req, global, &name).await,
        Route::DeleteOverlay(name) => overlays::delete_overlay(global, &name).await,
        Route::StreamFile(id, file) => files::get_stream_file(global, &id, &file).await,
        Route::NotFound => {
            warn!("404 Not found: {} {}", method, uri);
            Err(ServerError::NotFound("Not found".to_string()))
        }
    }
}

async fn read_body(req: hyper::Request<impl hyper::body::Body>) -> Result<Vec<u8>, ServerError> {
    match req.collect().await {
        Ok(body) => Ok(body.to_bytes().to_vec()),
        Err(_err) => {
            error!("Error reading request body");
            Err(ServerError::Validation(
                "Failed to read request body".to_string(),
            ))
        }
    }
}
