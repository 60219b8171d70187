use super::super::ServerError;
use super::{HttpResponse, ServerGlobal};
use log::*;
use std::sync::Arc;
use streamlay::{SessionInfo, StreamId};

fn session_json(global: &ServerGlobal, info: &SessionInfo) -> Result<serde_json::Value, ServerError> {
    let mut value = serde_json::to_value(info)
        .map_err(|e| ServerError::General(format!("Failed to serialize session: {}", e)))?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert(
            "playlistURL".to_string(),
            serde_json::Value::String(global.playlist_url(&info.id)),
        );
    }
    Ok(value)
}

pub(crate) async fn health(global: Arc<ServerGlobal>) -> Result<HttpResponse, ServerError> {
    global.json_response(hyper::StatusCode::OK, &serde_json::json!({ "status": "ok" }))
}

pub(crate) async fn start_stream(
    req: hyper::Request<impl hyper::body::Body>,
    global: Arc<ServerGlobal>,
) -> Result<HttpResponse, ServerError> {
    let body = super::read_body(req).await?;

    #[derive(serde::Deserialize)]
    struct RequestContent {
        #[serde(rename = "sourceURL", alias = "rtsp_url")]
        source_url: Option<String>,
    }

    let content: RequestContent = serde_json::from_slice(&body)
        .map_err(|e| ServerError::Validation(format!("Bad request: {}", e)))?;
    let source_url = match content.source_url {
        Some(url) if !url.trim().is_empty() => url,
        _ => {
            return Err(ServerError::Validation(
                "sourceURL is required".to_string(),
            ))
        }
    };

    let id = global.streams.start(&source_url).await?;
    let res = serde_json::json!({
        "id": id,
        "playlistURL": global.playlist_url(&id),
        "message": "Stream started",
    });
    global.json_response(hyper::StatusCode::CREATED, &res)
}

pub(crate) async fn list_streams(global: Arc<ServerGlobal>) -> Result<HttpResponse, ServerError> {
    let streams = global
        .streams
        .sessions()
        .iter()
        .map(|info| session_json(&global, info))
        .collect::<Result<Vec<_>, _>>()?;
    global.json_response(
        hyper::StatusCode::OK,
        &serde_json::json!({ "streams": streams }),
    )
}

pub(crate) async fn get_stream(
    global: Arc<ServerGlobal>,
    id: &StreamId,
) -> Result<HttpResponse, ServerError> {
    if let Some(info) = global.streams.info(id) {
        let res = session_json(&global, &info)?;
        return global.json_response(hyper::StatusCode::OK, &res);
    }
    match global.streams.outcome(id) {
        Some(termination) => {
            let res = serde_json::json!({
                "id": id,
                "state": streamlay::SessionState::Reclaimed,
                "ended_as": termination.reason.state(),
                "termination": termination,
            });
            global.json_response(hyper::StatusCode::OK, &res)
        }
        None => Err(ServerError::NotFound("Stream not found".to_string())),
    }
}

pub(crate) async fn stop_stream(
    global: Arc<ServerGlobal>,
    id: &StreamId,
) -> Result<HttpResponse, ServerError> {
    let termination = global.streams.stop(id).await?;
    debug!("Stop of stream {} requested over HTTP", id);
    let res = serde_json::json!({
        "message": "Stream stopped",
        "termination": termination,
    });
    global.json_response(hyper::StatusCode::OK, &res)
}
