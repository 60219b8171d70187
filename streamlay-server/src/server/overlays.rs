use super::super::ServerError;
use super::{HttpResponse, ServerGlobal};
use crate::schema::{OverlayPatch, OverlayRecord};
use log::*;
use std::sync::Arc;

pub(crate) async fn list_overlays(global: Arc<ServerGlobal>) -> Result<HttpResponse, ServerError> {
    let overlays = global.store.find_all().await?;
    global.json_response(hyper::StatusCode::OK, &serde_json::json!(overlays))
}

pub(crate) async fn create_overlay(
    req: hyper::Request<impl hyper::body::Body>,
    global: Arc<ServerGlobal>,
) -> Result<HttpResponse, ServerError> {
    let body = super::read_body(req).await?;
    let overlay = OverlayRecord::from_json(&body)?;

    if global.store.insert_one(&overlay).await? == 0 {
        return Err(ServerError::Conflict(format!(
            "Overlay `{}` already exists",
            overlay.name
        )));
    }
    info!("Created overlay {}", overlay.name);

    let res = serde_json::json!({
        "message": "Overlay created",
        "overlay": overlay,
    });
    global.json_response(hyper::StatusCode::CREATED, &res)
}

pub(crate) async fn get_overlay(
    global: Arc<ServerGlobal>,
    name: &str,
) -> Result<HttpResponse, ServerError> {
    match global.store.find_one(name).await? {
        Some(overlay) => global.json_response(hyper::StatusCode::OK, &serde_json::json!(overlay)),
        None => Err(ServerError::NotFound("Overlay not found".to_string())),
    }
}

pub(crate) async fn update_overlay(
    req: hyper::Request<impl hyper::body::Body>,
    global: Arc<ServerGlobal>,
    name: &str,
) -> Result<HttpResponse, ServerError> {
    let body = super::read_body(req).await?;
    let patch = OverlayPatch::from_json(&body, name)?;

    if global.store.update_one(name, &patch).await? == 0 {
        return Err(ServerError::NotFound("Overlay not found".to_string()));
    }
    debug!("Updated overlay {}", name);
    global.json_response(
        hyper::StatusCode::OK,
        &serde_json::json!({ "message": "Overlay updated" }),
    )
}

pub(crate) async fn delete_overlay(
    global: Arc<ServerGlobal>,
    name: &str,
) -> Result<HttpResponse, ServerError> {
    if global.store.delete_one(name).await? == 0 {
        return Err(ServerError::NotFound("Overlay not found".to_string()));
    }
    info!("Deleted overlay {}", name);
    global.json_response(
        hyper::StatusCode::OK,
        &serde_json::json!({ "message": "Overlay deleted" }),
    )
}
