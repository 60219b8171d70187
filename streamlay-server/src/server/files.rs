use super::super::ServerError;
use super::{HttpResponse, ServerGlobal};
use log::*;
use std::sync::Arc;
use streamlay::StreamId;

fn content_type(file: &str) -> &'static str {
    if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegURL"
    } else {
        "video/MP2T"
    }
}

/// Serve a playlist or segment straight from the stream's output directory.
///
/// `file` has already been restricted to `stream.m3u8` / `stream_NNN.ts` by the router.
pub(crate) async fn get_stream_file(
    global: Arc<ServerGlobal>,
    id: &StreamId,
    file: &str,
) -> Result<HttpResponse, ServerError> {
    let path = global
        .streams
        .config()
        .streams_dir
        .join(id.as_str())
        .join(file);

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Segments rotate out of the window, and playlists appear a few seconds after start
            debug!("Stream file {:?} not found", path);
            return Err(ServerError::NotFound("Not found".to_string()));
        }
        Err(err) => {
            return Err(ServerError::General(format!(
                "Failed to read {:?}: {}",
                path, err
            )))
        }
    };

    Ok(hyper::Response::builder()
        .header("Access-Control-Allow-Origin", &global.config.cors_allow_origin)
        .header("Content-Type", content_type(file))
        .header("Cache-Control", "no-cache")
        .body(http_body_util::Full::new(hyper::body::Bytes::from(data)))?)
}
