use super::ServerError;

#[derive(serde::Deserialize, serde::Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    Text,
    Image,
}

impl std::fmt::Display for OverlayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayKind::Text => write!(f, "text"),
            OverlayKind::Image => write!(f, "image"),
        }
    }
}

/// A text or image annotation positioned over the video
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, PartialEq)]
pub struct OverlayRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OverlayKind,
    /// Text, or the URL of the image
    pub content: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl OverlayRecord {
    pub fn from_json(body: &[u8]) -> Result<OverlayRecord, ServerError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ServerError::Validation(format!("Invalid JSON: {}", e)))?;
        match value.get("name").and_then(|name| name.as_str()) {
            Some(name) if !name.trim().is_empty() => {}
            _ => {
                return Err(ServerError::Validation(
                    "Overlay name is required".to_string(),
                ))
            }
        }
        let record: OverlayRecord = serde_json::from_value(value)
            .map_err(|e| ServerError::Validation(format!("Invalid overlay: {}", e)))?;
        check_geometry(
            &[record.x, record.y],
            &[record.width, record.height],
        )?;
        Ok(record)
    }
}

/// Partial update; absent fields keep their stored value
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, Default, PartialEq)]
pub struct OverlayPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<OverlayKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl OverlayPatch {
    /// Parse a patch addressed at the overlay called `name`. Renames are rejected since the name
    /// is the record's key.
    pub fn from_json(body: &[u8], name: &str) -> Result<OverlayPatch, ServerError> {
        let patch: OverlayPatch = serde_json::from_slice(body)
            .map_err(|e| ServerError::Validation(format!("Invalid overlay update: {}", e)))?;
        if let Some(new_name) = &patch.name {
            if new_name != name {
                return Err(ServerError::Validation(
                    "Overlay name cannot be changed".to_string(),
                ));
            }
        }
        let positions: Vec<f64> = [patch.x, patch.y].iter().flatten().copied().collect();
        let sizes: Vec<f64> = [patch.width, patch.height].iter().flatten().copied().collect();
        check_geometry(&positions, &sizes)?;
        Ok(patch)
    }

    pub fn apply(&self, record: &mut OverlayRecord) {
        if let Some(kind) = self.kind {
            record.kind = kind;
        }
        if let Some(content) = &self.content {
            record.content = content.clone();
        }
        if let Some(x) = self.x {
            record.x = x;
        }
        if let Some(y) = self.y {
            record.y = y;
        }
        if let Some(width) = self.width {
            record.width = width;
        }
        if let Some(height) = self.height {
            record.height = height;
        }
    }
}

fn check_geometry(positions: &[f64], sizes: &[f64]) -> Result<(), ServerError> {
    if positions.iter().chain(sizes).any(|v| !v.is_finite()) {
        return Err(ServerError::Validation(
            "Overlay position and size must be finite numbers".to_string(),
        ));
    }
    if sizes.iter().any(|v| *v < 0.0) {
        return Err(ServerError::Validation(
            "Overlay width and height must not be negative".to_string(),
        ));
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
pub struct OverlayRow {
    pub doc: sqlx::types::Json<OverlayRecord>,
}
