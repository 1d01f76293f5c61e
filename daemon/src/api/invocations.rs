use axum::{body::Bytes, extract::State, Json};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ApiError;
use crate::generator::GenerationInputs;
use crate::state::AppState;

const DEFAULT_PROMPT: &str = "A photorealistic portrait";
const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub person_image: Option<Value>,
    #[serde(default)]
    pub clothing_images: Option<Vec<String>>,
    #[serde(default)]
    pub place_image: Option<String>,
    /// An explicit `null` is treated the same as an omitted prompt
    #[serde(default)]
    pub prompt: Option<String>,
}

impl InvocationRequest {
    /// Parse a request body, which must be a JSON object
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        match serde_json::from_slice(body)? {
            Value::Object(fields) => Ok(serde_json::from_value(Value::Object(fields))?),
            other => Err(ApiError::NotAnObject(json_kind(&other))),
        }
    }

    fn into_inputs(self) -> Result<GenerationInputs, ApiError> {
        let person_image =
            person_image_url(self.person_image).ok_or(ApiError::MissingPersonImage)?;

        Ok(GenerationInputs {
            person_image,
            clothing_images: self.clothing_images.unwrap_or_default(),
            place_image: self.place_image,
            prompt: self.prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
        })
    }
}

/// Falsy values (`null`, `false`, `0`, `""`, `[]`, `{}`) count as missing.
/// Any other non-string is kept as its JSON text and fails at download time.
fn person_image_url(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(url) if url.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(fields) if fields.is_empty() => None,
        Value::String(url) => Some(url),
        other => Some(other.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Serialize)]
pub struct InvocationResponse {
    pub generated_image: String,
    pub status: &'static str,
}

pub async fn invocations(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<InvocationResponse>, ApiError> {
    let request = InvocationRequest::from_body(&body)?;
    let inputs = request.into_inputs()?;

    let image = state.generator.generate(&inputs).await?;
    let jpeg = encode_jpeg(&image)?;

    Ok(Json(InvocationResponse {
        generated_image: BASE64_STANDARD.encode(jpeg),
        status: "success",
    }))
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Vec::new();
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY))?;
    Ok(buffer)
}
