//! `ApiDescriber` calls an OpenAI-compatible `/v1/chat/completions`
//! endpoint with the image inlined as a base64 data URL.
//!
//! Works with LM Studio, Ollama (OpenAI mode), vLLM and hosted providers
//! that accept `image_url` content parts.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::DescriptionConfig;

use super::postprocess::postprocess_description;
use super::{DescribeError, ImageDescriber, ImageDescription};

pub struct ApiDescriber {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_description_length: usize,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl ApiDescriber {
    pub fn from_config(config: &DescriptionConfig) -> Self {
        Self {
            endpoint: format!(
                "{}/v1/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            api_key: config.resolved_api_key(),
            model: config.model.clone(),
            max_description_length: config.max_description_length,
            timeout: Duration::from_secs(config.timeout_secs),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, DescribeError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let _ = self.client.set(client);
        self.client
            .get()
            .ok_or_else(|| DescribeError::Request("HTTP client not initialised".into()))
    }

    fn request_body(&self, data_url: &str, context: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": [
                    { "type": "text", "text": user_prompt(context) },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]}
            ],
            "stream":      false,
            "temperature": 0.2,
            "max_tokens":  200,
            "logprobs":    true
        })
    }
}

const SYSTEM_PROMPT: &str = "You describe images for listeners of an audiobook. \
Answer with one or two plain sentences. Do not start with 'This image shows'.";

fn user_prompt(context: &str) -> String {
    let context = context.trim();
    if context.is_empty() {
        "Describe this image.".to_string()
    } else {
        format!("Describe this image. It appears next to this passage: {context}")
    }
}

/// MIME type for the data URL, from the file extension.
pub(crate) fn mime_type(path: &Path) -> Result<&'static str, DescribeError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Ok("image/png"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "gif" => Ok("image/gif"),
        "webp" => Ok("image/webp"),
        "bmp" => Ok("image/bmp"),
        other => Err(DescribeError::UnsupportedFormat(other.to_string())),
    }
}

/// Pull the caption and a confidence out of a chat-completions response.
///
/// Confidence is the geometric-mean token probability when the server
/// returns logprobs.  Otherwise it comes from `finish_reason`: a complete
/// answer (`stop`) scores 0.8, a truncated one (`length`) 0.6.
pub(crate) fn parse_response(json: &serde_json::Value) -> Result<(String, f32), DescribeError> {
    let choice = &json["choices"][0];
    let text = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| DescribeError::Parse("missing choices[0].message.content".into()))?
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(DescribeError::EmptyResponse);
    }

    let logprobs: Vec<f64> = choice["logprobs"]["content"]
        .as_array()
        .map(|tokens| tokens.iter().filter_map(|t| t["logprob"].as_f64()).collect())
        .unwrap_or_default();

    let confidence = if logprobs.is_empty() {
        match choice["finish_reason"].as_str() {
            Some("stop") => 0.8,
            Some("length") => 0.6,
            _ => 0.7,
        }
    } else {
        let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
        mean.exp().clamp(0.0, 1.0) as f32
    };
    Ok((text, confidence))
}

/// Map a non-success status to an error.  Auth, billing and quota failures
/// are `Rejected`; everything else keeps its status for the retry decision.
pub(crate) fn status_error(status: u16, body: &str) -> DescribeError {
    let quota = body.to_ascii_lowercase().contains("quota");
    match status {
        401 | 402 | 403 => DescribeError::Rejected(format!("HTTP {status}: {body}")),
        _ if quota => DescribeError::Rejected(format!("HTTP {status}: {body}")),
        _ => DescribeError::Http {
            status,
            body: body.to_string(),
        },
    }
}

impl ImageDescriber for ApiDescriber {
    fn describe(&self, path: &Path, context: &str) -> Result<ImageDescription, DescribeError> {
        if !path.exists() {
            return Err(DescribeError::NotFound(path.to_path_buf()));
        }
        let mime = mime_type(path)?;
        let bytes = std::fs::read(path)?;
        let data_url = format!("data:{mime};base64,{}", BASE64.encode(bytes));

        let mut req = self
            .client()?
            .post(&self.endpoint)
            .json(&self.request_body(&data_url, context));
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let response = req.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(status_error(status.as_u16(), body.trim()));
        }
        let json: serde_json::Value = response
            .json()
            .map_err(|e| DescribeError::Parse(e.to_string()))?;

        let (raw, confidence) = parse_response(&json)?;
        let text = postprocess_description(&raw, self.max_description_length);
        if text.is_empty() {
            return Err(DescribeError::EmptyResponse);
        }
        log::debug!("describe: {} → {text} ({confidence:.2})", path.display());

        Ok(ImageDescription {
            text,
            confidence,
            model: self.model.clone(),
        })
    }
}
