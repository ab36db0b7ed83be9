//! Object-detection seam and the HTTP inference client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use medlake_vision::{ObjectDetection, VisionError};
use serde::Deserialize;
use thiserror::Error;

use crate::config::DetectorConfig;
use crate::error::ErrorKind;
use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {attempts} attempt(s)")]
    Timeout { operation: String, attempts: u32 },

    #[error("unexpected detector response: {0}")]
    BadResponse(String),

    #[error("invalid detection: {0}")]
    InvalidDetection(#[from] VisionError),

    #[error("cannot read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DetectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectorError::Unavailable(_) | DetectorError::Timeout { .. } => {
                ErrorKind::Connectivity
            }
            DetectorError::BadResponse(_) | DetectorError::InvalidDetection(_) => {
                ErrorKind::Validation
            }
            DetectorError::Io { .. } => ErrorKind::Resource,
        }
    }
}

impl Retryable for DetectorError {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    fn timed_out(operation: &str, attempts: u32) -> Self {
        DetectorError::Timeout {
            operation: operation.to_string(),
            attempts,
        }
    }
}

/// Runs a pretrained detector over one image.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, image: &Path) -> Result<Vec<ObjectDetection>, DetectorError>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    class_id: u32,
    confidence: f64,
    #[serde(default)]
    class_name: Option<String>,
}

/// Posts raw image bytes to `<endpoint>/detect` and reads back a
/// `{"detections": [{"class_id", "confidence", "class_name"?}]}` body.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    confidence_threshold: f64,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| DetectorError::Unavailable(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            confidence_threshold: config.confidence_threshold,
        })
    }

    fn parse_response(&self, body: DetectResponse) -> Result<Vec<ObjectDetection>, DetectorError> {
        body.detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .map(|d| {
                ObjectDetection::new(d.class_id, d.class_name, d.confidence).map_err(Into::into)
            })
            .collect()
    }
}

#[async_trait]
impl ObjectDetector for HttpDetector {
    fn name(&self) -> &str {
        &self.model
    }

    async fn detect(&self, image: &Path) -> Result<Vec<ObjectDetection>, DetectorError> {
        let bytes = tokio::fs::read(image).await.map_err(|source| DetectorError::Io {
            path: image.display().to_string(),
            source,
        })?;

        let response = self
            .client
            .post(format!("{}/detect", self.endpoint))
            .query(&[
                ("model", self.model.clone()),
                ("conf", self.confidence_threshold.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DetectorError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DetectorError::BadResponse(format!("HTTP {status}")));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|err| DetectorError::BadResponse(err.to_string()))?;
        self.parse_response(body)
    }
}

fn map_transport_error(err: reqwest::Error) -> DetectorError {
    if err.is_timeout() {
        DetectorError::Timeout {
            operation: "detect".to_string(),
            attempts: 1,
        }
    } else {
        DetectorError::Unavailable(err.to_string())
    }
}
