use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::core::errors::{CapabilityError, CapabilityResult};
use crate::core::types::{Detection, Quad};

/// Word-level text detection and recognition
#[async_trait]
pub trait Detector: Send + Sync {
    /// Detect text in encoded image bytes
    async fn detect(&self, image: &[u8]) -> CapabilityResult<Vec<Detection>>;
}

/// Response shapes accepted from a detection endpoint
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetectorResponse {
    /// `[[quad, text, confidence], ...]`
    Triples(Vec<(Quad, String, f32)>),
    /// `{"bboxes": [...], "texts": [...]}`, already confidence filtered
    Columns { bboxes: Vec<Quad>, texts: Vec<String> },
}

impl DetectorResponse {
    fn into_detections(self) -> CapabilityResult<Vec<Detection>> {
        match self {
            DetectorResponse::Triples(rows) => Ok(rows
                .into_iter()
                .map(|(quad, text, confidence)| Detection {
                    quad,
                    text,
                    confidence,
                })
                .collect()),
            DetectorResponse::Columns { bboxes, texts } => {
                if bboxes.len() != texts.len() {
                    return Err(CapabilityError::InvalidResponse(format!(
                        "{} boxes but {} texts",
                        bboxes.len(),
                        texts.len()
                    )));
                }
                Ok(bboxes
                    .into_iter()
                    .zip(texts)
                    .map(|(quad, text)| Detection {
                        quad,
                        text,
                        confidence: 1.0,
                    })
                    .collect())
            }
        }
    }
}

/// Detector backed by an HTTP model server
pub struct HttpDetector {
    url: String,
    http_client: reqwest::Client,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> CapabilityResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn detect(&self, image: &[u8]) -> CapabilityResult<Vec<Detection>> {
        let start = Instant::now();
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name("image")
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http_client
            .post(&self.url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DetectorResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))?;
        let detections = parsed.into_detections()?;

        debug!(
            "Detector returned {} detections in {:.0}ms",
            detections.len(),
            start.elapsed().as_millis()
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_triples() {
        let raw = r#"[[[[0,0],[10,0],[10,5],[0,5]], "hello", 0.93]]"#;
        let parsed: DetectorResponse = serde_json::from_str(raw).unwrap();
        let detections = parsed.into_detections().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].text, "hello");
        assert_eq!(detections[0].quad[2], [10.0, 5.0]);
        assert!((detections[0].confidence - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_parse_columns() {
        let raw = r#"{"bboxes": [[[1,1],[4,1],[4,3],[1,3]]], "texts": ["hi"]}"#;
        let parsed: DetectorResponse = serde_json::from_str(raw).unwrap();
        let detections = parsed.into_detections().unwrap();
        assert_eq!(detections[0].confidence, 1.0);

        let uneven = r#"{"bboxes": [], "texts": ["orphan"]}"#;
        let parsed: DetectorResponse = serde_json::from_str(uneven).unwrap();
        assert!(matches!(
            parsed.into_detections(),
            Err(CapabilityError::InvalidResponse(_))
        ));
    }

    /// Model server stand-in: answers one triple per request when the image
    /// arrives as multipart field "file"
    async fn stub_server() -> (String, tokio::task::JoinHandle<()>) {
        use axum::extract::Multipart;
        use axum::http::StatusCode;
        use axum::routing::post;
        use axum::{Json, Router};

        let app = Router::new().route(
            "/ocr",
            post(|mut multipart: Multipart| async move {
                while let Ok(Some(field)) = multipart.next_field().await {
                    if field.name() == Some("file") {
                        let bytes = field.bytes().await.unwrap_or_default();
                        let text = format!("{} bytes", bytes.len());
                        let body = serde_json::json!([[[[0, 0], [10, 0], [10, 5], [0, 5]], text, 0.9]]);
                        return Ok(Json(body));
                    }
                }
                Err((StatusCode::UNPROCESSABLE_ENTITY, "missing file field"))
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/ocr", addr), server)
    }

    #[tokio::test]
    async fn test_http_detector_sends_file_field() {
        let (url, server) = stub_server().await;
        let detector = HttpDetector::new(url, Duration::from_secs(5)).unwrap();

        let detections = detector.detect(&[7u8; 42]).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].text, "42 bytes");

        server.abort();
    }

    #[tokio::test]
    async fn test_http_detector_reports_bad_status() {
        let (url, server) = stub_server().await;
        let client = reqwest::Client::new();

        // A raw body is not what the model server expects
        let response = client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(vec![1u8, 2, 3])
            .send()
            .await
            .unwrap();
        assert!(response.status().is_client_error());

        let missing = HttpDetector::new(url.replace("/ocr", "/nope"), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            missing.detect(&[1u8]).await,
            Err(CapabilityError::BadStatus { status: 404, .. })
        ));

        server.abort();
    }
}
