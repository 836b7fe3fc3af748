// Domain and wire types shared by the broker, workers and orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Pipeline stage served by a worker shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Translation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Translation => "translation",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Stage::Detection => 0,
            Stage::Translation => 1,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation identifier, generated once per client request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Four corner points, clockwise from top-left
pub type Quad = [[f32; 2]; 4];

/// Axis-aligned extent of a quad
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
}

impl Extent {
    pub fn from_quad(quad: &Quad) -> Self {
        let mut extent = Self {
            min_x: f32::MAX,
            max_x: f32::MIN,
            min_y: f32::MAX,
            max_y: f32::MIN,
        };
        for [x, y] in quad {
            extent.min_x = extent.min_x.min(*x);
            extent.max_x = extent.max_x.max(*x);
            extent.min_y = extent.min_y.min(*y);
            extent.max_y = extent.max_y.max(*y);
        }
        extent
    }

    pub fn width(&self) -> f32 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.max_y - self.min_y).max(0.0)
    }

    pub fn center_y(&self) -> f32 {
        (self.min_y + self.max_y) * 0.5
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            max_x: self.max_x.max(other.max_x),
            min_y: self.min_y.min(other.min_y),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grow by `dx` on both horizontal sides and `dy` on both vertical sides
    pub fn expand(&self, dx: f32, dy: f32) -> Self {
        Self {
            min_x: self.min_x - dx,
            max_x: self.max_x + dx,
            min_y: self.min_y - dy,
            max_y: self.max_y + dy,
        }
    }

    /// Closed-interval overlap on both axes
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn to_quad(&self) -> Quad {
        [
            [self.min_x, self.min_y],
            [self.max_x, self.min_y],
            [self.max_x, self.max_y],
            [self.min_x, self.max_y],
        ]
    }
}

/// Raw word-level detection produced by the detection capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub quad: Quad,
    pub text: String,
    pub confidence: f32,
}

/// Merged, renderable text unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParagraphBlock {
    pub quad: Quad,
    pub text: String,
}

impl ParagraphBlock {
    pub fn extent(&self) -> Extent {
        Extent::from_quad(&self.quad)
    }
}

/// Result payload of the detection stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub blocks: Vec<ParagraphBlock>,
    pub median_height: f32,
}

/// Detection task payload: base64 encoded image bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub image: String,
}

/// Translation task payload: block texts in reading order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationPayload {
    pub texts: Vec<String>,
}

/// Unit of dispatched work, serialized as `{"task_id": .., ...payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task<P> {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub payload: P,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Ok,
    Failed,
}

/// Asynchronous reply to a task, correlated by `task_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult<R> {
    pub task_id: TaskId,
    #[serde(default)]
    pub status: StageStatus,
    pub result: Option<R>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<R> StageResult<R> {
    pub fn ok(task_id: TaskId, result: R) -> Self {
        Self {
            task_id,
            status: StageStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(task_id: TaskId, error: String) -> Self {
        Self {
            task_id,
            status: StageStatus::Failed,
            result: None,
            error: Some(error),
        }
    }
}

/// Only the correlation id of a result, used by the demultiplexer
#[derive(Debug, Deserialize)]
pub(crate) struct ResultEnvelope {
    pub task_id: TaskId,
}

/// Reading direction for paragraph reconstruction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingDirection {
    #[default]
    LeftToRight,
    RightToLeft,
}

/// Lifecycle of one client request inside the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
    Created,
    AwaitingDetection,
    AwaitingTranslation,
    Composing,
    Done,
    Failed,
}

/// Per-request bookkeeping, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct RequestState {
    pub task_id: TaskId,
    pub stage: RequestStage,
    pub deadline: Option<Instant>,
    pub partial: Option<DetectionOutput>,
}

impl RequestState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            stage: RequestStage::Created,
            deadline: None,
            partial: None,
        }
    }
}

/// Encoded output image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

/// Final artifact returned to the caller of `submit`
#[derive(Debug, Clone)]
pub struct Artifact {
    pub task_id: TaskId,
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub blocks_rendered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_wire_format_is_flat() {
        let task = Task {
            task_id: TaskId::from("t-1"),
            payload: TranslationPayload {
                texts: vec!["hello".to_string()],
            },
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(json["texts"][0], "hello");

        let back: Task<TranslationPayload> = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_id.as_str(), "t-1");
    }

    #[test]
    fn test_stage_result_status_defaults_to_ok() {
        // Legacy result shape without a status field
        let raw = r#"{"task_id": "abc", "result": ["xin chao"]}"#;
        let parsed: StageResult<Vec<String>> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, StageStatus::Ok);
        assert_eq!(parsed.result.unwrap(), vec!["xin chao".to_string()]);
    }

    #[test]
    fn test_extent_overlap_and_quad() {
        let a = Extent::from_quad(&[[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [0.0, 5.0]]);
        let b = Extent::from_quad(&[[12.0, 0.0], [20.0, 0.0], [20.0, 5.0], [12.0, 5.0]]);
        assert!(!a.overlaps(&b));
        assert!(a.expand(2.0, 0.0).overlaps(&b));
        assert_eq!(a.to_quad()[2], [10.0, 5.0]);
        assert_eq!(a.center_y(), 2.5);
    }
}
