pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_base64, encode_base64, encode_image, encode_image_async, load_image_from_memory_async,
};
pub use metrics::{Metrics, MetricsSnapshot, StageSnapshot};
