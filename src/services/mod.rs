pub mod cache;
pub mod detection;
pub mod reconstruction;
pub mod rendering;
pub mod translation;

// Re-export commonly used services
pub use cache::{EvictionPolicy, Fingerprint, ResultCache};
pub use detection::{Detector, HttpDetector};
pub use reconstruction::{reconstruct, reconstruct_output};
pub use rendering::{ComposedImage, CosmicTextPainter, GlyphPainter, PlacedBlock, TextLayoutRenderer};
pub use translation::{strip_protocol_prefix, HttpTranslator, Translator};
