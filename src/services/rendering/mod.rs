use cosmic_text::{
    fontdb, Attrs, Buffer, Color as CosmicColor, Family, FontSystem, Metrics, Shaping, SwashCache,
    Wrap,
};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::RenderingConfig;
use crate::core::errors::{RenderError, RenderResult};
use crate::core::types::{Extent, ParagraphBlock};

/// Sample used to estimate the average advance of a font
const WIDTH_SAMPLE: &str = "The quick brown fox jumps over the lazy dog 0123456789";

/// Glyph rasterisation used by the layout renderer.
///
/// Layout only needs two metrics and a way to draw one already-wrapped line,
/// which keeps the layout rules testable without a font.
pub trait GlyphPainter: Send + Sync {
    /// Average advance of one character, in pixels
    fn average_glyph_width(&self, font_size: f32) -> f32;

    fn line_height(&self, font_size: f32) -> f32;

    /// Draw a single line with its top-left corner at (x, y)
    fn draw_line(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        x: i32,
        y: i32,
        font_size: f32,
        color: Rgba<u8>,
    );
}

/// cosmic-text backed painter
pub struct CosmicTextPainter {
    font_system: Mutex<FontSystem>,
    swash_cache: Mutex<SwashCache>,
    // Family of the loaded font file; None renders with the system sans-serif
    family: Option<String>,
}

impl CosmicTextPainter {
    /// Create a painter from a single font file, skipping system font scanning
    pub fn from_font_file(path: &str) -> RenderResult<Self> {
        let font_data = std::fs::read(path)
            .map_err(|e| RenderError::FontLoad(format!("{}: {}", path, e)))?;

        let mut db = fontdb::Database::new();
        db.load_font_data(font_data);

        let family = db
            .faces()
            .next()
            .and_then(|face| face.families.first())
            .map(|(name, _)| name.clone())
            .ok_or_else(|| RenderError::FontLoad(format!("{}: no usable font face", path)))?;

        info!("✓ Font: {} from {}", family, path);

        Ok(Self {
            font_system: Mutex::new(FontSystem::new_with_locale_and_db("en-US".to_string(), db)),
            swash_cache: Mutex::new(SwashCache::new()),
            family: Some(family),
        })
    }

    /// Create a painter over the system fonts
    pub fn with_system_fonts() -> Self {
        info!("Initializing text painter with system fonts");
        Self {
            font_system: Mutex::new(FontSystem::new()),
            swash_cache: Mutex::new(SwashCache::new()),
            family: None,
        }
    }

    fn attrs(&self) -> Attrs<'_> {
        match &self.family {
            Some(name) => Attrs::new().family(Family::Name(name.as_str())),
            None => Attrs::new().family(Family::SansSerif),
        }
    }

    /// Shape a single unwrapped line
    fn shape(&self, font_system: &mut FontSystem, text: &str, font_size: f32) -> Buffer {
        let metrics = Metrics::new(font_size, self.line_height(font_size));
        let mut buffer = Buffer::new(font_system, metrics);
        buffer.set_size(font_system, None, None);
        buffer.set_wrap(font_system, Wrap::None);
        buffer.set_text(font_system, text, &self.attrs(), Shaping::Advanced);
        buffer.shape_until_scroll(font_system, false);
        buffer
    }
}

impl GlyphPainter for CosmicTextPainter {
    fn average_glyph_width(&self, font_size: f32) -> f32 {
        let line_width = {
            let mut font_system = self.font_system.lock();
            let buffer = self.shape(&mut font_system, WIDTH_SAMPLE, font_size);
            buffer
                .layout_runs()
                .map(|run| run.line_w)
                .fold(0.0f32, f32::max)
        };

        let average = line_width / WIDTH_SAMPLE.chars().count() as f32;
        if average.is_finite() && average > 0.0 {
            average
        } else {
            // No glyphs shaped (missing font): assume half an em
            font_size * 0.5
        }
    }

    fn line_height(&self, font_size: f32) -> f32 {
        (font_size * 1.4).max(1.0)
    }

    fn draw_line(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        x: i32,
        y: i32,
        font_size: f32,
        color: Rgba<u8>,
    ) {
        let mut font_system = self.font_system.lock();
        let mut swash_cache = self.swash_cache.lock();
        let buffer = self.shape(&mut font_system, text, font_size);
        let cosmic_color = CosmicColor::rgba(color[0], color[1], color[2], color[3]);

        let (width, height) = (canvas.width() as i32, canvas.height() as i32);
        buffer.draw(
            &mut font_system,
            &mut swash_cache,
            cosmic_color,
            |px_x, px_y, w, h, pixel_color| {
                if pixel_color.a() == 0 {
                    return;
                }
                let alpha = pixel_color.a() as f32 / 255.0;
                let inv_alpha = 1.0 - alpha;

                for dy in 0..h as i32 {
                    for dx in 0..w as i32 {
                        let img_x = x + px_x + dx;
                        let img_y = y + px_y + dy;
                        if img_x < 0 || img_x >= width || img_y < 0 || img_y >= height {
                            continue;
                        }

                        let existing = canvas.get_pixel(img_x as u32, img_y as u32);
                        let blended = Rgba([
                            ((pixel_color.r() as f32 * alpha) + (existing[0] as f32 * inv_alpha)) as u8,
                            ((pixel_color.g() as f32 * alpha) + (existing[1] as f32 * inv_alpha)) as u8,
                            ((pixel_color.b() as f32 * alpha) + (existing[2] as f32 * inv_alpha)) as u8,
                            existing[3].max(pixel_color.a()),
                        ]);
                        canvas.put_pixel(img_x as u32, img_y as u32, blended);
                    }
                }
            },
        );
    }
}

/// Where one block ended up on the canvas
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedBlock {
    /// Filled background rectangle, clipped to the image
    pub rect: Extent,
    pub lines: Vec<String>,
}

/// Output of [`TextLayoutRenderer::compose`]
#[derive(Debug, Clone)]
pub struct ComposedImage {
    pub image: RgbaImage,
    pub placements: Vec<PlacedBlock>,
}

/// Stacks translated blocks over their source regions.
///
/// Blocks are laid out top to bottom. Each background rectangle starts at the
/// lower of its detected top and the bottom of the previous block, so later
/// blocks never cover earlier ones.
#[derive(Clone)]
pub struct TextLayoutRenderer {
    painter: Arc<dyn GlyphPainter>,
    config: RenderingConfig,
}

impl TextLayoutRenderer {
    pub fn new(painter: Arc<dyn GlyphPainter>, config: RenderingConfig) -> Self {
        Self { painter, config }
    }

    pub fn config(&self) -> &RenderingConfig {
        &self.config
    }

    /// Composite `translations` over `blocks`. Synchronous and CPU bound.
    pub fn compose(
        &self,
        mut image: RgbaImage,
        blocks: &[ParagraphBlock],
        translations: &[String],
        median_height: f32,
    ) -> RenderResult<ComposedImage> {
        if blocks.len() != translations.len() {
            return Err(RenderError::ContractViolation {
                blocks: blocks.len(),
                translations: translations.len(),
            });
        }

        let font_size = self.config.font_size_for(median_height);
        let line_height = self.painter.line_height(font_size);
        let glyph_width = match self.painter.average_glyph_width(font_size) {
            w if w.is_finite() && w > 0.0 => w,
            _ => font_size * 0.5,
        };
        let padding = self.config.padding as f32;
        let background = Rgba(self.config.background);
        let text_color = Rgba(self.config.text_color);
        let (img_w, img_h) = (image.width() as f32, image.height() as f32);

        debug!(
            "Composing {} blocks: font={:.1}px, line={:.1}px, glyph={:.1}px",
            blocks.len(),
            font_size,
            line_height,
            glyph_width
        );

        let mut placements = Vec::with_capacity(blocks.len());
        let mut current_y = 0.0f32;

        for (block, translation) in blocks.iter().zip(translations) {
            let extent = block.extent();
            let chars_per_line = ((extent.width() / glyph_width).floor() as usize).max(1);
            let lines = wrap_text(translation, chars_per_line);

            let top = extent.min_y.max(current_y);
            let text_height = lines.len() as f32 * line_height + 2.0 * padding;
            let height = extent.height().max(text_height);
            current_y = top + height;

            let rect = Extent {
                min_x: extent.min_x.clamp(0.0, img_w),
                max_x: extent.max_x.clamp(0.0, img_w),
                min_y: top.clamp(0.0, img_h),
                max_y: (top + height).clamp(0.0, img_h),
            };
            fill_rect(&mut image, &rect, background);

            for (i, line) in lines.iter().enumerate() {
                let y = top + padding + i as f32 * line_height;
                if y >= img_h {
                    break;
                }
                self.painter.draw_line(
                    &mut image,
                    line,
                    (extent.min_x + padding) as i32,
                    y as i32,
                    font_size,
                    text_color,
                );
            }

            placements.push(PlacedBlock { rect, lines });
        }

        if current_y > img_h {
            warn!(
                "Translated text overflows the image by {:.0}px and was clipped",
                current_y - img_h
            );
        }

        Ok(ComposedImage { image, placements })
    }
}

fn fill_rect(image: &mut RgbaImage, rect: &Extent, color: Rgba<u8>) {
    let x0 = rect.min_x.floor() as u32;
    let x1 = (rect.max_x.ceil() as u32).min(image.width());
    let y0 = rect.min_y.floor() as u32;
    let y1 = (rect.max_y.ceil() as u32).min(image.height());

    for y in y0..y1 {
        for x in x0..x1 {
            image.put_pixel(x, y, color);
        }
    }
}

/// Greedy word wrap to `width` characters per line.
///
/// Words longer than a line are broken, first filling whatever space is left
/// on the current line.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let needed = if current_len == 0 {
            word_len
        } else {
            current_len + 1 + word_len
        };

        if needed <= width {
            if current_len > 0 {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
            continue;
        }

        if word_len <= width {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
            continue;
        }

        // Long word
        let mut chars = word.chars().peekable();
        if current_len > 0 {
            let space_left = width.saturating_sub(current_len + 1);
            if space_left > 0 {
                current.push(' ');
                current.extend(chars.by_ref().take(space_left));
            }
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }
        while chars.peek().is_some() {
            let chunk: String = chars.by_ref().take(width).collect();
            let chunk_len = chunk.chars().count();
            if chunk_len == width && chars.peek().is_some() {
                lines.push(chunk);
            } else {
                current = chunk;
                current_len = chunk_len;
            }
        }
    }

    if current_len > 0 {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed-metric painter that marks the first pixel of every line
    struct FakePainter {
        drawn: Mutex<Vec<(String, i32, i32)>>,
    }

    impl FakePainter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                drawn: Mutex::new(Vec::new()),
            })
        }
    }

    impl GlyphPainter for FakePainter {
        fn average_glyph_width(&self, _font_size: f32) -> f32 {
            10.0
        }

        fn line_height(&self, _font_size: f32) -> f32 {
            20.0
        }

        fn draw_line(
            &self,
            canvas: &mut RgbaImage,
            text: &str,
            x: i32,
            y: i32,
            _font_size: f32,
            color: Rgba<u8>,
        ) {
            if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
                canvas.put_pixel(x as u32, y as u32, color);
            }
            self.drawn.lock().push((text.to_string(), x, y));
        }
    }

    fn block(text: &str, x0: f32, y0: f32, x1: f32, y1: f32) -> ParagraphBlock {
        ParagraphBlock {
            quad: [[x0, y0], [x1, y0], [x1, y1], [x0, y1]],
            text: text.to_string(),
        }
    }

    fn canvas() -> RgbaImage {
        RgbaImage::from_pixel(200, 200, Rgba([0, 0, 0, 255]))
    }

    fn renderer(painter: Arc<FakePainter>) -> TextLayoutRenderer {
        TextLayoutRenderer::new(painter, RenderingConfig::default())
    }

    #[test]
    fn test_dimensions_unchanged_and_background_filled() {
        let painter = FakePainter::new();
        let blocks = vec![block("hello", 20.0, 20.0, 120.0, 40.0)];
        let composed = renderer(painter.clone())
            .compose(canvas(), &blocks, &["xin chao".to_string()], 20.0)
            .unwrap();

        assert_eq!(composed.image.dimensions(), (200, 200));
        // Inside the rectangle, away from the text origin
        assert_eq!(*composed.image.get_pixel(110, 22), Rgba([128, 128, 128, 255]));
        // Outside any block
        assert_eq!(*composed.image.get_pixel(150, 150), Rgba([0, 0, 0, 255]));
        // Text origin is padded into the rectangle
        assert_eq!(*composed.image.get_pixel(25, 25), Rgba([255, 255, 255, 255]));

        let drawn = painter.drawn.lock();
        assert_eq!(drawn.as_slice(), &[("xin chao".to_string(), 25, 25)]);
    }

    #[test]
    fn test_count_mismatch_is_contract_violation() {
        let blocks = vec![
            block("a", 0.0, 0.0, 50.0, 20.0),
            block("b", 0.0, 50.0, 50.0, 70.0),
        ];
        let err = renderer(FakePainter::new())
            .compose(canvas(), &blocks, &["only one".to_string()], 20.0)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::ContractViolation {
                blocks: 2,
                translations: 1
            }
        ));
    }

    #[test]
    fn test_blocks_never_overlap() {
        let blocks = vec![
            block("first", 10.0, 10.0, 60.0, 30.0),
            block("second", 10.0, 40.0, 60.0, 60.0),
        ];
        // 50px wide at 10px per glyph: 5 chars per line, three lines
        let translations = vec!["aaaa bbbb cccc".to_string(), "dd".to_string()];
        let composed = renderer(FakePainter::new())
            .compose(canvas(), &blocks, &translations, 20.0)
            .unwrap();

        let first = &composed.placements[0];
        assert_eq!(first.lines, vec!["aaaa", "bbbb", "cccc"]);
        // 3 lines x 20 + 2 x 5 padding
        assert_eq!(first.rect.min_y, 10.0);
        assert_eq!(first.rect.max_y, 80.0);

        let second = &composed.placements[1];
        assert_eq!(second.rect.min_y, 80.0);
        assert!(second.rect.min_y >= first.rect.max_y);
    }

    #[test]
    fn test_detected_height_wins_when_taller() {
        let blocks = vec![block("tall", 10.0, 10.0, 110.0, 150.0)];
        let composed = renderer(FakePainter::new())
            .compose(canvas(), &blocks, &["short".to_string()], 20.0)
            .unwrap();
        assert_eq!(composed.placements[0].rect.max_y, 150.0);
    }

    #[test]
    fn test_rectangle_is_clipped_to_image() {
        let blocks = vec![block("edge", 150.0, 190.0, 260.0, 199.0)];
        let composed = renderer(FakePainter::new())
            .compose(canvas(), &blocks, &["one two three four".to_string()], 20.0)
            .unwrap();

        let rect = &composed.placements[0].rect;
        assert_eq!(rect.max_x, 200.0);
        assert_eq!(rect.max_y, 200.0);
        assert_eq!(*composed.image.get_pixel(199, 199), Rgba([128, 128, 128, 255]));
    }

    #[test]
    fn test_empty_input_returns_image_untouched() {
        let composed = renderer(FakePainter::new())
            .compose(canvas(), &[], &[], 0.0)
            .unwrap();
        assert!(composed.placements.is_empty());
        assert!(composed.image.pixels().all(|p| *p == Rgba([0, 0, 0, 255])));
    }

    #[test]
    fn test_wrap_text() {
        assert_eq!(wrap_text("hello world", 5), vec!["hello", "world"]);
        assert_eq!(wrap_text("hello world", 11), vec!["hello world"]);
        assert_eq!(wrap_text("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert_eq!(wrap_text("ab cdefghij", 5), vec!["ab cd", "efghi", "j"]);
        assert_eq!(wrap_text("abcd", 4), vec!["abcd"]);
        assert_eq!(wrap_text("xin chào thế giới", 1).len(), 14);
        assert!(wrap_text("   ", 10).is_empty());
    }
}
