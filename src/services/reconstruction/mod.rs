// Paragraph reconstruction: raw word detections -> ordered paragraph blocks
//
// Two passes over the confidence-filtered detections:
// 1. Reading order: repeatedly take the top visual row band and pick its
//    leftmost (or rightmost, for RTL) box.
// 2. Clustering: walk that order, growing a paragraph while boxes stay within
//    the expanded extent of the current group. A sentence delimiter at the end
//    of a box closes the paragraph.

use tracing::debug;

use crate::core::config::ReconstructionConfig;
use crate::core::types::{Detection, DetectionOutput, Extent, ParagraphBlock, ReadingDirection};

const SENTENCE_DELIMITERS: [char; 4] = ['.', '!', '?', ':'];

/// Detection reduced to the geometry the passes need
#[derive(Debug, Clone)]
struct WordBox {
    text: String,
    extent: Extent,
}

impl WordBox {
    fn height(&self) -> f32 {
        self.extent.height()
    }

    fn ends_sentence(&self) -> bool {
        self.text
            .trim_end()
            .ends_with(|c: char| SENTENCE_DELIMITERS.contains(&c))
    }
}

/// Paragraph being grown during the clustering pass
struct Group {
    members: Vec<WordBox>,
    extent: Extent,
    height_sum: f32,
}

impl Group {
    fn start(word: WordBox) -> Self {
        Self {
            extent: word.extent,
            height_sum: word.height(),
            members: vec![word],
        }
    }

    fn mean_height(&self) -> f32 {
        self.height_sum / self.members.len() as f32
    }

    fn accepts(&self, word: &WordBox, config: &ReconstructionConfig) -> bool {
        let mean = self.mean_height();
        self.extent
            .expand(config.x_ths * mean, config.y_ths * mean)
            .overlaps(&word.extent)
    }

    fn push(&mut self, word: WordBox) {
        self.extent = self.extent.union(&word.extent);
        self.height_sum += word.height();
        self.members.push(word);
    }

    fn into_block(self) -> ParagraphBlock {
        let text = self
            .members
            .iter()
            .map(|w| w.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        ParagraphBlock {
            quad: self.extent.to_quad(),
            text,
        }
    }
}

/// Reconstruct ordered paragraph blocks from raw detections.
///
/// Detections below `min_confidence` or with blank text are dropped first.
/// An empty input yields an empty output.
pub fn reconstruct(detections: &[Detection], config: &ReconstructionConfig) -> Vec<ParagraphBlock> {
    let words: Vec<WordBox> = detections
        .iter()
        .filter(|d| d.confidence >= config.min_confidence && !d.text.trim().is_empty())
        .map(|d| WordBox {
            text: d.text.clone(),
            extent: Extent::from_quad(&d.quad),
        })
        .collect();

    let kept = words.len();
    let ordered = reading_order(words, config);
    let blocks = cluster(ordered, config);

    debug!(
        "Reconstructed {} blocks from {} detections ({} kept)",
        blocks.len(),
        detections.len(),
        kept
    );
    blocks
}

/// Reconstruct blocks and compute the median block height used for font sizing
pub fn reconstruct_output(detections: &[Detection], config: &ReconstructionConfig) -> DetectionOutput {
    let blocks = reconstruct(detections, config);
    let median_height = median(blocks.iter().map(|b| b.extent().height()).collect());
    DetectionOutput {
        blocks,
        median_height,
    }
}

/// Total order approximating natural reading order
fn reading_order(mut pool: Vec<WordBox>, config: &ReconstructionConfig) -> Vec<WordBox> {
    if pool.is_empty() {
        return pool;
    }

    let mean_height = pool.iter().map(WordBox::height).sum::<f32>() / pool.len() as f32;
    let band = config.row_band * mean_height;
    let mut ordered = Vec::with_capacity(pool.len());

    while !pool.is_empty() {
        let top = pool
            .iter()
            .map(|w| w.extent.center_y())
            .fold(f32::INFINITY, f32::min);

        // First strictly better candidate wins, so ties keep input order
        let mut best: Option<usize> = None;
        for (i, word) in pool.iter().enumerate() {
            if word.extent.center_y() - top > band {
                continue;
            }
            let better = match best {
                None => true,
                Some(j) => match config.direction {
                    ReadingDirection::LeftToRight => word.extent.min_x < pool[j].extent.min_x,
                    ReadingDirection::RightToLeft => word.extent.max_x > pool[j].extent.max_x,
                },
            };
            if better {
                best = Some(i);
            }
        }

        // The box defining `top` is always inside the band
        match best {
            Some(i) => ordered.push(pool.remove(i)),
            None => break,
        }
    }

    ordered
}

fn cluster(ordered: Vec<WordBox>, config: &ReconstructionConfig) -> Vec<ParagraphBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<Group> = None;

    for word in ordered {
        let closes = word.ends_sentence();

        let group = match current.take() {
            Some(mut group) if group.accepts(&word, config) => {
                group.push(word);
                group
            }
            Some(group) => {
                blocks.push(group.into_block());
                Group::start(word)
            }
            None => Group::start(word),
        };

        if closes {
            blocks.push(group.into_block());
        } else {
            current = Some(group);
        }
    }

    if let Some(group) = current {
        blocks.push(group.into_block());
    }

    blocks
}

/// Median with the two middle values averaged; 0 for an empty set
pub fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
