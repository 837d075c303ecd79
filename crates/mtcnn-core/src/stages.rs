//! The three cascade stages and the candidate set they pass along.
//!
//! Candidates live in one flat `Vec`; suppression and thresholding compact it
//! in place, keeping the survivors in rank order.

use crate::geometry::{nms, pad, Deltas, IouMode, Rect, Scored};
use crate::network::{image_to_tensor, write_normalized, InferenceError, Network};
use crate::pyramid::PyramidScale;
use crate::types::{BoundingBox, FaceAnnotation, Landmark, LandmarkType, Position};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use rayon::prelude::*;

// --- Named constants (no magic numbers) ---
const PROPOSAL_STRIDE: f32 = 2.0;
const PROPOSAL_CELL_SIZE: f32 = 12.0;
const REFINE_INPUT_SIZE: u32 = 24;
const OUTPUT_INPUT_SIZE: u32 = 48;
const SCALE_NMS_THRESHOLD: f32 = 0.5;
const MERGE_NMS_THRESHOLD: f32 = 0.7;
const REFINE_NMS_THRESHOLD: f32 = 0.7;
const OUTPUT_NMS_THRESHOLD: f32 = 0.7;
/// Crops larger than this multiple of the image's longer side are fed as
/// black patches instead of allocating the full canvas.
const MAX_CROP_OVERSIZE: u32 = 8;

/// A face hypothesis carried between stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rect: Rect,
    pub score: f32,
    /// Regression deltas from the last network that saw this box, not yet applied.
    pub deltas: Deltas,
    /// Absolute landmark positions, set by the output stage.
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl Scored for Candidate {
    fn rect(&self) -> &Rect {
        &self.rect
    }

    fn score(&self) -> f32 {
        self.score
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    items: Vec<Candidate>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.items.iter()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.items.push(candidate);
    }

    pub fn append(&mut self, other: CandidateSet) {
        self.items.extend(other.items);
    }

    /// Run NMS and keep only the survivors, best first.
    pub fn suppress(&mut self, threshold: f32, mode: IouMode) {
        let keep = nms(&self.items, threshold, mode);
        let mut slots: Vec<Option<Candidate>> = self.items.drain(..).map(Some).collect();
        self.items = keep.iter().filter_map(|&i| slots[i].take()).collect();
    }

    pub fn retain_above(&mut self, threshold: f32) {
        self.items.retain(|c| c.score >= threshold);
    }

    /// Apply and clear each candidate's pending deltas.
    pub fn apply_regression(&mut self) {
        for c in &mut self.items {
            c.rect = c.rect.regress(&c.deltas);
            c.deltas = Deltas::default();
        }
    }

    pub fn square(&mut self) {
        for c in &mut self.items {
            c.rect = c.rect.square();
        }
    }

    /// Snap to whole pixels without changing the aspect of square boxes.
    pub fn truncate(&mut self) {
        for c in &mut self.items {
            c.rect = c.rect.trunc_extent();
        }
    }
}

impl FromIterator<Candidate> for CandidateSet {
    fn from_iter<I: IntoIterator<Item = Candidate>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Stage 1: run the proposal network on every pyramid level and merge.
///
/// Output boxes are regressed, squared and truncated to whole pixels.
pub(crate) fn collect_proposals(
    image: &RgbImage,
    scales: &[PyramidScale],
    net: &dyn Network,
    threshold: f32,
    parallel: bool,
) -> Result<CandidateSet, InferenceError> {
    let per_scale: Vec<Result<CandidateSet, InferenceError>> = if parallel && scales.len() > 1 {
        scales
            .par_iter()
            .map(|&scale| propose(image, scale, net, threshold))
            .collect()
    } else {
        scales
            .iter()
            .map(|&scale| propose(image, scale, net, threshold))
            .collect()
    };

    let mut merged = CandidateSet::default();
    for result in per_scale {
        merged.append(result?);
    }
    if merged.is_empty() {
        return Ok(merged);
    }

    let before = merged.len();
    merged.suppress(MERGE_NMS_THRESHOLD, IouMode::Union);
    tracing::trace!(before, after = merged.len(), "stage 1: cross-scale NMS");

    merged.apply_regression();
    merged.square();
    merged.truncate();
    Ok(merged)
}

/// Proposal pass over a single pyramid level.
fn propose(
    image: &RgbImage,
    scale: PyramidScale,
    net: &dyn Network,
    threshold: f32,
) -> Result<CandidateSet, InferenceError> {
    let resized = imageops::resize(image, scale.width, scale.height, FilterType::Triangle);
    let input = image_to_tensor(&resized);
    let output = net.predict(input.view())?;
    output.check("proposal", 1, false)?;

    let (_, _, rows, cols) = output.probabilities.dim();
    let mut set = CandidateSet::default();
    for row in 0..rows {
        for col in 0..cols {
            let score = output.face_probability(0, row, col);
            if !(score >= threshold) {
                continue;
            }
            set.push(Candidate {
                rect: cell_rect(row, col, scale.scale),
                score,
                deltas: output.deltas(0, row, col),
                landmarks: None,
            });
        }
    }

    let raw = set.len();
    set.suppress(SCALE_NMS_THRESHOLD, IouMode::Union);
    tracing::trace!(scale = scale.scale, raw, kept = set.len(), "stage 1: scale done");
    Ok(set)
}

/// Image-space box covered by one proposal-grid cell.
fn cell_rect(row: usize, col: usize, scale: f32) -> Rect {
    let x = PROPOSAL_STRIDE * col as f32;
    let y = PROPOSAL_STRIDE * row as f32;
    Rect::new(
        ((x + 1.0) / scale).trunc(),
        ((y + 1.0) / scale).trunc(),
        ((x + PROPOSAL_CELL_SIZE) / scale).trunc(),
        ((y + PROPOSAL_CELL_SIZE) / scale).trunc(),
    )
}

/// Stage 2: rescore 24×24 crops, regress, re-square and suppress.
pub(crate) fn refine(
    image: &RgbImage,
    mut set: CandidateSet,
    net: &dyn Network,
    threshold: f32,
) -> Result<CandidateSet, InferenceError> {
    if set.is_empty() {
        return Ok(set);
    }

    let input = crop_batch(image, &set, REFINE_INPUT_SIZE);
    let output = net.predict(input.view())?;
    output.check("refine", set.len(), false)?;

    for (n, c) in set.items.iter_mut().enumerate() {
        c.score = output.face_probability(n, 0, 0);
        c.deltas = output.deltas(n, 0, 0);
    }
    set.retain_above(threshold);
    set.apply_regression();
    set.square();
    set.suppress(REFINE_NMS_THRESHOLD, IouMode::Union);
    Ok(set)
}

/// Stage 3: rescore 48×48 crops, decode landmarks, regress and run the final
/// Min-mode suppression.
pub(crate) fn finalize(
    image: &RgbImage,
    mut set: CandidateSet,
    net: &dyn Network,
    threshold: f32,
) -> Result<Vec<FaceAnnotation>, InferenceError> {
    if set.is_empty() {
        return Ok(Vec::new());
    }

    set.truncate();
    let input = crop_batch(image, &set, OUTPUT_INPUT_SIZE);
    let output = net.predict(input.view())?;
    output.check("output", set.len(), true)?;

    for (n, c) in set.items.iter_mut().enumerate() {
        c.score = output.face_probability(n, 0, 0);
        c.deltas = output.deltas(n, 0, 0);
        c.landmarks = output
            .landmark_offsets(n)
            .map(|offsets| decode_landmarks(&c.rect, &offsets));
    }
    set.retain_above(threshold);
    set.apply_regression();
    set.suppress(OUTPUT_NMS_THRESHOLD, IouMode::Min);

    Ok(set
        .iter()
        .filter_map(|c| annotate(c, image.width(), image.height()))
        .collect())
}

/// Offsets are `[x0..x4, y0..y4]`, relative to `rect`'s size.
fn decode_landmarks(rect: &Rect, offsets: &[f32; 10]) -> [(f32, f32); 5] {
    std::array::from_fn(|i| {
        (
            rect.x1 + offsets[i] * rect.width(),
            rect.y1 + offsets[i + 5] * rect.height(),
        )
    })
}

/// Clip to the image and round to whole pixels. Empty boxes are dropped.
fn annotate(c: &Candidate, width: u32, height: u32) -> Option<FaceAnnotation> {
    let points = c.landmarks?;
    let clipped = c.rect.clip(width as f32, height as f32);
    let x1 = clipped.x1.round() as i32;
    let y1 = clipped.y1.round() as i32;
    let x2 = clipped.x2.round() as i32;
    let y2 = clipped.y2.round() as i32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(FaceAnnotation {
        bbox: BoundingBox {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        },
        confidence: c.score,
        landmarks: std::array::from_fn(|i| Landmark {
            kind: LandmarkType::ALL[i],
            position: Position {
                x: points[i].0.round() as i32,
                y: points[i].1.round() as i32,
            },
        }),
    })
}

/// Crop every candidate (black outside the image), resize and stack into one
/// `(N, 3, size, size)` batch.
fn crop_batch(image: &RgbImage, set: &CandidateSet, size: u32) -> Array4<f32> {
    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((set.len(), 3, s, s));
    for (n, c) in set.iter().enumerate() {
        let patch = crop_padded(image, &c.rect, size);
        write_normalized(&patch, &mut tensor, n);
    }
    tensor
}

fn crop_padded(image: &RgbImage, rect: &Rect, size: u32) -> RgbImage {
    let limit = MAX_CROP_OVERSIZE * image.width().max(image.height());
    let window = match pad(rect, image.width(), image.height()) {
        Some(w) if w.canvas_width <= limit && w.canvas_height <= limit => w,
        _ => return RgbImage::new(size, size),
    };

    let mut canvas = RgbImage::new(window.canvas_width, window.canvas_height);
    if window.width > 0 && window.height > 0 {
        let inside =
            imageops::crop_imm(image, window.src_x, window.src_y, window.width, window.height)
                .to_image();
        imageops::replace(&mut canvas, &inside, window.dst_x as i64, window.dst_y as i64);
    }
    imageops::resize(&canvas, size, size, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetOutput;
    use image::Rgb;
    use ndarray::ArrayView4;

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate {
            rect: Rect::from_xywh(x, y, w, h),
            score,
            deltas: Deltas::default(),
            landmarks: None,
        }
    }

    /// Batch network answering every crop with the same score and deltas.
    struct Constant {
        score: f32,
        deltas: [f32; 4],
        landmarks: Option<[f32; 10]>,
    }

    impl Network for Constant {
        fn predict(&self, input: ArrayView4<'_, f32>) -> Result<NetOutput, InferenceError> {
            let n = input.dim().0;
            let mut probabilities = Array4::zeros((n, 2, 1, 1));
            let mut regressions = Array4::zeros((n, 4, 1, 1));
            let mut landmarks = self.landmarks.map(|_| Array4::zeros((n, 10, 1, 1)));
            for i in 0..n {
                probabilities[[i, 0, 0, 0]] = 1.0 - self.score;
                probabilities[[i, 1, 0, 0]] = self.score;
                for c in 0..4 {
                    regressions[[i, c, 0, 0]] = self.deltas[c];
                }
                if let (Some(l), Some(values)) = (landmarks.as_mut(), self.landmarks) {
                    for c in 0..10 {
                        l[[i, c, 0, 0]] = values[c];
                    }
                }
            }
            Ok(NetOutput { probabilities, regressions, landmarks })
        }
    }

    struct Failing;

    impl Network for Failing {
        fn predict(&self, _input: ArrayView4<'_, f32>) -> Result<NetOutput, InferenceError> {
            Err(InferenceError::Failed("backend fault".to_string()))
        }
    }

    #[test]
    fn test_cell_rect_maps_back_to_image() {
        let r = cell_rect(3, 5, 0.5);
        assert_eq!(r, Rect::new(22.0, 14.0, 44.0, 36.0));
    }

    #[test]
    fn test_suppress_keeps_rank_order() {
        let mut set: CandidateSet = vec![
            cand(0.0, 0.0, 10.0, 10.0, 0.7),
            cand(100.0, 0.0, 10.0, 10.0, 0.9),
            cand(1.0, 1.0, 10.0, 10.0, 0.8),
        ]
        .into_iter()
        .collect();
        set.suppress(0.5, IouMode::Union);
        let scores: Vec<f32> = set.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.8]);
    }

    #[test]
    fn test_regression_then_square_is_square() {
        let mut set: CandidateSet = vec![Candidate {
            deltas: Deltas { dx1: 0.1, dy1: -0.05, dx2: 0.3, dy2: 0.2 },
            ..cand(10.0, 10.0, 40.0, 30.0, 0.9)
        }]
        .into_iter()
        .collect();
        set.apply_regression();
        set.square();
        let c = set.iter().next().unwrap();
        assert!((c.rect.width() - c.rect.height()).abs() < 1e-4);
        assert_eq!(c.deltas, Deltas::default());
    }

    #[test]
    fn test_decode_landmarks() {
        let rect = Rect::from_xywh(100.0, 50.0, 40.0, 60.0);
        let offsets = [0.25, 0.75, 0.5, 0.3, 0.7, 0.4, 0.4, 0.6, 0.8, 0.8];
        let pts = decode_landmarks(&rect, &offsets);
        assert_eq!(pts[0], (110.0, 74.0));
        assert_eq!(pts[1], (130.0, 74.0));
        assert_eq!(pts[2], (120.0, 86.0));
        assert!((pts[3].0 - 112.0).abs() < 1e-4 && (pts[3].1 - 98.0).abs() < 1e-4);
        assert!((pts[4].0 - 128.0).abs() < 1e-4 && (pts[4].1 - 98.0).abs() < 1e-4);
    }

    #[test]
    fn test_annotate_clips_to_image() {
        let c = Candidate {
            landmarks: Some([(5.0, 5.0); 5]),
            ..cand(-10.4, 20.0, 80.0, 200.0, 0.95)
        };
        let face = annotate(&c, 60, 100).unwrap();
        assert_eq!(face.bbox, BoundingBox { x: 0, y: 20, w: 60, h: 80 });
        assert!(face.bbox.x + face.bbox.w <= 60 && face.bbox.y + face.bbox.h <= 100);
        assert_eq!(face.landmarks[4].kind, LandmarkType::MouthRight);
    }

    #[test]
    fn test_annotate_drops_box_outside_image() {
        let c = Candidate {
            landmarks: Some([(0.0, 0.0); 5]),
            ..cand(200.0, 200.0, 20.0, 20.0, 0.95)
        };
        assert!(annotate(&c, 100, 100).is_none());
    }

    #[test]
    fn test_crop_padded_fills_outside_black() {
        let img = RgbImage::from_pixel(20, 20, Rgb([200, 200, 200]));
        // Box hangs 20 px off the left edge: left half of the crop is black.
        let patch = crop_padded(&img, &Rect::new(-20.0, 0.0, 20.0, 40.0), 24);
        assert_eq!(patch.dimensions(), (24, 24));
        assert_eq!(patch.get_pixel(2, 2)[0], 0);
        assert!(patch.get_pixel(20, 5)[0] > 150);
    }

    #[test]
    fn test_crop_padded_oversized_box_is_black() {
        let img = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        let patch = crop_padded(&img, &Rect::new(0.0, 0.0, 1000.0, 1000.0), 24);
        assert!(patch.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_refine_filters_regresses_and_squares() {
        let img = RgbImage::new(100, 100);
        let set: CandidateSet = vec![cand(10.0, 10.0, 40.0, 40.0, 0.6)].into_iter().collect();
        let net = Constant { score: 0.9, deltas: [0.0, 0.0, 0.0, -0.5], landmarks: None };
        let out = refine(&img, set, &net, 0.7).unwrap();
        assert_eq!(out.len(), 1);
        let c = out.iter().next().unwrap();
        assert_eq!(c.score, 0.9);
        // 40x20 after regression, squared to 40x40 around the same center.
        assert_eq!(c.rect, Rect::new(10.0, 0.0, 50.0, 40.0));
    }

    #[test]
    fn test_refine_rejects_below_threshold() {
        let img = RgbImage::new(100, 100);
        let set: CandidateSet = vec![cand(10.0, 10.0, 40.0, 40.0, 0.9)].into_iter().collect();
        let net = Constant { score: 0.5, deltas: [0.0; 4], landmarks: None };
        assert!(refine(&img, set, &net, 0.7).unwrap().is_empty());
    }

    #[test]
    fn test_empty_sets_skip_inference() {
        let img = RgbImage::new(100, 100);
        assert!(refine(&img, CandidateSet::default(), &Failing, 0.7).unwrap().is_empty());
        assert!(finalize(&img, CandidateSet::default(), &Failing, 0.7).unwrap().is_empty());
    }

    #[test]
    fn test_inference_failure_propagates() {
        let img = RgbImage::new(100, 100);
        let set: CandidateSet = vec![cand(10.0, 10.0, 40.0, 40.0, 0.9)].into_iter().collect();
        assert!(refine(&img, set.clone(), &Failing, 0.7).is_err());
        assert!(finalize(&img, set, &Failing, 0.7).is_err());
    }

    #[test]
    fn test_finalize_min_mode_removes_nested_duplicate() {
        let img = RgbImage::new(200, 200);
        let set: CandidateSet = vec![
            cand(20.0, 20.0, 100.0, 100.0, 0.9),
            cand(40.0, 40.0, 50.0, 50.0, 0.9),
        ]
        .into_iter()
        .collect();
        let offsets = [0.3, 0.7, 0.5, 0.35, 0.65, 0.4, 0.4, 0.55, 0.75, 0.75];
        let net = Constant { score: 0.99, deltas: [0.0; 4], landmarks: Some(offsets) };
        let faces = finalize(&img, set, &net, 0.7).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox { x: 20, y: 20, w: 100, h: 100 });
        assert_eq!(faces[0].landmarks[0].position, Position { x: 50, y: 60 });
        assert_eq!(faces[0].landmarks.len(), 5);
    }

    #[test]
    fn test_proposals_from_single_cell() {
        let img = RgbImage::new(24, 24);
        let scales = [PyramidScale { scale: 1.0, width: 24, height: 24 }];
        // 24x24 input -> 7x7 grid; only cell (2, 3) fires.
        let net = |input: ArrayView4<'_, f32>| -> Result<NetOutput, InferenceError> {
            assert_eq!(input.dim(), (1, 3, 24, 24));
            let mut probabilities = Array4::zeros((1, 2, 7, 7));
            probabilities[[0, 1, 2, 3]] = 0.95;
            let mut regressions = Array4::zeros((1, 4, 7, 7));
            regressions[[0, 3, 2, 3]] = 0.5;
            Ok(NetOutput { probabilities, regressions, landmarks: None })
        };
        let set = collect_proposals(&img, &scales, &net, 0.6, true).unwrap();
        assert_eq!(set.len(), 1);
        let c = set.iter().next().unwrap();
        // Cell box (7, 5)-(18, 16), y2 regressed by 0.5 * 11 to 21.5, squared
        // to side 16.5 around the center, then truncated.
        assert_eq!(c.rect, Rect::new(4.0, 5.0, 20.0, 21.0));
        assert!(c.score >= 0.6);
    }

    #[test]
    fn test_proposals_stay_square_across_left_border() {
        let img = RgbImage::new(24, 24);
        let scales = [PyramidScale { scale: 1.0, width: 24, height: 24 }];
        let net = |_: ArrayView4<'_, f32>| -> Result<NetOutput, InferenceError> {
            let mut probabilities = Array4::zeros((1, 2, 7, 7));
            probabilities[[0, 1, 0, 0]] = 0.95;
            let mut regressions = Array4::zeros((1, 4, 7, 7));
            regressions[[0, 3, 0, 0]] = 0.5;
            Ok(NetOutput { probabilities, regressions, landmarks: None })
        };
        let set = collect_proposals(&img, &scales, &net, 0.6, false).unwrap();
        assert_eq!(set.len(), 1);
        // (1, 1)-(12, 17.5) squares to side 16.5 starting at x = -1.75.
        let rect = set.iter().next().unwrap().rect;
        assert_eq!(rect, Rect::new(-1.0, 1.0, 15.0, 17.0));
        assert_eq!(rect.width(), rect.height());
    }
}
