//! Face alignment.
//!
//! Two flavours: a margin crop around each detection (optionally centered on
//! the landmark centroid) resized to a square, and a 4-DOF similarity warp
//! that moves the five landmarks onto a canonical template.

use crate::types::FaceAnnotation;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use serde::{Deserialize, Serialize};

/// Canonical five-point template for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// Parameters for [`align_faces`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignOptions {
    /// Pixels added on each side of the bounding box before cropping.
    pub margin: u32,
    /// Side of the square output crop.
    pub output_size: u32,
    /// Center the crop on the landmark centroid instead of the box center.
    pub center_on_landmarks: bool,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            margin: 44,
            output_size: 160,
            center_on_landmarks: false,
        }
    }
}

/// Pixel region of the source image that a face crop is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Region covered by `face` grown by `margin` on each side, clamped to the
/// image. Returns `None` if nothing of it lies inside the image.
pub fn crop_region(
    face: &FaceAnnotation,
    width: u32,
    height: u32,
    margin: u32,
    center_on_landmarks: bool,
) -> Option<CropRegion> {
    let bbox = &face.bbox;
    let half_w = bbox.w as f32 / 2.0 + margin as f32;
    let half_h = bbox.h as f32 / 2.0 + margin as f32;
    let (cx, cy) = if center_on_landmarks {
        face.landmark_centroid()
    } else {
        bbox.center()
    };

    let x1 = (cx - half_w).floor().max(0.0);
    let y1 = (cy - half_h).floor().max(0.0);
    let x2 = (cx + half_w).ceil().min(width as f32);
    let y2 = (cy + half_h).ceil().min(height as f32);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(CropRegion {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    })
}

/// Cut one `output_size`² crop per face, in input order.
///
/// Crops are clamped to the image rather than padded, so faces near a border
/// get a tighter crop stretched to the output size. A face lying entirely
/// outside the image yields a black crop.
pub fn align_faces(
    image: &RgbImage,
    faces: &[FaceAnnotation],
    options: &AlignOptions,
) -> Vec<RgbImage> {
    let (width, height) = image.dimensions();
    let size = options.output_size;

    faces
        .iter()
        .map(|face| {
            match crop_region(face, width, height, options.margin, options.center_on_landmarks) {
                Some(r) => {
                    let crop = imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image();
                    imageops::resize(&crop, size, size, FilterType::Triangle)
                }
                None => {
                    tracing::warn!(bbox = ?face.bbox, "face lies outside the image, emitting blank crop");
                    RgbImage::new(size, size)
                }
            }
        })
        .collect()
}

/// Warp a face so its landmarks land on the canonical template, scaled to an
/// `output_size`² image. Pixels mapped from outside the source are black.
pub fn align_to_template(image: &RgbImage, face: &FaceAnnotation, output_size: u32) -> RgbImage {
    let k = output_size as f32 / REFERENCE_SIZE;
    let template = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * k, y * k));

    let mut aligned = RgbImage::new(output_size, output_size);
    let projection = Similarity::fit(&face.landmark_points(), &template)
        .and_then(|s| Projection::from_matrix(s.matrix()));
    match projection {
        Some(p) => warp_into(image, &p, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut aligned),
        None => tracing::warn!(bbox = ?face.bbox, "degenerate landmarks, emitting blank crop"),
    }
    aligned
}

/// `(x, y) -> (a·x - b·y + tx, b·x + a·y + ty)`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit taking `src` onto `dst`. `None` when the
    /// source points all coincide.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < f32::EPSILON {
            return None;
        }

        let (a, b) = (dot / norm, cross / norm);
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    /// Row-major homogeneous 3×3 form.
    fn matrix(&self) -> [f32; 9] {
        [self.a, -self.b, self.tx, self.b, self.a, self.ty, 0.0, 0.0, 1.0]
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / points.len() as f32, sy / points.len() as f32)
}
