//! Detection results as they are handed to callers and serialized.
//!
//! Boxes and landmarks are whole pixels in original-image coordinates; the
//! JSON shape is `{bbox, confidence, landmarks: [{type, position}]}`.

use serde::{Deserialize, Serialize};

/// Bounding box of a detected face, in integer original-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.w as f32 / 2.0,
            self.y as f32 + self.h as f32 / 2.0,
        )
    }
}

/// The five facial landmarks, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LandmarkType {
    LeftEye,
    RightEye,
    Nose,
    MouthLeft,
    MouthRight,
}

impl LandmarkType {
    pub const ALL: [LandmarkType; 5] = [
        LandmarkType::LeftEye,
        LandmarkType::RightEye,
        LandmarkType::Nose,
        LandmarkType::MouthLeft,
        LandmarkType::MouthRight,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Landmark {
    #[serde(rename = "type")]
    pub kind: LandmarkType,
    pub position: Position,
}

/// A detected face: box, output-stage confidence and five landmarks.
///
/// Serializes as
/// `{"bbox":{"x","y","w","h"},"confidence","landmarks":[{"type","position":{"x","y"}}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Always ordered as [`LandmarkType::ALL`].
    pub landmarks: [Landmark; 5],
}

impl FaceAnnotation {
    /// Landmark positions as float points, in [`LandmarkType::ALL`] order.
    pub fn landmark_points(&self) -> [(f32, f32); 5] {
        std::array::from_fn(|i| {
            let p = self.landmarks[i].position;
            (p.x as f32, p.y as f32)
        })
    }

    /// Mean of the five landmark positions.
    pub fn landmark_centroid(&self) -> (f32, f32) {
        let (sx, sy) = self
            .landmark_points()
            .iter()
            .fold((0.0f32, 0.0f32), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / 5.0, sy / 5.0)
    }
}
