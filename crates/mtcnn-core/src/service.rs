//! Detection facade that loads images and remembers the last one.
//!
//! [`Mtcnn`] itself is stateless. `FaceService` adds the conveniences a
//! caller usually wants on top: decoding from a path or bytes, treating an
//! unreadable image as "no faces", and aligning against the image that was
//! most recently detected on.

use crate::alignment::{self, AlignOptions};
use crate::detector::{DetectorError, Mtcnn};
use crate::types::FaceAnnotation;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Where an image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    /// Encoded file contents (JPEG, PNG, ...).
    Bytes(Vec<u8>),
    Image(RgbImage),
}

impl ImageSource {
    pub fn decode(self) -> Result<RgbImage, image::ImageError> {
        match self {
            ImageSource::Path(path) => Ok(image::open(path)?.to_rgb8()),
            ImageSource::Bytes(bytes) => Ok(image::load_from_memory(&bytes)?.to_rgb8()),
            ImageSource::Image(image) => Ok(image),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl From<RgbImage> for ImageSource {
    fn from(image: RgbImage) -> Self {
        ImageSource::Image(image)
    }
}

pub struct FaceService {
    detector: Mtcnn,
    last_image: Mutex<Option<Arc<RgbImage>>>,
}

impl FaceService {
    pub fn new(detector: Mtcnn) -> Self {
        Self {
            detector,
            last_image: Mutex::new(None),
        }
    }

    pub fn detector(&self) -> &Mtcnn {
        &self.detector
    }

    /// Decode `source` and detect faces in it.
    ///
    /// An image that cannot be read or decoded yields an empty result, not an
    /// error. Inference failures are still errors.
    pub fn face_detection(
        &self,
        source: impl Into<ImageSource>,
    ) -> Result<Vec<FaceAnnotation>, DetectorError> {
        let image = match source.into().decode() {
            Ok(image) => Arc::new(image),
            Err(err) => {
                tracing::warn!(error = %err, "could not decode image, reporting no faces");
                return Ok(Vec::new());
            }
        };

        *self.lock_last_image() = Some(Arc::clone(&image));
        self.detector.detect(&image)
    }

    /// Crop the given faces. Without an explicit image, the one most recently
    /// passed to [`face_detection`](Self::face_detection) is used.
    pub fn face_alignment(
        &self,
        image: Option<&RgbImage>,
        faces: &[FaceAnnotation],
        options: &AlignOptions,
    ) -> Result<Vec<RgbImage>, DetectorError> {
        match image {
            Some(image) => Ok(alignment::align_faces(image, faces, options)),
            None => {
                let last = self.last_image().ok_or(DetectorError::NoImage)?;
                Ok(alignment::align_faces(&last, faces, options))
            }
        }
    }

    /// The image most recently decoded by [`face_detection`](Self::face_detection).
    pub fn last_image(&self) -> Option<Arc<RgbImage>> {
        self.lock_last_image().clone()
    }

    fn lock_last_image(&self) -> std::sync::MutexGuard<'_, Option<Arc<RgbImage>>> {
        // The slot holds a plain value; a panic elsewhere cannot leave it torn.
        self.last_image.lock().unwrap_or_else(|e| e.into_inner())
    }
}
