//! Image pyramid for the proposal stage.
//!
//! The proposal network has a 12×12 receptive field. The first scale maps the
//! minimum face size onto that field; every following scale shrinks by the
//! configured factor until the shorter image side drops below 12 pixels.

/// Receptive field of the proposal network, in pixels.
pub const PROPOSAL_RECEPTIVE_FIELD: f32 = 12.0;

/// One pyramid level: the scale factor and the resized image dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidScale {
    pub scale: f32,
    pub width: u32,
    pub height: u32,
}

/// Lazy, finite sequence of strictly decreasing scales.
#[derive(Debug, Clone)]
pub struct Pyramid {
    width: u32,
    height: u32,
    factor: f32,
    next_scale: f32,
}

impl Pyramid {
    pub fn new(width: u32, height: u32, min_face_size: f32, factor: f32) -> Self {
        Self {
            width,
            height,
            factor,
            next_scale: PROPOSAL_RECEPTIVE_FIELD / min_face_size,
        }
    }
}

impl Iterator for Pyramid {
    type Item = PyramidScale;

    fn next(&mut self) -> Option<PyramidScale> {
        let scale = self.next_scale;
        let min_side = self.width.min(self.height) as f32;
        if !scale.is_finite() || scale <= 0.0 || min_side * scale < PROPOSAL_RECEPTIVE_FIELD {
            return None;
        }

        // A factor outside (0, 1) would never terminate; stop after one level.
        self.next_scale = if self.factor > 0.0 && self.factor < 1.0 {
            scale * self.factor
        } else {
            0.0
        };

        Some(PyramidScale {
            scale,
            width: (self.width as f32 * scale).ceil() as u32,
            height: (self.height as f32 * scale).ceil() as u32,
        })
    }
}

impl std::iter::FusedIterator for Pyramid {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_scale_maps_min_face_to_receptive_field() {
        let first = Pyramid::new(250, 250, 20.0, 0.709).next().unwrap();
        assert!((first.scale - 0.6).abs() < 1e-6);
        assert_eq!((first.width, first.height), (150, 150));
    }

    #[test]
    fn test_scales_strictly_decreasing_and_useful() {
        for (w, h) in [(250, 250), (640, 480), (37, 900), (12, 12)] {
            let scales: Vec<_> = Pyramid::new(w, h, 20.0, 0.709).collect();
            for pair in scales.windows(2) {
                assert!(pair[1].scale < pair[0].scale);
            }
            for s in &scales {
                assert!(w.min(h) as f32 * s.scale >= PROPOSAL_RECEPTIVE_FIELD);
            }
        }
    }

    #[test]
    fn test_stops_before_receptive_field() {
        let scales: Vec<_> = Pyramid::new(200, 200, 20.0, 0.709).collect();
        // 0.6, 0.425, 0.302, 0.214, 0.152, 0.108, 0.076 -> 200 * 0.054 < 12
        assert_eq!(scales.len(), 7);
        let last = scales.last().unwrap();
        assert!(200.0 * last.scale * 0.709 < PROPOSAL_RECEPTIVE_FIELD);
    }

    #[test]
    fn test_small_image_yields_no_scales() {
        assert_eq!(Pyramid::new(10, 300, 12.0, 0.709).count(), 0);
        assert_eq!(Pyramid::new(100, 100, 120.0, 0.709).count(), 0);
    }

    #[test]
    fn test_resized_dimensions_round_up() {
        let scales: Vec<_> = Pyramid::new(101, 51, 24.0, 0.5).collect();
        assert_eq!(scales[0].scale, 0.5);
        assert_eq!((scales[0].width, scales[0].height), (51, 26));
        assert_eq!((scales[1].width, scales[1].height), (26, 13));
        assert_eq!(scales.len(), 2);
    }

    #[test]
    fn test_invalid_factor_terminates() {
        assert_eq!(Pyramid::new(500, 500, 20.0, 1.0).count(), 1);
        assert_eq!(Pyramid::new(500, 500, 0.0, 0.709).count(), 0);
    }
}
