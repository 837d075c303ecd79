//! Box geometry shared by the cascade stages.
//!
//! Boxes are float corner rectangles in original-image pixels. Overlap comes
//! in two flavours: `Union` (classic IoU) and `Min`, which divides by the
//! smaller area and therefore suppresses nested boxes more aggressively.

/// Axis-aligned box stored as corners `[x1, x2) × [y1, y2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Regression deltas relative to a box's own width and height.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Deltas {
    pub dx1: f32,
    pub dy1: f32,
    pub dx2: f32,
    pub dy2: f32,
}

impl Rect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Square of side `max(w, h)` sharing this box's center.
    pub fn square(&self) -> Rect {
        let w = self.width();
        let h = self.height();
        let side = w.max(h);
        let x1 = self.x1 + w * 0.5 - side * 0.5;
        let y1 = self.y1 + h * 0.5 - side * 0.5;
        Rect::new(x1, y1, x1 + side, y1 + side)
    }

    /// Apply regression deltas, each scaled by the current width or height.
    pub fn regress(&self, d: &Deltas) -> Rect {
        let w = self.width();
        let h = self.height();
        Rect::new(
            self.x1 + d.dx1 * w,
            self.y1 + d.dy1 * h,
            self.x2 + d.dx2 * w,
            self.y2 + d.dy2 * h,
        )
    }

    /// Drop the fractional part of every corner (rounds toward zero).
    pub fn trunc(&self) -> Rect {
        Rect::new(self.x1.trunc(), self.y1.trunc(), self.x2.trunc(), self.y2.trunc())
    }

    /// Truncate the origin and the size separately, so a square stays square.
    pub fn trunc_extent(&self) -> Rect {
        let (x1, y1) = (self.x1.trunc(), self.y1.trunc());
        Rect::new(x1, y1, x1 + self.width().trunc(), y1 + self.height().trunc())
    }

    /// Clamp all corners into `[0, width] × [0, height]`.
    pub fn clip(&self, width: f32, height: f32) -> Rect {
        Rect::new(
            self.x1.clamp(0.0, width),
            self.y1.clamp(0.0, height),
            self.x2.clamp(0.0, width),
            self.y2.clamp(0.0, height),
        )
    }
}

/// Denominator used when measuring overlap between two boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IouMode {
    /// `inter / (areaA + areaB - inter)`
    Union,
    /// `inter / min(areaA, areaB)`
    Min,
}

/// Overlap ratio of two boxes. Degenerate denominators yield 0.
pub fn iou(a: &Rect, b: &Rect, mode: IouMode) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = a.area();
    let area_b = b.area();

    let denom = match mode {
        IouMode::Union => area_a + area_b - inter_area,
        IouMode::Min => area_a.min(area_b),
    };

    if denom > 0.0 {
        inter_area / denom
    } else {
        0.0
    }
}

/// Anything NMS can rank and compare.
pub trait Scored {
    fn rect(&self) -> &Rect;
    fn score(&self) -> f32;
}

impl Scored for (Rect, f32) {
    fn rect(&self) -> &Rect {
        &self.0
    }

    fn score(&self) -> f32 {
        self.1
    }
}

/// Greedy non-maximum suppression.
///
/// Returns the indices of the kept items, best score first. Items are
/// visited by descending score; on equal scores the lower index wins. An item
/// is suppressed when its overlap with an already kept one exceeds
/// `threshold`.
pub fn nms<T: Scored>(items: &[T], threshold: f32, mode: IouMode) -> Vec<usize> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        items[b]
            .score()
            .partial_cmp(&items[a].score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; items.len()];

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[pos + 1..] {
            if suppressed[j] {
                continue;
            }
            if iou(items[i].rect(), items[j].rect(), mode) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Placement of a box crop relative to the image it is cut from.
///
/// The crop canvas is the full truncated box. Only the part inside the image
/// (`src_*`, `width` × `height`) is copied, at `dst_*` in the canvas; the rest
/// of the canvas stays black.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub dst_x: u32,
    pub dst_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the crop window of `rect` inside a `width` × `height` image.
///
/// Returns `None` when the truncated box is empty.
pub fn pad(rect: &Rect, width: u32, height: u32) -> Option<CropWindow> {
    let t = rect.trunc();
    let (x1, y1, x2, y2) = (t.x1 as i64, t.y1 as i64, t.x2 as i64, t.y2 as i64);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let sx1 = x1.clamp(0, width as i64);
    let sy1 = y1.clamp(0, height as i64);
    let sx2 = x2.clamp(0, width as i64);
    let sy2 = y2.clamp(0, height as i64);

    Some(CropWindow {
        canvas_width: (x2 - x1) as u32,
        canvas_height: (y2 - y1) as u32,
        src_x: sx1 as u32,
        src_y: sy1 as u32,
        dst_x: (sx1 - x1).max(0) as u32,
        dst_y: (sy1 - y1).max(0) as u32,
        width: (sx2 - sx1).max(0) as u32,
        height: (sy2 - sy1).max(0) as u32,
    })
}
