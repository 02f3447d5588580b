//! Document units and rectangle helpers

/// Twips per device pixel at scale 1.0.
pub const TWIPS_PER_PX: f32 = 15.0;

/// Convert a device pixel length at `scale` into twips.
pub fn pixel_to_twip(px: f32, scale: f32) -> f32 {
    px / scale * TWIPS_PER_PX
}

/// Convert a twip length into device pixels at `scale`.
pub fn twip_to_pixel(twips: f32, scale: f32) -> f32 {
    twips / TWIPS_PER_PX * scale
}

/// A rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn offset(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Intersection with `other`, or `None` when they do not overlap.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        let rect = PixelRect::new(x, y, right - x, bottom - y);
        (!rect.is_empty()).then_some(rect)
    }
}

/// A rectangle in twips, the document coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TwipRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl TwipRect {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

impl From<TwipRect> for PixelRect {
    fn from(rect: TwipRect) -> Self {
        PixelRect::new(
            rect.x as f32,
            rect.y as f32,
            rect.width as f32,
            rect.height as f32,
        )
    }
}

/// Span of whole tiles covering a rectangle, as half-open column/row bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub column_start: usize,
    pub column_end: usize,
    pub row_start: usize,
    pub row_end: usize,
}

impl TileSpan {
    /// Tiles of edge `tile_size` (in the same unit as `target`) enclosing the
    /// part of `target` that lies inside a `container_width` x
    /// `container_height` surface anchored at the origin.
    pub fn enclosing(
        target: &PixelRect,
        container_width: f32,
        container_height: f32,
        tile_size: f32,
    ) -> Option<TileSpan> {
        let container = PixelRect::new(0.0, 0.0, container_width, container_height);
        let visible = target.intersect(&container)?;

        Some(TileSpan {
            column_start: (visible.x / tile_size).floor() as usize,
            column_end: (visible.right() / tile_size).ceil() as usize,
            row_start: (visible.y / tile_size).floor() as usize,
            row_end: (visible.bottom() / tile_size).ceil() as usize,
        })
    }

    pub fn columns(&self) -> usize {
        self.column_end - self.column_start
    }

    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twip_conversion_round_trip() {
        let twips = pixel_to_twip(256.0, 2.0);
        assert_eq!(twips, 1920.0);
        assert_eq!(twip_to_pixel(twips, 2.0), 256.0);
    }

    #[test]
    fn test_intersect() {
        let a = PixelRect::new(0.0, 0.0, 100.0, 100.0);
        let b = PixelRect::new(50.0, 80.0, 100.0, 100.0);
        assert_eq!(a.intersect(&b), Some(PixelRect::new(50.0, 80.0, 50.0, 20.0)));

        let far = PixelRect::new(200.0, 200.0, 10.0, 10.0);
        assert_eq!(a.intersect(&far), None);
    }

    #[test]
    fn test_enclosing_span_clamps_to_container() {
        let span = TileSpan::enclosing(
            &PixelRect::new(10.0, 300.0, 1000.0, 100.0),
            512.0,
            1024.0,
            256.0,
        )
        .unwrap();

        assert_eq!(span.column_start, 0);
        assert_eq!(span.column_end, 2);
        assert_eq!(span.row_start, 1);
        assert_eq!(span.row_end, 2);
        assert_eq!(span.columns(), 2);
        assert_eq!(span.rows(), 1);
    }

    #[test]
    fn test_enclosing_span_outside_container() {
        let span = TileSpan::enclosing(
            &PixelRect::new(0.0, 2000.0, 100.0, 100.0),
            512.0,
            1024.0,
            256.0,
        );
        assert!(span.is_none());
    }
}
