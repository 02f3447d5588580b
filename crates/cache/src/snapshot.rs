//! Immutable composed images of a viewport

use std::sync::Arc;

use image::RgbaImage;

/// A composed image of a block of tiles, detached from the pool.
///
/// Produced by [`TileBuffer::make_snapshot`](crate::TileBuffer::make_snapshot)
/// only when every tile in the block was resident. Consumers can keep it
/// around as a fallback while the pool is repainted.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Composed pixels; the top-left corner is tile (`column_start`, `row_start`)
    pub image: Arc<RgbaImage>,

    /// Scale the tiles were rendered at
    pub scale: f32,

    pub column_start: usize,
    pub column_end: usize,
    pub row_start: usize,
    pub row_end: usize,

    /// Vertical scroll position at capture time, in device pixels
    pub scroll_y: f32,
}

impl Snapshot {
    /// Number of tiles composed into the image.
    pub fn tile_count(&self) -> usize {
        (self.column_end - self.column_start) * (self.row_end - self.row_start)
    }
}
