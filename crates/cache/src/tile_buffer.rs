//! Bounded, direct-mapped tile cache
//!
//! The document surface is cut into a grid of square tiles. Tile `i` lives at
//! `row * columns + column`; its pixels can only be cached in pool slot
//! `i % pool_size`, so at most one tile per residue class is resident and
//! caching a tile evicts whatever held its slot before.
//!
//! Validity is tracked separately in an [`AtomicBitset`]: a tile can be
//! invalidated by an edit while its stale pixels still sit in the pool, and it
//! only becomes valid again right after a render into its own slot.
//!
//! Each slot carries an atomic occupant tag for lock-free residency checks, a
//! mutex over its pixel buffer that serializes renders into that slot, and an
//! image handle tagged with the tile it was rendered for. Geometry changes
//! bump a generation counter; a render that started against an older
//! generation is discarded instead of published.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use image::RgbaImage;
use tracing::{debug, error, trace};

use crate::bitset::AtomicBitset;
use crate::cancel::CancelFlag;
use crate::config::TileBufferConfig;
use crate::geometry::{pixel_to_twip, twip_to_pixel, PixelRect, TileSpan, TwipRect};
use crate::range::{push_index, simplify_ranges, TileRange};
use crate::raster::{CanvasSink, Document, TileImage};
use crate::snapshot::Snapshot;

/// Scales closer than this are treated as equal.
pub const SCALE_EPSILON: f32 = 0.001;

/// Active context value meaning "no paint generation".
pub const NO_CONTEXT: u64 = 0;

const EMPTY_SLOT: usize = usize::MAX;

/// A band of tile rows, `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLimit {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
struct Geometry {
    width_twips: i64,
    height_twips: i64,
    scale: f32,
    width_px: f32,
    height_px: f32,
    columns: usize,
    rows: usize,
    generation: u64,
    valid: Arc<AtomicBitset>,
}

impl Geometry {
    fn empty() -> Self {
        Self {
            width_twips: 0,
            height_twips: 0,
            scale: 1.0,
            width_px: 0.0,
            height_px: 0.0,
            columns: 0,
            rows: 0,
            generation: 0,
            valid: Arc::new(AtomicBitset::new(1)),
        }
    }

    fn tile_count(&self) -> usize {
        self.columns * self.rows
    }

    fn is_empty(&self) -> bool {
        self.columns == 0 || self.rows == 0
    }

    fn coord_to_index(&self, column: usize, row: usize) -> usize {
        row * self.columns + column
    }

    fn index_to_coord(&self, index: usize) -> (usize, usize) {
        (index % self.columns, index / self.columns)
    }

    /// Index range covering `span`, clamped to the grid.
    fn span_to_range(&self, span: &TileSpan) -> TileRange {
        let last_column = self.columns - 1;
        let last_row = self.rows - 1;
        let start = self.coord_to_index(
            span.column_start.min(last_column),
            span.row_start.min(last_row),
        );
        let end = self.coord_to_index(
            span.column_end.saturating_sub(1).min(last_column),
            span.row_end.saturating_sub(1).min(last_row),
        );
        TileRange::new(start, end.max(start))
    }

    /// Pixel span covering `rect`, clamped to the grid.
    fn pixel_span(&self, rect: &PixelRect, tile_size: f32) -> Option<TileSpan> {
        if self.is_empty() {
            return None;
        }
        let span = TileSpan::enclosing(rect, self.width_px, self.height_px, tile_size)?;
        Some(TileSpan {
            column_start: span.column_start.min(self.columns),
            column_end: span.column_end.min(self.columns),
            row_start: span.row_start.min(self.rows),
            row_end: span.row_end.min(self.rows),
        })
    }
}

struct PoolSlot {
    occupant: AtomicUsize,
    pixels: Mutex<Vec<u8>>,
    image: RwLock<Option<(usize, TileImage)>>,
}

impl PoolSlot {
    fn new(stride: usize) -> Self {
        Self {
            occupant: AtomicUsize::new(EMPTY_SLOT),
            pixels: Mutex::new(vec![0; stride]),
            image: RwLock::new(None),
        }
    }

    fn holds(&self, tile_index: usize) -> bool {
        self.occupant.load(Ordering::Acquire) == tile_index
    }
}

/// Tile cache for one document view.
///
/// Shared between the scheduling thread and render workers behind an `Arc`;
/// every method takes `&self`.
///
/// # Example
///
/// ```
/// use doctile_cache::{CancelFlag, Document, Rasterizer, TileBuffer, TileBufferConfig, TwipRect};
///
/// struct White;
/// impl Rasterizer for White {
///     fn render(&self, buffer: &mut [u8], _w: u32, _h: u32, _area: TwipRect) {
///         buffer.fill(0xff);
///     }
/// }
///
/// let config = TileBufferConfig::default()
///     .with_tile_size(64)
///     .with_pool_budget_bytes(64 * 64 * 4 * 32);
/// let buffer = TileBuffer::new(&config);
///
/// // 20 x 10 tiles at scale 1.0 (64 px tiles, 15 twips per pixel)
/// buffer.resize_with_scale(64 * 15 * 20, 64 * 15 * 10, 1.0);
/// assert_eq!(buffer.tile_count(), 200);
///
/// let document = Document::new(White);
/// assert!(buffer.paint_tile(&CancelFlag::new(), &document, 5));
/// assert!(buffer.is_tile_valid(5));
/// ```
pub struct TileBuffer {
    tile_size: u32,
    slots: Box<[PoolSlot]>,
    geometry: RwLock<Geometry>,
    active_context: AtomicU64,
    y_position: AtomicU32,
}

impl TileBuffer {
    /// Create a tile buffer and allocate its whole pixel pool.
    ///
    /// The pool is never resized afterwards.
    pub fn new(config: &TileBufferConfig) -> Self {
        assert!(config.tile_size_px > 0, "tile size must be positive");
        let stride = config.tile_stride();
        let slots = (0..config.pool_slots())
            .map(|_| PoolSlot::new(stride))
            .collect();

        Self {
            tile_size: config.tile_size_px,
            slots,
            geometry: RwLock::new(Geometry::empty()),
            active_context: AtomicU64::new(NO_CONTEXT),
            y_position: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// Tile edge length in device pixels.
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Number of pool slots.
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    pub fn columns(&self) -> usize {
        self.read_geometry().columns
    }

    pub fn rows(&self) -> usize {
        self.read_geometry().rows
    }

    pub fn tile_count(&self) -> usize {
        self.read_geometry().tile_count()
    }

    pub fn scale(&self) -> f32 {
        self.read_geometry().scale
    }

    /// Document size in twips as `(width, height)`.
    pub fn document_size_twips(&self) -> (i64, i64) {
        let geometry = self.read_geometry();
        (geometry.width_twips, geometry.height_twips)
    }

    /// Scaled document size in device pixels as `(width, height)`.
    pub fn document_size_px(&self) -> (f32, f32) {
        let geometry = self.read_geometry();
        (geometry.width_px, geometry.height_px)
    }

    /// True while the grid has no rows or no columns.
    pub fn is_empty(&self) -> bool {
        self.read_geometry().is_empty()
    }

    pub fn y_position(&self) -> f32 {
        f32::from_bits(self.y_position.load(Ordering::Relaxed))
    }

    /// Set the vertical scroll offset applied by canvas painting and snapshots.
    pub fn set_y_position(&self, y: f32) {
        self.y_position.store(y.to_bits(), Ordering::Relaxed);
    }

    pub fn active_context(&self) -> u64 {
        self.active_context.load(Ordering::Acquire)
    }

    /// Record the paint generation whose work may publish tiles.
    pub fn set_active_context(&self, context: u64) {
        self.active_context.store(context, Ordering::Release);
    }

    /// Resize the grid for a new document size, keeping the current scale.
    ///
    /// No-op when the size is unchanged.
    pub fn resize(&self, width_twips: i64, height_twips: i64) {
        let (scale, unchanged) = {
            let geometry = self.read_geometry();
            (
                geometry.scale,
                geometry.width_twips == width_twips && geometry.height_twips == height_twips,
            )
        };
        if !unchanged {
            self.rebuild(width_twips, height_twips, scale);
        }
    }

    /// Resize the grid for a new document size and scale.
    ///
    /// Reallocates the validity bitset (all tiles invalid) and empties every
    /// pool slot. Pool memory is kept. An unchanged scale falls through to
    /// [`resize`](Self::resize).
    pub fn resize_with_scale(&self, width_twips: i64, height_twips: i64, scale: f32) {
        if (self.scale() - scale).abs() <= SCALE_EPSILON {
            self.resize(width_twips, height_twips);
        } else {
            self.rebuild(width_twips, height_twips, scale);
        }
    }

    /// Re-grid at a new scale and forget the active paint generation.
    pub fn reset_scale(&self, scale: f32) {
        let (width_twips, height_twips, current) = {
            let geometry = self.read_geometry();
            (geometry.width_twips, geometry.height_twips, geometry.scale)
        };
        if (scale - current).abs() > SCALE_EPSILON {
            self.rebuild(width_twips, height_twips, scale);
            self.set_active_context(NO_CONTEXT);
        }
    }

    fn rebuild(&self, width_twips: i64, height_twips: i64, scale: f32) {
        let mut geometry = self.geometry.write().unwrap_or_else(PoisonError::into_inner);
        let tile_size = self.tile_size as f64;

        let width_px = twip_to_pixel(width_twips as f32, scale);
        let height_px = twip_to_pixel(height_twips as f32, scale);
        let columns = (width_px.max(0.0) as f64 / tile_size).ceil() as usize;
        let rows = (height_px.max(0.0) as f64 / tile_size).ceil() as usize;

        *geometry = Geometry {
            width_twips,
            height_twips,
            scale,
            width_px,
            height_px,
            columns,
            rows,
            generation: geometry.generation + 1,
            // one trailing sentinel bit
            valid: Arc::new(AtomicBitset::new(columns * rows + 1)),
        };

        for slot in self.slots.iter() {
            slot.occupant.store(EMPTY_SLOT, Ordering::Release);
        }

        debug!(
            width_twips,
            height_twips,
            scale,
            columns,
            rows,
            generation = geometry.generation,
            "tile grid resized"
        );
    }

    /// Whether the tile's validity bit is set.
    pub fn is_tile_valid(&self, tile_index: usize) -> bool {
        let geometry = self.read_geometry();
        tile_index < geometry.tile_count() && geometry.valid.is_set(tile_index)
    }

    /// Whether the tile's pool slot currently holds exactly this tile.
    pub fn is_resident(&self, tile_index: usize) -> bool {
        self.slot_for(tile_index).holds(tile_index)
    }

    /// Image of a resident tile.
    pub fn tile_image(&self, tile_index: usize) -> Option<TileImage> {
        let slot = self.slot_for(tile_index);
        if !slot.holds(tile_index) {
            return None;
        }
        match &*slot.image.read().unwrap_or_else(PoisonError::into_inner) {
            Some((tagged, image)) if *tagged == tile_index => Some(image.clone()),
            _ => None,
        }
    }

    /// Clear one tile's validity bit. The slot keeps its pixels.
    pub fn invalidate_tile(&self, tile_index: usize) {
        self.read_geometry().valid.reset(tile_index);
    }

    /// Clear the validity bit of the tile at (`column`, `row`).
    pub fn invalidate_tile_at(&self, column: usize, row: usize) {
        let geometry = self.read_geometry();
        assert!(
            column < geometry.columns && row < geometry.rows,
            "tile ({column}, {row}) outside {}x{} grid",
            geometry.columns,
            geometry.rows
        );
        geometry.valid.reset(geometry.coord_to_index(column, row));
    }

    /// Tile range covering a pixel rect, without touching validity.
    pub fn tile_range_in_rect(&self, rect: &PixelRect) -> Option<TileRange> {
        let geometry = self.read_geometry();
        let span = geometry.pixel_span(rect, self.tile_size as f32)?;
        Some(geometry.span_to_range(&span))
    }

    /// Invalidate every tile covering a pixel rect and return their range.
    ///
    /// Returns `None` when the rect misses the document surface.
    pub fn invalidate_tiles_in_rect(&self, rect: &PixelRect) -> Option<TileRange> {
        let geometry = self.read_geometry();
        let span = geometry.pixel_span(rect, self.tile_size as f32)?;
        let range = geometry.span_to_range(&span);
        geometry.valid.reset_range(range.start, range.end);
        Some(range)
    }

    /// Invalidate every tile covering a rect in document twips.
    pub fn invalidate_tiles_in_twip_rect(&self, rect: &TwipRect) -> Option<TileRange> {
        let geometry = self.read_geometry();
        if geometry.is_empty() {
            return None;
        }
        let tile_twips = pixel_to_twip(self.tile_size as f32, geometry.scale);
        let span = TileSpan::enclosing(
            &PixelRect::from(*rect),
            geometry.width_twips as f32,
            geometry.height_twips as f32,
            tile_twips,
        )?;
        let range = geometry.span_to_range(&span);
        geometry.valid.reset_range(range.start, range.end);
        Some(range)
    }

    /// Mark every tile stale. Pool slots are untouched.
    pub fn invalidate_all_tiles(&self) {
        self.set_active_context(NO_CONTEXT);
        self.read_geometry().valid.clear();
    }

    /// Render one tile into its pool slot under the active paint context.
    ///
    /// See [`paint_tile_in_context`](Self::paint_tile_in_context).
    pub fn paint_tile(&self, cancel: &CancelFlag, document: &Document, tile_index: usize) -> bool {
        self.paint_tile_in_context(cancel, document, tile_index, self.active_context())
    }

    /// Render one tile into its pool slot.
    ///
    /// Evicts a different tile occupying the slot, then rasterizes unless the
    /// tile is already valid and resident. Work tagged with a stale `context`,
    /// an index beyond the current grid, and cancelled work are all skipped.
    /// Returns whether a render was published.
    pub fn paint_tile_in_context(
        &self,
        cancel: &CancelFlag,
        document: &Document,
        tile_index: usize,
        context: u64,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.active_context() != context {
            trace!(tile_index, context, "skipping tile from a retired paint context");
            return false;
        }

        let geometry = self.read_geometry().clone();
        let tile_count = geometry.tile_count();
        if tile_index >= tile_count {
            error!(
                tile_index,
                tile_count,
                context,
                "invalid tile index, the grid changed under an in-flight paint"
            );
            return false;
        }

        let slot = self.slot_for(tile_index);
        let mut pixels = slot.pixels.lock().unwrap_or_else(PoisonError::into_inner);

        let occupant = slot.occupant.load(Ordering::Acquire);
        if occupant != tile_index {
            if occupant != EMPTY_SLOT && occupant < geometry.valid.len() {
                geometry.valid.reset(occupant);
                trace!(evicted = occupant, tile_index, "pool slot evicted");
            }
            slot.occupant.store(EMPTY_SLOT, Ordering::Release);
        }

        if cancel.is_cancelled() {
            return false;
        }
        if geometry.valid.is_set(tile_index) && slot.holds(tile_index) {
            return false;
        }

        let (column, row) = geometry.index_to_coord(tile_index);
        let edge = self.tile_size;
        let edge_twips = pixel_to_twip(edge as f32, geometry.scale);
        let area = TwipRect::new(
            pixel_to_twip((edge as usize * column) as f32, geometry.scale).round() as i64,
            pixel_to_twip((edge as usize * row) as f32, geometry.scale).round() as i64,
            edge_twips.round() as i64,
            edge_twips.round() as i64,
        );

        pixels.fill(0);
        document.render(&mut pixels, edge, edge, area);

        let Some(image) = RgbaImage::from_raw(edge, edge, pixels.clone()) else {
            error!(tile_index, "pool buffer does not hold a full tile");
            return false;
        };

        let current = self.read_geometry();
        if current.generation != geometry.generation || self.active_context() != context {
            debug!(tile_index, "discarding tile rendered against a retired geometry");
            return false;
        }

        *slot.image.write().unwrap_or_else(PoisonError::into_inner) =
            Some((tile_index, Arc::new(image)));
        slot.occupant.store(tile_index, Ordering::Release);
        current.valid.set(tile_index);

        trace!(tile_index, column, row, "tile rendered");
        true
    }

    /// Indices in `ranges` that still need a render: invalid, or valid but no
    /// longer resident. Returned simplified.
    pub fn invalid_ranges_remaining(&self, ranges: &[TileRange]) -> Vec<TileRange> {
        let geometry = self.read_geometry();
        let tile_count = geometry.tile_count();
        let mut remaining = Vec::new();

        for range in ranges {
            for index in range.iter().take_while(|&index| index < tile_count) {
                if !geometry.valid.is_set(index) || !self.is_resident(index) {
                    push_index(&mut remaining, index);
                }
            }
        }

        simplify_ranges(&remaining)
    }

    /// Rows covered by a vertical window starting at `y_pos` (device pixels).
    pub fn limit_range(&self, y_pos: i32, view_height: u32) -> RowLimit {
        let tile_size = self.tile_size as f64;
        let start = if y_pos < 0 {
            0
        } else {
            (y_pos as f64 / tile_size).floor() as usize
        };
        let end = start + (view_height as f64 / tile_size).ceil() as usize;
        RowLimit {
            start,
            end: end.max(start),
        }
    }

    /// Tile indices spanning all columns of the rows a vertical window covers.
    pub fn limit_index(&self, y_pos: i32, view_height: u32) -> Option<TileRange> {
        let rows = self.limit_range(y_pos, view_height);
        let geometry = self.read_geometry();
        if geometry.is_empty() {
            return None;
        }
        let last_row = geometry.rows - 1;
        let start = geometry.coord_to_index(0, rows.start.min(last_row));
        let end = geometry.coord_to_index(geometry.columns - 1, rows.end.min(last_row));
        Some(TileRange::new(start, end))
    }

    /// Prefetch band for a scroll to `next_y_pos`: one viewport above through
    /// two viewports below.
    pub fn next_scroll_tile_range(&self, next_y_pos: i32, view_height: u32) -> Option<TileRange> {
        let from = next_y_pos.saturating_sub(view_height as i32).max(0);
        let rows = self.limit_range(from, view_height.saturating_mul(3));
        let geometry = self.read_geometry();
        if geometry.is_empty() {
            return None;
        }
        let last_row = geometry.rows - 1;
        let start = rows.start.min(last_row) * geometry.columns;
        let end = rows.end.min(last_row) * geometry.columns + geometry.columns - 1;
        Some(TileRange::new(start, end))
    }

    /// Compose every tile under `rect` (view coordinates, shifted by the
    /// scroll position) into one image.
    ///
    /// Returns `None` if any tile is not resident or `cancel` is set.
    pub fn make_snapshot(&self, cancel: &CancelFlag, rect: &PixelRect) -> Option<Snapshot> {
        let y_pos = self.y_position();
        let (span, geometry) = {
            let geometry = self.read_geometry();
            let span = geometry.pixel_span(&rect.offset(0.0, y_pos), self.tile_size as f32)?;
            (span, geometry.clone())
        };

        let edge = self.tile_size;
        let mut composed = RgbaImage::new(
            span.columns() as u32 * edge,
            span.rows() as u32 * edge,
        );

        for row in span.row_start..span.row_end {
            for column in span.column_start..span.column_end {
                if cancel.is_cancelled() {
                    return None;
                }
                let tile_index = geometry.coord_to_index(column, row);
                let Some(tile) = self.tile_image(tile_index) else {
                    error!(tile_index, "snapshot requested over a non-resident tile");
                    return None;
                };
                image::imageops::replace(
                    &mut composed,
                    &*tile,
                    ((column - span.column_start) as u32 * edge) as i64,
                    ((row - span.row_start) as u32 * edge) as i64,
                );
            }
        }

        Some(Snapshot {
            image: Arc::new(composed),
            scale: geometry.scale,
            column_start: span.column_start,
            column_end: span.column_end,
            row_start: span.row_start,
            row_end: span.row_end,
            scroll_y: y_pos,
        })
    }

    /// Draw resident tiles under `rect` (view coordinates) onto `canvas`.
    ///
    /// Drawing stops at the first row containing a missing tile so a partial
    /// row never shows. If tiles are missing and `fallback` was taken at the
    /// current scale, the fallback snapshot is drawn instead. Returns the
    /// missing tile ranges.
    pub fn paint_to_canvas(
        &self,
        cancel: &CancelFlag,
        canvas: &mut dyn CanvasSink,
        rect: &PixelRect,
        fallback: Option<&Snapshot>,
    ) -> Vec<TileRange> {
        let y_pos = self.y_position();
        let (span, geometry) = {
            let geometry = self.read_geometry();
            match geometry.pixel_span(&rect.offset(0.0, y_pos), self.tile_size as f32) {
                Some(span) => (span, geometry.clone()),
                None => return Vec::new(),
            }
        };

        let mut missing = Vec::new();
        let mut first_missing_row = None;
        for row in span.row_start..span.row_end {
            for column in span.column_start..span.column_end {
                let tile_index = geometry.coord_to_index(column, row);
                if !self.is_resident(tile_index) {
                    push_index(&mut missing, tile_index);
                    first_missing_row.get_or_insert(row);
                }
            }
        }

        let edge = self.tile_size as i64;
        let scroll = y_pos.round() as i64;

        if !missing.is_empty() {
            let fallback =
                fallback.filter(|snapshot| (snapshot.scale - geometry.scale).abs() <= SCALE_EPSILON);
            if let Some(snapshot) = fallback {
                canvas.draw_image(
                    &snapshot.image,
                    snapshot.column_start as i64 * edge,
                    snapshot.row_start as i64 * edge - scroll,
                );
                return missing;
            }
        }

        let row_end = first_missing_row.unwrap_or(span.row_end);
        for row in span.row_start..row_end {
            for column in span.column_start..span.column_end {
                if cancel.is_cancelled() {
                    return missing;
                }
                let tile_index = geometry.coord_to_index(column, row);
                let Some(tile) = self.tile_image(tile_index) else {
                    push_index(&mut missing, tile_index);
                    return simplify_ranges(&missing);
                };
                canvas.draw_image(&tile, column as i64 * edge, row as i64 * edge - scroll);
            }
        }

        missing
    }

    fn slot_for(&self, tile_index: usize) -> &PoolSlot {
        &self.slots[tile_index % self.slots.len()]
    }

    fn read_geometry(&self) -> RwLockReadGuard<'_, Geometry> {
        self.geometry.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TileBuffer {
    /// A buffer with 256 px tiles and a 256 MiB pool
    fn default() -> Self {
        Self::new(&TileBufferConfig::default())
    }
}

impl fmt::Debug for TileBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let geometry = self.read_geometry();
        f.debug_struct("TileBuffer")
            .field("tile_size", &self.tile_size)
            .field("pool_size", &self.slots.len())
            .field("columns", &geometry.columns)
            .field("rows", &geometry.rows)
            .field("scale", &geometry.scale)
            .field("generation", &geometry.generation)
            .field("valid_tiles", &geometry.valid.count_set())
            .finish()
    }
}
