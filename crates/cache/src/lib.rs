//! Doctile Cache Library
//!
//! Direct-mapped tile cache for rendered document views: a fixed pixel pool,
//! lock-free validity tracking, range bookkeeping and viewport compositing.

pub mod bitset;
pub mod cancel;
pub mod config;
pub mod geometry;
pub mod range;
pub mod raster;
pub mod snapshot;
pub mod tile_buffer;

pub use bitset::AtomicBitset;
pub use cancel::CancelFlag;
pub use config::{
    ConfigError, TileBufferConfig, BYTES_PER_PIXEL, DEFAULT_POOL_BUDGET_BYTES,
    DEFAULT_TILE_SIZE_PX,
};
pub use geometry::{pixel_to_twip, twip_to_pixel, PixelRect, TileSpan, TwipRect, TWIPS_PER_PX};
pub use range::{clip_ranges, simplify_ranges, tile_count, TileRange};
pub use raster::{CanvasSink, Document, ImageCanvas, Rasterizer, TileImage};
pub use snapshot::Snapshot;
pub use tile_buffer::{RowLimit, TileBuffer, NO_CONTEXT, SCALE_EPSILON};
