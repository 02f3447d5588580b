//! Collaborator contracts: the rasterizing engine and the compositing sink
//!
//! The tile cache never talks to a document engine directly. It asks a
//! [`Rasterizer`] to fill pixel buffers and hands finished tiles to a
//! [`CanvasSink`]. An engine session is passed around explicitly as a
//! reference-counted [`Document`] handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::RgbaImage;

use crate::geometry::TwipRect;

/// A decoded tile image, cheap to clone and share with compositors.
pub type TileImage = Arc<RgbaImage>;

/// An engine capable of rasterizing a sub-rectangle of a document.
///
/// Implementations must tolerate concurrent calls from several worker threads
/// for different sub-rectangles of the same document.
pub trait Rasterizer: Send + Sync {
    /// Fill `buffer` (`width * height` premultiplied 32-bit pixels, tightly
    /// packed) with the rendering of `area`, given in twips.
    fn render(&self, buffer: &mut [u8], width: u32, height: u32, area: TwipRect);
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Explicit handle to one initialized engine session.
///
/// Every `new`/`from_arc` call opens a new session with a process-unique id;
/// clones share it. Two handles are equal when they refer to the same session.
#[derive(Clone)]
pub struct Document {
    engine: Arc<dyn Rasterizer>,
    session: u64,
}

impl Document {
    pub fn new<R: Rasterizer + 'static>(engine: R) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<dyn Rasterizer>) -> Self {
        Self {
            engine,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Session identity, used to tag paint generations. Never reused.
    pub fn id(&self) -> u64 {
        self.session
    }

    pub fn render(&self, buffer: &mut [u8], width: u32, height: u32, area: TwipRect) {
        self.engine.render(buffer, width, height, area);
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Document {}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("session", &self.session)
            .finish()
    }
}

/// A compositing surface for finished tiles.
///
/// Coordinates are device pixels relative to the surface origin and may be
/// negative when a tile is partially scrolled out.
pub trait CanvasSink {
    fn draw_image(&mut self, image: &RgbaImage, x: i64, y: i64);
}

/// A [`CanvasSink`] backed by an in-memory RGBA image.
#[derive(Debug, Clone)]
pub struct ImageCanvas {
    image: RgbaImage,
    draws: usize,
}

impl ImageCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            draws: 0,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Number of draw calls received.
    pub fn draw_count(&self) -> usize {
        self.draws
    }
}

impl CanvasSink for ImageCanvas {
    fn draw_image(&mut self, image: &RgbaImage, x: i64, y: i64) {
        image::imageops::replace(&mut self.image, image, x, y);
        self.draws += 1;
    }
}
