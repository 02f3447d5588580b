//! Paint task coalescing and dispatch
//!
//! [`PaintManager`] holds at most two tasks: `current`, whose tiles are being
//! rendered on the worker pool, and `next`, which waits for `current` to
//! retire. New requests are folded into `next` when they target the same
//! document, so a burst of scroll or edit events collapses into a bounded
//! amount of queued work.
//!
//! All state transitions happen on the caller's thread and require external
//! serialization. Only tile rendering and completion callbacks run on
//! worker threads.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::{Arc, Weak};

use doctile_cache::{
    clip_ranges, simplify_ranges, tile_count, CancelFlag, Document, TileBuffer, TileRange,
    NO_CONTEXT, SCALE_EPSILON,
};
use tracing::{debug, trace};

use crate::barrier::CompletionBarrier;
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// The embedding view a [`PaintManager`] paints for.
pub trait PaintClient: Send + Sync {
    /// Called once per completed batch that was not cancelled.
    fn invalidate_container(&self);

    /// The tile buffer to paint into, if one is allocated.
    fn tile_buffer(&self) -> Option<Arc<TileBuffer>>;
}

/// Parameters of one paint request.
#[derive(Debug, Clone)]
pub struct PaintRequest {
    pub document: Document,
    /// Top of the viewport in device pixels
    pub y_pos: i32,
    /// Viewport height in device pixels
    pub view_height: u32,
    pub scale: f32,
    pub full_paint: bool,
    pub tile_ranges: Vec<TileRange>,
}

impl PaintRequest {
    pub fn new(document: Document, y_pos: i32, view_height: u32, scale: f32) -> Self {
        Self {
            document,
            y_pos,
            view_height,
            scale,
            full_paint: false,
            tile_ranges: Vec::new(),
        }
    }

    pub fn with_ranges(mut self, tile_ranges: Vec<TileRange>) -> Self {
        self.tile_ranges = tile_ranges;
        self
    }

    pub fn with_full_paint(mut self, full_paint: bool) -> Self {
        self.full_paint = full_paint;
        self
    }
}

/// An immutable unit of scheduled paint work.
///
/// Merging never mutates a task; it builds a new one with fresh cancel flags.
#[derive(Debug, Clone)]
pub struct Task {
    document: Document,
    y_pos: i32,
    view_height: u32,
    scale: f32,
    full_paint: bool,
    tile_ranges: Vec<TileRange>,
    skip_paint: CancelFlag,
    skip_invalidation: CancelFlag,
}

impl Task {
    fn from_request(request: PaintRequest) -> Self {
        Self {
            tile_ranges: simplify_ranges(&request.tile_ranges),
            document: request.document,
            y_pos: request.y_pos,
            view_height: request.view_height,
            scale: request.scale,
            full_paint: request.full_paint,
            skip_paint: CancelFlag::new(),
            skip_invalidation: CancelFlag::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn y_pos(&self) -> i32 {
        self.y_pos
    }

    pub fn view_height(&self) -> u32 {
        self.view_height
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn full_paint(&self) -> bool {
        self.full_paint
    }

    /// Simplified tile ranges
    pub fn tile_ranges(&self) -> &[TileRange] {
        &self.tile_ranges
    }

    /// Flag that stops queued rasterization for this task.
    pub fn skip_paint(&self) -> &CancelFlag {
        &self.skip_paint
    }

    /// Flag that suppresses the completion invalidate for this task.
    pub fn skip_invalidation(&self) -> &CancelFlag {
        &self.skip_invalidation
    }

    /// Same document, same scale and overlapping vertical bands.
    pub fn can_merge_with(&self, other: &Task) -> bool {
        let top = i64::from(self.y_pos);
        let bottom = top + i64::from(self.view_height);
        let other_top = i64::from(other.y_pos);
        let other_bottom = other_top + i64::from(other.view_height);

        self.document == other.document
            && (self.scale - other.scale).abs() <= SCALE_EPSILON
            && other_top < bottom
            && top < other_bottom
    }

    /// Same document and the same simplified ranges.
    pub fn is_duplicate_of(&self, other: &Task) -> bool {
        self.document == other.document && self.tile_ranges == other.tile_ranges
    }

    /// Union with `extra`, clipped to this task's viewport band.
    ///
    /// An empty `extra` just re-clips.
    pub fn merge_ranges(&self, extra: &[TileRange], tile_buffer: &TileBuffer) -> Task {
        let mut joined = self.tile_ranges.clone();
        joined.extend_from_slice(extra);

        if let Some(limit) = tile_buffer.limit_index(self.y_pos, self.view_height) {
            joined = clip_ranges(&joined, limit);
        }

        Task {
            document: self.document.clone(),
            y_pos: self.y_pos,
            view_height: self.view_height,
            scale: self.scale,
            full_paint: self.full_paint,
            tile_ranges: simplify_ranges(&joined),
            skip_paint: CancelFlag::new(),
            skip_invalidation: CancelFlag::new(),
        }
    }

    /// Paint generation identifier for (document, scale). Never [`NO_CONTEXT`].
    pub fn context_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.document.id().hash(&mut hasher);
        self.scale.to_bits().hash(&mut hasher);
        match hasher.finish() {
            NO_CONTEXT => NO_CONTEXT + 1,
            hash => hash,
        }
    }

    fn cancel(&self) {
        self.skip_paint.set();
        self.skip_invalidation.set();
    }
}

/// Coalescing paint scheduler for one client.
///
/// # Example
///
/// ```no_run
/// use doctile_cache::{Document, Rasterizer, TileBuffer, TileRange, TwipRect};
/// use doctile_scheduler::{PaintClient, PaintManager, PaintRequest, WorkerPoolConfig};
/// use std::sync::{Arc, Weak};
///
/// struct Blank;
/// impl Rasterizer for Blank {
///     fn render(&self, _buffer: &mut [u8], _w: u32, _h: u32, _area: TwipRect) {}
/// }
///
/// struct View {
///     tiles: Arc<TileBuffer>,
/// }
/// impl PaintClient for View {
///     fn invalidate_container(&self) {
///         println!("batch complete");
///     }
///     fn tile_buffer(&self) -> Option<Arc<TileBuffer>> {
///         Some(self.tiles.clone())
///     }
/// }
///
/// let tiles = Arc::new(TileBuffer::default());
/// tiles.resize_with_scale(12_240 * 4, 15_840 * 4, 1.5);
/// let view = Arc::new(View { tiles });
/// let client: Weak<View> = Arc::downgrade(&view);
/// let client: Weak<dyn PaintClient> = client;
///
/// let mut manager = PaintManager::new(client, WorkerPoolConfig::default()).unwrap();
/// let request = PaintRequest::new(Document::new(Blank), 0, 900, 1.5)
///     .with_ranges(vec![TileRange::new(0, 24)]);
/// manager.schedule_paint(request);
/// ```
pub struct PaintManager {
    client: Weak<dyn PaintClient>,
    pool: WorkerPool,
    current: Option<Task>,
    next: Option<Task>,
    paused: bool,
    invalidation_flag: CancelFlag,
}

impl PaintManager {
    /// Create a manager and start its worker pool.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(client: Weak<dyn PaintClient>, config: WorkerPoolConfig) -> io::Result<Self> {
        Ok(Self {
            client,
            pool: WorkerPool::new(config)?,
            current: None,
            next: None,
            paused: false,
            invalidation_flag: CancelFlag::new(),
        })
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    pub fn next_task(&self) -> Option<&Task> {
        self.next.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Queue a paint request.
    ///
    /// With nothing in flight the request is dispatched right away.
    /// Otherwise it replaces `next`, absorbing the ranges of a same-document
    /// `next` (and `current`), and the state machine advances through
    /// [`schedule_next_paint`](Self::schedule_next_paint).
    pub fn schedule_paint(&mut self, request: PaintRequest) {
        if self.current.is_none() {
            self.current = Some(Task::from_request(request));
            self.post_current_task();
            return;
        }

        let mut request = request;
        if let Some(next) = self.next.as_ref().filter(|next| next.document == request.document) {
            request.tile_ranges.extend_from_slice(&next.tile_ranges);
            request.full_paint |= next.full_paint;

            if let Some(current) = self
                .current
                .as_ref()
                .filter(|current| current.document == request.document)
            {
                request.tile_ranges.extend_from_slice(&current.tile_ranges);
                request.full_paint |= current.full_paint;
            }
        }

        self.next = Some(Task::from_request(request));
        self.schedule_next_paint(Vec::new());
    }

    /// Retire `current` in favour of `next` and dispatch it.
    ///
    /// `extra_ranges` are merged into `next` first (or into a copy of
    /// `current` when nothing is queued). Returns whether a batch was
    /// dispatched.
    pub fn schedule_next_paint(&mut self, extra_ranges: Vec<TileRange>) -> bool {
        let tile_buffer = self.tile_buffer();

        if let Some(buffer) = tile_buffer.as_deref() {
            if !extra_ranges.is_empty() {
                let base = self.next.as_ref().or(self.current.as_ref());
                if let Some(base) = base {
                    self.next = Some(base.merge_ranges(&extra_ranges, buffer));
                }
            }

            if let (Some(current), Some(next)) = (self.current.as_ref(), self.next.as_ref()) {
                if current.can_merge_with(next) {
                    let remaining = buffer.invalid_ranges_remaining(&current.tile_ranges);
                    if !remaining.is_empty() {
                        trace!(ranges = remaining.len(), "folding unfinished work into next task");
                        self.next = Some(next.merge_ranges(&remaining, buffer));
                    }
                }
            }

            if let Some(next) = self.next.take() {
                self.next = Some(next.merge_ranges(&[], buffer));
            }
        }

        match (self.current.take(), self.next.as_ref()) {
            (Some(current), Some(next)) => {
                if current.is_duplicate_of(next) {
                    debug!(y_pos = current.y_pos, "dropping duplicate paint task");
                } else if current.y_pos != next.y_pos {
                    debug!(
                        from = current.y_pos,
                        to = next.y_pos,
                        "viewport moved, cancelling superseded paint task"
                    );
                    current.cancel();
                }
            }
            (Some(current), None) => {
                debug!(y_pos = current.y_pos, "retiring paint task, nothing queued");
            }
            _ => {}
        }

        self.current = self.next.take();
        self.current.is_some() && self.post_current_task()
    }

    /// Cancel and drop both tasks.
    pub fn clear_tasks(&mut self) {
        for task in self.current.take().into_iter().chain(self.next.take()) {
            task.cancel();
        }
        debug!("paint tasks cleared");
    }

    /// Make every dispatched batch inert: no further tiles, no invalidate.
    pub fn on_destroy(&mut self) {
        self.invalidation_flag.cancel_and_reset();
        debug!("paint manager detached from dispatched work");
    }

    /// Stop dispatching. Work already on the pool keeps running.
    pub fn pause_paint(&mut self) {
        self.paused = true;
        debug!("painting paused");
    }

    /// Resume dispatching.
    ///
    /// With `paint_next`, re-dispatches `current`, or promotes and dispatches
    /// `next` when there is no `current`. Returns whether a batch was
    /// dispatched.
    pub fn resume_paint(&mut self, paint_next: bool) -> bool {
        self.paused = false;
        debug!(paint_next, "painting resumed");
        if !paint_next {
            return false;
        }

        if self.current.is_none() {
            self.current = self.next.take();
        }
        self.current.is_some() && self.post_current_task()
    }

    fn tile_buffer(&self) -> Option<Arc<TileBuffer>> {
        self.client.upgrade()?.tile_buffer()
    }

    /// Dispatch every range of `current` to the pool behind one barrier.
    fn post_current_task(&mut self) -> bool {
        let Some(task) = self.current.as_ref() else {
            return false;
        };
        if self.paused || self.invalidation_flag.is_cancelled() {
            trace!(paused = self.paused, "dispatch skipped");
            return false;
        }
        let Some(tile_buffer) = self.tile_buffer() else {
            return false;
        };
        if tile_buffer.is_empty() {
            trace!("dispatch skipped, tile grid not allocated");
            return false;
        }

        let context = task.context_hash();
        tile_buffer.set_active_context(context);

        let ranges = simplify_ranges(&task.tile_ranges);
        let total = tile_count(&ranges);

        let barrier = {
            let client = self.client.clone();
            let skip_invalidation = task.skip_invalidation.clone();
            let manager_flag = self.invalidation_flag.clone();
            let full_paint = task.full_paint;
            CompletionBarrier::new(total, move || {
                if skip_invalidation.is_cancelled() || manager_flag.is_cancelled() {
                    trace!("batch finished after cancellation, invalidate suppressed");
                    return;
                }
                if let Some(client) = client.upgrade() {
                    trace!(full_paint, "batch complete");
                    client.invalidate_container();
                }
            })
        };

        debug!(
            y_pos = task.y_pos,
            scale = task.scale,
            ranges = ranges.len(),
            tiles = total,
            "dispatching paint task"
        );

        for range in ranges {
            let job = TileRangeJob {
                tile_buffer: tile_buffer.clone(),
                document: task.document.clone(),
                skip_paint: task.skip_paint.clone(),
                manager_flag: self.invalidation_flag.clone(),
                next_tile: range.start,
                range,
                context,
                barrier: barrier.clone(),
            };
            self.pool.post(Box::new(move || job.run()));
        }
        true
    }
}

impl Drop for PaintManager {
    fn drop(&mut self) {
        self.on_destroy();
    }
}

/// One posted range of tiles.
///
/// Every tile of the range arrives at the barrier exactly once. Tiles not
/// reached, because the job was cancelled or unwound, arrive on drop.
struct TileRangeJob {
    tile_buffer: Arc<TileBuffer>,
    document: Document,
    skip_paint: CancelFlag,
    manager_flag: CancelFlag,
    range: TileRange,
    next_tile: usize,
    context: u64,
    barrier: CompletionBarrier,
}

impl TileRangeJob {
    fn run(mut self) {
        while self.next_tile <= self.range.end {
            if self.skip_paint.is_cancelled() || self.manager_flag.is_cancelled() {
                return;
            }
            let tile_index = self.next_tile;
            self.tile_buffer.paint_tile_in_context(
                &self.skip_paint,
                &self.document,
                tile_index,
                self.context,
            );
            self.next_tile += 1;
            self.barrier.arrive();
        }
    }
}

impl Drop for TileRangeJob {
    fn drop(&mut self) {
        if self.next_tile <= self.range.end {
            self.barrier.arrive_many(self.range.end - self.next_tile + 1);
        }
    }
}
