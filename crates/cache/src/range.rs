//! Inclusive tile index ranges

/// An inclusive range of tile indices, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRange {
    pub start: usize,
    pub end: usize,
}

impl TileRange {
    /// Create a new range. Panics if `start > end`.
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "malformed tile range {start}..={end}");
        Self { start, end }
    }

    /// A range covering exactly one tile.
    pub fn single(index: usize) -> Self {
        Self {
            start: index,
            end: index,
        }
    }

    /// Number of tiles covered.
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..=self.end).contains(&index)
    }

    /// Intersection with `limit`, or `None` when the two are disjoint.
    pub fn clip(&self, limit: TileRange) -> Option<TileRange> {
        if self.end < limit.start || self.start > limit.end {
            return None;
        }
        Some(TileRange {
            start: self.start.max(limit.start),
            end: self.end.min(limit.end),
        })
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }
}

impl From<(usize, usize)> for TileRange {
    fn from((start, end): (usize, usize)) -> Self {
        Self::new(start, end)
    }
}

/// Sort ranges by start and merge the ones that overlap.
///
/// The output is ascending and non-overlapping. Ranges that merely touch
/// (`next.start == prev.end + 1`) are kept separate.
pub fn simplify_ranges(ranges: &[TileRange]) -> Vec<TileRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|range| range.start);

    let mut simplified: Vec<TileRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match simplified.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => simplified.push(range),
        }
    }
    simplified
}

/// Sum of range lengths. Overlapping input double-counts, so simplify first
/// to get the size of the covered index set.
pub fn tile_count(ranges: &[TileRange]) -> usize {
    ranges.iter().map(TileRange::len).sum()
}

/// Intersect every range with `limit`, dropping the ones entirely outside.
pub fn clip_ranges(ranges: &[TileRange], limit: TileRange) -> Vec<TileRange> {
    ranges.iter().filter_map(|range| range.clip(limit)).collect()
}

/// Append `index` to a run-length list, extending the last range when the
/// index directly follows it.
pub(crate) fn push_index(ranges: &mut Vec<TileRange>, index: usize) {
    match ranges.last_mut() {
        Some(last) if last.end + 1 == index => last.end = index,
        _ => ranges.push(TileRange::single(index)),
    }
}
