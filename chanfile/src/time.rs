//! Tick times and the time range cursor shared by every search and read.
//!
//! All stored times are signed 64-bit tick counts. A [`TimeRange`] is the
//! mutable cursor handed down through the buffer, write block and store
//! layers: each layer narrows it in place, spends its item budget, and leaves
//! it in a state that tells the caller whether to continue in the next layer.
//!
//! # Cursor states
//!
//! ```text
//! from < upto, remaining > 0   -> more work may be done (has_range() == true)
//! remaining == 0               -> budget spent, search satisfied
//! from >= upto                 -> interval exhausted
//! ```
//!
//! A cursor must not be shared between concurrently running searches.

use crate::record::WaveGrid;

/// A time in file ticks.
pub type Tick = i64;

/// Largest time the engine will store.
///
/// Keeping times below this bound leaves headroom so that adding a buffer's
/// worth of sample intervals to any valid time cannot overflow.
pub const MAX_TIME: Tick = 1 << 62;

/// Number of sample slots of width `divide` that start before `offset`
/// ticks past a run's first sample; 0 for non-positive offsets.
#[inline]
pub(crate) fn slots_before(offset: Tick, divide: Tick) -> usize {
    if offset <= 0 {
        0
    } else {
        ((offset - 1) / divide + 1) as usize
    }
}

/// Clamps a caller supplied time into the storable range `[0, MAX_TIME]`.
#[inline]
pub(crate) fn clamp_time(t: Tick) -> Tick {
    t.clamp(0, MAX_TIME)
}

/// Result of a backward search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The search was satisfied at this time.
    Found(Tick),
    /// Nothing qualified in the layers searched so far.
    NotFound,
    /// The cooperative yield budget ran out. The cursor holds the progress
    /// made; call again with the same cursor to resume.
    CallAgain,
}

impl SearchOutcome {
    /// Returns the found time, if any.
    pub fn found(self) -> Option<Tick> {
        match self {
            Self::Found(t) => Some(t),
            _ => None,
        }
    }

    /// Returns true for [`SearchOutcome::CallAgain`].
    pub fn is_call_again(self) -> bool {
        matches!(self, Self::CallAgain)
    }
}

/// Half-open time interval `[from, upto)` with an item budget.
///
/// The `first` flag is set for the first read of a sequence: while it is set
/// a waveform read may start at the nearest sample at or after `from`; once it
/// is cleared each following read must continue exactly at `from`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    from: Tick,
    upto: Tick,
    remaining: usize,
    first: bool,
    yield_every: u32,
    yield_left: u32,
    grid: Option<WaveGrid>,
}

impl TimeRange {
    /// Creates a cursor over `[from, upto)` allowing `max` items.
    ///
    /// `yield_every` is the number of steps a filtered search may take before
    /// it reports [`SearchOutcome::CallAgain`]; 0 disables yielding.
    ///
    /// Both ends are clamped to `[0, MAX_TIME]`, so `Tick::MAX` reads to the
    /// end. An empty or inverted interval gives a cursor with no range.
    pub fn new(from: Tick, upto: Tick, max: usize, first: bool, yield_every: u32) -> Self {
        Self {
            from: clamp_time(from),
            upto: clamp_time(upto),
            remaining: max,
            first,
            yield_every,
            yield_left: yield_every,
            grid: None,
        }
    }

    /// Attaches the grid description needed to read extended markers as waveforms.
    pub fn with_grid(mut self, grid: WaveGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    /// Start of the interval (inclusive).
    pub fn from(&self) -> Tick {
        self.from
    }

    /// End of the interval (exclusive).
    pub fn upto(&self) -> Tick {
        self.upto
    }

    /// Items still wanted.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// The attached waveform grid, if any.
    pub fn grid(&self) -> Option<&WaveGrid> {
        self.grid.as_ref()
    }

    /// Moves the start of the interval. Returns true if the interval is still non-empty.
    pub fn set_from(&mut self, from: Tick) -> bool {
        self.from = clamp_time(from);
        self.from < self.upto
    }

    /// Moves the end of the interval. Returns true if the interval is still non-empty.
    pub fn set_upto(&mut self, upto: Tick) -> bool {
        self.upto = clamp_time(upto);
        self.from < self.upto
    }

    /// Spends `n` items of the budget, stopping at zero.
    pub fn reduce(&mut self, n: usize) {
        self.remaining = self.remaining.saturating_sub(n);
    }

    /// Zeroes the budget: the search is complete.
    pub fn set_done(&mut self) {
        self.remaining = 0;
    }

    /// True while there is both time left in the interval and budget to spend.
    pub fn has_range(&self) -> bool {
        self.from < self.upto && self.upto > 0 && self.remaining > 0
    }

    /// Collapses the interval so that no further layer is consulted.
    pub fn set_exhausted(&mut self) {
        self.from = self.upto;
    }

    /// Whether the first item may be the nearest candidate rather than exactly `from`.
    pub fn is_first(&self) -> bool {
        self.first
    }

    /// Clears the first flag after the first item has been produced.
    pub fn clear_first(&mut self) {
        self.first = false;
    }

    /// Counts one unit of work. Returns true when the caller should stop and
    /// report [`SearchOutcome::CallAgain`]; the counter is then re-armed so
    /// the resumed call gets a fresh allowance.
    pub fn tick_yield(&mut self) -> bool {
        if self.yield_every == 0 {
            return false;
        }
        self.yield_left -= 1;
        if self.yield_left == 0 {
            self.yield_left = self.yield_every;
            return true;
        }
        false
    }
}
