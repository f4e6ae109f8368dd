//! Circular buffer of equally spaced waveform samples.
//!
//! Times are implicit: sample `i` sits at `first_time + i * divide`, so the
//! buffer only ever holds one gap-free run. Data that does not continue the
//! run exactly is refused; the channel commits and empties the buffer before
//! starting a new run.
//!
//! Samples may be corrected after they were added. The lowest corrected time
//! is tracked as a dirty watermark so that samples already committed to disk
//! can be rewritten on the next commit.

use crate::circ::{Contig, Window};
use crate::stride::Sample;
use crate::time::{SearchOutcome, Tick, TimeRange, slots_before};

/// Circular buffer of samples of type `S`.
#[derive(Debug, Clone)]
pub struct CircWaveBuffer<S> {
    data: Vec<S>,
    win: Window,
    first_time: Tick,
    divide: Tick,
    dirty: Option<Tick>,
}

impl<S: Sample> CircWaveBuffer<S> {
    /// Allocates room for `capacity` samples spaced `divide` ticks apart.
    ///
    /// # Panics
    ///
    /// Panics if `divide` is not positive.
    pub fn new(capacity: usize, divide: Tick) -> Self {
        assert!(divide > 0, "sample interval must be positive");
        let win = Window::new(capacity);
        Self {
            data: vec![S::default(); win.slots()],
            win,
            first_time: 0,
            divide,
            dirty: None,
        }
    }

    /// Drops all contents and re-sizes to `capacity` samples.
    pub fn reallocate(&mut self, capacity: usize) {
        self.win = Window::new(capacity);
        self.data = vec![S::default(); self.win.slots()];
        self.dirty = None;
    }

    /// Ticks per sample.
    pub fn divide(&self) -> Tick {
        self.divide
    }

    /// Maximum samples held.
    pub fn capacity(&self) -> usize {
        self.win.capacity()
    }

    /// Samples held.
    pub fn len(&self) -> usize {
        self.win.len()
    }

    /// True if no samples are held.
    pub fn is_empty(&self) -> bool {
        self.win.len() == 0
    }

    /// Samples that can be added before the buffer is full.
    pub fn space(&self) -> usize {
        self.win.space()
    }

    /// Time of the oldest sample.
    pub fn first_time(&self) -> Option<Tick> {
        (!self.is_empty()).then_some(self.first_time)
    }

    /// Time of the newest sample.
    pub fn last_time(&self) -> Option<Tick> {
        (!self.is_empty()).then(|| self.time_of(self.len() - 1))
    }

    /// Time the next added sample must have.
    pub fn end_time(&self) -> Option<Tick> {
        (!self.is_empty()).then(|| self.time_of(self.len()))
    }

    /// Time of logical sample `i`.
    pub fn time_of(&self, i: usize) -> Tick {
        self.first_time + i as Tick * self.divide
    }

    /// Index of the first sample at or after `t` (`len()` if none).
    pub fn index_at(&self, t: Tick) -> usize {
        slots_before(t.saturating_sub(self.first_time), self.divide).min(self.len())
    }

    /// Logical sample `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    pub fn sample(&self, i: usize) -> S {
        assert!(i < self.len(), "sample {i} out of {}", self.len());
        self.data[self.win.phys(i)]
    }

    /// Lowest time corrected since it was last committed.
    pub fn dirty(&self) -> Option<Tick> {
        self.dirty
    }

    /// Appends samples starting at time `t`. Returns the count added.
    ///
    /// A non-empty buffer only accepts data that starts exactly at
    /// [`end_time`](Self::end_time); anything else adds nothing and leaves the
    /// buffer unchanged.
    pub fn add(&mut self, data: &[S], t: Tick) -> usize {
        if let Some(end) = self.end_time()
            && end != t
        {
            return 0;
        }
        let n = data.len().min(self.space());
        if n == 0 {
            return 0;
        }
        if self.is_empty() {
            self.first_time = t;
        }
        let spans = self.win.spans(self.len(), self.len() + n);
        self.copy_in(&spans, data);
        self.win.grow(n);
        n
    }

    fn copy_in(&mut self, spans: &Contig, data: &[S]) {
        let mut src = 0;
        for part in spans.parts() {
            let len = part.len();
            self.data[part.clone()].copy_from_slice(&data[src..src + len]);
            src += len;
        }
    }

    /// Drops the `n` oldest samples. Returns the count dropped.
    pub fn free(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.first_time = self.time_of(n);
        self.win.pop_front(n);
        self.dirty = match self.dirty {
            _ if self.is_empty() => None,
            Some(d) => Some(d.max(self.first_time)),
            None => None,
        };
        n
    }

    /// Removes every sample.
    pub fn clear(&mut self) {
        self.win.clear();
        self.dirty = None;
    }

    /// Overwrites buffered samples with `data`, whose first element is at
    /// time `from`. Only the overlap with the buffer is written. Returns the
    /// count changed; 0 if `from` is not on the sample grid.
    pub fn change(&mut self, data: &[S], from: Tick) -> usize {
        if self.is_empty() || data.is_empty() {
            return 0;
        }
        let offset = from.saturating_sub(self.first_time);
        if offset.rem_euclid(self.divide) != 0 {
            return 0;
        }
        let start = offset / self.divide;
        let skip = if start < 0 { start.unsigned_abs() as usize } else { 0 };
        if skip >= data.len() {
            return 0;
        }
        let lo = start.max(0) as usize;
        if lo >= self.len() {
            return 0;
        }
        let n = (data.len() - skip).min(self.len() - lo);
        let spans = self.win.spans(lo, lo + n);
        self.copy_in(&spans, &data[skip..skip + n]);

        let changed_from = self.time_of(lo);
        self.dirty = Some(self.dirty.map_or(changed_from, |d| d.min(changed_from)));
        n
    }

    /// Records that everything before `upto` is on disk.
    pub fn mark_written(&mut self, upto: Tick) {
        self.dirty = match (self.dirty, self.end_time()) {
            (Some(_), Some(end)) if upto >= end => None,
            (Some(d), _) => Some(d.max(upto)),
            (None, _) => None,
        };
    }

    /// Physical spans of the samples in `[from, upto)`.
    pub fn contig_range(&self, from: Tick, upto: Tick) -> Contig {
        self.win.spans(self.index_at(from), self.index_at(upto))
    }

    /// Contiguous slices of the samples in `[from, upto)` with the time of
    /// each slice's first sample, oldest first.
    pub fn slices(&self, from: Tick, upto: Tick) -> Vec<(Tick, &[S])> {
        let lo = self.index_at(from);
        let spans = self.win.spans(lo, self.index_at(upto));
        let mut at = self.time_of(lo);
        let mut out = Vec::with_capacity(2);
        for part in spans.parts() {
            out.push((at, &self.data[part.clone()]));
            at += part.len() as Tick * self.divide;
        }
        out
    }

    /// Copies samples from `[from, upto)` into `out`.
    ///
    /// Returns the count copied and the time of the first one, or `None` if
    /// nothing in the range is buffered. Unless `allow_non_aligned` is set,
    /// the first copied sample must be exactly at `from`.
    pub fn read(
        &self,
        out: &mut [S],
        from: Tick,
        upto: Tick,
        allow_non_aligned: bool,
    ) -> Option<(usize, Tick)> {
        if self.is_empty() || out.is_empty() {
            return None;
        }
        let lo = self.index_at(from);
        let hi = self.index_at(upto);
        if lo >= hi {
            return None;
        }
        let t0 = self.time_of(lo);
        if !allow_non_aligned && t0 != from {
            return None;
        }
        let n = (hi - lo).min(out.len());
        let mut dst = 0;
        for part in self.win.spans(lo, lo + n).parts() {
            out[dst..dst + part.len()].copy_from_slice(&self.data[part.clone()]);
            dst += part.len();
        }
        Some((n, t0))
    }

    /// Finds the time of the `cursor.remaining()`th sample before `cursor.upto()`.
    ///
    /// Constant time: sample times are computed, never searched. When the
    /// buffer cannot satisfy the search the budget is reduced by the samples
    /// counted and `upto` narrowed to the first buffered sample.
    pub fn prev_n_time(&self, cursor: &mut TimeRange) -> SearchOutcome {
        if self.is_empty() || !cursor.has_range() {
            return SearchOutcome::NotFound;
        }
        let lo = self.index_at(cursor.from());
        let hi = self.index_at(cursor.upto());
        let n = hi.saturating_sub(lo);
        if n > 0 && cursor.remaining() <= n {
            let t = self.time_of(hi - cursor.remaining());
            cursor.set_done();
            return SearchOutcome::Found(t);
        }
        cursor.reduce(n);
        let floor = if lo == 0 { self.first_time } else { cursor.from() };
        cursor.set_upto(floor.min(cursor.upto()));
        SearchOutcome::NotFound
    }
}
