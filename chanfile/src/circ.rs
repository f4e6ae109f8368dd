//! Circular buffer of fixed-stride records.
//!
//! The buffer holds the most recent records of a channel in memory so that
//! save/discard decisions can be made retrospectively. Storage is one
//! allocation of `capacity + 1` slots; one slot always stays unused so that
//! a full buffer and an empty one are never confused.
//!
//! Records are addressed by logical index (0 is the oldest). A logical range
//! maps to at most two physical spans:
//!
//! ```text
//! physical:  [ 5 6 7 . . . 1 2 3 4 ]
//!              ^^^^^       ^^^^^^^
//!              second      first span
//! ```
//!
//! Bulk copies run over these spans with one memcpy each instead of one per
//! record.

use std::ops::Range;

use crate::filter::MarkerFilter;
use crate::search;
use crate::stride::{Fixed, FixedRecord, Indexed, RecordSlice, Stride, read_time};
use crate::time::{SearchOutcome, Tick, TimeRange};

/// Up to two physical index ranges covering one logical range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Contig {
    parts: [Range<usize>; 2],
    count: usize,
}

impl Contig {
    /// The non-empty physical ranges, oldest first.
    pub fn parts(&self) -> &[Range<usize>] {
        &self.parts[..self.count]
    }

    /// Total items covered.
    pub fn len(&self) -> usize {
        self.parts().iter().map(ExactSizeIterator::len).sum()
    }

    /// True if nothing is covered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True if the range wrapped around the end of storage.
    pub fn is_split(&self) -> bool {
        self.count == 2
    }
}

/// Slot accounting shared by the record and waveform buffers.
///
/// All wrap arithmetic lives here: logical index `i` is physical slot
/// `(first + i) mod slots`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    slots: usize,
    first: usize,
    size: usize,
}

impl Window {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: capacity + 1,
            first: 0,
            size: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn space(&self) -> usize {
        self.capacity() - self.size
    }

    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    /// Physical slot of logical index `i`, for `i < slots`.
    #[inline]
    pub(crate) fn phys(&self, i: usize) -> usize {
        debug_assert!(i < self.slots);
        let p = self.first + i;
        if p >= self.slots { p - self.slots } else { p }
    }

    /// Physical spans of logical range `lo..hi`.
    pub(crate) fn spans(&self, lo: usize, hi: usize) -> Contig {
        if hi <= lo {
            return Contig::default();
        }
        let start = self.phys(lo);
        let n = hi - lo;
        let head = n.min(self.slots - start);
        if head == n {
            Contig {
                parts: [start..start + n, 0..0],
                count: 1,
            }
        } else {
            Contig {
                parts: [start..self.slots, 0..n - head],
                count: 2,
            }
        }
    }

    pub(crate) fn grow(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.size += n;
    }

    pub(crate) fn pop_front(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        if n == self.size {
            self.first = 0;
            self.size = 0;
        } else {
            self.first = self.phys(n);
            self.size -= n;
        }
    }

    pub(crate) fn pop_back(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        self.size -= n;
    }

    pub(crate) fn clear(&mut self) {
        self.first = 0;
        self.size = 0;
    }
}

/// Circular buffer of records with stride `S`.
///
/// # Examples
///
/// ```
/// use chanfile::circ::CircBuffer;
///
/// let mut buf = CircBuffer::<chanfile::stride::Fixed<i64>>::with_capacity(4);
/// assert_eq!(buf.push(&[10, 20, 30, 40]), 4);
/// assert_eq!(buf.push(&[50]), 0); // full
/// buf.free(1);
/// assert_eq!(buf.push(&[50]), 1);
/// assert_eq!(buf.first_time(), Some(20));
/// ```
#[derive(Debug, Clone)]
pub struct CircBuffer<S> {
    data: Vec<u8>,
    win: Window,
    stride: S,
}

impl<S: Stride> CircBuffer<S> {
    /// Allocates room for `capacity` records.
    pub fn new(capacity: usize, stride: S) -> Self {
        let win = Window::new(capacity);
        Self {
            data: vec![0; win.slots() * stride.bytes()],
            win,
            stride,
        }
    }

    /// Drops all contents and re-sizes to `capacity` records.
    pub fn reallocate(&mut self, capacity: usize) {
        self.win = Window::new(capacity);
        self.data = vec![0; self.win.slots() * self.stride.bytes()];
    }

    /// The record stride.
    pub fn stride(&self) -> S {
        self.stride
    }

    /// Maximum records held.
    pub fn capacity(&self) -> usize {
        self.win.capacity()
    }

    /// Records held.
    pub fn len(&self) -> usize {
        self.win.len()
    }

    /// True if no records are held.
    pub fn is_empty(&self) -> bool {
        self.win.len() == 0
    }

    /// Records that can be added before the buffer is full.
    pub fn space(&self) -> usize {
        self.win.space()
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.win.clear();
    }

    fn slot(&self, phys: usize) -> &[u8] {
        let s = self.stride.bytes();
        &self.data[phys * s..(phys + 1) * s]
    }

    fn slot_mut(&mut self, phys: usize) -> &mut [u8] {
        let s = self.stride.bytes();
        &mut self.data[phys * s..(phys + 1) * s]
    }

    /// Record at logical index `i` (0 is the oldest).
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    pub fn get(&self, i: usize) -> &[u8] {
        assert!(i < self.len(), "index {i} out of {} records", self.len());
        self.slot(self.win.phys(i))
    }

    /// Time of record `i`.
    pub fn time(&self, i: usize) -> Tick {
        read_time(self.get(i))
    }

    /// Time of the oldest record.
    pub fn first_time(&self) -> Option<Tick> {
        (!self.is_empty()).then(|| self.time(0))
    }

    /// Time of the newest record.
    pub fn last_time(&self) -> Option<Tick> {
        (!self.is_empty()).then(|| self.time(self.len() - 1))
    }

    /// Appends as many whole records from `records` as fit. Returns the count
    /// added; 0 when the buffer is full.
    ///
    /// The caller guarantees that the records continue the time order.
    pub fn add(&mut self, records: &[u8]) -> usize {
        let s = self.stride.bytes();
        let n = (records.len() / s).min(self.space());
        if n == 0 {
            return 0;
        }
        let spans = self.win.spans(self.len(), self.len() + n);
        let mut src = 0;
        for part in spans.parts() {
            let bytes = part.len() * s;
            let at = part.start * s;
            self.data[at..at + bytes].copy_from_slice(&records[src..src + bytes]);
            src += bytes;
        }
        self.win.grow(n);
        n
    }

    /// Drops the `n` oldest records. Returns the count dropped.
    pub fn free(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.win.pop_front(n);
        n
    }

    /// Removes the newest record. Returns false if the buffer was empty.
    pub fn sub(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        self.win.pop_back(1);
        true
    }

    /// Both physical halves as record slices, oldest first.
    pub fn halves(&self) -> (RecordSlice<'_, S>, RecordSlice<'_, S>) {
        let s = self.stride.bytes();
        let spans = self.win.spans(0, self.len());
        let view = |r: Option<&Range<usize>>| {
            let bytes = r.map_or(&[][..], |r| &self.data[r.start * s..r.end * s]);
            RecordSlice::new(bytes, self.stride)
        };
        (view(spans.parts().first()), view(spans.parts().get(1)))
    }

    /// Index of the first record at or after `t` (`len()` if none).
    ///
    /// Searches whichever physical half holds `t` so each step is a plain slice lookup.
    pub fn lower_bound(&self, t: Tick) -> usize {
        let (older, newer) = self.halves();
        if !newer.is_empty() && older.time(older.len() - 1) < t {
            older.len() + newer.lower_bound(t)
        } else {
            older.lower_bound(t)
        }
    }

    /// Index of the record exactly at `t`.
    pub fn find(&self, t: Tick) -> Option<usize> {
        let i = self.lower_bound(t);
        (i < self.len() && self.time(i) == t).then_some(i)
    }

    /// Number of records in `[from, upto)`.
    pub fn count_range(&self, from: Tick, upto: Tick) -> usize {
        self.lower_bound(upto).saturating_sub(self.lower_bound(from))
    }

    /// Physical record spans holding the records in `[from, upto)`.
    pub fn contig_range(&self, from: Tick, upto: Tick) -> Contig {
        self.win.spans(self.lower_bound(from), self.lower_bound(upto))
    }

    /// Encoded bytes of each physical span in `[from, upto)`, oldest first.
    pub fn byte_spans(&self, from: Tick, upto: Tick) -> impl Iterator<Item = &[u8]> + '_ {
        let s = self.stride.bytes();
        let spans = self.contig_range(from, upto);
        (0..spans.count).map(move |i| {
            let r = &spans.parts[i];
            &self.data[r.start * s..r.end * s]
        })
    }

    /// Copies qualifying records from the cursor interval to `sink`, oldest
    /// first. Returns the count copied; the cursor is left as described for
    /// [`search::copy_forward`].
    pub fn copy_range<F>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        sink: F,
    ) -> usize
    where
        F: FnMut(&[u8]),
    {
        search::copy_forward(self, self.stride.filterable(), cursor, filter, sink)
    }

    /// Finds the `cursor.remaining()`th qualifying record before `cursor.upto()`.
    pub fn prev_n_time(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
    ) -> SearchOutcome {
        search::prev_n_time(self, self.stride.filterable(), cursor, filter)
    }

    /// Overwrites everything after the time field of the record whose time
    /// matches `record`'s. Returns false if no record has that time.
    pub fn edit(&mut self, record: &[u8]) -> bool {
        let Some(i) = self.find(read_time(record)) else {
            return false;
        };
        let phys = self.win.phys(i);
        let slot = self.slot_mut(phys);
        let n = slot.len().min(record.len());
        slot[8..n].copy_from_slice(&record[8..n]);
        true
    }
}

impl<S: Stride> Indexed for CircBuffer<S> {
    fn len(&self) -> usize {
        CircBuffer::len(self)
    }

    fn record(&self, i: usize) -> &[u8] {
        self.get(i)
    }
}

impl<R: FixedRecord> CircBuffer<Fixed<R>> {
    /// Allocates room for `capacity` records of type `R`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, Fixed::new())
    }

    /// Appends as many of `items` as fit. Returns the count added.
    pub fn push(&mut self, items: &[R]) -> usize {
        let n = items.len().min(self.space());
        for (i, item) in items[..n].iter().enumerate() {
            let phys = self.win.phys(self.len() + i);
            item.encode(self.slot_mut(phys));
        }
        self.win.grow(n);
        n
    }

    /// Decodes record `i`.
    pub fn item(&self, i: usize) -> R {
        R::decode(self.get(i))
    }

    /// Decodes qualifying records of the cursor interval into `out`.
    pub fn read(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        out: &mut Vec<R>,
    ) -> usize {
        search::read_forward(self, self.stride.filterable(), cursor, filter, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CodeFilter;
    use crate::record::{ExtLayout, ExtMark, Marker};
    use crate::stride::Dynamic;

    fn events(times: &[Tick]) -> Vec<u8> {
        let mut bytes = vec![0u8; times.len() * 8];
        for (i, t) in times.iter().enumerate() {
            t.encode(&mut bytes[i * 8..]);
        }
        bytes
    }

    #[test]
    fn test_window_spans() {
        let mut w = Window::new(4);
        w.grow(4);
        w.pop_front(3);
        w.grow(3);
        // first = 3, size = 4, slots = 5: logical 0..4 -> phys 3,4,0,1
        let spans = w.spans(0, 4);
        assert_eq!(spans.parts(), &[3..5, 0..2]);
        assert!(spans.is_split());
        assert_eq!(spans.len(), 4);
        assert_eq!(w.spans(2, 4).parts(), &[0..2]);
        assert!(w.spans(2, 2).is_empty());
    }

    #[test]
    fn test_full_and_drain() {
        let mut buf = CircBuffer::<Fixed<Tick>>::with_capacity(4);
        assert_eq!(buf.push(&[1, 2, 3, 4]), 4);
        assert_eq!(buf.space(), 0);
        assert_eq!(buf.push(&[5, 6, 7]), 0);
        assert_eq!(buf.free(2), 2);
        assert_eq!(buf.push(&[5, 6, 7]), 2);
        assert_eq!(buf.len(), 4);
        assert_eq!((0..4).map(|i| buf.item(i)).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_add_bytes_across_wrap() {
        let mut buf = CircBuffer::new(5, Fixed::<Tick>::new());
        assert_eq!(buf.add(&events(&[1, 2, 3, 4])), 4);
        buf.free(3);
        assert_eq!(buf.add(&events(&[5, 6, 7, 8])), 4);
        assert_eq!(buf.len(), 5);
        let (older, newer) = buf.halves();
        assert_eq!(older.len() + newer.len(), 5);
        assert!(!newer.is_empty());
        let all: Vec<Tick> = (0..buf.len()).map(|i| buf.time(i)).collect();
        assert_eq!(all, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_wrap_round_trip_many_cycles() {
        let mut buf = CircBuffer::<Fixed<Tick>>::with_capacity(7);
        let mut next = 0;
        let mut expected = std::collections::VecDeque::new();
        for round in 0..50 {
            let batch: Vec<Tick> = (0..(round % 5 + 1))
                .map(|_| {
                    next += 3;
                    next
                })
                .collect();
            let free = batch.len().saturating_sub(buf.space());
            buf.free(free);
            for _ in 0..free {
                expected.pop_front();
            }
            assert_eq!(buf.push(&batch), batch.len());
            expected.extend(batch);

            let got: Vec<Tick> = (0..buf.len()).map(|i| buf.item(i)).collect();
            assert_eq!(got, expected.iter().copied().collect::<Vec<_>>());
            for &t in &expected {
                assert_eq!(buf.find(t).map(|i| buf.item(i)), Some(t));
                assert_eq!(buf.find(t + 1), None);
            }
        }
    }

    #[test]
    fn test_lower_bound_across_halves() {
        let mut buf = CircBuffer::<Fixed<Tick>>::with_capacity(4);
        buf.push(&[10, 20, 30]);
        buf.free(2);
        buf.push(&[40, 50, 60]);
        // contents 30 40 50 60, split storage
        assert!(buf.contig_range(0, 100).is_split());
        assert_eq!(buf.lower_bound(0), 0);
        assert_eq!(buf.lower_bound(31), 1);
        assert_eq!(buf.lower_bound(50), 2);
        assert_eq!(buf.lower_bound(61), 4);
        assert_eq!(buf.count_range(35, 60), 2);
    }

    #[test]
    fn test_byte_spans_cover_range() {
        let mut buf = CircBuffer::<Fixed<Tick>>::with_capacity(4);
        buf.push(&[10, 20, 30]);
        buf.free(2);
        buf.push(&[40, 50, 60]);
        let mut times = Vec::new();
        for span in buf.byte_spans(20, 60) {
            times.extend(span.chunks_exact(8).map(read_time));
        }
        assert_eq!(times, vec![30, 40, 50]);
    }

    #[test]
    fn test_sub_removes_newest() {
        let mut buf = CircBuffer::<Fixed<Tick>>::with_capacity(3);
        assert!(!buf.sub());
        buf.push(&[1, 2]);
        assert!(buf.sub());
        assert_eq!(buf.last_time(), Some(1));
    }

    #[test]
    fn test_read_and_prev_n_across_wrap() {
        let mut buf = CircBuffer::<Fixed<Marker>>::with_capacity(5);
        let marks: Vec<Marker> = (0..5)
            .map(|i| Marker::with_codes(i * 10, [i as u8, 0, 0, 0]))
            .collect();
        buf.push(&marks[..3]);
        buf.free(2);
        buf.push(&marks[3..]);
        buf.push(&[Marker::with_codes(50, [5, 0, 0, 0]), Marker::with_codes(60, [6, 0, 0, 0])]);
        // contents 20..=60

        let filter = CodeFilter::only_codes(&[2, 4, 6]);
        let mut out = Vec::new();
        let mut cursor = TimeRange::new(0, 100, 10, true, 0);
        buf.read(&mut cursor, Some(&filter), &mut out);
        assert_eq!(out.iter().map(|m| m.time).collect::<Vec<_>>(), vec![20, 40, 60]);

        let mut cursor = TimeRange::new(0, 60, 2, false, 0);
        assert_eq!(buf.prev_n_time(&mut cursor, Some(&filter)), SearchOutcome::Found(20));
    }

    #[test]
    fn test_dynamic_stride_edit() {
        let layout = ExtLayout::text(8);
        let stride = layout.dynamic().unwrap();
        let mut buf = CircBuffer::new(3, stride);
        let mut rec = vec![0u8; stride.bytes()];
        for (t, text) in [(5, "one"), (6, "two")] {
            ExtMark::text(Marker::new(t), text).encode(&mut rec);
            assert_eq!(buf.add(&rec), 1);
        }

        ExtMark::text(Marker::with_codes(6, [9, 0, 0, 0]), "TWO").encode(&mut rec);
        assert!(buf.edit(&rec));
        let back = ExtMark::decode(buf.get(1), &layout);
        assert_eq!(back.as_text(), "TWO");
        assert_eq!(back.marker.codes()[0], 9);

        ExtMark::text(Marker::new(7), "none").encode(&mut rec);
        assert!(!buf.edit(&rec));
        assert_eq!(buf.stride(), Dynamic::new(24).unwrap());
    }

    #[test]
    fn test_reallocate_clears() {
        let mut buf = CircBuffer::<Fixed<Tick>>::with_capacity(2);
        buf.push(&[1, 2]);
        buf.reallocate(10);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 10);
        assert_eq!(buf.push(&(0..10).collect::<Vec<_>>()), 10);
    }
}
