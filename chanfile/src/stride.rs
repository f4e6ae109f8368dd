//! Indexed access to packed records and waveform runs.
//!
//! Records are stored packed back-to-back in byte buffers, with the time as
//! the first 8 bytes of every record. The stride is either a compile-time
//! property of the record type ([`Fixed`]) or a value fixed when a channel is
//! opened ([`Dynamic`], used by extended markers). Both implement [`Stride`],
//! so one algorithm body serves both: the fixed case compiles down to a
//! constant multiply, the dynamic case carries the stride alongside the slice.
//!
//! Waveform blocks pack variable-length contiguous runs instead of equal-sized
//! records. [`WaveRuns`] walks them one run at a time:
//!
//! ```text
//! [start: i64][count: u32][reserved: u32][count samples][pad to 8]  <- one run
//! [start: i64][count: u32][reserved: u32][count samples][pad to 8]  <- next run
//! ```
//!
//! These accessors are unchecked in the sense that index legality is the
//! caller's responsibility; out-of-range indices panic through slice indexing
//! and are caught by debug assertions first.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

use crate::record::MARKER_SIZE;
use crate::time::Tick;

/// Size of the time field at the start of every record.
pub const TIME_SIZE: usize = 8;

/// Size of the header that precedes every waveform run.
pub const RUN_HEADER_SIZE: usize = 16;

/// Rounds `n` up to the next multiple of 8.
#[inline]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Reads the little-endian time at the start of a record.
#[inline]
pub fn read_time(bytes: &[u8]) -> Tick {
    let mut raw = [0u8; TIME_SIZE];
    raw.copy_from_slice(&bytes[..TIME_SIZE]);
    Tick::from_le_bytes(raw)
}

/// Writes a little-endian time at the start of a record.
#[inline]
pub fn write_time(bytes: &mut [u8], time: Tick) {
    bytes[..TIME_SIZE].copy_from_slice(&time.to_le_bytes());
}

/// A record type whose encoded size is known at compile time.
pub trait FixedRecord: Copy {
    /// Encoded size in bytes; a multiple of 8.
    const SIZE: usize;

    /// The record's time.
    fn time(&self) -> Tick;

    /// Encodes into exactly `SIZE` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Decodes from at least `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;
}

/// Bare event times are records of their own.
impl FixedRecord for Tick {
    const SIZE: usize = TIME_SIZE;

    fn time(&self) -> Tick {
        *self
    }

    fn encode(&self, out: &mut [u8]) {
        write_time(out, *self);
    }

    fn decode(bytes: &[u8]) -> Self {
        read_time(bytes)
    }
}

/// Byte distance between consecutive records.
pub trait Stride: Copy + fmt::Debug {
    /// Stride in bytes.
    fn bytes(&self) -> usize;

    /// Whether records carry a marker code that filters can test.
    #[inline]
    fn filterable(&self) -> bool {
        self.bytes() >= MARKER_SIZE
    }
}

/// Stride equal to the encoded size of `R`, known at compile time.
pub struct Fixed<R>(PhantomData<fn() -> R>);

impl<R> Fixed<R> {
    /// Creates the (zero-sized) stride tag.
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for Fixed<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for Fixed<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Fixed<R> {}

impl<R> fmt::Debug for Fixed<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed<{}>", std::any::type_name::<R>())
    }
}

impl<R: FixedRecord> Stride for Fixed<R> {
    #[inline]
    fn bytes(&self) -> usize {
        R::SIZE
    }
}

/// Stride chosen at channel-open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dynamic(usize);

impl Dynamic {
    /// Creates a runtime stride. It must cover a marker and be a multiple of 8.
    pub fn new(bytes: usize) -> Option<Self> {
        (bytes >= MARKER_SIZE && bytes % 8 == 0).then_some(Self(bytes))
    }
}

impl Stride for Dynamic {
    #[inline]
    fn bytes(&self) -> usize {
        self.0
    }
}

/// Random access by logical index to a time-ordered run of records.
///
/// Implemented by [`RecordSlice`] and by the logical window of a circular
/// buffer, so the search algorithms run unchanged on both.
pub trait Indexed {
    /// Number of records.
    fn len(&self) -> usize;

    /// The encoded record at logical index `i`.
    fn record(&self, i: usize) -> &[u8];

    /// True if there are no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of record `i`.
    fn time_at(&self, i: usize) -> Tick {
        read_time(self.record(i))
    }

    /// Index of the first record at or after `t` (`len()` if none).
    fn lower_bound(&self, t: Tick) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.time_at(mid) < t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// A borrowed, contiguous sequence of records with a common stride.
#[derive(Debug, Clone, Copy)]
pub struct RecordSlice<'a, S> {
    bytes: &'a [u8],
    stride: S,
}

impl<'a, S: Stride> RecordSlice<'a, S> {
    /// Views `bytes` as records of `stride` bytes.
    pub fn new(bytes: &'a [u8], stride: S) -> Self {
        debug_assert_eq!(bytes.len() % stride.bytes(), 0);
        Self { bytes, stride }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride.bytes()
    }

    /// True if there are no records.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The stride.
    pub fn stride(&self) -> S {
        self.stride
    }

    /// Record `i`.
    pub fn get(&self, i: usize) -> &'a [u8] {
        debug_assert!(i < self.len());
        let s = self.stride.bytes();
        &self.bytes[i * s..(i + 1) * s]
    }

    /// Time of record `i`.
    pub fn time(&self, i: usize) -> Tick {
        read_time(self.get(i))
    }

    /// Cursor at the first record.
    pub fn begin(&self) -> RecordCursor<'a, S> {
        RecordCursor {
            bytes: self.bytes,
            stride: self.stride,
            pos: 0,
        }
    }

    /// Cursor one past the last record.
    pub fn end(&self) -> RecordCursor<'a, S> {
        RecordCursor {
            bytes: self.bytes,
            stride: self.stride,
            pos: self.len(),
        }
    }

    /// Index of the first record at or after `t`.
    pub fn lower_bound(&self, t: Tick) -> usize {
        let mut first = self.begin();
        let mut count = self.len();
        while count > 0 {
            let step = count / 2;
            let mid = first + step;
            if mid.time() < t {
                first = mid + 1;
                count -= step + 1;
            } else {
                count = step;
            }
        }
        first - self.begin()
    }

    /// Iterates over the encoded records.
    pub fn iter(&self) -> std::slice::ChunksExact<'a, u8> {
        self.bytes.chunks_exact(self.stride.bytes())
    }
}

impl<R: FixedRecord> RecordSlice<'_, Fixed<R>> {
    /// Decodes record `i`.
    pub fn item(&self, i: usize) -> R {
        R::decode(self.get(i))
    }
}

impl<S: Stride> Indexed for RecordSlice<'_, S> {
    fn len(&self) -> usize {
        RecordSlice::len(self)
    }

    fn record(&self, i: usize) -> &[u8] {
        self.get(i)
    }
}

/// A mutable view of packed records.
#[derive(Debug)]
pub struct RecordSliceMut<'a, S> {
    bytes: &'a mut [u8],
    stride: S,
}

impl<'a, S: Stride> RecordSliceMut<'a, S> {
    /// Views `bytes` as records of `stride` bytes.
    pub fn new(bytes: &'a mut [u8], stride: S) -> Self {
        debug_assert_eq!(bytes.len() % stride.bytes(), 0);
        Self { bytes, stride }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride.bytes()
    }

    /// True if there are no records.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Mutable access to record `i`.
    pub fn get_mut(&mut self, i: usize) -> &mut [u8] {
        debug_assert!(i < self.len());
        let s = self.stride.bytes();
        &mut self.bytes[i * s..(i + 1) * s]
    }

    /// Read-only view of the same records.
    pub fn as_slice(&self) -> RecordSlice<'_, S> {
        RecordSlice::new(self.bytes, self.stride)
    }
}

/// Pointer-like position within a [`RecordSlice`].
///
/// Supports `cursor + n`, `cursor - n`, `cursor - other` (signed distance)
/// and relative indexing through [`RecordCursor::at`].
#[derive(Debug, Clone, Copy)]
pub struct RecordCursor<'a, S> {
    bytes: &'a [u8],
    stride: S,
    pos: usize,
}

impl<'a, S: Stride> RecordCursor<'a, S> {
    /// Position in records from the start of the slice.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The record under the cursor.
    pub fn get(&self) -> &'a [u8] {
        self.at(0)
    }

    /// The record `n` places from the cursor.
    pub fn at(&self, n: isize) -> &'a [u8] {
        let Some(i) = self.pos.checked_add_signed(n) else {
            panic!("record cursor moved before start");
        };
        let s = self.stride.bytes();
        &self.bytes[i * s..(i + 1) * s]
    }

    /// Time of the record under the cursor.
    pub fn time(&self) -> Tick {
        read_time(self.get())
    }

    /// Moves one record forward.
    pub fn inc(&mut self) {
        self.pos += 1;
    }

    /// Moves one record back.
    pub fn dec(&mut self) {
        debug_assert!(self.pos > 0);
        self.pos -= 1;
    }
}

impl<S: Stride> Add<usize> for RecordCursor<'_, S> {
    type Output = Self;

    fn add(mut self, n: usize) -> Self {
        self.pos += n;
        self
    }
}

impl<S: Stride> Sub<usize> for RecordCursor<'_, S> {
    type Output = Self;

    fn sub(mut self, n: usize) -> Self {
        debug_assert!(self.pos >= n);
        self.pos -= n;
        self
    }
}

impl<S: Stride> Sub for RecordCursor<'_, S> {
    type Output = usize;

    fn sub(self, other: Self) -> usize {
        debug_assert!(self.pos >= other.pos);
        self.pos - other.pos
    }
}

impl<S> PartialEq for RecordCursor<'_, S> {
    fn eq(&self, other: &Self) -> bool {
        self.pos == other.pos
    }
}

/// A waveform sample type.
pub trait Sample: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encodes little-endian into `SIZE` bytes.
    fn write_le(self, out: &mut [u8]);

    /// Decodes little-endian from `SIZE` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

impl Sample for i16 {
    const SIZE: usize = 2;

    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        i16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl Sample for f32 {
    const SIZE: usize = 4;

    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Bytes taken by a run of `count` samples, header and padding included.
#[inline]
pub fn run_bytes<S: Sample>(count: usize) -> usize {
    RUN_HEADER_SIZE + align8(count * S::SIZE)
}

/// Writes a run header at the start of `out`.
pub fn write_run_header(out: &mut [u8], start: Tick, count: usize) {
    write_time(out, start);
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    out[8..12].copy_from_slice(&count.to_le_bytes());
    out[12..16].fill(0);
}

/// One contiguous run of samples inside a packed waveform area.
#[derive(Debug, Clone, Copy)]
pub struct WaveRun<'a, S> {
    offset: usize,
    start: Tick,
    count: usize,
    data: &'a [u8],
    _sample: PhantomData<S>,
}

impl<'a, S: Sample> WaveRun<'a, S> {
    /// Byte offset of the run header within the packed area.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Time of the first sample.
    pub fn start(&self) -> Tick {
        self.start
    }

    /// Number of samples.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Bytes the run occupies, header and padding included.
    pub fn byte_len(&self) -> usize {
        run_bytes::<S>(self.count)
    }

    /// Sample `i` of the run.
    pub fn sample(&self, i: usize) -> S {
        S::read_le(&self.data[i * S::SIZE..])
    }

    /// Iterates over the samples.
    pub fn samples(&self) -> impl Iterator<Item = S> + 'a {
        self.data.chunks_exact(S::SIZE).map(S::read_le)
    }
}

/// Walks a packed waveform area one whole run at a time.
#[derive(Debug, Clone)]
pub struct WaveRuns<'a, S> {
    bytes: &'a [u8],
    offset: usize,
    remaining: usize,
    _sample: PhantomData<S>,
}

impl<'a, S: Sample> WaveRuns<'a, S> {
    /// Iterates over `runs` runs packed from the start of `bytes`.
    pub fn new(bytes: &'a [u8], runs: usize) -> Self {
        Self {
            bytes,
            offset: 0,
            remaining: runs,
            _sample: PhantomData,
        }
    }
}

impl<'a, S: Sample> Iterator for WaveRuns<'a, S> {
    type Item = WaveRun<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.offset + RUN_HEADER_SIZE > self.bytes.len() {
            return None;
        }
        let header = &self.bytes[self.offset..self.offset + RUN_HEADER_SIZE];
        let start = read_time(header);
        let count = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let data_start = self.offset + RUN_HEADER_SIZE;
        let data_end = data_start + count * S::SIZE;
        // A truncated run ends the walk
        if data_end > self.bytes.len() {
            self.remaining = 0;
            return None;
        }

        let run = WaveRun {
            offset: self.offset,
            start,
            count,
            data: &self.bytes[data_start..data_end],
            _sample: PhantomData,
        };
        self.offset += run_bytes::<S>(count);
        self.remaining -= 1;
        Some(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(times: &[Tick], stride: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; times.len() * stride];
        for (i, &t) in times.iter().enumerate() {
            write_time(&mut bytes[i * stride..], t);
            bytes[i * stride + 8] = i as u8;
        }
        bytes
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(17), 24);
    }

    #[test]
    fn test_dynamic_stride_validation() {
        assert!(Dynamic::new(8).is_none());
        assert!(Dynamic::new(20).is_none());
        assert_eq!(Dynamic::new(24).map(|d| d.bytes()), Some(24));
    }

    #[test]
    fn test_fixed_and_dynamic_agree() {
        let times = [10, 20, 30, 40, 50];
        let bytes = packed(&times, 8);
        let fixed = RecordSlice::new(&bytes, Fixed::<Tick>::new());
        assert_eq!(fixed.len(), 5);
        assert_eq!(fixed.item(3), 40);

        let wide = packed(&times, 32);
        let dynamic = RecordSlice::new(&wide, Dynamic::new(32).unwrap());
        assert_eq!(dynamic.len(), 5);
        for i in 0..5 {
            assert_eq!(fixed.time(i), dynamic.time(i));
        }
        assert_eq!(dynamic.get(2)[8], 2);
    }

    #[test]
    fn test_lower_bound() {
        let bytes = packed(&[10, 20, 30, 40], 24);
        let slice = RecordSlice::new(&bytes, Dynamic::new(24).unwrap());
        assert_eq!(slice.lower_bound(0), 0);
        assert_eq!(slice.lower_bound(10), 0);
        assert_eq!(slice.lower_bound(11), 1);
        assert_eq!(slice.lower_bound(40), 3);
        assert_eq!(slice.lower_bound(41), 4);
        // trait default agrees with the cursor version
        for t in 0..50 {
            assert_eq!(Indexed::lower_bound(&slice, t), slice.lower_bound(t));
        }
    }

    #[test]
    fn test_cursor_arithmetic() {
        let bytes = packed(&[1, 2, 3, 4, 5], 8);
        let slice = RecordSlice::new(&bytes, Fixed::<Tick>::new());
        let begin = slice.begin();
        let mut c = begin + 2;
        assert_eq!(c.time(), 3);
        assert_eq!(read_time(c.at(1)), 4);
        assert_eq!(read_time(c.at(-2)), 1);
        c.inc();
        assert_eq!(c.time(), 4);
        c.dec();
        c.dec();
        assert_eq!(c.time(), 2);
        assert_eq!(slice.end() - begin, 5);
        assert_eq!((slice.end() - 1).time(), 5);
        assert!(begin + 5 == slice.end());
    }

    #[test]
    fn test_mut_slice_edits() {
        let mut bytes = packed(&[1, 2, 3], 16);
        let mut slice = RecordSliceMut::new(&mut bytes, Dynamic::new(16).unwrap());
        slice.get_mut(1)[8] = 99;
        assert_eq!(slice.as_slice().get(1)[8], 99);
        assert_eq!(slice.as_slice().time(1), 2);
    }

    #[test]
    fn test_wave_runs_of_unequal_length() {
        let mut bytes = vec![0u8; 128];
        // run of 3 i16 at 100, then run of 5 i16 at 500
        write_run_header(&mut bytes, 100, 3);
        for i in 0..3 {
            (i as i16 + 1).write_le(&mut bytes[RUN_HEADER_SIZE + i * 2..]);
        }
        let second = run_bytes::<i16>(3);
        assert_eq!(second, 24);
        write_run_header(&mut bytes[second..], 500, 5);
        for i in 0..5 {
            (i as i16 * 10).write_le(&mut bytes[second + RUN_HEADER_SIZE + i * 2..]);
        }

        let runs: Vec<_> = WaveRuns::<i16>::new(&bytes, 2).collect();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].start(), 100);
        assert_eq!(runs[0].samples().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(runs[1].offset(), 24);
        assert_eq!(runs[1].count(), 5);
        assert_eq!(runs[1].sample(4), 40);
        assert_eq!(runs[1].byte_len(), 32);
    }

    #[test]
    fn test_wave_runs_stops_on_truncation() {
        let mut bytes = vec![0u8; 24];
        write_run_header(&mut bytes, 0, 100);
        assert_eq!(WaveRuns::<f32>::new(&bytes, 1).count(), 0);
    }

    #[test]
    fn test_sample_round_trip() {
        let mut buf = [0u8; 4];
        (-1234i16).write_le(&mut buf);
        assert_eq!(i16::read_le(&buf), -1234);
        1.5f32.write_le(&mut buf);
        assert_eq!(f32::read_le(&buf), 1.5);
    }
}
