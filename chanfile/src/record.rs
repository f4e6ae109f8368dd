//! Channel record kinds.
//!
//! - events are bare [`Tick`] times
//! - [`Marker`] is a time plus 8 bytes of code, viewable as four code bytes
//!   (plus four spare), two `i32`s, or one `i64`
//! - [`ExtMark`] is a marker followed by a payload whose size is fixed per
//!   channel by an [`ExtLayout`]: text, a float grid or a short grid
//!
//! All encodings are little-endian and 8-byte aligned.

use serde::{Deserialize, Serialize};

use crate::stride::{Dynamic, FixedRecord, Sample, align8, read_time, write_time};
use crate::time::Tick;

/// Encoded size of a marker: time plus 8 code bytes.
pub const MARKER_SIZE: usize = 16;

/// Number of code bytes inspected by marker filters.
pub const FILTER_CODES: usize = 4;

/// A timestamp with 8 bytes of opaque code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Marker {
    /// Marker time.
    pub time: Tick,
    code: [u8; 8],
}

impl Marker {
    /// A marker with all code bytes zero.
    pub fn new(time: Tick) -> Self {
        Self { time, code: [0; 8] }
    }

    /// A marker carrying four code bytes.
    pub fn with_codes(time: Tick, codes: [u8; FILTER_CODES]) -> Self {
        let mut code = [0; 8];
        code[..FILTER_CODES].copy_from_slice(&codes);
        Self { time, code }
    }

    /// A marker whose payload holds two 32-bit integers.
    pub fn with_ints(time: Tick, ints: [i32; 2]) -> Self {
        let mut code = [0; 8];
        code[..4].copy_from_slice(&ints[0].to_le_bytes());
        code[4..].copy_from_slice(&ints[1].to_le_bytes());
        Self { time, code }
    }

    /// A marker whose payload holds one 64-bit integer.
    pub fn with_int64(time: Tick, value: i64) -> Self {
        Self {
            time,
            code: value.to_le_bytes(),
        }
    }

    /// Code byte `i` (0..8).
    pub fn code(&self, i: usize) -> u8 {
        self.code[i]
    }

    /// Sets code byte `i`.
    pub fn set_code(&mut self, i: usize, value: u8) {
        self.code[i] = value;
    }

    /// The four filterable code bytes.
    pub fn codes(&self) -> [u8; FILTER_CODES] {
        [self.code[0], self.code[1], self.code[2], self.code[3]]
    }

    /// The payload viewed as two 32-bit integers.
    pub fn ints(&self) -> [i32; 2] {
        let c = &self.code;
        [
            i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            i32::from_le_bytes([c[4], c[5], c[6], c[7]]),
        ]
    }

    /// The payload viewed as one 64-bit integer.
    pub fn int64(&self) -> i64 {
        i64::from_le_bytes(self.code)
    }

    /// The raw 8 payload bytes.
    pub fn payload(&self) -> [u8; 8] {
        self.code
    }
}

impl FixedRecord for Marker {
    const SIZE: usize = MARKER_SIZE;

    fn time(&self) -> Tick {
        self.time
    }

    fn encode(&self, out: &mut [u8]) {
        write_time(out, self.time);
        out[8..MARKER_SIZE].copy_from_slice(&self.code);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut code = [0; 8];
        code.copy_from_slice(&bytes[8..MARKER_SIZE]);
        Self {
            time: read_time(bytes),
            code,
        }
    }
}

/// Payload flavour of an extended marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtKind {
    /// Text bytes, NUL padded.
    Text,
    /// `f32` grid.
    Real,
    /// `i16` grid.
    Short,
}

impl ExtKind {
    /// Size of one payload element.
    pub fn elem_size(self) -> usize {
        match self {
            Self::Text => 1,
            Self::Real => 4,
            Self::Short => 2,
        }
    }
}

/// Shape of the payload attached to every extended marker of a channel.
///
/// For grids, `rows` is points per trace and `cols` the number of
/// interleaved traces: element `(row, col)` lives at `row * cols + col`.
/// For text, `rows` is the maximum length and `cols` is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtLayout {
    /// Payload flavour.
    pub kind: ExtKind,
    /// Points per trace (or characters).
    pub rows: usize,
    /// Interleaved traces.
    pub cols: usize,
    /// Points before the marker time (grids only).
    pub pre_trig: usize,
}

impl ExtLayout {
    /// Text payload of up to `len` bytes.
    pub fn text(len: usize) -> Self {
        Self {
            kind: ExtKind::Text,
            rows: len,
            cols: 1,
            pre_trig: 0,
        }
    }

    /// A sample grid of `rows` points by `cols` traces.
    pub fn grid(kind: ExtKind, rows: usize, cols: usize, pre_trig: usize) -> Self {
        Self {
            kind,
            rows,
            cols,
            pre_trig,
        }
    }

    /// Payload size in bytes, before padding.
    pub fn payload_bytes(&self) -> usize {
        self.rows * self.cols * self.kind.elem_size()
    }

    /// Record stride: marker plus payload, rounded up to 8 bytes.
    pub fn stride(&self) -> usize {
        align8(MARKER_SIZE + self.payload_bytes())
    }

    /// The runtime stride tag for this layout.
    pub fn dynamic(&self) -> Option<Dynamic> {
        Dynamic::new(self.stride())
    }
}

/// An owned extended marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtMark {
    /// The marker part (time and codes).
    pub marker: Marker,
    /// Raw little-endian payload.
    pub payload: Vec<u8>,
}

impl ExtMark {
    /// Text extended marker.
    pub fn text(marker: Marker, text: &str) -> Self {
        Self {
            marker,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Short-grid extended marker.
    pub fn shorts(marker: Marker, data: &[i16]) -> Self {
        Self {
            marker,
            payload: encode_samples(data),
        }
    }

    /// Float-grid extended marker.
    pub fn reals(marker: Marker, data: &[f32]) -> Self {
        Self {
            marker,
            payload: encode_samples(data),
        }
    }

    /// Marker time.
    pub fn time(&self) -> Tick {
        self.marker.time
    }

    /// Encodes into one record of `out.len()` bytes, zero filling the tail.
    /// A payload longer than the record is truncated.
    pub fn encode(&self, out: &mut [u8]) {
        self.marker.encode(out);
        let room = out.len() - MARKER_SIZE;
        let n = self.payload.len().min(room);
        out[MARKER_SIZE..MARKER_SIZE + n].copy_from_slice(&self.payload[..n]);
        out[MARKER_SIZE + n..].fill(0);
    }

    /// Decodes one record laid out as `layout`.
    pub fn decode(bytes: &[u8], layout: &ExtLayout) -> Self {
        let end = MARKER_SIZE + layout.payload_bytes();
        Self {
            marker: Marker::decode(bytes),
            payload: bytes[MARKER_SIZE..end].to_vec(),
        }
    }

    /// The payload as text, up to the first NUL.
    pub fn as_text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// The payload as `i16` samples.
    pub fn as_shorts(&self) -> Vec<i16> {
        decode_samples(&self.payload)
    }

    /// The payload as `f32` samples.
    pub fn as_reals(&self) -> Vec<f32> {
        decode_samples(&self.payload)
    }
}

fn encode_samples<S: Sample>(data: &[S]) -> Vec<u8> {
    let mut out = vec![0u8; data.len() * S::SIZE];
    for (chunk, &s) in out.chunks_exact_mut(S::SIZE).zip(data) {
        s.write_le(chunk);
    }
    out
}

fn decode_samples<S: Sample>(bytes: &[u8]) -> Vec<S> {
    bytes.chunks_exact(S::SIZE).map(S::read_le).collect()
}

/// What a reader needs to treat an extended marker grid as waveform data.
///
/// Row `i` of a record at time `t` is the sample at
/// `t - pre_trig * divide + i * divide`; `column` selects the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveGrid {
    /// Grid element type.
    pub kind: ExtKind,
    /// Ticks per sample.
    pub divide: Tick,
    /// Points per trace.
    pub rows: usize,
    /// Interleaved traces.
    pub cols: usize,
    /// Points before the marker time.
    pub pre_trig: usize,
    /// Trace to read.
    pub column: usize,
}

impl WaveGrid {
    /// Builds the grid description for a layout, clamping `column` to the traces present.
    pub fn new(layout: &ExtLayout, divide: Tick, column: usize) -> Self {
        Self {
            kind: layout.kind,
            divide,
            rows: layout.rows,
            cols: layout.cols,
            pre_trig: layout.pre_trig,
            column: column.min(layout.cols.saturating_sub(1)),
        }
    }

    /// Time of row 0 for a record at `time`.
    pub fn start_of(&self, time: Tick) -> Tick {
        time - self.pre_trig as Tick * self.divide
    }

    /// Time just after the last row for a record at `time`.
    pub fn end_of(&self, time: Tick) -> Tick {
        self.start_of(time) + self.rows as Tick * self.divide
    }

    /// Reads row `row` of the selected trace from an encoded record.
    pub fn sample<S: Sample>(&self, record: &[u8], row: usize) -> S {
        let at = MARKER_SIZE + (row * self.cols + self.column) * S::SIZE;
        S::read_le(&record[at..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_union_views() {
        let m = Marker::with_ints(5, [1, -2]);
        assert_eq!(m.ints(), [1, -2]);
        assert_eq!(m.codes(), [1, 0, 0, 0]);

        let m = Marker::with_int64(5, -7);
        assert_eq!(m.int64(), -7);

        let mut m = Marker::with_codes(9, [1, 2, 3, 4]);
        m.set_code(6, 42);
        assert_eq!(m.code(6), 42);
        assert_eq!(m.codes(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_marker_encoding() {
        let m = Marker::with_codes(123_456, [9, 8, 7, 6]);
        let mut buf = [0u8; MARKER_SIZE];
        m.encode(&mut buf);
        assert_eq!(read_time(&buf), 123_456);
        assert_eq!(Marker::decode(&buf), m);
    }

    #[test]
    fn test_layout_stride() {
        assert_eq!(ExtLayout::text(1).stride(), 24);
        assert_eq!(ExtLayout::text(8).stride(), 24);
        assert_eq!(ExtLayout::grid(ExtKind::Short, 3, 2, 0).stride(), 32);
        assert_eq!(ExtLayout::grid(ExtKind::Real, 4, 1, 1).stride(), 32);
        assert!(ExtLayout::text(5).dynamic().is_some());
    }

    #[test]
    fn test_ext_mark_text() {
        let layout = ExtLayout::text(10);
        let mark = ExtMark::text(Marker::with_codes(50, [1, 0, 0, 0]), "hello");
        let mut buf = vec![0xffu8; layout.stride()];
        mark.encode(&mut buf);
        let back = ExtMark::decode(&buf, &layout);
        assert_eq!(back.time(), 50);
        assert_eq!(back.as_text(), "hello");
        assert_eq!(back.payload.len(), 10);
    }

    #[test]
    fn test_grid_sample_addressing() {
        // 3 rows x 2 traces, interleaved
        let layout = ExtLayout::grid(ExtKind::Short, 3, 2, 1);
        let mark = ExtMark::shorts(Marker::new(100), &[10, 20, 11, 21, 12, 22]);
        let mut buf = vec![0u8; layout.stride()];
        mark.encode(&mut buf);

        let grid = WaveGrid::new(&layout, 10, 1);
        assert_eq!(grid.start_of(100), 90);
        assert_eq!(grid.end_of(100), 120);
        assert_eq!(grid.sample::<i16>(&buf, 0), 20);
        assert_eq!(grid.sample::<i16>(&buf, 2), 22);

        let clamped = WaveGrid::new(&layout, 10, 7);
        assert_eq!(clamped.column, 1);
    }
}
