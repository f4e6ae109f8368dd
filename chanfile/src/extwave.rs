//! Extended marker grids read as waveform data.
//!
//! An extended marker at time `t` carrying a `rows x cols` grid contributes
//! `rows` samples of the selected trace, starting `pre_trig` sample intervals
//! before `t`. Consecutive records can overlap; a record's samples stop where
//! the next record's begin, both forwards and backwards, so every time has at
//! most one sample.
//!
//! The grid description travels in the cursor ([`TimeRange::with_grid`]).
//! Without one both operations do nothing.

use crate::filter::{FilterEffect, MarkerFilter};
use crate::search::{effect_for, passes};
use crate::stride::{Indexed, Sample, read_time};
use crate::time::{SearchOutcome, Tick, TimeRange, slots_before};

/// Finds the time of the `cursor.remaining()`th grid sample before `cursor.upto()`.
///
/// Each record visited (accepted or not) narrows `upto` to its first sample,
/// so an unsatisfied search leaves the cursor ready for the next older layer.
/// Yields with [`SearchOutcome::CallAgain`] when the cursor's yield counter
/// runs out.
pub fn prev_n_time_wave<Q: Indexed + ?Sized>(
    seq: &Q,
    cursor: &mut TimeRange,
    filter: Option<&dyn MarkerFilter>,
) -> SearchOutcome {
    let Some(grid) = cursor.grid().copied() else {
        return SearchOutcome::NotFound;
    };
    if seq.is_empty() || !cursor.has_range() {
        return SearchOutcome::NotFound;
    }
    let effect = effect_for(true, filter);
    if effect == FilterEffect::RejectAll {
        cursor.set_exhausted();
        return SearchOutcome::NotFound;
    }

    let div = grid.divide;
    let mut i = seq.lower_bound(cursor.upto() + grid.pre_trig as Tick * div);
    while i > 0 {
        i -= 1;
        let record = seq.record(i);
        let time = read_time(record);
        if grid.end_of(time) <= cursor.from() {
            cursor.set_exhausted();
            break;
        }
        let start = grid.start_of(time);
        if passes(effect, filter, record) {
            let lo = slots_before(cursor.from() - start, div);
            let hi = grid.rows.min(slots_before(cursor.upto() - start, div));
            let n = hi.saturating_sub(lo);
            if n > 0 && cursor.remaining() <= n {
                let found = start + (hi - cursor.remaining()) as Tick * div;
                cursor.set_done();
                return SearchOutcome::Found(found);
            }
            cursor.reduce(n);
        }
        if !cursor.set_upto(start.min(cursor.upto())) {
            break;
        }
        if i > 0 && cursor.tick_yield() {
            tracing::trace!(upto = cursor.upto(), "extended wave search yielding");
            return SearchOutcome::CallAgain;
        }
    }
    SearchOutcome::NotFound
}

/// Copies grid samples of the selected trace from the cursor interval into `out`.
///
/// Returns the count copied and the time of the first one. While the cursor's
/// first flag is set the read may begin at the first sample at or after
/// `from`; afterwards each record must continue exactly at `from`, and the
/// read stops at the first gap. The cursor's `from` ends just past the last
/// sample copied.
pub fn copy_wave<Q, S>(
    seq: &Q,
    cursor: &mut TimeRange,
    filter: Option<&dyn MarkerFilter>,
    out: &mut [S],
) -> Option<(usize, Tick)>
where
    Q: Indexed + ?Sized,
    S: Sample,
{
    let grid = cursor.grid().copied()?;
    if seq.is_empty() || !cursor.has_range() || out.is_empty() {
        return None;
    }
    let effect = effect_for(true, filter);
    if effect == FilterEffect::RejectAll {
        cursor.set_exhausted();
        return None;
    }

    let div = grid.divide;
    let post = (grid.rows - grid.pre_trig.min(grid.rows)) as Tick * div;
    let mut i = seq.lower_bound(cursor.from() - post + 1);
    let mut written = 0;
    let mut first_at = None;

    while i < seq.len() && written < out.len() && cursor.has_range() {
        let record = seq.record(i);
        let start = grid.start_of(read_time(record));
        if start >= cursor.upto() {
            break;
        }
        let mut count = grid.rows;
        if i + 1 < seq.len() {
            let next = grid.start_of(seq.time_at(i + 1));
            count = count.min(slots_before(next - start, div));
        }
        i += 1;
        if !passes(effect, filter, record) {
            continue;
        }

        let idx = slots_before(cursor.from() - start, div);
        if idx >= count {
            continue;
        }
        let t0 = start + idx as Tick * div;
        if t0 >= cursor.upto() || (!cursor.is_first() && t0 != cursor.from()) {
            break;
        }
        let last = count.min(slots_before(cursor.upto() - start, div));
        let n = (last - idx).min(out.len() - written).min(cursor.remaining());
        for (k, slot) in out[written..written + n].iter_mut().enumerate() {
            *slot = grid.sample::<S>(record, idx + k);
        }
        first_at.get_or_insert(t0);
        written += n;
        cursor.clear_first();
        cursor.reduce(n);
        cursor.set_from(t0 + n as Tick * div);
    }
    first_at.map(|t| (written, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CodeFilter;
    use crate::record::{ExtKind, ExtLayout, ExtMark, Marker, WaveGrid};
    use crate::stride::{Dynamic, RecordSlice, Stride};

    /// Records with 4 rows x 2 traces of shorts, pre-trigger 1, divide 10.
    /// Trace 0 holds `time + row`, trace 1 holds `-(time + row)`.
    fn grid_records(times: &[Tick]) -> (Vec<u8>, Dynamic, WaveGrid) {
        let layout = ExtLayout::grid(ExtKind::Short, 4, 2, 1);
        let stride = layout.dynamic().unwrap();
        let mut bytes = vec![0u8; times.len() * stride.bytes()];
        for (i, &t) in times.iter().enumerate() {
            let mut data = Vec::new();
            for row in 0..4 {
                let v = (t + row) as i16;
                data.push(v);
                data.push(-v);
            }
            let mark = ExtMark::shorts(Marker::with_codes(t, [i as u8, 0, 0, 0]), &data);
            mark.encode(&mut bytes[i * stride.bytes()..(i + 1) * stride.bytes()]);
        }
        (bytes, stride, WaveGrid::new(&layout, 10, 0))
    }

    #[test]
    fn test_copy_wave_contiguous_records() {
        // records at 110 and 150 cover 100..140 and 140..180
        let (bytes, stride, grid) = grid_records(&[110, 150]);
        let seq = RecordSlice::new(&bytes, stride);
        let mut out = [0i16; 16];
        let mut cursor = TimeRange::new(0, 1000, 100, true, 0).with_grid(grid);

        let (n, t0) = copy_wave(&seq, &mut cursor, None, &mut out).unwrap();
        assert_eq!((n, t0), (8, 100));
        assert_eq!(&out[..8], &[110, 111, 112, 113, 150, 151, 152, 153]);
        assert_eq!(cursor.from(), 180);
    }

    #[test]
    fn test_copy_wave_stops_at_gap() {
        let (bytes, stride, grid) = grid_records(&[110, 200]);
        let seq = RecordSlice::new(&bytes, stride);
        let mut out = [0i16; 16];
        let mut cursor = TimeRange::new(0, 1000, 100, true, 0).with_grid(grid);
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), Some((4, 100)));

        // the next call is not first and must start at 140, which has no data
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), None);
    }

    #[test]
    fn test_copy_wave_first_read_past_record_end() {
        let (bytes, stride, grid) = grid_records(&[110, 200]);
        let seq = RecordSlice::new(&bytes, stride);
        let mut out = [0i16; 16];

        // 135 lies after the last row of the first record (130)
        let mut cursor = TimeRange::new(135, 1000, 100, true, 0).with_grid(grid);
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), Some((4, 190)));
        assert_eq!(&out[..4], &[200, 201, 202, 203]);

        // no sample time falls inside 131..139
        let mut cursor = TimeRange::new(131, 139, 100, true, 0).with_grid(grid);
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), None);
        assert!(cursor.is_first());
    }

    #[test]
    fn test_copy_wave_overlap_later_wins() {
        // 110 covers 100..140, 130 starts at 120
        let (bytes, stride, grid) = grid_records(&[110, 130]);
        let seq = RecordSlice::new(&bytes, stride);
        let mut out = [0i16; 16];
        let mut cursor = TimeRange::new(0, 1000, 100, true, 0).with_grid(grid);
        let (n, _) = copy_wave(&seq, &mut cursor, None, &mut out).unwrap();
        assert_eq!(&out[..n], &[110, 111, 130, 131, 132, 133]);
    }

    #[test]
    fn test_copy_wave_first_flag_and_column() {
        let (bytes, stride, grid) = grid_records(&[110]);
        let seq = RecordSlice::new(&bytes, stride);
        let grid = WaveGrid { column: 1, ..grid };
        let mut out = [0i16; 8];

        let mut cursor = TimeRange::new(115, 1000, 100, true, 0).with_grid(grid);
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), Some((2, 120)));
        assert_eq!(&out[..2], &[-112, -113]);

        let mut cursor = TimeRange::new(115, 1000, 100, false, 0).with_grid(grid);
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), None);
    }

    #[test]
    fn test_copy_wave_filtered() {
        let (bytes, stride, grid) = grid_records(&[110, 150, 190]);
        let seq = RecordSlice::new(&bytes, stride);
        let filter = CodeFilter::only_codes(&[1]);
        let mut out = [0i16; 16];
        let mut cursor = TimeRange::new(0, 1000, 100, true, 0).with_grid(grid);
        assert_eq!(copy_wave(&seq, &mut cursor, Some(&filter), &mut out), Some((4, 140)));
        assert_eq!(&out[..4], &[150, 151, 152, 153]);
    }

    #[test]
    fn test_prev_n_wave_matches_forward_read() {
        let (bytes, stride, grid) = grid_records(&[110, 130, 200]);
        let seq = RecordSlice::new(&bytes, stride);

        // every sample time, oldest first: 100,110 | 120..150 | 190..220
        let all: Vec<Tick> = vec![100, 110, 120, 130, 140, 150, 190, 200, 210, 220];
        for k in 1..=all.len() {
            let mut cursor = TimeRange::new(0, 1000, k, false, 0).with_grid(grid);
            assert_eq!(
                prev_n_time_wave(&seq, &mut cursor, None),
                SearchOutcome::Found(all[all.len() - k]),
                "k = {k}"
            );
        }

        let mut cursor = TimeRange::new(0, 1000, all.len() + 2, false, 0).with_grid(grid);
        assert_eq!(prev_n_time_wave(&seq, &mut cursor, None), SearchOutcome::NotFound);
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.upto(), 100);
    }

    #[test]
    fn test_prev_n_wave_yields() {
        let times: Vec<Tick> = (0..10).map(|i| 1000 + i * 100).collect();
        let (bytes, stride, grid) = grid_records(&times);
        let seq = RecordSlice::new(&bytes, stride);
        let mut cursor = TimeRange::new(0, 10_000, 30, false, 2).with_grid(grid);
        let mut calls = 0;
        let outcome = loop {
            calls += 1;
            let outcome = prev_n_time_wave(&seq, &mut cursor, None);
            if !outcome.is_call_again() {
                break outcome;
            }
        };
        assert!(calls > 1);
        // 4 samples per record: the 30th sample back is row 2 of the third record
        assert_eq!(outcome, SearchOutcome::Found(1200 - 10 + 20));
    }

    #[test]
    fn test_no_grid_does_nothing() {
        let (bytes, stride, _) = grid_records(&[110]);
        let seq = RecordSlice::new(&bytes, stride);
        let mut cursor = TimeRange::new(0, 1000, 5, true, 0);
        let mut out = [0i16; 4];
        assert_eq!(copy_wave(&seq, &mut cursor, None, &mut out), None);
        assert_eq!(prev_n_time_wave(&seq, &mut cursor, None), SearchOutcome::NotFound);
        assert_eq!(cursor.remaining(), 5);
    }
}
