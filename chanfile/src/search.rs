//! Backward search and forward extraction over time-ordered records.
//!
//! The same two algorithm bodies serve the circular buffers and the on-disk
//! record blocks: both expose their records through [`Indexed`], and both
//! report progress by narrowing the caller's [`TimeRange`].
//!
//! # Backward search
//!
//! [`prev_n_time`] finds the `n`th qualifying record before `upto`:
//!
//! ```text
//!  records:  a    b    c    d    e  |  f     (| = upto, f excluded)
//!  n = 2  -> d
//!  n = 9  -> not found here; budget reduced by 5, upto narrowed to a
//! ```
//!
//! Half-open semantics throughout: a record exactly at `upto` is outside,
//! a record exactly at `from` is inside.

use crate::filter::{FilterEffect, MarkerFilter, effect_of};
use crate::record::Marker;
use crate::stride::{FixedRecord, Indexed};
use crate::time::{SearchOutcome, Tick, TimeRange};

/// Effect of `filter` on records of this shape. Records without a code are never filtered.
pub(crate) fn effect_for(filterable: bool, filter: Option<&dyn MarkerFilter>) -> FilterEffect {
    if filterable {
        effect_of(filter)
    } else {
        FilterEffect::AcceptAll
    }
}

/// Tests one encoded record against the filter.
#[inline]
pub(crate) fn passes(
    effect: FilterEffect,
    filter: Option<&dyn MarkerFilter>,
    record: &[u8],
) -> bool {
    match effect {
        FilterEffect::AcceptAll => true,
        FilterEffect::RejectAll => false,
        FilterEffect::PerItem => filter.is_some_and(|f| f.accepts(&Marker::decode(record))),
    }
}

/// Where an older layer should continue a backward search after this one
/// found nothing: the first record if the whole sequence was inside the
/// interval, else `from` (which ends the search).
fn floor_of<Q: Indexed + ?Sized>(seq: &Q, lo: usize, cursor: &TimeRange) -> Tick {
    if lo == 0 {
        seq.time_at(0)
    } else {
        cursor.from()
    }
}

/// Finds the `cursor.remaining()`th qualifying record before `cursor.upto()`.
///
/// On success the budget is zeroed and the record time returned. Otherwise
/// the budget is reduced by the records counted and `upto` is narrowed so the
/// caller can continue in an older layer. A per-item filtered walk may stop
/// early with [`SearchOutcome::CallAgain`] when the cursor's yield counter
/// runs out; the cursor then describes the remaining work.
pub fn prev_n_time<Q: Indexed + ?Sized>(
    seq: &Q,
    filterable: bool,
    cursor: &mut TimeRange,
    filter: Option<&dyn MarkerFilter>,
) -> SearchOutcome {
    if seq.is_empty() || !cursor.has_range() {
        return SearchOutcome::NotFound;
    }

    let hi = seq.lower_bound(cursor.upto());
    let lo = seq.lower_bound(cursor.from());
    if hi <= lo {
        let floor = floor_of(seq, lo, cursor);
        cursor.set_upto(floor.min(cursor.upto()));
        return SearchOutcome::NotFound;
    }

    match effect_for(filterable, filter) {
        FilterEffect::AcceptAll => {
            let n = hi - lo;
            if cursor.remaining() <= n {
                let index = hi - cursor.remaining();
                cursor.set_done();
                return SearchOutcome::Found(seq.time_at(index));
            }
            cursor.reduce(n);
            cursor.set_upto(floor_of(seq, lo, cursor));
            SearchOutcome::NotFound
        }
        FilterEffect::RejectAll => {
            // nothing older can match either
            cursor.set_exhausted();
            SearchOutcome::NotFound
        }
        FilterEffect::PerItem => {
            for i in (lo..hi).rev() {
                let record = seq.record(i);
                let time = Marker::decode(record).time;
                if passes(FilterEffect::PerItem, filter, record) {
                    if cursor.remaining() <= 1 {
                        cursor.set_done();
                        return SearchOutcome::Found(time);
                    }
                    cursor.reduce(1);
                }
                if i > lo && cursor.tick_yield() {
                    tracing::trace!(
                        upto = time,
                        remaining = cursor.remaining(),
                        "backward search yielding"
                    );
                    cursor.set_upto(time);
                    return SearchOutcome::CallAgain;
                }
            }
            cursor.set_upto(floor_of(seq, lo, cursor));
            SearchOutcome::NotFound
        }
    }
}

/// Copies qualifying records in `[from, upto)` to `sink`, oldest first,
/// spending one unit of budget per record copied. Returns the count copied.
///
/// On return the cursor tells the caller what happened:
/// - budget spent: `remaining() == 0`, `from` is the next unread record
/// - interval ends inside this sequence: the cursor is exhausted
/// - sequence ran out first: `from` moves past its last record and
///   `has_range()` stays true, so the next newer layer should be read
pub fn copy_forward<Q, F>(
    seq: &Q,
    filterable: bool,
    cursor: &mut TimeRange,
    filter: Option<&dyn MarkerFilter>,
    mut sink: F,
) -> usize
where
    Q: Indexed + ?Sized,
    F: FnMut(&[u8]),
{
    if seq.is_empty() || !cursor.has_range() {
        return 0;
    }

    let effect = effect_for(filterable, filter);
    let lo = seq.lower_bound(cursor.from());
    let hi = seq.lower_bound(cursor.upto());

    let mut copied = 0;
    let mut i = lo;
    while i < hi && cursor.remaining() > 0 {
        let record = seq.record(i);
        if passes(effect, filter, record) {
            sink(record);
            cursor.reduce(1);
            copied += 1;
        }
        i += 1;
    }
    if copied > 0 {
        cursor.clear_first();
    }

    if i < hi {
        cursor.set_from(seq.time_at(i));
    } else if hi < seq.len() {
        cursor.set_exhausted();
    } else {
        let past_last = seq.time_at(seq.len() - 1) + 1;
        cursor.set_from(past_last.max(cursor.from()));
    }
    copied
}

/// Typed wrapper over [`copy_forward`] that decodes into `out`.
pub fn read_forward<Q, R>(
    seq: &Q,
    filterable: bool,
    cursor: &mut TimeRange,
    filter: Option<&dyn MarkerFilter>,
    out: &mut Vec<R>,
) -> usize
where
    Q: Indexed + ?Sized,
    R: FixedRecord,
{
    copy_forward(seq, filterable, cursor, filter, |record| out.push(R::decode(record)))
}
