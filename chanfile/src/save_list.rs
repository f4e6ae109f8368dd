//! Retrospective save/discard bookkeeping for one channel.
//!
//! Buffered data is only committed when it is about to leave the circular
//! buffer, so the decision to keep or drop it can be made after it arrived.
//! [`SaveList`] records that decision as a sorted list of toggle times and
//! the state at the start:
//!
//! ```text
//! save_at_start = true, toggles = [100, 200, 500]
//!
//!  0         100        200                  500
//!  |== save ==|-- drop --|======= save =======|-- drop -->
//! ```
//!
//! The state at `t` is `save_at_start` flipped once for every toggle `<= t`.
//! The list never holds duplicate or no-op toggles. None of the operations
//! fail: empty or inverted ranges are ignored.

use std::ops::Range;

use crate::time::{MAX_TIME, Tick};

/// Summary of a list's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    /// No toggles, everything is saved.
    AllSaved,
    /// No toggles, everything is discarded.
    NoneSaved,
    /// Alternating save and discard spans.
    Mixed,
}

/// Sorted save/no-save toggle list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveList {
    first: Tick,
    save_at_start: bool,
    toggles: Vec<Tick>,
    iter: Option<SpanCursor>,
}

/// Position of an in-flight span walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpanCursor {
    /// Time the next span may start at.
    at: Tick,
    /// Number of toggles `<= at`.
    index: usize,
    /// Ceiling for reported spans.
    upto: Tick,
}

impl Default for SaveList {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SaveList {
    /// Creates an empty list with the given start state.
    pub fn new(save: bool) -> Self {
        Self {
            first: 0,
            save_at_start: save,
            toggles: Vec::new(),
            iter: None,
        }
    }

    /// The earliest time still tracked.
    pub fn first_time(&self) -> Tick {
        self.first
    }

    /// State before the first toggle.
    pub fn save_at_start(&self) -> bool {
        self.save_at_start
    }

    /// The toggle times, sorted.
    pub fn toggles(&self) -> &[Tick] {
        &self.toggles
    }

    /// Summary state.
    pub fn state(&self) -> SaveState {
        match (self.toggles.is_empty(), self.save_at_start) {
            (true, true) => SaveState::AllSaved,
            (true, false) => SaveState::NoneSaved,
            (false, _) => SaveState::Mixed,
        }
    }

    /// Number of toggles at or before `t`.
    fn count_upto(&self, t: Tick) -> usize {
        self.toggles.partition_point(|&x| x <= t)
    }

    /// Number of toggles strictly before `t`.
    fn count_before(&self, t: Tick) -> usize {
        self.toggles.partition_point(|&x| x < t)
    }

    fn state_after(&self, count: usize) -> bool {
        self.save_at_start ^ (count % 2 == 1)
    }

    /// Whether data at `t` is to be saved.
    pub fn is_saving(&self, t: Tick) -> bool {
        self.state_after(self.count_upto(t))
    }

    /// Sets the state from `t` onwards, discarding any later toggles.
    pub fn set_save(&mut self, t: Tick, save: bool) {
        if t <= self.first {
            self.save_at_start = save;
            self.toggles.clear();
            return;
        }

        let keep = self.count_before(t);
        self.toggles.truncate(keep);
        if self.state_after(keep) != save {
            self.toggles.push(t);
        }
    }

    /// Marks `[from, upto)` as saved, leaving the state outside it unchanged.
    pub fn save_range(&mut self, from: Tick, upto: Tick) {
        if from >= upto || upto <= self.first {
            return;
        }

        let lo = if from <= self.first {
            0
        } else {
            self.count_before(from)
        };
        let hi = self.count_upto(upto);
        let after = self.state_after(hi);

        let mut replacement = Vec::with_capacity(2);
        if from <= self.first {
            self.save_at_start = true;
        } else if !self.state_after(lo) {
            replacement.push(from);
        }
        if !after {
            replacement.push(upto);
        }
        self.toggles.splice(lo..hi, replacement);
    }

    /// Forgets history before `t`, keeping the state at and after `t`.
    pub fn set_first_time(&mut self, t: Tick) {
        if t <= self.first {
            return;
        }
        let n = self.count_upto(t);
        if n % 2 == 1 {
            self.save_at_start = !self.save_at_start;
        }
        self.toggles.drain(..n);
        self.first = t;
    }

    /// Prunes toggles in a span with no data.
    ///
    /// Toggles strictly between `last_data` and `reached` affect nothing but
    /// the parity beyond `reached`. When there are more than `keep + 1` of them
    /// the oldest are removed, always an even number, leaving the newest.
    pub fn set_dead_range(&mut self, last_data: Tick, reached: Tick, keep: usize) {
        if reached <= last_data {
            return;
        }
        let lo = self.count_upto(last_data);
        let hi = self.count_before(reached);
        let n = hi.saturating_sub(lo);
        if n <= keep + 1 {
            return;
        }
        let mut remove = n - keep;
        if remove % 2 == 1 {
            remove -= 1;
        }
        self.toggles.drain(lo..lo + remove);
    }

    /// Starts a walk over saved spans of `[from, upto)` and returns the first.
    ///
    /// The walk state lives in the list, so only one walk may be in flight per
    /// list; [`SaveList::save_ranges`] is the borrowing alternative.
    pub fn first_save_range(&mut self, from: Tick, upto: Tick) -> Option<Range<Tick>> {
        let from = from.max(self.first);
        self.iter = Some(SpanCursor {
            at: from,
            index: self.count_upto(from),
            upto,
        });
        self.next_save_range()
    }

    /// Next saved span of the walk begun by [`SaveList::first_save_range`].
    pub fn next_save_range(&mut self) -> Option<Range<Tick>> {
        let mut cursor = self.iter?;
        let span = self.step(&mut cursor, true);
        self.iter = span.as_ref().map(|_| cursor);
        span
    }

    /// Iterates over saved spans clipped to `[from, upto)`.
    pub fn save_ranges(&self, from: Tick, upto: Tick) -> Spans<'_> {
        self.spans(from, upto, true)
    }

    /// Discarded spans overlapping `[from, upto)`, at most `max` of them.
    ///
    /// This is a snapshot for display: a writer changing the list at the same
    /// time makes it stale at once.
    pub fn no_save_list(&self, from: Tick, upto: Tick, max: usize) -> Vec<Range<Tick>> {
        self.spans(from, upto, false).take(max).collect()
    }

    fn spans(&self, from: Tick, upto: Tick, want: bool) -> Spans<'_> {
        let from = from.max(self.first);
        Spans {
            list: self,
            cursor: SpanCursor {
                at: from,
                index: self.count_upto(from),
                upto,
            },
            want,
            done: false,
        }
    }

    /// Advances `cursor` to the next span in state `want`.
    fn step(&self, cursor: &mut SpanCursor, want: bool) -> Option<Range<Tick>> {
        let mut start = cursor.at;
        let mut index = cursor.index;
        if self.state_after(index) != want {
            start = *self.toggles.get(index)?;
            index += 1;
        }
        if start >= cursor.upto {
            return None;
        }
        let end = self
            .toggles
            .get(index)
            .copied()
            .unwrap_or(MAX_TIME)
            .min(cursor.upto);
        cursor.at = end;
        cursor.index = index + 1;
        Some(start..end)
    }
}

/// Iterator over spans of one state; see [`SaveList::save_ranges`].
#[derive(Debug, Clone)]
pub struct Spans<'a> {
    list: &'a SaveList,
    cursor: SpanCursor,
    want: bool,
    done: bool,
}

impl Iterator for Spans<'_> {
    type Item = Range<Tick>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let span = self.list.step(&mut self.cursor, self.want);
        self.done = span.is_none();
        span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute-force coverage over `[0, until)`.
    fn coverage(list: &SaveList, until: Tick) -> Vec<bool> {
        (0..until).map(|t| list.is_saving(t)).collect()
    }

    fn assert_parity_invariant(list: &SaveList, until: Tick) {
        for t in 0..until {
            let n = list.toggles().iter().filter(|&&x| x <= t).count();
            assert_eq!(list.is_saving(t), list.save_at_start() ^ (n % 2 == 1), "t={t}");
        }
        assert!(list.toggles().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_initial_states() {
        assert_eq!(SaveList::new(true).state(), SaveState::AllSaved);
        assert_eq!(SaveList::new(false).state(), SaveState::NoneSaved);
        assert!(SaveList::default().is_saving(12345));
    }

    #[test]
    fn test_set_save_minimal() {
        let mut list = SaveList::new(true);
        list.set_save(100, true);
        assert!(list.toggles().is_empty());

        list.set_save(100, false);
        assert_eq!(list.toggles(), &[100]);
        list.set_save(150, false);
        assert_eq!(list.toggles(), &[100]);

        list.set_save(200, true);
        list.set_save(300, false);
        assert_eq!(list.toggles(), &[100, 200, 300]);
        assert_eq!(list.state(), SaveState::Mixed);

        // collapses everything from 150 on
        list.set_save(150, true);
        assert_eq!(list.toggles(), &[100, 150]);
    }

    #[test]
    fn test_set_save_at_start_overwrites() {
        let mut list = SaveList::new(true);
        list.set_save(100, false);
        list.set_save(0, false);
        assert!(list.toggles().is_empty());
        assert_eq!(list.state(), SaveState::NoneSaved);
    }

    #[test]
    fn test_save_coalescing_scenario() {
        let mut list = SaveList::new(true);
        list.set_save(100, false);
        list.save_range(200, 300);
        list.save_range(400, 500);
        list.save_range(300, 400);

        assert_eq!(list.toggles(), &[100, 200, 500]);
        let saved: Vec<_> = list.save_ranges(0, 1000).collect();
        assert_eq!(saved, vec![0..100, 200..500]);
        assert!(!list.is_saving(750));
    }

    #[test]
    fn test_save_range_idempotent() {
        let mut once = SaveList::new(false);
        once.save_range(10, 20);
        let mut twice = once.clone();
        twice.save_range(10, 20);
        assert_eq!(once, twice);
        assert_eq!(once.toggles(), &[10, 20]);
    }

    #[test]
    fn test_save_range_overlap_equivalent() {
        let mut a = SaveList::new(false);
        a.save_range(0, 100);
        a.save_range(50, 150);
        let mut b = SaveList::new(false);
        b.save_range(0, 150);
        assert_eq!(coverage(&a, 300), coverage(&b, 300));
    }

    #[test]
    fn test_save_range_inside_saved_is_noop() {
        let mut list = SaveList::new(true);
        list.set_save(500, false);
        let before = list.clone();
        list.save_range(100, 200);
        assert_eq!(list, before);
    }

    #[test]
    fn test_save_range_ignores_bad_input() {
        let mut list = SaveList::new(false);
        list.save_range(20, 10);
        list.save_range(10, 10);
        assert!(list.toggles().is_empty());

        list.set_first_time(100);
        list.save_range(10, 50);
        assert!(list.toggles().is_empty());
    }

    #[test]
    fn test_save_range_from_start() {
        let mut list = SaveList::new(false);
        list.save_range(0, 50);
        assert!(list.save_at_start());
        assert_eq!(list.toggles(), &[50]);
        assert!(list.is_saving(49));
        assert!(!list.is_saving(50));
    }

    #[test]
    fn test_save_range_ending_on_toggle() {
        let mut list = SaveList::new(false);
        list.save_range(100, 200);
        list.save_range(50, 100);
        assert_eq!(list.toggles(), &[50, 200]);
        assert_parity_invariant(&list, 300);
    }

    #[test]
    fn test_set_first_time_parity() {
        let mut list = SaveList::new(true);
        list.set_save(100, false);
        list.set_save(200, true);
        list.set_save(300, false);
        let tail = coverage(&list, 400)[150..].to_vec();

        list.set_first_time(150);
        assert_eq!(list.first_time(), 150);
        assert!(list.toggles().iter().all(|&t| t >= 150));
        assert!(!list.save_at_start());
        assert_eq!(coverage(&list, 400)[150..].to_vec(), tail);
        assert_parity_invariant(&list, 400);

        // a toggle exactly at the new first time is folded into the start state
        list.set_first_time(200);
        assert_eq!(list.toggles(), &[300]);
        assert!(list.save_at_start());
    }

    #[test]
    fn test_set_dead_range_keeps_parity() {
        let mut list = SaveList::new(true);
        for (i, t) in (110..=200).step_by(10).enumerate() {
            list.set_save(t, i % 2 == 1);
        }
        assert_eq!(list.toggles().len(), 10);
        let after = list.is_saving(1000);

        list.set_dead_range(100, 1000, 2);
        // 10 dead toggles, keep 2 -> remove 8
        assert_eq!(list.toggles(), &[190, 200]);
        assert_eq!(list.is_saving(1000), after);

        // within the keep allowance nothing changes
        let snapshot = list.clone();
        list.set_dead_range(100, 1000, 2);
        assert_eq!(list, snapshot);
    }

    #[test]
    fn test_set_dead_range_odd_excess() {
        let mut list = SaveList::new(true);
        for (i, t) in [10, 20, 30, 40, 50].into_iter().enumerate() {
            list.set_save(t, i % 2 == 1);
        }
        let after = list.is_saving(100);
        list.set_dead_range(0, 100, 2);
        // 5 toggles, 3 excess rounds down to 2
        assert_eq!(list.toggles(), &[30, 40, 50]);
        assert_eq!(list.is_saving(100), after);
    }

    #[test]
    fn test_stateful_walk() {
        let mut list = SaveList::new(true);
        list.set_save(100, false);
        list.save_range(200, 300);
        list.save_range(400, 500);

        assert_eq!(list.first_save_range(50, 450), Some(50..100));
        assert_eq!(list.next_save_range(), Some(200..300));
        assert_eq!(list.next_save_range(), Some(400..450));
        assert_eq!(list.next_save_range(), None);
        assert_eq!(list.next_save_range(), None);

        // starting inside a discard span skips to the next save
        assert_eq!(list.first_save_range(150, 1000), Some(200..300));
    }

    #[test]
    fn test_no_save_list() {
        let mut list = SaveList::new(true);
        list.set_save(100, false);
        list.save_range(200, 300);

        assert_eq!(list.no_save_list(0, 1000, 10), vec![100..200, 300..1000]);
        assert_eq!(list.no_save_list(150, 250, 10), vec![150..200]);
        assert_eq!(list.no_save_list(0, 1000, 1), vec![100..200]);
    }

    #[test]
    fn test_parity_invariant_random_sequence() {
        // deterministic pseudo-random mix of commands
        let mut list = SaveList::new(true);
        let mut seed: u64 = 0x2545_f491;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let a = (seed % 400) as Tick;
            let b = ((seed >> 16) % 400) as Tick;
            match seed % 3 {
                0 => list.set_save(a, seed & 8 == 0),
                1 => list.save_range(a.min(b), a.max(b)),
                _ => {
                    let mut reference = coverage(&list, 400);
                    list.save_range(a.min(b), a.max(b));
                    for t in a.min(b)..a.max(b) {
                        reference[t as usize] = true;
                    }
                    assert_eq!(coverage(&list, 400), reference);
                }
            }
            assert_parity_invariant(&list, 400);
        }
    }
}
