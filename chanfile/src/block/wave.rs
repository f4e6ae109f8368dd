//! Blocks of waveform runs.
//!
//! Samples are stored as a sequence of contiguous runs, each prefixed by a
//! run header giving its start time and sample count (see
//! [`crate::stride::WaveRuns`]). Data that continues the last run exactly is
//! appended to it; anything later starts a new run. An in-memory index of the
//! runs is rebuilt whenever an image is adopted.

use std::marker::PhantomData;

use tracing::trace;

use super::{BLOCK_HEADER_SIZE, BlockHeader, BlockImage, BlockKind, to_u32};
use crate::error::BlockError;
use crate::stride::{RUN_HEADER_SIZE, Sample, WaveRuns, run_bytes, write_run_header};
use crate::time::{SearchOutcome, Tick, TimeRange, slots_before};

/// Location of one run inside a waveform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    /// Time of the first sample.
    pub start: Tick,
    /// Samples in the run.
    pub count: usize,
    /// Byte offset of the run header within the payload.
    pub offset: usize,
}

impl RunInfo {
    /// Time just after the last sample.
    pub fn end(&self, divide: Tick) -> Tick {
        self.start + self.count as Tick * divide
    }
}

/// A block image holding runs of samples of type `S`.
#[derive(Debug, Clone)]
pub struct WaveBlock<S> {
    image: Vec<u8>,
    kind: BlockKind,
    chan: u16,
    divide: Tick,
    used: usize,
    runs: Vec<RunInfo>,
    _sample: PhantomData<S>,
}

impl<S: Sample> WaveBlock<S> {
    /// Creates an empty block image of `block_size` bytes.
    pub fn new(kind: BlockKind, chan: u16, block_size: usize, divide: Tick) -> Self {
        debug_assert!(block_size >= BLOCK_HEADER_SIZE + RUN_HEADER_SIZE + 8);
        let mut block = Self {
            image: vec![0; block_size],
            kind,
            chan,
            divide,
            used: 0,
            runs: Vec::new(),
            _sample: PhantomData,
        };
        block.sync_header();
        block
    }

    /// Adopts a stored image and rebuilds the run index.
    ///
    /// # Errors
    ///
    /// Returns a [`BlockError`] if the header is unreadable, does not
    /// describe a waveform block, or disagrees with the runs actually found.
    pub fn from_image(image: Vec<u8>, divide: Tick) -> Result<Self, BlockError> {
        let header = BlockHeader::read(&image)?;
        if !header.kind.is_wave() {
            return Err(BlockError::Corrupted {
                reason: format!("{:?} block read as waveform", header.kind),
            });
        }
        let used = header.used as usize;
        let payload = &image[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + used];
        let runs: Vec<RunInfo> = WaveRuns::<S>::new(payload, header.items as usize)
            .map(|run| RunInfo {
                start: run.start(),
                count: run.count(),
                offset: run.offset(),
            })
            .collect();
        let walked = runs.last().map_or(0, |r| r.offset + run_bytes::<S>(r.count));
        if runs.len() != header.items as usize || walked != used {
            return Err(BlockError::Corrupted {
                reason: format!(
                    "header lists {} runs in {used} bytes, found {} runs in {walked} bytes",
                    header.items,
                    runs.len()
                ),
            });
        }
        Ok(Self {
            image,
            kind: header.kind,
            chan: header.chan,
            divide,
            used,
            runs,
            _sample: PhantomData,
        })
    }

    fn sync_header(&mut self) {
        let (first, last) = match (self.runs.first(), self.runs.last()) {
            (Some(a), Some(b)) => (a.start, b.end(self.divide) - self.divide),
            _ => (0, 0),
        };
        let header = BlockHeader {
            kind: self.kind,
            chan: self.chan,
            items: to_u32(self.runs.len()),
            used: to_u32(self.used),
            first,
            last,
        };
        header.write(&mut self.image);
    }

    fn payload_cap(&self) -> usize {
        self.image.len() - BLOCK_HEADER_SIZE
    }

    /// Owning channel.
    pub fn chan(&self) -> u16 {
        self.chan
    }

    /// Ticks per sample.
    pub fn divide(&self) -> Tick {
        self.divide
    }

    /// Total samples held.
    pub fn len(&self) -> usize {
        self.runs.iter().map(|r| r.count).sum()
    }

    /// The run index.
    pub fn run_info(&self) -> &[RunInfo] {
        &self.runs
    }

    /// Walks the runs in the image.
    pub fn runs(&self) -> WaveRuns<'_, S> {
        let payload = &self.image[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + self.used];
        WaveRuns::new(payload, self.runs.len())
    }

    /// Time just after the last sample.
    pub fn end_time(&self) -> Option<Tick> {
        self.runs.last().map(|r| r.end(self.divide))
    }

    /// Empties the block for reuse.
    pub fn reset(&mut self) {
        self.used = 0;
        self.runs.clear();
        self.sync_header();
    }

    fn sample_at(&self, run: &RunInfo, i: usize) -> S {
        let at = BLOCK_HEADER_SIZE + run.offset + RUN_HEADER_SIZE + i * S::SIZE;
        S::read_le(&self.image[at..])
    }

    fn write_samples(&mut self, run: &RunInfo, first: usize, data: &[S]) {
        let mut at = BLOCK_HEADER_SIZE + run.offset + RUN_HEADER_SIZE + first * S::SIZE;
        for &s in data {
            s.write_le(&mut self.image[at..]);
            at += S::SIZE;
        }
    }

    /// Appends samples whose first element is at time `t`. Returns the count added.
    ///
    /// Data continuing the last run exactly extends it; data after its end
    /// starts a new run. Data overlapping the last run is refused. A full
    /// block is recycled first; the caller must already have stored it. A
    /// short add always leaves the block full.
    pub fn add_data(&mut self, data: &[S], t: Tick) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.is_full() {
            trace!(chan = self.chan, "recycling full waveform block");
            self.reset();
        }

        let n = match self.runs.last().copied() {
            Some(last) if t == last.end(self.divide) => {
                let samples_end = last.offset + RUN_HEADER_SIZE + last.count * S::SIZE;
                let n = data.len().min((self.payload_cap() - samples_end) / S::SIZE);
                self.write_samples(&last, last.count, &data[..n]);
                let idx = self.runs.len() - 1;
                let run = &mut self.runs[idx];
                run.count += n;
                let (offset, count) = (run.offset, run.count);
                write_run_header(&mut self.image[BLOCK_HEADER_SIZE + offset..], last.start, count);
                self.used = offset + run_bytes::<S>(count);
                n
            }
            Some(last) if t < last.end(self.divide) => return 0,
            _ => {
                let offset = self.used;
                let room = (self.payload_cap() - offset).saturating_sub(RUN_HEADER_SIZE) / S::SIZE;
                let n = data.len().min(room);
                if n == 0 {
                    return 0;
                }
                let run = RunInfo { start: t, count: n, offset };
                write_run_header(&mut self.image[BLOCK_HEADER_SIZE + offset..], t, n);
                self.write_samples(&run, 0, &data[..n]);
                self.runs.push(run);
                self.used = offset + run_bytes::<S>(n);
                n
            }
        };
        self.sync_header();
        n
    }

    /// Reads samples from one contiguous run into `out`.
    ///
    /// Returns the count read and the time of the first sample. While the
    /// cursor's first flag is set the read may start at the first sample at
    /// or after `from`; otherwise it must start exactly at `from`. The
    /// cursor's `from` ends just past the last sample read, so calling again
    /// continues with the next run if it is contiguous.
    pub fn get_data(&self, out: &mut [S], cursor: &mut TimeRange) -> Option<(usize, Tick)> {
        if self.runs.is_empty() || out.is_empty() || !cursor.has_range() {
            return None;
        }
        let div = self.divide;
        let from = cursor.from();
        // first run whose last sample is at or after `from`
        let ri = self.runs.partition_point(|r| r.end(div) - div < from);
        let run = self.runs.get(ri)?;
        let idx = slots_before(from - run.start, div);
        let t0 = run.start + idx as Tick * div;
        if t0 >= cursor.upto() || (!cursor.is_first() && t0 != from) {
            return None;
        }
        let last = run.count.min(slots_before(cursor.upto() - run.start, div));
        let n = last.saturating_sub(idx).min(out.len()).min(cursor.remaining());
        if n == 0 {
            return None;
        }
        for (k, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.sample_at(run, idx + k);
        }
        cursor.clear_first();
        cursor.reduce(n);
        cursor.set_from(t0 + n as Tick * div);
        Some((n, t0))
    }

    /// Finds the time of the `cursor.remaining()`th sample before `cursor.upto()`.
    ///
    /// Binary search locates the newest run that starts before `upto`; each
    /// run is then counted in constant time.
    pub fn prev_n_time(&self, cursor: &mut TimeRange) -> SearchOutcome {
        if self.runs.is_empty() || !cursor.has_range() {
            return SearchOutcome::NotFound;
        }
        let div = self.divide;
        let ri = self.runs.partition_point(|r| r.start < cursor.upto());
        for run in self.runs[..ri].iter().rev() {
            let lo = slots_before(cursor.from() - run.start, div);
            let hi = run.count.min(slots_before(cursor.upto() - run.start, div));
            let n = hi.saturating_sub(lo);
            if n > 0 && cursor.remaining() <= n {
                let found = run.start + (hi - cursor.remaining()) as Tick * div;
                cursor.set_done();
                return SearchOutcome::Found(found);
            }
            cursor.reduce(n);
            if !cursor.set_upto(run.start) {
                return SearchOutcome::NotFound;
            }
        }
        SearchOutcome::NotFound
    }

    /// Overwrites stored samples with `data`, whose first element is at time
    /// `from`. Runs off the sample grid of `from` are left alone. Returns the
    /// count changed.
    pub fn change_wave(&mut self, data: &[S], from: Tick) -> usize {
        let div = self.divide;
        let span_end = from + data.len() as Tick * div;
        let mut changed = 0;
        for ri in 0..self.runs.len() {
            let run = self.runs[ri];
            if run.start >= span_end || run.end(div) <= from {
                continue;
            }
            let offset = run.start - from;
            if offset.rem_euclid(div) != 0 {
                continue;
            }
            // index into `data` of the run's first sample
            let d0 = offset / div;
            let lo = if d0 < 0 { d0.unsigned_abs() as usize } else { 0 };
            let hi = run.count.min((data.len() as Tick - d0) as usize);
            if lo >= hi {
                continue;
            }
            let src = (lo as Tick + d0) as usize;
            self.write_samples(&run, lo, &data[src..src + hi - lo]);
            changed += hi - lo;
        }
        changed
    }
}

impl<S: Sample> BlockImage for WaveBlock<S> {
    fn image(&self) -> &[u8] {
        &self.image
    }

    fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Full once there is no room for another run header and one aligned word.
    fn is_full(&self) -> bool {
        self.payload_cap() - self.used < RUN_HEADER_SIZE + 8
    }

    fn first_time(&self) -> Option<Tick> {
        self.runs.first().map(|r| r.start)
    }

    fn last_time(&self) -> Option<Tick> {
        self.end_time().map(|t| t - self.divide)
    }
}
