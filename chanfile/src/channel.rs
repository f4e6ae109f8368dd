//! Channels: the write and read paths over buffer, write block and store.
//!
//! Data written to a channel lands in its circular buffer. As the buffer
//! fills, its oldest items are committed: the spans the save list marks as
//! saved are copied into the channel's write block, and the rest is dropped.
//! A full write block goes to the [`BlockStore`] and is recycled.
//!
//! Reads and backward searches see the three layers as one time-ordered
//! sequence. Store blocks come first, then the write block, then the buffer;
//! older layers are capped at the first buffered time so that data both
//! committed and still buffered is seen once.
//!
//! ```text
//!   store blocks         write block       circular buffer
//!  [....][....][....]  [......      ]    [ committed | pending ]
//!                                         ^ first buffered time
//! ```
//!
//! Waveform corrections ([`Channel::change_wave`]) reach buffered samples at
//! once; samples that were already committed are rewritten on disk at the
//! next commit.

use std::any::Any;
use std::ops::Range;

use tracing::{debug, trace, warn};

use crate::block::{BlockImage, DataBlock, RecordBlock, WaveBlock, ext_stride};
use crate::circ::CircBuffer;
use crate::circ_wave::CircWaveBuffer;
use crate::config::{ChannelConfig, ChannelKind};
use crate::error::{ChanError, ConfigError, Result, WriteError};
use crate::extwave;
use crate::filter::MarkerFilter;
use crate::record::{ExtLayout, ExtMark, MARKER_SIZE, Marker, WaveGrid};
use crate::save_list::SaveList;
use crate::store::BlockStore;
use crate::stride::{Dynamic, Fixed, FixedRecord, Sample, Stride, TIME_SIZE, read_time};
use crate::time::{MAX_TIME, SearchOutcome, Tick, TimeRange, slots_before};

/// The block being filled and the store slot holding its image, if any.
#[derive(Debug)]
struct Pending<B> {
    block: B,
    stored: Option<usize>,
    /// The stored image matches the block.
    synced: bool,
}

impl<B: BlockImage> Pending<B> {
    fn new(block: B) -> Self {
        Self {
            block,
            stored: None,
            synced: true,
        }
    }

    /// Store blocks of `chan` that are older than the write block.
    fn older<T: BlockStore + ?Sized>(&self, store: &T, chan: u16) -> usize {
        store.block_count(chan) - usize::from(self.stored.is_some())
    }

    /// Writes the block image to the store, in place once it has a slot.
    fn store<T: BlockStore + ?Sized>(&mut self, store: &mut T, chan: u16) -> Result<()> {
        if self.block.is_empty() || (self.synced && self.stored.is_some()) {
            return Ok(());
        }
        match self.stored {
            Some(index) => store.update(chan, index, self.block.image())?,
            None => {
                let index = store.append(chan, self.block.image())?;
                debug!(chan, index, "stored write block");
                self.stored = Some(index);
            }
        }
        self.synced = true;
        Ok(())
    }

    /// Makes sure a full block is stored before the next add recycles it.
    fn make_room<T: BlockStore + ?Sized>(&mut self, store: &mut T, chan: u16) -> Result<()> {
        if self.block.is_full() {
            self.store(store, chan)?;
            self.stored = None;
        }
        Ok(())
    }
}

impl<S: Stride> Pending<RecordBlock<S>> {
    fn write<T: BlockStore + ?Sized>(
        &mut self,
        mut records: &[u8],
        store: &mut T,
        chan: u16,
    ) -> Result<()> {
        let s = self.block.stride().bytes();
        while !records.is_empty() {
            self.make_room(store, chan)?;
            let n = self.block.add_data(records);
            if n == 0 {
                return Err(WriteError::BlockRefused {
                    chan,
                    time: read_time(records),
                }
                .into());
            }
            self.synced = false;
            records = &records[n * s..];
            if self.block.is_full() {
                self.store(store, chan)?;
            }
        }
        Ok(())
    }

    /// Applies an edit to the write block, restoring it if it has a slot.
    fn edit<T: BlockStore + ?Sized>(
        &mut self,
        record: &[u8],
        store: &mut T,
        chan: u16,
    ) -> Result<bool> {
        if !self.block.edit_marker(record) {
            return Ok(false);
        }
        self.synced = false;
        if self.stored.is_some() {
            self.store(store, chan)?;
        }
        Ok(true)
    }
}

impl<S: Sample> Pending<WaveBlock<S>> {
    fn write<T: BlockStore + ?Sized>(
        &mut self,
        mut data: &[S],
        mut t: Tick,
        store: &mut T,
        chan: u16,
    ) -> Result<()> {
        let div = self.block.divide();
        while !data.is_empty() {
            self.make_room(store, chan)?;
            let n = self.block.add_data(data, t);
            if n == 0 {
                return Err(WriteError::BlockRefused { chan, time: t }.into());
            }
            self.synced = false;
            data = &data[n..];
            t += n as Tick * div;
            if self.block.is_full() {
                self.store(store, chan)?;
            }
        }
        Ok(())
    }

    /// Rewrites samples of `[from, from + data.len() * divide)` in the
    /// older store blocks and the write block. Returns the count changed.
    fn change<T: BlockStore + ?Sized>(
        &mut self,
        data: &[S],
        from: Tick,
        store: &mut T,
        chan: u16,
    ) -> Result<usize> {
        let div = self.block.divide();
        let end = from + data.len() as Tick * div;
        let older = self.older(store, chan);
        let mut changed = 0;

        let mut i = store.first_ending_at_or_after(chan, from);
        while i < older && store.span(chan, i).is_some_and(|s| s.first < end) {
            let mut block = WaveBlock::<S>::from_image(store.load(chan, i)?, div)?;
            let n = block.change_wave(data, from);
            if n > 0 {
                store.update(chan, i, block.image())?;
                changed += n;
            }
            i += 1;
        }

        let n = self.block.change_wave(data, from);
        if n > 0 {
            self.synced = false;
            if self.stored.is_some() {
                self.store(store, chan)?;
            }
            changed += n;
        }
        Ok(changed)
    }
}

/// Runs `search` over the store blocks of `chan` below `older`, newest first,
/// starting at the last block that begins before `before`. `search` returns
/// `Some` to stop.
fn search_back<T, F>(
    store: &T,
    chan: u16,
    older: usize,
    before: Tick,
    mut search: F,
) -> Result<SearchOutcome>
where
    T: BlockStore + ?Sized,
    F: FnMut(Vec<u8>) -> Result<Option<SearchOutcome>>,
{
    let Some(last) = store.last_starting_before(chan, before) else {
        return Ok(SearchOutcome::NotFound);
    };
    for i in (0..older.min(last + 1)).rev() {
        if let Some(outcome) = search(store.load(chan, i)?)? {
            return Ok(outcome);
        }
    }
    Ok(SearchOutcome::NotFound)
}

/// Whether a layer's answer ends a backward search.
fn settled(outcome: SearchOutcome, cursor: &TimeRange) -> bool {
    outcome != SearchOutcome::NotFound || !cursor.has_range()
}

/// Samples gathered from several layers into one output slice.
struct WaveFill<'a, S> {
    out: &'a mut [S],
    written: usize,
    first: Option<Tick>,
}

impl<'a, S> WaveFill<'a, S> {
    fn new(out: &'a mut [S]) -> Self {
        Self {
            out,
            written: 0,
            first: None,
        }
    }

    fn is_full(&self) -> bool {
        self.written == self.out.len()
    }

    fn room(&mut self) -> &mut [S] {
        &mut self.out[self.written..]
    }

    /// Accounts for one layer read. Returns false if it produced nothing.
    fn took(&mut self, got: Option<(usize, Tick)>) -> bool {
        let Some((n, t)) = got else {
            return false;
        };
        self.first.get_or_insert(t);
        self.written += n;
        true
    }

    fn finish(self) -> Option<(usize, Tick)> {
        self.first.map(|t| (self.written, t))
    }
}

/// Buffer and write path for record channels.
#[derive(Debug)]
struct RecordLane<S> {
    buf: CircBuffer<S>,
    out: Pending<RecordBlock<S>>,
    /// Buffered records before this time have been committed or dropped.
    committed: Tick,
}

impl<S: Stride> RecordLane<S> {
    fn new(config: &ChannelConfig, chan: u16, block_size: usize, stride: S) -> Self {
        Self {
            buf: CircBuffer::new(config.buffer_items, stride),
            out: Pending::new(RecordBlock::new(config.kind.block_kind(), chan, block_size, stride)),
            committed: Tick::MIN,
        }
    }

    fn stride(&self) -> S {
        self.buf.stride()
    }

    /// Buffers encoded records, draining the oldest when the buffer is full.
    fn append<T>(
        &mut self,
        mut records: &[u8],
        saves: &mut SaveList,
        store: &mut T,
        chan: u16,
    ) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        let s = self.stride().bytes();
        loop {
            let n = self.buf.add(records);
            records = &records[n * s..];
            if records.is_empty() {
                return Ok(());
            }
            let want = (records.len() / s).max(self.buf.capacity() / 8).max(1);
            self.drain(want.min(self.buf.len()), saves, store, chan)?;
        }
    }

    /// Commits and frees the `n` oldest buffered records.
    fn drain<T>(&mut self, n: usize, saves: &mut SaveList, store: &mut T, chan: u16) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        let upto = if n < self.buf.len() {
            self.buf.time(n)
        } else {
            self.buf.time(n - 1) + 1
        };
        self.commit(upto, saves, store, chan)?;
        self.buf.free(n);
        saves.set_first_time(self.buf.first_time().unwrap_or(upto));
        trace!(chan, freed = n, upto, "drained record buffer");
        Ok(())
    }

    /// Copies the saved spans of buffered records before `upto` into the write block.
    fn commit<T>(
        &mut self,
        upto: Tick,
        saves: &mut SaveList,
        store: &mut T,
        chan: u16,
    ) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        let Some(last) = self.buf.last_time() else {
            return Ok(());
        };
        let upto = upto.min(last + 1);
        if upto <= self.committed {
            return Ok(());
        }
        let mut span = saves.first_save_range(self.committed, upto);
        while let Some(range) = span {
            for records in self.buf.byte_spans(range.start, range.end) {
                self.out.write(records, store, chan)?;
            }
            span = saves.next_save_range();
        }
        self.committed = upto;
        Ok(())
    }

    fn flush<T>(&mut self, saves: &mut SaveList, store: &mut T, chan: u16) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        self.commit(Tick::MAX, saves, store, chan)?;
        self.out.store(store, chan)
    }

    /// Removes the newest buffered record if it is at `t` and not yet committed.
    fn take_back(&mut self, t: Tick) -> bool {
        self.buf.last_time() == Some(t) && t >= self.committed && self.buf.sub()
    }

    fn read<T, F>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        store: &T,
        chan: u16,
        mut sink: F,
    ) -> Result<usize>
    where
        T: BlockStore + ?Sized,
        F: FnMut(&[u8]),
    {
        let upto = cursor.upto();
        let buffered = self.buf.first_time();
        let mut copied = 0;

        if buffered.is_none_or(|first| cursor.from() < first) {
            if let Some(first) = buffered {
                cursor.set_upto(first.min(upto));
            }
            let older = self.out.older(store, chan);
            let mut i = store.first_ending_at_or_after(chan, cursor.from());
            while i < older && cursor.has_range() {
                let block = RecordBlock::from_image(store.load(chan, i)?, self.stride())?;
                copied += block.get_data(cursor, filter, &mut sink);
                i += 1;
            }
            if cursor.has_range() {
                copied += self.out.block.get_data(cursor, filter, &mut sink);
            }

            let done = cursor.remaining() == 0;
            cursor.set_upto(upto);
            if done {
                return Ok(copied);
            }
            if let Some(first) = buffered {
                cursor.set_from(cursor.from().max(first));
            }
        }
        copied += self.buf.copy_range(cursor, filter, &mut sink);
        Ok(copied)
    }

    fn prev_n_time<T>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        store: &T,
        chan: u16,
    ) -> Result<SearchOutcome>
    where
        T: BlockStore + ?Sized,
    {
        let outcome = self.buf.prev_n_time(cursor, filter);
        if settled(outcome, cursor) {
            return Ok(outcome);
        }
        let outcome = self.out.block.prev_n_time(cursor, filter);
        if settled(outcome, cursor) {
            return Ok(outcome);
        }
        let stride = self.stride();
        search_back(store, chan, self.out.older(store, chan), cursor.upto(), |image| {
            let block = RecordBlock::from_image(image, stride)?;
            let outcome = block.prev_n_time(cursor, filter);
            Ok(settled(outcome, cursor).then_some(outcome))
        })
    }

    /// Overwrites the record at the time of `record` in every layer holding it.
    fn edit<T>(&mut self, record: &[u8], store: &mut T, chan: u16) -> Result<bool>
    where
        T: BlockStore + ?Sized,
    {
        let time = read_time(record);
        let mut hit = self.buf.edit(record);
        hit |= self.out.edit(record, store, chan)?;

        let older = self.out.older(store, chan);
        if let Some(i) = store.last_starting_before(chan, time + 1)
            && i < older
        {
            let mut block = RecordBlock::from_image(store.load(chan, i)?, self.stride())?;
            if block.edit_marker(record) {
                store.update(chan, i, block.image())?;
                hit = true;
            }
        }
        Ok(hit)
    }
}

impl RecordLane<Dynamic> {
    fn read_wave<T, V>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        store: &T,
        chan: u16,
        out: &mut [V],
    ) -> Result<Option<(usize, Tick)>>
    where
        T: BlockStore + ?Sized,
        V: Sample,
    {
        let Some(grid) = cursor.grid().copied() else {
            return Ok(None);
        };
        let post = (grid.rows - grid.pre_trig.min(grid.rows)) as Tick * grid.divide;
        let mut fill = WaveFill::new(out);
        let upto = cursor.upto();
        let buffered = self.buf.first_time().map(|t| grid.start_of(t));

        if buffered.is_none_or(|start| cursor.from() < start) {
            if let Some(start) = buffered {
                cursor.set_upto(start.min(upto));
            }
            let older = self.out.older(store, chan);
            let mut i = store.first_ending_at_or_after(chan, cursor.from() - post + 1);
            while i < older && cursor.has_range() && !fill.is_full() {
                // a later block cannot continue the read across a gap
                if !cursor.is_first()
                    && store
                        .span(chan, i)
                        .is_some_and(|s| grid.start_of(s.first) > cursor.from())
                {
                    break;
                }
                let block = RecordBlock::from_image(store.load(chan, i)?, self.stride())?;
                let got = block.get_wave(cursor, filter, fill.room());
                fill.took(got);
                i += 1;
            }
            if cursor.has_range() && !fill.is_full() {
                let got = self.out.block.get_wave(cursor, filter, fill.room());
                fill.took(got);
            }
            cursor.set_upto(upto);
        }
        if cursor.has_range() && !fill.is_full() {
            let got = extwave::copy_wave(&self.buf, cursor, filter, fill.room());
            fill.took(got);
        }
        Ok(fill.finish())
    }

    fn prev_n_time_wave<T>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        store: &T,
        chan: u16,
    ) -> Result<SearchOutcome>
    where
        T: BlockStore + ?Sized,
    {
        let Some(grid) = cursor.grid().copied() else {
            return Ok(SearchOutcome::NotFound);
        };
        let outcome = extwave::prev_n_time_wave(&self.buf, cursor, filter);
        if settled(outcome, cursor) {
            return Ok(outcome);
        }
        let outcome = self.out.block.prev_n_time_wave(cursor, filter);
        if settled(outcome, cursor) {
            return Ok(outcome);
        }
        let stride = self.stride();
        let before = cursor.upto() + grid.pre_trig as Tick * grid.divide;
        search_back(store, chan, self.out.older(store, chan), before, |image| {
            let block = RecordBlock::from_image(image, stride)?;
            let outcome = block.prev_n_time_wave(cursor, filter);
            Ok(settled(outcome, cursor).then_some(outcome))
        })
    }
}

/// Buffer and write path for waveform channels.
#[derive(Debug)]
struct WaveLane<S> {
    buf: CircWaveBuffer<S>,
    out: Pending<WaveBlock<S>>,
    /// Buffered samples before this time have been committed or dropped.
    committed: Tick,
}

impl<S: Sample> WaveLane<S> {
    fn new(config: &ChannelConfig, chan: u16, block_size: usize) -> Self {
        Self {
            buf: CircWaveBuffer::new(config.buffer_items, config.divide),
            out: Pending::new(WaveBlock::new(
                config.kind.block_kind(),
                chan,
                block_size,
                config.divide,
            )),
            committed: Tick::MIN,
        }
    }

    /// Buffers samples starting at `t`. Data that does not continue the
    /// buffer exactly starts over: everything buffered is drained first.
    fn append<T>(
        &mut self,
        mut data: &[S],
        mut t: Tick,
        saves: &mut SaveList,
        store: &mut T,
        chan: u16,
    ) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        if let Some(end) = self.buf.end_time()
            && end != t
        {
            debug!(chan, end, t, "waveform gap, draining buffer");
            self.drain(self.buf.len(), saves, store, chan)?;
        }
        let div = self.buf.divide();
        loop {
            let n = self.buf.add(data, t);
            data = &data[n..];
            t += n as Tick * div;
            if data.is_empty() {
                return Ok(());
            }
            let want = data.len().max(self.buf.capacity() / 8).max(1);
            self.drain(want.min(self.buf.len()), saves, store, chan)?;
        }
    }

    fn drain<T>(&mut self, n: usize, saves: &mut SaveList, store: &mut T, chan: u16) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        let upto = self.buf.time_of(n);
        self.commit(upto, saves, store, chan)?;
        self.buf.free(n);
        saves.set_first_time(self.buf.first_time().unwrap_or(upto));
        trace!(chan, freed = n, upto, "drained waveform buffer");
        Ok(())
    }

    /// Rewrites corrected samples already on disk, then copies the saved
    /// spans of buffered samples before `upto` into the write block.
    fn commit<T>(
        &mut self,
        upto: Tick,
        saves: &mut SaveList,
        store: &mut T,
        chan: u16,
    ) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        let (Some(first), Some(end)) = (self.buf.first_time(), self.buf.end_time()) else {
            return Ok(());
        };
        if let Some(dirty) = self.buf.dirty()
            && dirty < self.committed
        {
            for (t, data) in self.buf.slices(dirty, self.committed) {
                self.out.change(data, t, store, chan)?;
            }
        }

        let upto = upto.min(end);
        if upto > self.committed {
            let mut span = saves.first_save_range(self.committed.max(first), upto);
            while let Some(range) = span {
                for (t, data) in self.buf.slices(range.start, range.end) {
                    self.out.write(data, t, store, chan)?;
                }
                span = saves.next_save_range();
            }
            self.committed = upto;
        }
        self.buf.mark_written(self.committed);
        Ok(())
    }

    fn flush<T>(&mut self, saves: &mut SaveList, store: &mut T, chan: u16) -> Result<()>
    where
        T: BlockStore + ?Sized,
    {
        self.commit(Tick::MAX, saves, store, chan)?;
        self.out.store(store, chan)
    }

    fn read<T>(
        &self,
        out: &mut [S],
        cursor: &mut TimeRange,
        store: &T,
        chan: u16,
    ) -> Result<Option<(usize, Tick)>>
    where
        T: BlockStore + ?Sized,
    {
        let div = self.buf.divide();
        let mut fill = WaveFill::new(out);
        let upto = cursor.upto();
        let buffered = self.buf.first_time();

        if buffered.is_none_or(|first| cursor.from() < first) {
            if let Some(first) = buffered {
                cursor.set_upto(first.min(upto));
            }
            let older = self.out.older(store, chan);
            let mut i = store.first_ending_at_or_after(chan, cursor.from());
            while i < older && cursor.has_range() && !fill.is_full() {
                if !cursor.is_first()
                    && store.span(chan, i).is_some_and(|s| s.first > cursor.from())
                {
                    break;
                }
                let block = WaveBlock::<S>::from_image(store.load(chan, i)?, div)?;
                while !fill.is_full() {
                    let got = block.get_data(fill.room(), cursor);
                    if !fill.took(got) {
                        break;
                    }
                }
                i += 1;
            }
            while cursor.has_range() && !fill.is_full() {
                let got = self.out.block.get_data(fill.room(), cursor);
                if !fill.took(got) {
                    break;
                }
            }
            cursor.set_upto(upto);
        }

        if cursor.has_range() && !fill.is_full() {
            let (from, upto, first) = (cursor.from(), cursor.upto(), cursor.is_first());
            let got = self.buf.read(fill.room(), from, upto, first);
            if let Some((n, t)) = got {
                cursor.clear_first();
                cursor.reduce(n);
                cursor.set_from(t + n as Tick * div);
            }
            fill.took(got);
        }
        Ok(fill.finish())
    }

    fn prev_n_time<T>(&self, cursor: &mut TimeRange, store: &T, chan: u16) -> Result<SearchOutcome>
    where
        T: BlockStore + ?Sized,
    {
        let outcome = self.buf.prev_n_time(cursor);
        if settled(outcome, cursor) {
            return Ok(outcome);
        }
        let outcome = self.out.block.prev_n_time(cursor);
        if settled(outcome, cursor) {
            return Ok(outcome);
        }
        let div = self.buf.divide();
        search_back(store, chan, self.out.older(store, chan), cursor.upto(), |image| {
            let block = WaveBlock::<S>::from_image(image, div)?;
            let outcome = block.prev_n_time(cursor);
            Ok(settled(outcome, cursor).then_some(outcome))
        })
    }

    /// Overwrites samples from `from` on. Buffered samples change at once;
    /// those that only exist on disk are rewritten there.
    fn change<T>(&mut self, data: &[S], from: Tick, store: &mut T, chan: u16) -> Result<usize>
    where
        T: BlockStore + ?Sized,
    {
        let on_disk = match self.buf.first_time() {
            Some(first) if from < first => {
                data.len().min(slots_before(first - from, self.buf.divide()))
            }
            Some(_) => 0,
            None => data.len(),
        };
        let mut changed = 0;
        if on_disk > 0 {
            changed += self.out.change(&data[..on_disk], from, store, chan)?;
        }
        changed += self.buf.change(data, from);
        Ok(changed)
    }
}

#[derive(Debug)]
enum Lane {
    Event(RecordLane<Fixed<Tick>>),
    Marker(RecordLane<Fixed<Marker>>),
    ExtMark(RecordLane<Dynamic>, ExtLayout),
    Adc(WaveLane<i16>),
    Real(WaveLane<f32>),
}

macro_rules! each_lane {
    ($lane:expr, $l:ident => $body:expr) => {
        match $lane {
            Lane::Event($l) => $body,
            Lane::Marker($l) => $body,
            Lane::ExtMark($l, _) => $body,
            Lane::Adc($l) => $body,
            Lane::Real($l) => $body,
        }
    };
}

fn wave_lane<S: Sample>(lane: &Lane) -> Option<&WaveLane<S>> {
    let any: &dyn Any = match lane {
        Lane::Adc(l) => l,
        Lane::Real(l) => l,
        _ => return None,
    };
    any.downcast_ref()
}

fn wave_lane_mut<S: Sample>(lane: &mut Lane) -> Option<&mut WaveLane<S>> {
    let any: &mut dyn Any = match lane {
        Lane::Adc(l) => l,
        Lane::Real(l) => l,
        _ => return None,
    };
    any.downcast_mut()
}

fn wrong_kind(chan: u16, found: ChannelKind, expected: &'static str) -> ChanError {
    ChanError::WrongKind { chan, expected, found }
}

fn check_after(chan: u16, last: Option<Tick>, time: Tick) -> Result<()> {
    check_in_range(chan, time)?;
    match last {
        Some(last) if time <= last => {
            warn!(chan, time, last, "rejected out of order write");
            Err(WriteError::TimeOrder { time, last }.into())
        }
        _ => Ok(()),
    }
}

fn check_in_range(chan: u16, time: Tick) -> std::result::Result<(), WriteError> {
    if (0..=MAX_TIME).contains(&time) {
        Ok(())
    } else {
        warn!(chan, time, "rejected time outside storable range");
        Err(WriteError::TimeOutOfRange { time })
    }
}

/// Encodes records that must be strictly after `last` and each other.
/// Returns the bytes and the new last time.
fn encode_ordered<R: FixedRecord>(
    chan: u16,
    last: Option<Tick>,
    items: &[R],
) -> Result<(Vec<u8>, Option<Tick>)> {
    let mut bytes = vec![0u8; items.len() * R::SIZE];
    let mut last = last;
    for (item, out) in items.iter().zip(bytes.chunks_exact_mut(R::SIZE)) {
        check_after(chan, last, item.time())?;
        item.encode(out);
        last = Some(item.time());
    }
    Ok((bytes, last))
}

/// One channel of a data file.
///
/// A channel owns its buffer, write block and save list; the block store is
/// shared and passed in by the caller, so several channels can file into one
/// store.
///
/// # Example
///
/// ```rust
/// use chanfile::channel::Channel;
/// use chanfile::config::{ChannelConfig, ChannelKind};
/// use chanfile::store::MemStore;
/// use chanfile::time::TimeRange;
///
/// let mut store = MemStore::new(4096);
/// let mut chan = Channel::new(1, ChannelConfig::events(ChannelKind::EventRise, 64), 4096)?;
///
/// chan.write_events(&mut store, &[10, 20, 30])?;
/// chan.flush(&mut store)?;
///
/// let mut times = Vec::new();
/// chan.read_events(&store, &mut TimeRange::new(0, 100, 10, true, 0), &mut times)?;
/// assert_eq!(times, vec![10, 20, 30]);
/// # Ok::<(), chanfile::ChanError>(())
/// ```
#[derive(Debug)]
pub struct Channel {
    chan: u16,
    config: ChannelConfig,
    saves: SaveList,
    lane: Lane,
    last_time: Option<Tick>,
    /// A level change at `last_time` was taken back.
    cancelled: bool,
}

impl Channel {
    /// Creates an empty channel filing blocks of `block_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid or the
    /// block size cannot hold the channel's items.
    pub fn new(chan: u16, config: ChannelConfig, block_size: usize) -> Result<Self> {
        config.validate()?;
        config.check_block_size(block_size)?;

        let lane = match config.kind {
            ChannelKind::Adc => Lane::Adc(WaveLane::new(&config, chan, block_size)),
            ChannelKind::RealWave => Lane::Real(WaveLane::new(&config, chan, block_size)),
            ChannelKind::EventFall | ChannelKind::EventRise | ChannelKind::EventBoth => {
                Lane::Event(RecordLane::new(&config, chan, block_size, Fixed::new()))
            }
            ChannelKind::Marker => {
                Lane::Marker(RecordLane::new(&config, chan, block_size, Fixed::new()))
            }
            ChannelKind::AdcMark | ChannelKind::RealMark | ChannelKind::TextMark => {
                let layout = config.layout.ok_or_else(|| ConfigError::InvalidLayout {
                    reason: format!("{:?} channel needs a layout", config.kind),
                })?;
                let stride = ext_stride(&layout)?;
                Lane::ExtMark(RecordLane::new(&config, chan, block_size, stride), layout)
            }
        };

        debug!(chan, kind = ?config.kind, buffer = config.buffer_items, "created channel");
        Ok(Self {
            chan,
            saves: SaveList::new(config.save_at_start),
            config,
            lane,
            last_time: None,
            cancelled: false,
        })
    }

    /// Channel number.
    pub fn number(&self) -> u16 {
        self.chan
    }

    /// What the channel holds.
    pub fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    /// The channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Time of the newest item written (last sample for waveforms).
    pub fn last_time(&self) -> Option<Tick> {
        self.last_time
    }

    /// Items in the circular buffer.
    pub fn buffered(&self) -> usize {
        each_lane!(&self.lane, l => l.buf.len())
    }

    /// Time of the oldest buffered item.
    pub fn buffer_first_time(&self) -> Option<Tick> {
        each_lane!(&self.lane, l => l.buf.first_time())
    }

    /// The save/discard list.
    pub fn saves(&self) -> &SaveList {
        &self.saves
    }

    /// Writes event times.
    ///
    /// Times must be strictly increasing. On an [`ChannelKind::EventBoth`]
    /// channel a repeated time takes back the previous level change, provided
    /// it has not been committed yet; it can be done once per time.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a non-event channel,
    /// [`WriteError::TimeOrder`] for an out of order time and
    /// [`WriteError::TimeOutOfRange`] for a time outside `[0, MAX_TIME]`;
    /// the times before it are kept.
    pub fn write_events<T: BlockStore + ?Sized>(
        &mut self,
        store: &mut T,
        times: &[Tick],
    ) -> Result<()> {
        let (chan, kind) = (self.chan, self.config.kind);
        let Lane::Event(lane) = &mut self.lane else {
            return Err(wrong_kind(chan, kind, "event times"));
        };

        let mut accepted = Vec::with_capacity(times.len() * TIME_SIZE);
        let mut refused = None;
        for &t in times {
            if let Err(err) = check_in_range(chan, t) {
                refused = Some(err);
                break;
            }
            if let Some(last) = self.last_time
                && t <= last
            {
                let undo = kind == ChannelKind::EventBoth && t == last && !self.cancelled;
                if undo && !accepted.is_empty() {
                    accepted.truncate(accepted.len() - TIME_SIZE);
                } else if !(undo && lane.take_back(t)) {
                    warn!(chan, time = t, last, "rejected out of order event");
                    refused = Some(WriteError::TimeOrder { time: t, last });
                    break;
                }
                trace!(chan, t, "level change taken back");
                self.cancelled = true;
                continue;
            }
            accepted.extend_from_slice(&t.to_le_bytes());
            self.last_time = Some(t);
            self.cancelled = false;
        }

        lane.append(&accepted, &mut self.saves, store, chan)?;
        match refused {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Writes markers in strictly increasing time order.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a non-marker channel,
    /// [`WriteError::TimeOrder`] if the times are out of order and
    /// [`WriteError::TimeOutOfRange`] for a time outside `[0, MAX_TIME]`.
    /// Nothing is written on error.
    pub fn write_markers<T: BlockStore + ?Sized>(
        &mut self,
        store: &mut T,
        markers: &[Marker],
    ) -> Result<()> {
        let (chan, kind) = (self.chan, self.config.kind);
        let Lane::Marker(lane) = &mut self.lane else {
            return Err(wrong_kind(chan, kind, "markers"));
        };
        let (bytes, last) = encode_ordered(chan, self.last_time, markers)?;
        lane.append(&bytes, &mut self.saves, store, chan)?;
        self.last_time = last;
        Ok(())
    }

    /// Writes extended markers in strictly increasing time order.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a channel without a layout,
    /// [`WriteError::PayloadTooLarge`] for an oversized payload and
    /// [`WriteError::TimeOrder`] for out of order times and
    /// [`WriteError::TimeOutOfRange`] for a time outside `[0, MAX_TIME]`.
    /// Nothing is written on error.
    pub fn write_ext_marks<T: BlockStore + ?Sized>(
        &mut self,
        store: &mut T,
        marks: &[ExtMark],
    ) -> Result<()> {
        let (chan, kind) = (self.chan, self.config.kind);
        let Lane::ExtMark(lane, layout) = &mut self.lane else {
            return Err(wrong_kind(chan, kind, "extended markers"));
        };
        let stride = layout.stride();
        let max = layout.payload_bytes();

        let mut bytes = vec![0u8; marks.len() * stride];
        let mut last = self.last_time;
        for (mark, out) in marks.iter().zip(bytes.chunks_exact_mut(stride)) {
            check_after(chan, last, mark.time())?;
            if mark.payload.len() > max {
                return Err(WriteError::PayloadTooLarge {
                    len: mark.payload.len(),
                    max,
                }
                .into());
            }
            mark.encode(out);
            last = Some(mark.time());
        }
        lane.append(&bytes, &mut self.saves, store, chan)?;
        self.last_time = last;
        Ok(())
    }

    /// Writes waveform samples, the first at time `t`.
    ///
    /// Data that does not continue the previous write exactly starts a new
    /// run after a gap.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] if `S` is not the channel's sample
    /// type, [`WriteError::TimeOrder`] if `t` is before the end of the data
    /// already written and [`WriteError::TimeOutOfRange`] if any sample time
    /// falls outside `[0, MAX_TIME]`.
    pub fn write_wave<S, T>(&mut self, store: &mut T, data: &[S], t: Tick) -> Result<()>
    where
        S: Sample,
        T: BlockStore + ?Sized,
    {
        let (chan, kind, div) = (self.chan, self.config.kind, self.config.divide);
        let Some(lane) = wave_lane_mut::<S>(&mut self.lane) else {
            return Err(wrong_kind(chan, kind, "waveform samples of its type"));
        };
        if data.is_empty() {
            return Ok(());
        }
        check_in_range(chan, t)?;
        let span = (data.len() as Tick - 1).saturating_mul(div);
        if span > MAX_TIME - t {
            let time = t.saturating_add(span);
            warn!(chan, time, "rejected waveform ending past the storable range");
            return Err(WriteError::TimeOutOfRange { time }.into());
        }
        if let Some(last) = self.last_time
            && t < last + div
        {
            warn!(chan, t, last, "rejected overlapping waveform write");
            return Err(WriteError::TimeOrder { time: t, last }.into());
        }
        lane.append(data, t, &mut self.saves, store, chan)?;
        self.last_time = Some(t + (data.len() as Tick - 1) * div);
        Ok(())
    }

    /// Sets the save state from `t` onwards.
    pub fn set_save(&mut self, t: Tick, save: bool) {
        self.saves.set_save(t, save);
    }

    /// Marks `[from, upto)` as saved. Only data still uncommitted is affected.
    pub fn save_range(&mut self, from: Tick, upto: Tick) {
        self.saves.save_range(from, upto);
    }

    /// Whether data at `t` will be saved.
    pub fn is_saving(&self, t: Tick) -> bool {
        self.saves.is_saving(t)
    }

    /// Discarded spans overlapping `[from, upto)`, at most `max` of them.
    pub fn no_save_list(&self, from: Tick, upto: Tick, max: usize) -> Vec<Range<Tick>> {
        self.saves.no_save_list(from, upto, max)
    }

    /// Notes that time has reached `reached` with no new data, pruning
    /// save/discard toggles in the dead span.
    pub fn idle(&mut self, reached: Tick) {
        let last = self.last_time.unwrap_or(self.saves.first_time());
        self.saves.set_dead_range(last, reached, self.config.dead_keep);
    }

    /// Commits buffered data before `upto` according to the save list.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot take a full write block.
    pub fn commit<T: BlockStore + ?Sized>(&mut self, store: &mut T, upto: Tick) -> Result<()> {
        let (chan, saves) = (self.chan, &mut self.saves);
        each_lane!(&mut self.lane, l => l.commit(upto, saves, store, chan))
    }

    /// Commits everything buffered and stores the write block.
    ///
    /// # Errors
    ///
    /// Fails if the store refuses the block.
    pub fn flush<T: BlockStore + ?Sized>(&mut self, store: &mut T) -> Result<()> {
        let (chan, saves) = (self.chan, &mut self.saves);
        each_lane!(&mut self.lane, l => l.flush(saves, store, chan))
    }

    /// Reads event times of the cursor interval into `out`. Returns the count read.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a non-event channel, or a store
    /// or block error.
    pub fn read_events<T: BlockStore + ?Sized>(
        &self,
        store: &T,
        cursor: &mut TimeRange,
        out: &mut Vec<Tick>,
    ) -> Result<usize> {
        let Lane::Event(lane) = &self.lane else {
            return Err(wrong_kind(self.chan, self.config.kind, "event times"));
        };
        lane.read(cursor, None, store, self.chan, |r| out.push(read_time(r)))
    }

    /// Reads the markers of the cursor interval that `filter` accepts.
    ///
    /// Works on marker and extended marker channels; the latter yield their
    /// marker part.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on other channels, or a store or
    /// block error.
    pub fn read_markers<T: BlockStore + ?Sized>(
        &self,
        store: &T,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        out: &mut Vec<Marker>,
    ) -> Result<usize> {
        let sink = |r: &[u8]| out.push(Marker::decode(r));
        match &self.lane {
            Lane::Marker(lane) => lane.read(cursor, filter, store, self.chan, sink),
            Lane::ExtMark(lane, _) => lane.read(cursor, filter, store, self.chan, sink),
            _ => Err(wrong_kind(self.chan, self.config.kind, "markers")),
        }
    }

    /// Reads the extended markers of the cursor interval that `filter` accepts.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a channel without a layout, or a
    /// store or block error.
    pub fn read_ext_marks<T: BlockStore + ?Sized>(
        &self,
        store: &T,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        out: &mut Vec<ExtMark>,
    ) -> Result<usize> {
        let Lane::ExtMark(lane, layout) = &self.lane else {
            return Err(wrong_kind(self.chan, self.config.kind, "extended markers"));
        };
        lane.read(cursor, filter, store, self.chan, |r| out.push(ExtMark::decode(r, layout)))
    }

    /// Reads contiguous waveform samples from `[from, upto)` into `out`.
    ///
    /// The read starts at the first sample at or after `from` and stops at
    /// the first gap. Returns the count read and the time of the first
    /// sample, or `None` if there is no data in the range.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] if `S` is not the channel's sample
    /// type, or a store or block error.
    pub fn read_wave<S, T>(
        &self,
        store: &T,
        out: &mut [S],
        from: Tick,
        upto: Tick,
    ) -> Result<Option<(usize, Tick)>>
    where
        S: Sample,
        T: BlockStore + ?Sized,
    {
        let Some(lane) = wave_lane::<S>(&self.lane) else {
            return Err(wrong_kind(self.chan, self.config.kind, "waveform samples of its type"));
        };
        if from >= upto || out.is_empty() {
            return Ok(None);
        }
        let mut cursor = TimeRange::new(from, upto, out.len(), true, 0);
        lane.read(out, &mut cursor, store, self.chan)
    }

    /// Grid description for reading trace `column` of an extended marker
    /// channel as a waveform. `None` for channels without a numeric grid.
    pub fn wave_grid(&self, column: usize) -> Option<WaveGrid> {
        match &self.lane {
            Lane::ExtMark(_, layout) if self.config.kind.has_grid() => {
                Some(WaveGrid::new(layout, self.config.divide, column))
            }
            _ => None,
        }
    }

    fn grid_for(&self, filter: Option<&dyn MarkerFilter>, size: usize) -> Result<WaveGrid> {
        let column = filter.and_then(|f| f.column()).unwrap_or(0);
        self.wave_grid(column)
            .filter(|g| g.kind.elem_size() == size)
            .ok_or_else(|| wrong_kind(self.chan, self.config.kind, "a grid of matching samples"))
    }

    /// Reads extended marker grids as waveform samples, like [`Channel::read_wave`].
    ///
    /// The trace comes from the filter's column, or column 0.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] unless the channel holds a grid of
    /// `S` samples, or a store or block error.
    pub fn read_ext_wave<S, T>(
        &self,
        store: &T,
        out: &mut [S],
        from: Tick,
        upto: Tick,
        filter: Option<&dyn MarkerFilter>,
    ) -> Result<Option<(usize, Tick)>>
    where
        S: Sample,
        T: BlockStore + ?Sized,
    {
        let grid = self.grid_for(filter, S::SIZE)?;
        let Lane::ExtMark(lane, _) = &self.lane else {
            return Err(wrong_kind(self.chan, self.config.kind, "extended markers"));
        };
        if from >= upto || out.is_empty() {
            return Ok(None);
        }
        let mut cursor = TimeRange::new(from, upto, out.len(), true, 0).with_grid(grid);
        lane.read_wave(&mut cursor, filter, store, self.chan, out)
    }

    /// Finds the time of the `cursor.remaining()`th item before `cursor.upto()`.
    ///
    /// Counts records the filter accepts, or samples on waveform channels.
    /// [`SearchOutcome::CallAgain`] asks the caller to repeat the call with
    /// the same cursor.
    ///
    /// # Errors
    ///
    /// Fails on a store or block error.
    pub fn prev_n_time<T: BlockStore + ?Sized>(
        &self,
        store: &T,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
    ) -> Result<SearchOutcome> {
        let chan = self.chan;
        match &self.lane {
            Lane::Event(lane) => lane.prev_n_time(cursor, filter, store, chan),
            Lane::Marker(lane) => lane.prev_n_time(cursor, filter, store, chan),
            Lane::ExtMark(lane, _) => lane.prev_n_time(cursor, filter, store, chan),
            Lane::Adc(lane) => lane.prev_n_time(cursor, store, chan),
            Lane::Real(lane) => lane.prev_n_time(cursor, store, chan),
        }
    }

    /// Backward search over the grid samples of an extended marker channel.
    ///
    /// A cursor without a grid gets the channel's, for the filter's column.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a channel without a numeric grid,
    /// or a store or block error.
    pub fn prev_n_time_wave<T: BlockStore + ?Sized>(
        &self,
        store: &T,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
    ) -> Result<SearchOutcome> {
        let Lane::ExtMark(lane, _) = &self.lane else {
            return Err(wrong_kind(self.chan, self.config.kind, "extended markers"));
        };
        if cursor.grid().is_none() {
            let column = filter.and_then(|f| f.column()).unwrap_or(0);
            let grid = self
                .wave_grid(column)
                .ok_or_else(|| wrong_kind(self.chan, self.config.kind, "a numeric grid"))?;
            *cursor = cursor.with_grid(grid);
        }
        lane.prev_n_time_wave(cursor, filter, store, self.chan)
    }

    /// Replaces the codes and payload of the marker at `marker.time`.
    /// Returns false if no marker has that time.
    ///
    /// On an extended marker channel only the marker part changes.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on other channels, or a store or
    /// block error.
    pub fn edit_marker<T: BlockStore + ?Sized>(
        &mut self,
        store: &mut T,
        marker: &Marker,
    ) -> Result<bool> {
        let mut record = [0u8; MARKER_SIZE];
        marker.encode(&mut record);
        let chan = self.chan;
        match &mut self.lane {
            Lane::Marker(lane) => lane.edit(&record, store, chan),
            Lane::ExtMark(lane, _) => lane.edit(&record, store, chan),
            _ => Err(wrong_kind(chan, self.config.kind, "markers")),
        }
    }

    /// Replaces the marker part and payload of the extended marker at
    /// `mark.time()`. Returns false if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] on a channel without a layout,
    /// [`WriteError::PayloadTooLarge`] for an oversized payload, or a store
    /// or block error.
    pub fn edit_ext_mark<T: BlockStore + ?Sized>(
        &mut self,
        store: &mut T,
        mark: &ExtMark,
    ) -> Result<bool> {
        let chan = self.chan;
        let Lane::ExtMark(lane, layout) = &mut self.lane else {
            return Err(wrong_kind(chan, self.config.kind, "extended markers"));
        };
        let max = layout.payload_bytes();
        if mark.payload.len() > max {
            return Err(WriteError::PayloadTooLarge {
                len: mark.payload.len(),
                max,
            }
            .into());
        }
        let mut record = vec![0u8; layout.stride()];
        mark.encode(&mut record);
        lane.edit(&record, store, chan)
    }

    /// Overwrites waveform samples starting at `from`. Returns the count changed.
    ///
    /// Samples off the channel's sample grid are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`ChanError::WrongKind`] if `S` is not the channel's sample
    /// type, [`WriteError::TimeOutOfRange`] if `from` is outside
    /// `[0, MAX_TIME]`, or a store or block error.
    pub fn change_wave<S, T>(&mut self, store: &mut T, data: &[S], from: Tick) -> Result<usize>
    where
        S: Sample,
        T: BlockStore + ?Sized,
    {
        let (chan, kind) = (self.chan, self.config.kind);
        let Some(lane) = wave_lane_mut::<S>(&mut self.lane) else {
            return Err(wrong_kind(chan, kind, "waveform samples of its type"));
        };
        check_in_range(chan, from)?;
        let changed = lane.change(data, from, store, chan)?;
        trace!(chan, from, changed, "changed waveform");
        Ok(changed)
    }

    /// Decodes stored block `index` of this channel.
    ///
    /// # Errors
    ///
    /// Fails if the block does not exist or cannot be decoded.
    pub fn load_block<T: BlockStore + ?Sized>(&self, store: &T, index: usize) -> Result<DataBlock> {
        let layout = match &self.lane {
            Lane::ExtMark(_, layout) => Some(layout),
            _ => None,
        };
        let image = store.load(self.chan, index)?;
        Ok(DataBlock::from_image(image, layout, self.config.divide)?)
    }
}
