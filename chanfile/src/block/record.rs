//! Blocks of fixed-stride records: events, markers and extended markers.

use tracing::trace;

use super::{BLOCK_HEADER_SIZE, BlockHeader, BlockImage, BlockKind, to_u32};
use crate::error::BlockError;
use crate::extwave;
use crate::filter::MarkerFilter;
use crate::search;
use crate::stride::{Dynamic, Fixed, FixedRecord, RecordSlice, Sample, Stride, read_time};
use crate::time::{SearchOutcome, Tick, TimeRange};

/// Event block.
pub type EventBlock = RecordBlock<Fixed<Tick>>;

/// Marker block.
pub type MarkerBlock = RecordBlock<Fixed<crate::record::Marker>>;

/// Extended marker block; the stride comes from the channel layout.
pub type ExtMarkBlock = RecordBlock<Dynamic>;

/// A block image holding records packed back to back after the header.
#[derive(Debug, Clone)]
pub struct RecordBlock<S> {
    image: Vec<u8>,
    stride: S,
    kind: BlockKind,
    chan: u16,
    items: usize,
}

impl<S: Stride> RecordBlock<S> {
    /// Creates an empty block image of `block_size` bytes.
    pub fn new(kind: BlockKind, chan: u16, block_size: usize, stride: S) -> Self {
        debug_assert!(block_size >= BLOCK_HEADER_SIZE + stride.bytes());
        let mut block = Self {
            image: vec![0; block_size],
            stride,
            kind,
            chan,
            items: 0,
        };
        block.sync_header();
        block
    }

    /// Adopts a stored image.
    ///
    /// # Errors
    ///
    /// Returns a [`BlockError`] if the header is unreadable, describes a
    /// waveform block, or counts more records than the image can hold.
    pub fn from_image(image: Vec<u8>, stride: S) -> Result<Self, BlockError> {
        let header = BlockHeader::read(&image)?;
        if header.kind.is_wave() {
            return Err(BlockError::Corrupted {
                reason: format!("{:?} block read as records", header.kind),
            });
        }
        let items = header.items as usize;
        if items * stride.bytes() != header.used as usize {
            return Err(BlockError::Corrupted {
                reason: format!(
                    "{items} records of {} bytes in {} bytes",
                    stride.bytes(),
                    header.used
                ),
            });
        }
        Ok(Self {
            image,
            stride,
            kind: header.kind,
            chan: header.chan,
            items,
        })
    }

    fn sync_header(&mut self) {
        let records = self.records();
        let (first, last) = if records.is_empty() {
            (0, 0)
        } else {
            (records.time(0), records.time(records.len() - 1))
        };
        let header = BlockHeader {
            kind: self.kind,
            chan: self.chan,
            items: to_u32(self.items),
            used: to_u32(self.items * self.stride.bytes()),
            first,
            last,
        };
        header.write(&mut self.image);
    }

    /// Owning channel.
    pub fn chan(&self) -> u16 {
        self.chan
    }

    /// What the block holds.
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Record stride.
    pub fn stride(&self) -> S {
        self.stride
    }

    /// Records that fit in the block.
    pub fn capacity(&self) -> usize {
        (self.image.len() - BLOCK_HEADER_SIZE) / self.stride.bytes()
    }

    /// Records held.
    pub fn len(&self) -> usize {
        self.items
    }

    /// The records as a slice view.
    pub fn records(&self) -> RecordSlice<'_, S> {
        let end = BLOCK_HEADER_SIZE + self.items * self.stride.bytes();
        RecordSlice::new(&self.image[BLOCK_HEADER_SIZE..end], self.stride)
    }

    /// Empties the block for reuse.
    pub fn reset(&mut self) {
        self.items = 0;
        self.sync_header();
    }

    /// Appends whole records from `records`. Returns the count added.
    ///
    /// A full block is recycled first: the caller must already have stored
    /// its image.
    pub fn add_data(&mut self, records: &[u8]) -> usize {
        if self.is_full() {
            trace!(chan = self.chan, kind = ?self.kind, "recycling full block");
            self.reset();
        }
        let s = self.stride.bytes();
        let n = (records.len() / s).min(self.capacity() - self.items);
        if n == 0 {
            return 0;
        }
        debug_assert!(self.last_time().is_none_or(|last| read_time(records) > last));
        let at = BLOCK_HEADER_SIZE + self.items * s;
        self.image[at..at + n * s].copy_from_slice(&records[..n * s]);
        self.items += n;
        self.sync_header();
        n
    }

    /// Copies qualifying records of the cursor interval to `sink`.
    pub fn get_data<F>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        sink: F,
    ) -> usize
    where
        F: FnMut(&[u8]),
    {
        search::copy_forward(&self.records(), self.stride.filterable(), cursor, filter, sink)
    }

    /// Finds the `cursor.remaining()`th qualifying record before `cursor.upto()`.
    pub fn prev_n_time(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
    ) -> SearchOutcome {
        search::prev_n_time(&self.records(), self.stride.filterable(), cursor, filter)
    }

    /// Overwrites everything but the time of the record whose time matches
    /// `record`'s. Returns false if there is none.
    pub fn edit_marker(&mut self, record: &[u8]) -> bool {
        let records = self.records();
        let i = records.lower_bound(read_time(record));
        if i >= records.len() || records.time(i) != read_time(record) {
            return false;
        }
        let s = self.stride.bytes();
        let at = BLOCK_HEADER_SIZE + i * s;
        let n = s.min(record.len());
        self.image[at + 8..at + n].copy_from_slice(&record[8..n]);
        true
    }
}

impl<R: FixedRecord> RecordBlock<Fixed<R>> {
    /// Appends typed records. Returns the count added.
    pub fn push(&mut self, items: &[R]) -> usize {
        let mut bytes = vec![0u8; items.len() * R::SIZE];
        for (chunk, item) in bytes.chunks_exact_mut(R::SIZE).zip(items) {
            item.encode(chunk);
        }
        self.add_data(&bytes)
    }

    /// Decodes qualifying records of the cursor interval into `out`.
    pub fn read(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        out: &mut Vec<R>,
    ) -> usize {
        search::read_forward(&self.records(), self.stride.filterable(), cursor, filter, out)
    }
}

impl RecordBlock<Dynamic> {
    /// Backward search over the grid samples of extended markers.
    pub fn prev_n_time_wave(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
    ) -> SearchOutcome {
        extwave::prev_n_time_wave(&self.records(), cursor, filter)
    }

    /// Reads extended marker grids as waveform samples.
    pub fn get_wave<T: Sample>(
        &self,
        cursor: &mut TimeRange,
        filter: Option<&dyn MarkerFilter>,
        out: &mut [T],
    ) -> Option<(usize, Tick)> {
        extwave::copy_wave(&self.records(), cursor, filter, out)
    }
}

impl<S: Stride> BlockImage for RecordBlock<S> {
    fn image(&self) -> &[u8] {
        &self.image
    }

    fn is_empty(&self) -> bool {
        self.items == 0
    }

    fn is_full(&self) -> bool {
        self.items == self.capacity()
    }

    fn first_time(&self) -> Option<Tick> {
        (self.items > 0).then(|| self.records().time(0))
    }

    fn last_time(&self) -> Option<Tick> {
        (self.items > 0).then(|| self.records().time(self.items - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CodeFilter;
    use crate::record::Marker;

    #[test]
    fn test_fill_and_recycle() {
        // 32-byte header + 4 events
        let mut block = EventBlock::new(BlockKind::Event, 7, BLOCK_HEADER_SIZE + 32, Fixed::new());
        assert_eq!(block.capacity(), 4);
        assert_eq!(block.push(&[1, 2, 3, 4, 5]), 4);
        assert!(block.is_full());

        let header = BlockHeader::read(block.image()).unwrap();
        assert_eq!((header.items, header.used, header.first, header.last), (4, 32, 1, 4));
        assert_eq!(header.chan, 7);

        // the next add recycles
        assert_eq!(block.push(&[5]), 1);
        assert_eq!(block.len(), 1);
        assert_eq!(block.first_time(), Some(5));
    }

    #[test]
    fn test_from_image_checks_counts() {
        let mut block = MarkerBlock::new(BlockKind::Marker, 1, 128, Fixed::new());
        block.push(&[Marker::new(1), Marker::new(2)]);
        let image = block.image().to_vec();
        let back = MarkerBlock::from_image(image.clone(), Fixed::new()).unwrap();
        assert_eq!(back.len(), 2);

        // the same bytes read with a wider stride disagree with `used`
        assert!(RecordBlock::from_image(image, Dynamic::new(24).unwrap()).is_err());
    }

    #[test]
    fn test_get_data_filtered() {
        let mut block = MarkerBlock::new(BlockKind::Marker, 1, 1024, Fixed::new());
        let marks: Vec<Marker> = (0..10)
            .map(|i| Marker::with_codes(i * 10, [(i % 3) as u8, 0, 0, 0]))
            .collect();
        block.push(&marks);

        let filter = CodeFilter::only_codes(&[0]);
        let mut out = Vec::new();
        let mut cursor = TimeRange::new(0, 1000, 100, true, 0);
        assert_eq!(block.read(&mut cursor, Some(&filter), &mut out), 4);
        assert_eq!(out.iter().map(|m| m.time).collect::<Vec<_>>(), vec![0, 30, 60, 90]);
        // ran out of data: the next layer should be consulted
        assert!(cursor.has_range());

        let mut cursor = TimeRange::new(0, 1000, 2, false, 0);
        assert_eq!(block.prev_n_time(&mut cursor, Some(&filter)), SearchOutcome::Found(60));
    }

    #[test]
    fn test_edit_marker() {
        let mut block = MarkerBlock::new(BlockKind::Marker, 1, 256, Fixed::new());
        block.push(&[Marker::new(10), Marker::new(20)]);
        let mut rec = [0u8; 16];
        Marker::with_codes(20, [5, 6, 7, 8]).encode(&mut rec);
        assert!(block.edit_marker(&rec));
        Marker::with_codes(15, [1, 1, 1, 1]).encode(&mut rec);
        assert!(!block.edit_marker(&rec));

        let mut out = Vec::new();
        block.read(&mut TimeRange::new(0, 100, 10, true, 0), None, &mut out);
        assert_eq!(out[1].codes(), [5, 6, 7, 8]);
        assert_eq!(out[0].codes(), [0, 0, 0, 0]);
    }
}
