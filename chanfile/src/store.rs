//! Block stores: where full (and flushed) write blocks end up.
//!
//! A store keeps, per channel, an ordered list of fixed-size block images.
//! Blocks are appended in time order, so block `i` of a channel only holds
//! data older than block `i + 1`. The most recent block may be rewritten in
//! place while it is still being filled, and any block may be rewritten to
//! apply corrections.
//!
//! Two implementations are provided:
//!
//! - [`MemStore`]: images kept in memory, for tests and transient files
//! - [`FileStore`]: a pre-sized, memory-mapped file of block slots
//!
//! # File layout
//!
//! ```text
//! [slot 0: block_size bytes][slot 1][slot 2] ... [slot max_blocks - 1]
//! ```
//!
//! Slots are handed out sequentially. A slot whose kind byte is zero is
//! unused; the per-channel index is rebuilt from block headers on open.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use tracing::{debug, info};

use crate::block::BlockHeader;
use crate::error::{Result, StoreError};
use crate::time::Tick;

/// Time span of one stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Time of the first item.
    pub first: Tick,
    /// Time of the last item (last sample for waveforms).
    pub last: Tick,
}

/// Ordered per-channel storage of block images.
pub trait BlockStore {
    /// Size in bytes of every block image.
    fn block_size(&self) -> usize;

    /// Appends a block for `chan`. Returns its index within the channel.
    ///
    /// # Errors
    ///
    /// Fails if the image has the wrong size or the store is full.
    fn append(&mut self, chan: u16, image: &[u8]) -> Result<usize>;

    /// Rewrites block `index` of `chan`.
    ///
    /// # Errors
    ///
    /// Fails if the image has the wrong size or the block does not exist.
    fn update(&mut self, chan: u16, index: usize, image: &[u8]) -> Result<()>;

    /// Number of blocks stored for `chan`.
    fn block_count(&self, chan: u16) -> usize;

    /// Copies out block `index` of `chan`.
    ///
    /// # Errors
    ///
    /// Fails if the block does not exist.
    fn load(&self, chan: u16, index: usize) -> Result<Vec<u8>>;

    /// Time span of block `index` of `chan`.
    fn span(&self, chan: u16, index: usize) -> Option<BlockSpan>;

    /// Index of the first block of `chan` whose last item is at or after `t`
    /// (`block_count` if none).
    fn first_ending_at_or_after(&self, chan: u16, t: Tick) -> usize {
        let (mut lo, mut hi) = (0, self.block_count(chan));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.span(chan, mid).is_some_and(|s| s.last < t) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the last block of `chan` whose first item is before `t`.
    fn last_starting_before(&self, chan: u16, t: Tick) -> Option<usize> {
        let (mut lo, mut hi) = (0, self.block_count(chan));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.span(chan, mid).is_some_and(|s| s.first < t) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }
}

fn span_of(image: &[u8]) -> Result<BlockSpan> {
    let header = BlockHeader::read(image)?;
    Ok(BlockSpan {
        first: header.first,
        last: header.last,
    })
}

fn check_size(image: &[u8], block_size: usize) -> Result<()> {
    if image.len() != block_size {
        return Err(StoreError::SizeMismatch {
            len: image.len(),
            block_size,
        }
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct MemBlock {
    image: Vec<u8>,
    span: BlockSpan,
}

/// In-memory block store.
#[derive(Debug, Clone)]
pub struct MemStore {
    block_size: usize,
    channels: HashMap<u16, Vec<MemBlock>>,
}

impl MemStore {
    /// Creates an empty store of `block_size` byte blocks.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            channels: HashMap::new(),
        }
    }

    /// Total blocks across all channels.
    pub fn total_blocks(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}

impl BlockStore for MemStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn append(&mut self, chan: u16, image: &[u8]) -> Result<usize> {
        check_size(image, self.block_size)?;
        let span = span_of(image)?;
        let blocks = self.channels.entry(chan).or_default();
        blocks.push(MemBlock {
            image: image.to_vec(),
            span,
        });
        Ok(blocks.len() - 1)
    }

    fn update(&mut self, chan: u16, index: usize, image: &[u8]) -> Result<()> {
        check_size(image, self.block_size)?;
        let span = span_of(image)?;
        let block = self
            .channels
            .get_mut(&chan)
            .and_then(|b| b.get_mut(index))
            .ok_or(StoreError::NoSuchBlock { chan, index })?;
        block.image.copy_from_slice(image);
        block.span = span;
        Ok(())
    }

    fn block_count(&self, chan: u16) -> usize {
        self.channels.get(&chan).map_or(0, Vec::len)
    }

    fn load(&self, chan: u16, index: usize) -> Result<Vec<u8>> {
        self.channels
            .get(&chan)
            .and_then(|b| b.get(index))
            .map(|b| b.image.clone())
            .ok_or_else(|| StoreError::NoSuchBlock { chan, index }.into())
    }

    fn span(&self, chan: u16, index: usize) -> Option<BlockSpan> {
        self.channels.get(&chan).and_then(|b| b.get(index)).map(|b| b.span)
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    slot: usize,
    span: BlockSpan,
}

/// Block store backed by a memory-mapped file of fixed-size slots.
///
/// # Examples
///
/// ```rust,no_run
/// use chanfile::store::{BlockStore, FileStore};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FileStore::create("data.blocks", 4096, 256)?;
/// println!("{} slots free", store.free_slots());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileStore {
    mmap: MmapMut,
    path: String,
    block_size: usize,
    max_blocks: usize,
    next_slot: usize,
    index: HashMap<u16, Vec<SlotEntry>>,
}

impl FileStore {
    /// Creates (or truncates) a store file with room for `max_blocks` blocks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the file cannot be created or sized,
    /// or [`StoreError::MemoryMap`] if mapping fails.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, max_blocks: usize) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::Open {
                path: path_str.clone(),
                source: e,
            })?;

        file.set_len((block_size * max_blocks) as u64)
            .map_err(|e| StoreError::Open {
                path: path_str.clone(),
                source: e,
            })?;

        // SAFETY: The file was just created with the correct size and we hold
        // the only handle to it.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| StoreError::MemoryMap {
                path: path_str.clone(),
                source: e,
            })?
        };

        info!(path = %path_str, block_size, max_blocks, "created block file");
        Ok(Self {
            mmap,
            path: path_str,
            block_size,
            max_blocks,
            next_slot: 0,
            index: HashMap::new(),
        })
    }

    /// Opens an existing store file and rebuilds the channel index from the
    /// block headers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] or [`StoreError::MemoryMap`] on I/O
    /// failure, [`StoreError::Corrupted`] if the file is not a whole number
    /// of blocks, or a block error for an unreadable header.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::Open {
                path: path_str.clone(),
                source: e,
            })?;

        // SAFETY: The file was successfully opened with read/write access.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| StoreError::MemoryMap {
                path: path_str.clone(),
                source: e,
            })?
        };

        if block_size == 0 || mmap.len() % block_size != 0 {
            return Err(StoreError::Corrupted {
                path: path_str,
                reason: format!(
                    "{} bytes is not a whole number of {block_size} byte blocks",
                    mmap.len()
                ),
            }
            .into());
        }

        let mut store = Self {
            max_blocks: mmap.len() / block_size,
            mmap,
            path: path_str,
            block_size,
            next_slot: 0,
            index: HashMap::new(),
        };
        store.rebuild_index()?;
        info!(path = %store.path, blocks = store.next_slot, "opened block file");
        Ok(store)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        for slot in 0..self.max_blocks {
            let image = self.slot(slot);
            if image[0] == 0 {
                break;
            }
            let header = BlockHeader::read(image)?;
            let span = BlockSpan {
                first: header.first,
                last: header.last,
            };
            self.index.entry(header.chan).or_default().push(SlotEntry { slot, span });
            self.next_slot = slot + 1;
        }
        Ok(())
    }

    fn slot(&self, slot: usize) -> &[u8] {
        &self.mmap[slot * self.block_size..(slot + 1) * self.block_size]
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let bs = self.block_size;
        &mut self.mmap[slot * bs..(slot + 1) * bs]
    }

    fn entry(&self, chan: u16, index: usize) -> Result<SlotEntry> {
        self.index
            .get(&chan)
            .and_then(|e| e.get(index))
            .copied()
            .ok_or_else(|| StoreError::NoSuchBlock { chan, index }.into())
    }

    /// Slots not yet used.
    pub fn free_slots(&self) -> usize {
        self.max_blocks - self.next_slot
    }

    /// Channels with at least one block, in ascending order.
    pub fn channels(&self) -> Vec<u16> {
        let mut chans: Vec<u16> = self.index.keys().copied().collect();
        chans.sort_unstable();
        chans
    }

    /// Path to the store file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flushes the mapping to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SyncFailed`] if the flush fails.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| {
            StoreError::SyncFailed {
                path: self.path.clone(),
                source: e,
            }
            .into()
        })
    }
}

impl BlockStore for FileStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn append(&mut self, chan: u16, image: &[u8]) -> Result<usize> {
        check_size(image, self.block_size)?;
        if self.next_slot >= self.max_blocks {
            return Err(StoreError::Full {
                max_blocks: self.max_blocks,
            }
            .into());
        }
        let span = span_of(image)?;
        let slot = self.next_slot;
        self.slot_mut(slot).copy_from_slice(image);
        self.next_slot += 1;

        let entries = self.index.entry(chan).or_default();
        entries.push(SlotEntry { slot, span });
        debug!(chan, slot, index = entries.len() - 1, "appended block");
        Ok(entries.len() - 1)
    }

    fn update(&mut self, chan: u16, index: usize, image: &[u8]) -> Result<()> {
        check_size(image, self.block_size)?;
        let span = span_of(image)?;
        let slot = self.entry(chan, index)?.slot;
        self.slot_mut(slot).copy_from_slice(image);
        if let Some(entry) = self.index.get_mut(&chan).and_then(|e| e.get_mut(index)) {
            entry.span = span;
        }
        Ok(())
    }

    fn block_count(&self, chan: u16) -> usize {
        self.index.get(&chan).map_or(0, Vec::len)
    }

    fn load(&self, chan: u16, index: usize) -> Result<Vec<u8>> {
        let slot = self.entry(chan, index)?.slot;
        Ok(self.slot(slot).to_vec())
    }

    fn span(&self, chan: u16, index: usize) -> Option<BlockSpan> {
        self.index.get(&chan).and_then(|e| e.get(index)).map(|e| e.span)
    }
}
