//! On-disk data blocks.
//!
//! A block is a fixed-size byte image: a 32-byte header followed by payload.
//! Record blocks pack records back to back; waveform blocks pack contiguous
//! runs of samples, each with its own run header.
//!
//! # Header layout
//!
//! ```text
//! offset  size  field
//! 0       1     kind (1 event, 2 marker, 3 extended marker, 4 adc, 5 real)
//! 1       1     reserved
//! 2       2     channel number
//! 4       4     items (records, or runs for waveform blocks)
//! 8       4     payload bytes used
//! 12      4     reserved
//! 16      8     time of the first item
//! 24      8     time of the last item (last sample for waveforms)
//! ```
//!
//! All fields are little-endian. A block's image is always current: every
//! mutation rewrites the header, so the bytes can be handed to a store at
//! any point.

mod record;
mod wave;

pub use record::{EventBlock, ExtMarkBlock, MarkerBlock, RecordBlock};
pub use wave::{RunInfo, WaveBlock};

use crate::error::BlockError;
use crate::record::ExtLayout;
use crate::stride::{Dynamic, Fixed, read_time, write_time};
use crate::time::Tick;

/// Size of the block header.
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Block size used when a channel does not ask for another.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Smallest block size accepted.
pub const MIN_BLOCK_SIZE: usize = 128;

/// What a block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Event times.
    Event = 1,
    /// Markers.
    Marker = 2,
    /// Extended markers.
    ExtMark = 3,
    /// 16-bit waveform runs.
    Adc = 4,
    /// 32-bit float waveform runs.
    Real = 5,
}

impl BlockKind {
    /// Decodes a header kind byte.
    pub fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(Self::Event),
            2 => Some(Self::Marker),
            3 => Some(Self::ExtMark),
            4 => Some(Self::Adc),
            5 => Some(Self::Real),
            _ => None,
        }
    }

    /// True for the waveform kinds.
    pub fn is_wave(self) -> bool {
        matches!(self, Self::Adc | Self::Real)
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// What the block holds.
    pub kind: BlockKind,
    /// Owning channel.
    pub chan: u16,
    /// Records, or runs for waveform blocks.
    pub items: u32,
    /// Payload bytes in use.
    pub used: u32,
    /// Time of the first item.
    pub first: Tick,
    /// Time of the last item.
    pub last: Tick,
}

impl BlockHeader {
    /// Decodes the header at the start of `image`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::TooSmall`] for a short image,
    /// [`BlockError::UnknownKind`] for an unrecognized kind byte and
    /// [`BlockError::Corrupted`] if `used` overruns the image.
    pub fn read(image: &[u8]) -> Result<Self, BlockError> {
        if image.len() < BLOCK_HEADER_SIZE {
            return Err(BlockError::TooSmall { len: image.len() });
        }
        let kind = BlockKind::from_u8(image[0]).ok_or(BlockError::UnknownKind { kind: image[0] })?;
        let u32_at = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&image[at..at + 4]);
            u32::from_le_bytes(word)
        };
        let header = Self {
            kind,
            chan: u16::from_le_bytes([image[2], image[3]]),
            items: u32_at(4),
            used: u32_at(8),
            first: read_time(&image[16..]),
            last: read_time(&image[24..]),
        };
        if header.used as usize > image.len() - BLOCK_HEADER_SIZE {
            return Err(BlockError::Corrupted {
                reason: format!(
                    "{} payload bytes used in a {} byte block",
                    header.used,
                    image.len()
                ),
            });
        }
        Ok(header)
    }

    /// Encodes the header into the start of `image`.
    pub fn write(&self, image: &mut [u8]) {
        image[0] = self.kind as u8;
        image[1] = 0;
        image[2..4].copy_from_slice(&self.chan.to_le_bytes());
        image[4..8].copy_from_slice(&self.items.to_le_bytes());
        image[8..12].copy_from_slice(&self.used.to_le_bytes());
        image[12..16].fill(0);
        write_time(&mut image[16..], self.first);
        write_time(&mut image[24..], self.last);
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Common view of any block type as a storable image.
pub trait BlockImage {
    /// The full block image, header included.
    fn image(&self) -> &[u8];

    /// True if the block holds no data.
    fn is_empty(&self) -> bool;

    /// True if the next add will recycle the block.
    fn is_full(&self) -> bool;

    /// Time of the first item.
    fn first_time(&self) -> Option<Tick>;

    /// Time of the last item.
    fn last_time(&self) -> Option<Tick>;
}

/// A decoded block of any kind.
#[derive(Debug, Clone)]
pub enum DataBlock {
    /// Event times.
    Event(EventBlock),
    /// Markers.
    Marker(MarkerBlock),
    /// Extended markers.
    ExtMark(ExtMarkBlock),
    /// 16-bit waveform.
    Adc(WaveBlock<i16>),
    /// Float waveform.
    Real(WaveBlock<f32>),
}

impl DataBlock {
    /// Decodes a block image, dispatching on the header's kind byte.
    ///
    /// Extended marker blocks need the channel `layout`; waveform blocks
    /// need the sample interval `divide`.
    ///
    /// # Errors
    ///
    /// Returns a [`BlockError`] if the header is invalid, the payload
    /// disagrees with it, or an extended marker block has no usable layout.
    pub fn from_image(
        image: Vec<u8>,
        layout: Option<&ExtLayout>,
        divide: Tick,
    ) -> Result<Self, BlockError> {
        let header = BlockHeader::read(&image)?;
        Ok(match header.kind {
            BlockKind::Event => Self::Event(RecordBlock::from_image(image, Fixed::new())?),
            BlockKind::Marker => Self::Marker(RecordBlock::from_image(image, Fixed::new())?),
            BlockKind::ExtMark => {
                let layout = layout.ok_or_else(|| BlockError::Corrupted {
                    reason: "extended marker block without a layout".to_string(),
                })?;
                Self::ExtMark(RecordBlock::from_image(image, ext_stride(layout)?)?)
            }
            BlockKind::Adc => Self::Adc(WaveBlock::from_image(image, divide)?),
            BlockKind::Real => Self::Real(WaveBlock::from_image(image, divide)?),
        })
    }

    /// What the block holds.
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::Event(_) => BlockKind::Event,
            Self::Marker(_) => BlockKind::Marker,
            Self::ExtMark(_) => BlockKind::ExtMark,
            Self::Adc(_) => BlockKind::Adc,
            Self::Real(_) => BlockKind::Real,
        }
    }

    fn inner(&self) -> &dyn BlockImage {
        match self {
            Self::Event(b) => b,
            Self::Marker(b) => b,
            Self::ExtMark(b) => b,
            Self::Adc(b) => b,
            Self::Real(b) => b,
        }
    }

    /// Decoded header.
    ///
    /// # Errors
    ///
    /// Cannot fail for a block built by this crate; the header is rewritten
    /// on every mutation.
    pub fn header(&self) -> Result<BlockHeader, BlockError> {
        BlockHeader::read(self.image())
    }

    /// Items held: records, or samples for waveform blocks.
    pub fn len(&self) -> usize {
        match self {
            Self::Event(b) => b.len(),
            Self::Marker(b) => b.len(),
            Self::ExtMark(b) => b.len(),
            Self::Adc(b) => b.len(),
            Self::Real(b) => b.len(),
        }
    }

    /// The full block image.
    pub fn image(&self) -> &[u8] {
        self.inner().image()
    }

    /// True if the block holds no data.
    pub fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }

    /// True if the block is full.
    pub fn is_full(&self) -> bool {
        self.inner().is_full()
    }

    /// Time of the first item.
    pub fn first_time(&self) -> Option<Tick> {
        self.inner().first_time()
    }

    /// Time of the last item.
    pub fn last_time(&self) -> Option<Tick> {
        self.inner().last_time()
    }
}

/// Runtime stride tag for extended marker blocks of `layout`.
pub(crate) fn ext_stride(layout: &ExtLayout) -> Result<Dynamic, BlockError> {
    layout.dynamic().ok_or_else(|| BlockError::Corrupted {
        reason: format!("unusable record stride {}", layout.stride()),
    })
}
