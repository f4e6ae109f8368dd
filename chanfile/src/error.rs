//! Error types for the chanfile filing engine.
//!
//! The buffering and search core reports its ordinary outcomes (not found,
//! short copies, "call again") as plain return values. The types here cover
//! what is left: invalid configuration, writes that break time order, block
//! images that cannot be decoded, store I/O, and calls that do not match the
//! kind of a channel.

use thiserror::Error;

use crate::config::ChannelKind;
use crate::time::Tick;

/// The main error type for all chanfile operations.
#[derive(Error, Debug)]
pub enum ChanError {
    /// Channel configuration is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A write was refused.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// A block image could not be decoded.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// The block store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The operation does not apply to this kind of channel.
    #[error("channel {chan} is {found:?}, operation needs {expected}")]
    WrongKind {
        /// The channel number.
        chan: u16,
        /// What the operation works on.
        expected: &'static str,
        /// The actual kind of the channel.
        found: ChannelKind,
    },
}

/// Errors raised while validating or loading a channel configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The circular buffer must hold at least one item.
    #[error("buffer capacity must be > 0")]
    ZeroBuffer,

    /// Waveform and grid channels need a positive sample interval.
    #[error("invalid sample interval {divide} (must be > 0)")]
    InvalidDivide {
        /// The offending interval in ticks.
        divide: Tick,
    },

    /// The block size is too small or not a multiple of 8.
    #[error("invalid block size {size}: {reason}")]
    InvalidBlockSize {
        /// The requested block size.
        size: usize,
        /// Why it was rejected.
        reason: String,
    },

    /// Extended marker channels need a layout and other channels must not have one.
    #[error("invalid extended marker layout: {reason}")]
    InvalidLayout {
        /// Why the layout was rejected.
        reason: String,
    },

    /// Failed to read a configuration file.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a configuration file.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The file path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised on the write path.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Data must arrive in strictly increasing time order.
    #[error("time {time} is not after last written time {last}")]
    TimeOrder {
        /// The rejected time.
        time: Tick,
        /// The last time already held by the channel.
        last: Tick,
    },

    /// Times must lie in `[0, MAX_TIME]`; -1 stands for "no data".
    #[error("time {time} is outside the storable range")]
    TimeOutOfRange {
        /// The rejected time.
        time: Tick,
    },

    /// An extended marker payload does not fit the channel layout.
    #[error("extended marker payload of {len} bytes exceeds layout size {max}")]
    PayloadTooLarge {
        /// Payload length supplied.
        len: usize,
        /// Maximum the layout allows.
        max: usize,
    },

    /// The write block refused data even after being recycled.
    #[error("block for channel {chan} refused data at time {time}")]
    BlockRefused {
        /// The channel number.
        chan: u16,
        /// Time of the first refused item.
        time: Tick,
    },
}

/// Errors raised while decoding a block image.
#[derive(Error, Debug)]
pub enum BlockError {
    /// The image is shorter than a block header.
    #[error("block image too small: {len} bytes")]
    TooSmall {
        /// Length of the image.
        len: usize,
    },

    /// The kind byte in the header is unknown.
    #[error("unknown block kind {kind}")]
    UnknownKind {
        /// The kind byte found.
        kind: u8,
    },

    /// The header disagrees with the image contents.
    #[error("corrupted block: {reason}")]
    Corrupted {
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Errors raised by block store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open or create the backing file.
    #[error("failed to open block file '{path}': {source}")]
    Open {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping failed.
    #[error("memory mapping failed for '{path}': {source}")]
    MemoryMap {
        /// The file path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to flush the mapping to disk.
    #[error("failed to sync '{path}': {source}")]
    SyncFailed {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// All block slots of the file are in use.
    #[error("block file is full ({max_blocks} blocks)")]
    Full {
        /// Number of slots in the file.
        max_blocks: usize,
    },

    /// The image does not match the store's block size.
    #[error("block image is {len} bytes, store block size is {block_size}")]
    SizeMismatch {
        /// Length of the supplied image.
        len: usize,
        /// The store's fixed block size.
        block_size: usize,
    },

    /// No such block for the channel.
    #[error("channel {chan} has no block {index}")]
    NoSuchBlock {
        /// The channel number.
        chan: u16,
        /// The requested block index.
        index: usize,
    },

    /// The file size does not hold a whole number of blocks.
    #[error("block file '{path}' is corrupted: {reason}")]
    Corrupted {
        /// The file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },
}

/// Type alias for `Result<T, ChanError>`.
pub type Result<T> = std::result::Result<T, ChanError>;
