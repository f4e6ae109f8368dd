//! Channel and file configuration.
//!
//! A [`ChannelConfig`] fixes everything about a channel that cannot change
//! while it is open: the kind of data, the sample interval, the circular
//! buffer size and the extended marker layout. A [`FileConfig`] groups the
//! channels of one data file with the store's block geometry and can be
//! loaded from and saved to JSON.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::{BLOCK_HEADER_SIZE, BlockKind, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{ConfigError, Result};
use crate::record::{ExtKind, ExtLayout, MARKER_SIZE};
use crate::stride::{RUN_HEADER_SIZE, TIME_SIZE};
use crate::time::Tick;

/// Block slots reserved by [`FileConfig`] when none is given.
pub const DEFAULT_MAX_BLOCKS: usize = 1024;

/// Kind of data a channel holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// 16-bit waveform.
    Adc,
    /// 32-bit float waveform.
    RealWave,
    /// Event times on falling edges.
    EventFall,
    /// Event times on rising edges.
    EventRise,
    /// Level events: every transition in either direction.
    EventBoth,
    /// Markers with codes.
    Marker,
    /// Extended markers carrying a 16-bit grid.
    AdcMark,
    /// Extended markers carrying a float grid.
    RealMark,
    /// Extended markers carrying text.
    TextMark,
}

impl ChannelKind {
    /// Block kind used to store this channel.
    pub fn block_kind(self) -> BlockKind {
        match self {
            Self::Adc => BlockKind::Adc,
            Self::RealWave => BlockKind::Real,
            Self::EventFall | Self::EventRise | Self::EventBoth => BlockKind::Event,
            Self::Marker => BlockKind::Marker,
            Self::AdcMark | Self::RealMark | Self::TextMark => BlockKind::ExtMark,
        }
    }

    /// True for the continuous waveform kinds.
    pub fn is_wave(self) -> bool {
        matches!(self, Self::Adc | Self::RealWave)
    }

    /// True for the event kinds.
    pub fn is_event(self) -> bool {
        matches!(self, Self::EventFall | Self::EventRise | Self::EventBoth)
    }

    /// Payload flavour for extended marker kinds.
    pub fn ext_kind(self) -> Option<ExtKind> {
        match self {
            Self::AdcMark => Some(ExtKind::Short),
            Self::RealMark => Some(ExtKind::Real),
            Self::TextMark => Some(ExtKind::Text),
            _ => None,
        }
    }

    /// True if records carry a grid that can be read as waveform data.
    pub fn has_grid(self) -> bool {
        matches!(self, Self::AdcMark | Self::RealMark)
    }
}

fn default_divide() -> Tick {
    1
}

fn default_save() -> bool {
    true
}

fn default_dead_keep() -> usize {
    4
}

/// Configuration for one channel.
///
/// # Example
///
/// ```rust
/// use chanfile::config::{ChannelConfig, ChannelKind};
///
/// let adc = ChannelConfig::waveform(ChannelKind::Adc, 10, 10_000);
/// assert!(adc.validate().is_ok());
///
/// let bad = ChannelConfig::events(ChannelKind::EventRise, 0);
/// assert!(bad.validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// What the channel holds.
    pub kind: ChannelKind,

    /// Ticks per sample for waveforms and extended marker grids.
    #[serde(default = "default_divide")]
    pub divide: Tick,

    /// Items (records or samples) the circular buffer holds.
    pub buffer_items: usize,

    /// Payload layout for extended marker channels.
    #[serde(default)]
    pub layout: Option<ExtLayout>,

    /// Whether data is saved before the first save/discard toggle.
    #[serde(default = "default_save")]
    pub save_at_start: bool,

    /// Toggles kept in a dead range when the channel idles.
    #[serde(default = "default_dead_keep")]
    pub dead_keep: usize,
}

impl ChannelConfig {
    fn base(
        kind: ChannelKind,
        divide: Tick,
        buffer_items: usize,
        layout: Option<ExtLayout>,
    ) -> Self {
        Self {
            kind,
            divide,
            buffer_items,
            layout,
            save_at_start: default_save(),
            dead_keep: default_dead_keep(),
        }
    }

    /// An event channel.
    pub fn events(kind: ChannelKind, buffer_items: usize) -> Self {
        Self::base(kind, 1, buffer_items, None)
    }

    /// A marker channel.
    pub fn markers(buffer_items: usize) -> Self {
        Self::base(ChannelKind::Marker, 1, buffer_items, None)
    }

    /// A waveform channel sampled every `divide` ticks.
    pub fn waveform(kind: ChannelKind, divide: Tick, buffer_items: usize) -> Self {
        Self::base(kind, divide, buffer_items, None)
    }

    /// An extended marker channel.
    pub fn ext_marks(
        kind: ChannelKind,
        layout: ExtLayout,
        divide: Tick,
        buffer_items: usize,
    ) -> Self {
        Self::base(kind, divide, buffer_items, Some(layout))
    }

    /// Starts the channel in the discard state.
    #[must_use]
    pub fn discarding(mut self) -> Self {
        self.save_at_start = false;
        self
    }

    /// Bytes of one buffered item: a record, or a sample for waveforms.
    pub fn item_bytes(&self) -> usize {
        match self.kind {
            ChannelKind::Adc => 2,
            ChannelKind::RealWave => 4,
            ChannelKind::EventFall | ChannelKind::EventRise | ChannelKind::EventBoth => TIME_SIZE,
            ChannelKind::Marker => MARKER_SIZE,
            ChannelKind::AdcMark | ChannelKind::RealMark | ChannelKind::TextMark => {
                self.layout.map_or(MARKER_SIZE, |l| l.stride())
            }
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - the buffer holds no items
    /// - a waveform or grid channel has a non-positive sample interval
    /// - an extended marker channel has no layout, or a layout of the wrong
    ///   flavour or shape
    /// - any other channel has a layout
    pub fn validate(&self) -> Result<()> {
        if self.buffer_items == 0 {
            return Err(ConfigError::ZeroBuffer.into());
        }

        if (self.kind.is_wave() || self.kind.has_grid()) && self.divide <= 0 {
            return Err(ConfigError::InvalidDivide { divide: self.divide }.into());
        }

        match (self.kind.ext_kind(), &self.layout) {
            (Some(_), None) => Err(ConfigError::InvalidLayout {
                reason: format!("{:?} channel needs a layout", self.kind),
            }
            .into()),
            (None, Some(_)) => Err(ConfigError::InvalidLayout {
                reason: format!("{:?} channel cannot have a layout", self.kind),
            }
            .into()),
            (Some(kind), Some(layout)) => {
                if layout.kind != kind {
                    return Err(ConfigError::InvalidLayout {
                        reason: format!("{:?} channel with {:?} payload", self.kind, layout.kind),
                    }
                    .into());
                }
                if layout.rows == 0 || layout.cols == 0 {
                    return Err(ConfigError::InvalidLayout {
                        reason: format!("empty {}x{} payload", layout.rows, layout.cols),
                    }
                    .into());
                }
                if kind == ExtKind::Text && layout.cols != 1 {
                    return Err(ConfigError::InvalidLayout {
                        reason: "text payloads have one column".to_string(),
                    }
                    .into());
                }
                if layout.pre_trig > layout.rows {
                    return Err(ConfigError::InvalidLayout {
                        reason: format!(
                            "pre-trigger {} exceeds {} rows",
                            layout.pre_trig, layout.rows
                        ),
                    }
                    .into());
                }
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Checks that blocks of `block_size` bytes can hold this channel's data.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBlockSize`] if the size is below the
    /// minimum, not a multiple of 8, or too small for one record or run.
    pub fn check_block_size(&self, block_size: usize) -> Result<()> {
        check_block_size(block_size)?;
        let needed = if self.kind.is_wave() {
            RUN_HEADER_SIZE + 8
        } else {
            self.item_bytes()
        };
        if block_size - BLOCK_HEADER_SIZE < needed {
            return Err(ConfigError::InvalidBlockSize {
                size: block_size,
                reason: format!("cannot hold one {needed} byte item"),
            }
            .into());
        }
        Ok(())
    }
}

fn check_block_size(block_size: usize) -> Result<()> {
    if block_size < MIN_BLOCK_SIZE {
        return Err(ConfigError::InvalidBlockSize {
            size: block_size,
            reason: format!("must be at least {MIN_BLOCK_SIZE}"),
        }
        .into());
    }
    if block_size % 8 != 0 {
        return Err(ConfigError::InvalidBlockSize {
            size: block_size,
            reason: "must be a multiple of 8".to_string(),
        }
        .into());
    }
    Ok(())
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_blocks() -> usize {
    DEFAULT_MAX_BLOCKS
}

/// Configuration of a whole data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Size of every block in the store.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Block slots reserved in a file-backed store.
    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,

    /// Channels by number.
    pub channels: BTreeMap<u16, ChannelConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: DEFAULT_MAX_BLOCKS,
            channels: BTreeMap::new(),
        }
    }
}

impl FileConfig {
    /// Validates the block geometry and every channel.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<()> {
        check_block_size(self.block_size)?;
        for config in self.channels.values() {
            config.validate()?;
            config.check_block_size(self.block_size)?;
        }
        Ok(())
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be loaded, or a validation error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}
