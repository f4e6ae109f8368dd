//! # chanfile
//!
//! Channel-oriented time-series filing engine with retrospective buffering.
//!
//! chanfile is the storage core of a data acquisition file: each channel
//! receives a stream of event times, markers, extended markers or waveform
//! samples, keeps the most recent data in a circular buffer, and files it
//! into fixed-size blocks. Whether buffered data is kept can be decided after
//! it arrived, up to the moment it leaves the buffer.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Time in integer ticks; every stored sequence is strictly increasing
//! - Retrospective save/discard per channel through a toggle list
//! - Fixed-size block images with a self-describing 32-byte header
//! - One read path over store, write block and buffer, with filters,
//!   budgets and cooperative yielding for long backward searches
//! - Extended marker grids readable as waveforms
//!
//! ## Quick Start
//!
//! ```rust
//! use chanfile::{Channel, ChannelConfig, ChannelKind, MemStore, SearchOutcome, TimeRange};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = MemStore::new(1024);
//!
//! // A 16-bit waveform sampled every 10 ticks, buffering 4096 samples
//! let config = ChannelConfig::waveform(ChannelKind::Adc, 10, 4096);
//! let mut adc = Channel::new(1, config, 1024)?;
//!
//! let samples: Vec<i16> = (0..1000).map(|i| (i % 100) as i16).collect();
//! adc.write_wave(&mut store, &samples, 0)?;
//! adc.flush(&mut store)?;
//!
//! // Read it back from the start
//! let mut out = vec![0i16; 1000];
//! assert_eq!(adc.read_wave(&store, &mut out, 0, 100_000)?, Some((1000, 0)));
//!
//! // Time of the 10th sample before t = 5000
//! let mut cursor = TimeRange::new(0, 5000, 10, false, 0);
//! assert_eq!(adc.prev_n_time(&store, &mut cursor, None)?, SearchOutcome::Found(4900));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Channel`]: write and read paths of one channel
//! - [`ChannelConfig`] / [`FileConfig`]: what a channel holds and how much it buffers
//! - [`BlockStore`]: ordered per-channel block storage, in memory or memory-mapped
//! - [`TimeRange`]: the cursor every read and search works through
//! - [`SaveList`]: retrospective save/discard toggles
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`time`]: ticks, the time range cursor and search outcomes
//! - [`stride`]: indexed record access over packed bytes
//! - [`record`]: markers, extended markers and their layouts
//! - [`filter`]: marker filters
//! - [`search`]: forward copy and backward search over one sequence
//! - [`save_list`]: save/discard interval list
//! - [`circ`]: circular record buffer
//! - [`circ_wave`]: circular waveform buffer
//! - [`extwave`]: extended marker grids read as waveforms
//! - [`block`]: on-disk block images
//! - [`store`]: block stores
//! - [`channel`]: channels
//! - [`config`]: configuration
//! - [`error`]: error types

pub mod block;
pub mod channel;
pub mod circ;
pub mod circ_wave;
pub mod config;
pub mod error;
pub mod extwave;
pub mod filter;
pub mod record;
pub mod save_list;
pub mod search;
pub mod store;
pub mod stride;
pub mod time;

// Re-export primary API types at crate root for convenience.
pub use block::{BlockHeader, BlockKind, DataBlock};
pub use channel::Channel;
pub use circ::CircBuffer;
pub use circ_wave::CircWaveBuffer;
pub use config::{ChannelConfig, ChannelKind, FileConfig};
pub use error::{ChanError, Result};
pub use filter::{CodeFilter, MarkerFilter};
pub use record::{ExtLayout, ExtMark, Marker};
pub use save_list::SaveList;
pub use store::{BlockStore, FileStore, MemStore};
pub use time::{SearchOutcome, Tick, TimeRange};
