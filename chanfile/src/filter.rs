//! Marker filters.
//!
//! Every marker and extended marker read or backward search takes an optional
//! filter. Before testing items one by one, callers ask for the filter's
//! overall [`FilterEffect`] so that accept-all and reject-all filters cost
//! nothing per item.

use crate::record::{FILTER_CODES, Marker};

/// Overall effect of a filter, independent of any particular item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterEffect {
    /// Every item passes.
    AcceptAll,
    /// No item passes.
    RejectAll,
    /// Items must be tested one at a time.
    PerItem,
}

/// A predicate over marker records.
pub trait MarkerFilter {
    /// The global effect of the filter.
    fn effect(&self) -> FilterEffect;

    /// Tests one marker.
    fn accepts(&self, marker: &Marker) -> bool;

    /// Trace selected for multi-trace extended marker waveform reads.
    fn column(&self) -> Option<usize> {
        None
    }
}

/// Effect of an optional filter; no filter accepts everything.
pub fn effect_of(filter: Option<&dyn MarkerFilter>) -> FilterEffect {
    filter.map_or(FilterEffect::AcceptAll, |f| f.effect())
}

/// How the per-code layers of a [`CodeFilter`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerMode {
    /// Each layer must accept its code byte.
    #[default]
    All,
    /// At least one layer must accept its code byte.
    Any,
}

const FULL: [u64; 4] = [u64::MAX; 4];

/// Filter on the four marker code bytes.
///
/// Layer `i` is a 256-bit set of accepted values for code byte `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFilter {
    layers: [[u64; 4]; FILTER_CODES],
    mode: LayerMode,
    column: Option<usize>,
}

impl Default for CodeFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl CodeFilter {
    /// A filter that accepts every code.
    pub fn accept_all() -> Self {
        Self {
            layers: [FULL; FILTER_CODES],
            mode: LayerMode::All,
            column: None,
        }
    }

    /// A filter that accepts nothing until codes are added.
    pub fn reject_all() -> Self {
        Self {
            layers: [[0; 4]; FILTER_CODES],
            mode: LayerMode::All,
            column: None,
        }
    }

    /// A filter that accepts only the listed values of code byte 0.
    pub fn only_codes(codes: &[u8]) -> Self {
        let mut filter = Self::accept_all();
        filter.clear_layer(0);
        for &c in codes {
            filter.set(0, c, true);
        }
        filter
    }

    /// Sets the combination mode.
    pub fn set_mode(&mut self, mode: LayerMode) {
        self.mode = mode;
    }

    /// Selects the trace used for extended marker waveform reads.
    pub fn set_column(&mut self, column: Option<usize>) {
        self.column = column;
    }

    /// Adds or removes `code` from `layer`.
    pub fn set(&mut self, layer: usize, code: u8, on: bool) {
        let (word, bit) = (usize::from(code) / 64, usize::from(code) % 64);
        if on {
            self.layers[layer][word] |= 1 << bit;
        } else {
            self.layers[layer][word] &= !(1 << bit);
        }
    }

    /// Removes every code from `layer`.
    pub fn clear_layer(&mut self, layer: usize) {
        self.layers[layer] = [0; 4];
    }

    /// Adds every code to `layer`.
    pub fn fill_layer(&mut self, layer: usize) {
        self.layers[layer] = FULL;
    }

    /// Whether `layer` accepts `code`.
    pub fn contains(&self, layer: usize, code: u8) -> bool {
        let (word, bit) = (usize::from(code) / 64, usize::from(code) % 64);
        self.layers[layer][word] & (1 << bit) != 0
    }

    fn layer_full(&self, layer: usize) -> bool {
        self.layers[layer] == FULL
    }

    fn layer_empty(&self, layer: usize) -> bool {
        self.layers[layer] == [0; 4]
    }
}

impl MarkerFilter for CodeFilter {
    fn effect(&self) -> FilterEffect {
        let layers = 0..FILTER_CODES;
        match self.mode {
            LayerMode::All => {
                if layers.clone().all(|l| self.layer_full(l)) {
                    FilterEffect::AcceptAll
                } else if layers.clone().any(|l| self.layer_empty(l)) {
                    FilterEffect::RejectAll
                } else {
                    FilterEffect::PerItem
                }
            }
            LayerMode::Any => {
                if layers.clone().any(|l| self.layer_full(l)) {
                    FilterEffect::AcceptAll
                } else if layers.clone().all(|l| self.layer_empty(l)) {
                    FilterEffect::RejectAll
                } else {
                    FilterEffect::PerItem
                }
            }
        }
    }

    fn accepts(&self, marker: &Marker) -> bool {
        let codes = marker.codes();
        match self.mode {
            LayerMode::All => (0..FILTER_CODES).all(|l| self.contains(l, codes[l])),
            LayerMode::Any => (0..FILTER_CODES).any(|l| self.contains(l, codes[l])),
        }
    }

    fn column(&self) -> Option<usize> {
        self.column
    }
}
