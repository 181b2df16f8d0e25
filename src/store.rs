//! Persisted zero offsets
//!
//! Offsets live in a single flash page of 16-bit words. Each 3-vector is
//! quantized over a symmetric range and written to a fixed slot, next to one
//! quantized configuration scalar; a validity mask word records which slots
//! hold data. Erased flash reads as `0xFFFF`, so a cleared bit means
//! "written".
//!
//! # Page Layout
//!
//! ```text
//! word 0..=2   accelerometer zero (x, y, z)    mask bit 0
//! word 3..=5   magnetometer zero (x, y, z)     mask bit 1
//! word 6       configuration scalar            mask bit 2
//! word 7       validity mask, bit cleared = slot written
//! word 8..=23  unused, left erased
//! ```

use crate::error::PersistenceError;
use crate::math::{dequantize, quantize};
use core::fmt;
use nalgebra::Vector3;

/// Words per page
pub const PAGE_WORDS: usize = 24;

/// Bits per stored component
pub const QUANTIZATION_BITS: u8 = 16;

const PARAMETER_WORD: usize = 6;
const PARAMETER_MASK: u16 = 1 << 2;
const VALIDITY_WORD: usize = 7;
const ERASED: u16 = 0xFFFF;

/// Raw page image
pub type Page = [u16; PAGE_WORDS];

/// Page-granular non-volatile storage
///
/// A write replaces the whole page (erase and program as one unit). Only one
/// owner may use an instance at a time.
pub trait PageStorage {
    type Error: fmt::Debug;

    /// Read the current page image
    fn read_page(&mut self) -> Result<Page, Self::Error>;

    /// Erase the page and program `page` into it
    fn write_page(&mut self, page: &Page) -> Result<(), Self::Error>;
}

/// Storage location of one persisted vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Slot {
    AccelerometerZero,
    MagnetometerZero,
}

impl Slot {
    fn first_word(self) -> usize {
        match self {
            Slot::AccelerometerZero => 0,
            Slot::MagnetometerZero => 3,
        }
    }

    fn mask(self) -> u16 {
        match self {
            Slot::AccelerometerZero => 1 << 0,
            Slot::MagnetometerZero => 1 << 1,
        }
    }
}

/// Quantized slot store over a [`PageStorage`]
///
/// Keeps a RAM mirror of the page. A store builds the next page image from
/// the mirror, writes it, and commits the mirror only when the write
/// succeeded, so a failed write leaves previously stored data as it was.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::store::{ParameterStore, RamPage, Slot};
///
/// let mut store = ParameterStore::new(RamPage::new());
/// assert_eq!(store.load(Slot::AccelerometerZero, 19.62), None);
///
/// store.store(&Vector3::new(0.1, -0.2, 0.3), Slot::AccelerometerZero, 19.62).unwrap();
/// let loaded = store.load(Slot::AccelerometerZero, 19.62).unwrap();
/// assert!((loaded - Vector3::new(0.1, -0.2, 0.3)).amax() < 19.62 / 32768.0);
/// ```
pub struct ParameterStore<S: PageStorage> {
    storage: S,
    mirror: Page,
}

impl<S: PageStorage> ParameterStore<S> {
    /// Wrap `storage`; the mirror starts erased until [`reload`](Self::reload)
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mirror: [ERASED; PAGE_WORDS],
        }
    }

    /// Refresh the RAM mirror from storage
    ///
    /// On failure the mirror keeps its previous contents.
    pub fn reload(&mut self) -> Result<(), PersistenceError<S::Error>> {
        self.mirror = self.storage.read_page().map_err(PersistenceError::Storage)?;
        Ok(())
    }

    /// Quantize `value` over ±`range` and persist it in `slot`
    ///
    /// Components outside the range saturate at its ends.
    pub fn store(
        &mut self,
        value: &Vector3<f32>,
        slot: Slot,
        range: f32,
    ) -> Result<(), PersistenceError<S::Error>> {
        check_range(range)?;
        if !value.iter().all(|v| v.is_finite()) {
            return Err(PersistenceError::InvalidValue);
        }

        let mut page = self.mirror;
        let first = slot.first_word();
        for (i, component) in value.iter().enumerate() {
            page[first + i] = quantize(*component, range, QUANTIZATION_BITS);
        }
        page[VALIDITY_WORD] &= !slot.mask();
        self.commit(page)
    }

    /// Quantize the configuration scalar over ±`range` and persist it
    ///
    /// Saturates like [`store`](Self::store).
    pub fn store_parameter(
        &mut self,
        value: f32,
        range: f32,
    ) -> Result<(), PersistenceError<S::Error>> {
        check_range(range)?;
        if !value.is_finite() {
            return Err(PersistenceError::InvalidValue);
        }

        let mut page = self.mirror;
        page[PARAMETER_WORD] = quantize(value, range, QUANTIZATION_BITS);
        page[VALIDITY_WORD] &= !PARAMETER_MASK;
        self.commit(page)
    }

    /// Stored value of `slot`, or `None` when nothing was ever written
    pub fn load(&self, slot: Slot, range: f32) -> Option<Vector3<f32>> {
        if check_range::<S::Error>(range).is_err() || !self.contains(slot) {
            return None;
        }

        let first = slot.first_word();
        Some(Vector3::from_fn(|i, _| {
            dequantize(self.mirror[first + i], range, QUANTIZATION_BITS)
        }))
    }

    /// Stored configuration scalar, or `None` when it was never written
    pub fn load_parameter(&self, range: f32) -> Option<f32> {
        let written = self.mirror[VALIDITY_WORD] & PARAMETER_MASK == 0;
        if check_range::<S::Error>(range).is_err() || !written {
            return None;
        }
        Some(dequantize(self.mirror[PARAMETER_WORD], range, QUANTIZATION_BITS))
    }

    /// Whether `slot` holds a stored value
    pub fn contains(&self, slot: Slot) -> bool {
        self.mirror[VALIDITY_WORD] & slot.mask() == 0
    }

    /// Current page image as last read or written
    pub fn page(&self) -> &Page {
        &self.mirror
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    fn commit(&mut self, page: Page) -> Result<(), PersistenceError<S::Error>> {
        self.storage
            .write_page(&page)
            .map_err(PersistenceError::Storage)?;
        self.mirror = page;
        Ok(())
    }
}

fn check_range<E>(range: f32) -> Result<(), PersistenceError<E>> {
    if range.is_finite() && range > 0.0 {
        Ok(())
    } else {
        Err(PersistenceError::InvalidRange)
    }
}

/// Write failure reported by [`RamPage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RamPageError {
    WriteFailed,
}

/// In-memory [`PageStorage`]
///
/// Starts erased. Writes can be made to fail for exercising error paths; a
/// failed write leaves the page untouched.
#[derive(Debug, Clone)]
pub struct RamPage {
    words: Page,
    fail_writes: bool,
    write_count: u32,
}

impl RamPage {
    /// Create an erased page
    pub fn new() -> Self {
        Self::with_contents([ERASED; PAGE_WORDS])
    }

    /// Create a page with the given contents
    pub fn with_contents(words: Page) -> Self {
        Self {
            words,
            fail_writes: false,
            write_count: 0,
        }
    }

    /// Make every following write fail (or succeed again)
    pub fn set_write_failure(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Number of successful writes
    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    pub fn words(&self) -> &Page {
        &self.words
    }
}

impl Default for RamPage {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStorage for RamPage {
    type Error = RamPageError;

    fn read_page(&mut self) -> Result<Page, Self::Error> {
        Ok(self.words)
    }

    fn write_page(&mut self, page: &Page) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(RamPageError::WriteFailed);
        }
        self.words = *page;
        self.write_count += 1;
        Ok(())
    }
}
