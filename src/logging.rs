//! Crate-internal logging macros
//!
//! With the `defmt` feature the macros forward to `defmt`; otherwise they
//! expand to nothing so the estimator stays free of any logging transport.

#[cfg(feature = "defmt")]
#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => { defmt::debug!($($arg)*) };
}

#[cfg(feature = "defmt")]
#[allow(unused_macros)]
macro_rules! log_info {
    ($($arg:tt)*) => { defmt::info!($($arg)*) };
}

#[cfg(feature = "defmt")]
macro_rules! log_warn {
    ($($arg:tt)*) => { defmt::warn!($($arg)*) };
}

// Stub macros when defmt is not available
#[cfg(not(feature = "defmt"))]
#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "defmt"))]
#[allow(unused_macros)]
macro_rules! log_info {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "defmt"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {{}};
}
