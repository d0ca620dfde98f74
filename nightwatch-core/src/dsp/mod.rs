//! DSP primitives shared by the detectors.
//!
//! Everything here is allocation-light and bounded: filters are stateful
//! per-sample IIR sections, windows are fixed-capacity rings, and spectral
//! passes run over slices the caller already holds. Detector ticks call
//! these synchronously between awaits; none of it yields.

pub mod filter;
pub mod peaks;
pub mod spectrum;
pub mod stats;
pub mod window;

pub use filter::{BandPass, EnvelopeFollower, OnePoleLowPass};
pub use peaks::find_peaks;
pub use spectrum::{SpectralPeak, Spectrum};
pub use stats::{mean, median, percentile, rms, rmssd, std_dev};
pub use window::{SampleWindow, TimedWindow};
