//! External I/O Integration
//!
//! This module provides the pieces that bridge the node graph with the
//! threads around it: lock-free scalar cells written by a GUI or MIDI thread
//! and read by the audio thread, and the [`Render`] boundary an audio driver
//! pulls rendered blocks through.

use crate::modules::{EnvelopeStage, Waveform};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Atomic f32 for lock-free communication between threads
///
/// Uses AtomicU32 internally since there's no native AtomicF32.
/// A single-word store, so readers never observe a torn value.
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    /// Create a new atomic f32 with the given initial value
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    /// Get the current value
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Set a new value
    #[inline]
    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Load with specified ordering
    pub fn load(&self, ordering: Ordering) -> f32 {
        f32::from_bits(self.0.load(ordering))
    }

    /// Store with specified ordering
    pub fn store(&self, value: f32, ordering: Ordering) {
        self.0.store(value.to_bits(), ordering);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clone for AtomicF32 {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// Shared handle to a scalar control value (a knob).
///
/// Cloning the handle shares the cell. Writes are eventually visible to the
/// audio thread at the latest on the next block.
#[derive(Debug, Clone, Default)]
pub struct ParamHandle(Arc<AtomicF32>);

impl ParamHandle {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicF32::new(value)))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.0.get()
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.0.set(value);
    }

    /// Whether two handles share the same cell
    pub fn shares_cell(&self, other: &ParamHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Shared handle to an oscillator waveform selection
#[derive(Debug, Clone)]
pub struct WaveformHandle(Arc<AtomicU8>);

impl WaveformHandle {
    pub fn new(waveform: Waveform) -> Self {
        Self(Arc::new(AtomicU8::new(waveform.index())))
    }

    #[inline]
    pub fn get(&self) -> Waveform {
        Waveform::from_index(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, waveform: Waveform) {
        self.0.store(waveform.index(), Ordering::Relaxed);
    }
}

impl Default for WaveformHandle {
    fn default() -> Self {
        Self::new(Waveform::default())
    }
}

/// Read-only view of an envelope's stage, published once per block
#[derive(Debug, Clone, Default)]
pub struct EnvelopeMonitor(Arc<AtomicU8>);

impl EnvelopeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> EnvelopeStage {
        EnvelopeStage::from_index(self.0.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.stage() == EnvelopeStage::Idle
    }

    pub(crate) fn publish(&self, stage: EnvelopeStage) {
        self.0.store(stage.index(), Ordering::Release);
    }
}

/// Convert a MIDI note index to frequency in Hz (A4 = note 69 = 440 Hz)
#[inline]
pub fn note_to_frequency(note: u8) -> f32 {
    440.0 * libm::exp2f((note as f32 - 69.0) / 12.0)
}

/// Boundary between the synthesis core and an audio driver.
///
/// The driver calls [`Render::render`] once per hardware buffer and takes care
/// of device I/O, channel duplication and sample-format conversion itself.
pub trait Render {
    /// Render `frames` mono samples, one per frame
    fn render(&mut self, frames: usize) -> &[f32];

    /// Sample rate the rendered samples are meant to be played at
    fn sample_rate(&self) -> f32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::thread;

    #[test]
    fn test_atomic_f32_roundtrip() {
        let value = AtomicF32::new(0.25);
        assert_eq!(value.get(), 0.25);
        value.set(-3.5);
        assert_eq!(value.get(), -3.5);
        value.store(1.0, Ordering::SeqCst);
        assert_eq!(value.load(Ordering::SeqCst), 1.0);
    }

    #[test]
    fn test_param_handle_shared_across_threads() {
        let handle = ParamHandle::new(0.0);
        let writer = handle.clone();
        assert!(handle.shares_cell(&writer));
        thread::spawn(move || writer.set(880.0)).join().unwrap();
        assert_eq!(handle.get(), 880.0);
        assert!(!handle.shares_cell(&ParamHandle::new(880.0)));
    }

    #[test]
    fn test_waveform_handle() {
        let handle = WaveformHandle::new(Waveform::Triangle);
        assert_eq!(handle.get(), Waveform::Triangle);
        handle.set(Waveform::Pulse);
        assert_eq!(handle.get(), Waveform::Pulse);
    }

    #[test]
    fn test_envelope_monitor_defaults_to_idle() {
        let monitor = EnvelopeMonitor::new();
        assert!(monitor.is_idle());
        monitor.publish(EnvelopeStage::Sustain);
        assert_eq!(monitor.stage(), EnvelopeStage::Sustain);
    }

    #[test]
    fn test_note_to_frequency() {
        assert_relative_eq!(note_to_frequency(69), 440.0, epsilon = 1e-3);
        assert_relative_eq!(note_to_frequency(57), 220.0, epsilon = 1e-3);
        assert_relative_eq!(note_to_frequency(60), 261.6256, epsilon = 1e-2);
    }
}
