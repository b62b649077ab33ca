//! Clock and Processing Context
//!
//! The [`AudioContext`] is the single timing reference shared by every node:
//! it owns the sample rate (writable from any thread), the generation counter
//! that identifies each processing pass, and the running sample clock used to
//! timestamp scheduled automation. Each audio callback turns it into a
//! [`ProcessContext`], which is passed explicitly into every `process` call.

use crate::io::AtomicF32;
use std::sync::Arc;

/// Sample rate used when a context is created with an unusable one
pub const DEFAULT_SAMPLE_RATE: f32 = 44100.0;

fn is_valid_sample_rate(sample_rate: f32) -> bool {
    sample_rate.is_finite() && sample_rate > 0.0
}

/// Identifies one processing pass over the graph.
///
/// A node that has already been processed for a generation returns its cached
/// buffer instead of rendering again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The generation following this one
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Per-block view of the clock, handed to every node during a pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessContext {
    /// Number of frames to render
    pub frames: usize,
    /// Identity of this processing pass
    pub generation: Generation,
    /// Sample rate in Hz, sampled once at the start of the block
    pub sample_rate: f32,
    /// Absolute position of the first frame of the block
    pub sample_position: u64,
}

impl ProcessContext {
    pub fn new(frames: usize, generation: Generation, sample_rate: f32) -> Self {
        Self {
            frames,
            generation,
            sample_rate,
            sample_position: 0,
        }
    }

    pub fn at_position(mut self, sample_position: u64) -> Self {
        self.sample_position = sample_position;
        self
    }

    /// Timestamp in seconds of a frame within this block
    #[inline]
    pub fn time_at(&self, frame: usize) -> f64 {
        (self.sample_position + frame as u64) as f64 / self.sample_rate as f64
    }

    /// Duration of the block in seconds
    pub fn duration(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

/// Shared sample-rate and timing reference.
///
/// Created once when the engine starts; outlives every node. The sample rate
/// lives behind an atomic so a control thread may change it while the
/// realtime thread reads it at the start of every block.
#[derive(Debug)]
pub struct AudioContext {
    sample_rate: Arc<AtomicF32>,
    generation: Generation,
    sample_position: u64,
}

impl AudioContext {
    /// Non-positive or non-finite rates fall back to [`DEFAULT_SAMPLE_RATE`]
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = if is_valid_sample_rate(sample_rate) {
            sample_rate
        } else {
            tracing::warn!(sample_rate, "invalid sample rate, using the default");
            DEFAULT_SAMPLE_RATE
        };
        Self {
            sample_rate: Arc::new(AtomicF32::new(sample_rate)),
            generation: Generation::default(),
            sample_position: 0,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate.get()
    }

    /// Change the sample rate; non-positive or non-finite rates are ignored
    pub fn set_sample_rate(&self, sample_rate: f32) {
        if is_valid_sample_rate(sample_rate) {
            self.sample_rate.set(sample_rate);
        } else {
            tracing::warn!(sample_rate, "ignoring invalid sample rate");
        }
    }

    /// Shared cell holding the sample rate, for control threads
    pub fn sample_rate_cell(&self) -> Arc<AtomicF32> {
        Arc::clone(&self.sample_rate)
    }

    /// The most recently issued generation
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn sample_position(&self) -> u64 {
        self.sample_position
    }

    /// Start a new processing pass of `frames` samples.
    ///
    /// Increments the generation exactly once and advances the sample clock.
    pub fn begin_block(&mut self, frames: usize) -> ProcessContext {
        self.generation = self.generation.next();
        let ctx = ProcessContext::new(frames, self.generation, self.sample_rate())
            .at_position(self.sample_position);
        self.sample_position += frames as u64;
        ctx
    }

    /// Rewind the sample clock (the generation keeps counting)
    pub fn rewind(&mut self) {
        self.sample_position = 0;
    }
}

impl Default for AudioContext {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}
