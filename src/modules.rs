//! Core DSP Modules
//!
//! This module provides the building blocks a voice is assembled from:
//! oscillator, envelope, resonant filter, gain stages, arithmetic and the
//! mixer. Each node declares its automatable ports as a small enum whose
//! discriminants are the [`PortId`]s accepted by [`Graph::automate`].
//!
//! [`Graph::automate`]: crate::graph::Graph::automate

use crate::automation::{ModulationMode, Param};
use crate::context::ProcessContext;
use crate::io::{EnvelopeMonitor, ParamHandle, WaveformHandle};
use crate::node::{AudioNode, NodeId, PortId, RenderIo};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

macro_rules! port_ids {
    ($($port:ty),* $(,)?) => {
        $(
            impl From<$port> for PortId {
                fn from(port: $port) -> Self {
                    port as PortId
                }
            }
        )*
    };
}

/// Automatable ports of an [`Oscillator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscillatorPort {
    Frequency = 0,
    PulseWidth = 1,
}

/// Automatable ports of an [`Adsr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsrPort {
    Gate = 0,
}

/// Automatable ports of an [`Lp12Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPort {
    Cutoff = 0,
    Resonance = 1,
    Detune = 2,
}

/// Automatable ports of a [`Gain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainPort {
    Gain = 0,
}

/// Automatable ports of a [`MulAdd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulAddPort {
    Multiply = 0,
    Add = 1,
}

/// Automatable ports of an [`Arithmetic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticPort {
    Value = 0,
}

/// Automatable ports of a [`Mixer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerPort {
    Level = 0,
}

port_ids!(
    OscillatorPort,
    AdsrPort,
    FilterPort,
    GainPort,
    MulAddPort,
    ArithmeticPort,
    MixerPort,
);

/// Convert a detune in cents to a frequency ratio
#[inline]
pub fn cents_to_ratio(cents: f32) -> f32 {
    libm::exp2f(cents / 1200.0)
}

// ============================================================================
// Oscillator
// ============================================================================

/// Oscillator waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    #[default]
    Sine,
    Triangle,
    Square,
    Sawtooth,
    InvSawtooth,
    /// Square with variable duty cycle taken from the pulse-width port
    Pulse,
}

impl Waveform {
    pub const ALL: [Waveform; 6] = [
        Waveform::Sine,
        Waveform::Triangle,
        Waveform::Square,
        Waveform::Sawtooth,
        Waveform::InvSawtooth,
        Waveform::Pulse,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Waveform::index`]; out-of-range indices map to sine
    pub fn from_index(index: u8) -> Self {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(Waveform::Sine)
    }

    /// One sample at `phase` radians in `[0, 2π)`
    #[inline]
    pub fn sample(self, phase: f64, pulse_width: f32) -> f32 {
        let x = phase / TAU;
        match self {
            Waveform::Sine => libm::sin(phase) as f32,
            Waveform::Triangle => (2.0 * (2.0 * (x - libm::floor(x + 0.5))).abs() - 1.0) as f32,
            Waveform::Square => {
                if libm::sin(phase) >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => (2.0 * (x - libm::floor(x + 0.5))) as f32,
            Waveform::InvSawtooth => (-2.0 * (x - libm::floor(x + 0.5))) as f32,
            Waveform::Pulse => {
                if x.rem_euclid(1.0) < (pulse_width as f64).rem_euclid(1.0) {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }
}

/// Periodic waveform generator
///
/// Frequency modulation is added to the base frequency; pulse-width
/// modulation replaces it. Detune (cents) and waveform are plain shared
/// cells read once per block.
pub struct Oscillator {
    params: [Param; 2],
    waveform: WaveformHandle,
    detune: ParamHandle,
    phase: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: f32) -> Self {
        Self {
            params: [
                Param::new("frequency", frequency).with_mode(ModulationMode::Offset),
                Param::new("pulse_width", 0.5),
            ],
            waveform: WaveformHandle::new(waveform),
            detune: ParamHandle::new(0.0),
            phase: 0.0,
        }
    }

    pub fn with_detune(self, cents: f32) -> Self {
        self.detune.set(cents);
        self
    }

    pub fn with_pulse_width(self, pulse_width: f32) -> Self {
        self.params[OscillatorPort::PulseWidth as usize].set_base(pulse_width);
        self
    }

    pub fn frequency(&self) -> ParamHandle {
        self.params[OscillatorPort::Frequency as usize].handle()
    }

    pub fn pulse_width(&self) -> ParamHandle {
        self.params[OscillatorPort::PulseWidth as usize].handle()
    }

    pub fn detune(&self) -> ParamHandle {
        self.detune.clone()
    }

    pub fn waveform(&self) -> WaveformHandle {
        self.waveform.clone()
    }

    /// Current phase in radians
    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn reset_phase(&mut self) {
        self.phase = 0.0;
    }
}

impl Default for Oscillator {
    fn default() -> Self {
        Self::new(Waveform::Sine, 440.0)
    }
}

impl AudioNode for Oscillator {
    fn render(&mut self, ctx: &ProcessContext, _io: &RenderIo<'_>, out: &mut [f32]) {
        let frames = ctx.frames;
        let ratio = cents_to_ratio(self.detune.get());
        let waveform = self.waveform.get();
        let increment = TAU / ctx.sample_rate as f64;
        let [frequency, pulse_width] = &self.params;
        let frequency = frequency.values(frames);
        let pulse_width = pulse_width.values(frames);

        for (i, sample) in out.iter_mut().enumerate() {
            *sample = waveform.sample(self.phase, pulse_width[i]);
            let hz = (frequency[i] * ratio) as f64;
            self.phase = (self.phase + increment * hz).rem_euclid(TAU);
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "oscillator"
    }
}

// ============================================================================
// ADSR envelope
// ============================================================================

/// Shortest attack, decay or release time in seconds
pub const MIN_STAGE_TIME: f32 = 1e-6;

/// Stage of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeStage {
    #[default]
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

impl EnvelopeStage {
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Self {
        match index {
            1 => EnvelopeStage::Attack,
            2 => EnvelopeStage::Decay,
            3 => EnvelopeStage::Sustain,
            4 => EnvelopeStage::Release,
            _ => EnvelopeStage::Idle,
        }
    }
}

/// Per-sample increments for one block
#[derive(Debug, Clone, Copy)]
struct EnvelopeRates {
    attack: f32,
    decay: f32,
    sustain: f32,
    release_samples: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct EnvelopeState {
    stage: EnvelopeStage,
    level: f32,
    release_step: f32,
}

impl EnvelopeState {
    #[inline]
    fn step(&mut self, gate: bool, rates: &EnvelopeRates) -> f32 {
        if gate && self.stage == EnvelopeStage::Idle {
            self.stage = EnvelopeStage::Attack;
        } else if !gate && !matches!(self.stage, EnvelopeStage::Idle | EnvelopeStage::Release) {
            self.stage = EnvelopeStage::Release;
            // Zero sustain would never release, so fall from the current level instead
            self.release_step = if rates.sustain > 0.0 {
                rates.sustain / rates.release_samples
            } else {
                self.level / rates.release_samples
            };
        }

        match self.stage {
            EnvelopeStage::Idle => self.level = 0.0,
            EnvelopeStage::Attack => {
                self.level += rates.attack;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                self.level -= rates.decay;
                if self.level <= rates.sustain {
                    self.level = rates.sustain;
                    self.stage = EnvelopeStage::Sustain;
                }
            }
            EnvelopeStage::Sustain => self.level = rates.sustain,
            EnvelopeStage::Release => {
                self.level -= self.release_step;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = EnvelopeStage::Idle;
                }
            }
        }
        self.level
    }
}

/// ADSR Envelope Generator
///
/// Gated linear envelope. The gate port reads as held while non-zero.
/// Release falls by `sustain / (release * sample_rate)` per sample from
/// whatever level the envelope had when the gate fell. With a sustain of zero
/// it falls from that level to zero in the release time instead.
pub struct Adsr {
    params: [Param; 1],
    attack: ParamHandle,
    decay: ParamHandle,
    sustain: ParamHandle,
    release: ParamHandle,
    state: EnvelopeState,
    monitor: EnvelopeMonitor,
}

impl Adsr {
    pub fn new(attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        let adsr = Self {
            params: [Param::new("gate", 0.0)],
            attack: ParamHandle::default(),
            decay: ParamHandle::default(),
            sustain: ParamHandle::default(),
            release: ParamHandle::default(),
            state: EnvelopeState::default(),
            monitor: EnvelopeMonitor::new(),
        };
        adsr.set_attack(attack);
        adsr.set_decay(decay);
        adsr.set_sustain(sustain);
        adsr.set_release(release);
        adsr
    }

    pub fn set_attack(&self, seconds: f32) {
        self.attack.set(seconds.max(MIN_STAGE_TIME));
    }

    pub fn set_decay(&self, seconds: f32) {
        self.decay.set(seconds.max(MIN_STAGE_TIME));
    }

    pub fn set_sustain(&self, level: f32) {
        self.sustain.set(level.clamp(0.0, 1.0));
    }

    pub fn set_release(&self, seconds: f32) {
        self.release.set(seconds.max(MIN_STAGE_TIME));
    }

    /// Gate base value; non-zero holds the note
    pub fn gate(&self) -> ParamHandle {
        self.params[AdsrPort::Gate as usize].handle()
    }

    pub fn attack(&self) -> ParamHandle {
        self.attack.clone()
    }

    pub fn decay(&self) -> ParamHandle {
        self.decay.clone()
    }

    pub fn sustain(&self) -> ParamHandle {
        self.sustain.clone()
    }

    pub fn release(&self) -> ParamHandle {
        self.release.clone()
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.state.stage
    }

    pub fn level(&self) -> f32 {
        self.state.level
    }

    pub fn monitor(&self) -> EnvelopeMonitor {
        self.monitor.clone()
    }

    fn rates(&self, sample_rate: f32) -> EnvelopeRates {
        // Handles may be written directly, so clamp again here
        let attack = self.attack.get().max(MIN_STAGE_TIME);
        let decay = self.decay.get().max(MIN_STAGE_TIME);
        let sustain = self.sustain.get().clamp(0.0, 1.0);
        let release = self.release.get().max(MIN_STAGE_TIME);
        EnvelopeRates {
            attack: 1.0 / (attack * sample_rate),
            decay: (1.0 - sustain) / (decay * sample_rate),
            sustain,
            release_samples: release * sample_rate,
        }
    }
}

impl Default for Adsr {
    fn default() -> Self {
        Self::new(0.01, 0.1, 0.7, 0.3)
    }
}

impl AudioNode for Adsr {
    fn render(&mut self, ctx: &ProcessContext, _io: &RenderIo<'_>, out: &mut [f32]) {
        let rates = self.rates(ctx.sample_rate);
        let gate = self.params[AdsrPort::Gate as usize].values(ctx.frames);
        for (sample, &g) in out.iter_mut().zip(gate) {
            *sample = self.state.step(g != 0.0, &rates);
        }
        self.monitor.publish(self.state.stage);
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "adsr"
    }
}

// ============================================================================
// LP12 filter
// ============================================================================

/// The two integrator registers of an [`Lp12Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilterState {
    pub pos: f32,
    pub speed: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Coefficients {
    q: f32,
    r: f32,
    c: f32,
}

impl Coefficients {
    fn compute(cutoff: f32, resonance: f32, detune: f32, sample_rate: f32) -> Self {
        let detuned = cutoff * cents_to_ratio(detune);
        let w = std::f32::consts::TAU * detuned / sample_rate;
        let q = 1.0 - w / (2.0 * (resonance + 0.5 / (1.0 + w)) + w - 2.0);
        let r = q * q;
        let c = r + 1.0 - 2.0 * libm::cosf(w) * q;
        Self { q, r, c }
    }
}

/// Resonant 12 dB/oct low-pass filter
///
/// Coefficients are only recomputed when cutoff, resonance, detune or the
/// sample rate move by more than `f32::EPSILON`.
pub struct Lp12Filter {
    params: [Param; 3],
    state: FilterState,
    coefficients: Coefficients,
    /// Cutoff, resonance, detune and sample rate the coefficients were derived from
    derived_from: Option<[f32; 4]>,
    recomputes: u64,
}

impl Lp12Filter {
    pub fn new(cutoff: f32, resonance: f32, detune: f32) -> Self {
        Self {
            params: [
                Param::new("cutoff", cutoff),
                Param::new("resonance", resonance),
                Param::new("detune", detune),
            ],
            state: FilterState::default(),
            coefficients: Coefficients::default(),
            derived_from: None,
            recomputes: 0,
        }
    }

    pub fn cutoff(&self) -> ParamHandle {
        self.params[FilterPort::Cutoff as usize].handle()
    }

    pub fn resonance(&self) -> ParamHandle {
        self.params[FilterPort::Resonance as usize].handle()
    }

    pub fn detune(&self) -> ParamHandle {
        self.params[FilterPort::Detune as usize].handle()
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = FilterState::default();
    }

    /// Number of coefficient recomputations so far
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    /// Feedback coefficient `q` currently in use
    pub fn feedback(&self) -> f32 {
        self.coefficients.q
    }
}

impl Default for Lp12Filter {
    fn default() -> Self {
        Self::new(20000.0, 1.0, 0.0)
    }
}

impl AudioNode for Lp12Filter {
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]) {
        let Some(input) = io.input() else {
            out.fill(0.0);
            return;
        };
        let frames = ctx.frames;
        let [cutoff, resonance, detune] = &self.params;
        let (cutoff, resonance, detune) = (
            cutoff.values(frames),
            resonance.values(frames),
            detune.values(frames),
        );

        for i in 0..frames {
            let current = [cutoff[i], resonance[i], detune[i], ctx.sample_rate];
            let stale = match self.derived_from {
                Some(previous) => previous
                    .iter()
                    .zip(&current)
                    .any(|(a, b)| (a - b).abs() > f32::EPSILON),
                None => true,
            };
            if stale {
                self.coefficients =
                    Coefficients::compute(current[0], current[1], current[2], current[3]);
                self.derived_from = Some(current);
                self.recomputes += 1;
            }

            let Coefficients { r, c, .. } = self.coefficients;
            self.state.speed += (input[i] - self.state.pos) * c;
            self.state.pos += self.state.speed;
            self.state.speed *= r;
            out[i] = self.state.pos;
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "lp12"
    }
}

// ============================================================================
// Gain, MulAdd, Arithmetic
// ============================================================================

/// Amplifier: `out = in * (gain + modulation)`
pub struct Gain {
    params: [Param; 1],
}

impl Gain {
    pub fn new(gain: f32) -> Self {
        Self {
            params: [Param::new("gain", gain).with_mode(ModulationMode::Offset)],
        }
    }

    pub fn gain(&self) -> ParamHandle {
        self.params[GainPort::Gain as usize].handle()
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl AudioNode for Gain {
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]) {
        let Some(input) = io.input() else {
            out.fill(0.0);
            return;
        };
        let gain = self.params[GainPort::Gain as usize].values(ctx.frames);
        for ((sample, x), g) in out.iter_mut().zip(input).zip(gain) {
            *sample = x * g;
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "gain"
    }
}

/// `out = in * multiply + add`, for rescaling modulation signals
pub struct MulAdd {
    params: [Param; 2],
}

impl MulAdd {
    pub fn new(multiply: f32, add: f32) -> Self {
        Self {
            params: [Param::new("multiply", multiply), Param::new("add", add)],
        }
    }

    pub fn multiply(&self) -> ParamHandle {
        self.params[MulAddPort::Multiply as usize].handle()
    }

    pub fn add(&self) -> ParamHandle {
        self.params[MulAddPort::Add as usize].handle()
    }
}

impl Default for MulAdd {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl AudioNode for MulAdd {
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]) {
        let Some(input) = io.input() else {
            out.fill(0.0);
            return;
        };
        let [multiply, add] = &self.params;
        let (multiply, add) = (multiply.values(ctx.frames), add.values(ctx.frames));
        for i in 0..ctx.frames {
            out[i] = input[i] * multiply[i] + add[i];
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "muladd"
    }
}

/// Binary operation applied by an [`Arithmetic`] node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Add,
    Subtract,
    Multiply,
    /// Division by zero yields zero
    Divide,
}

impl Operation {
    #[inline]
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            Operation::Add => lhs + rhs,
            Operation::Subtract => lhs - rhs,
            Operation::Multiply => lhs * rhs,
            Operation::Divide => {
                if rhs == 0.0 {
                    0.0
                } else {
                    lhs / rhs
                }
            }
        }
    }
}

/// `out = in <op> value`
pub struct Arithmetic {
    operation: Operation,
    params: [Param; 1],
}

impl Arithmetic {
    pub fn new(operation: Operation, value: f32) -> Self {
        Self {
            operation,
            params: [Param::new("value", value)],
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn set_operation(&mut self, operation: Operation) {
        self.operation = operation;
    }

    pub fn value(&self) -> ParamHandle {
        self.params[ArithmeticPort::Value as usize].handle()
    }
}

impl AudioNode for Arithmetic {
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]) {
        let Some(input) = io.input() else {
            out.fill(0.0);
            return;
        };
        let value = self.params[ArithmeticPort::Value as usize].values(ctx.frames);
        for ((sample, &x), &v) in out.iter_mut().zip(input).zip(value) {
            *sample = self.operation.apply(x, v);
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "arithmetic"
    }
}

// ============================================================================
// Mixer
// ============================================================================

/// How a [`Mixer`] scales the sum of its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixPolicy {
    /// Plain weighted sum
    #[default]
    Sum,
    /// Weighted sum scaled by `1/N` over the inputs that produced a block
    Average,
}

/// One member of a mixer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixerInput {
    pub node: NodeId,
    pub gain: f32,
}

/// N-ary weighted summing junction with dynamic membership
///
/// Membership changes go through the graph (or the engine's command queue),
/// so they only ever happen between blocks. Adding members beyond the
/// capacity given to [`Mixer::with_capacity`] allocates. The `Level` port
/// scales the final mix.
pub struct Mixer {
    inputs: Vec<MixerInput>,
    policy: MixPolicy,
    params: [Param; 1],
}

impl Mixer {
    pub fn new(policy: MixPolicy) -> Self {
        Self {
            inputs: Vec::new(),
            policy,
            params: [Param::new("level", 1.0)],
        }
    }

    /// Reserve room for `capacity` members so adding them later does not
    /// allocate
    pub fn with_capacity(policy: MixPolicy, capacity: usize) -> Self {
        let mut mixer = Self::new(policy);
        mixer.inputs.reserve(capacity);
        mixer
    }

    /// Returns `false` if `node` is already a member
    pub fn add_input(&mut self, node: NodeId, gain: f32) -> bool {
        if self.inputs.iter().any(|input| input.node == node) {
            return false;
        }
        self.inputs.push(MixerInput { node, gain });
        true
    }

    pub fn remove_input(&mut self, node: NodeId) -> bool {
        let before = self.inputs.len();
        self.inputs.retain(|input| input.node != node);
        self.inputs.len() != before
    }

    pub fn set_input_gain(&mut self, node: NodeId, gain: f32) -> bool {
        match self.inputs.iter_mut().find(|input| input.node == node) {
            Some(input) => {
                input.gain = gain;
                true
            }
            None => false,
        }
    }

    pub fn inputs(&self) -> &[MixerInput] {
        &self.inputs
    }

    pub fn policy(&self) -> MixPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: MixPolicy) {
        self.policy = policy;
    }

    pub fn level(&self) -> ParamHandle {
        self.params[MixerPort::Level as usize].handle()
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new(MixPolicy::Sum)
    }
}

impl AudioNode for Mixer {
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]) {
        out.fill(0.0);
        let mut live = 0usize;
        for member in &self.inputs {
            let Some(signal) = io.signal(member.node) else {
                continue;
            };
            live += 1;
            for (sample, x) in out.iter_mut().zip(signal) {
                *sample += x * member.gain;
            }
        }

        let scale = match self.policy {
            MixPolicy::Average if live > 0 => 1.0 / live as f32,
            _ => 1.0,
        };
        let level = self.params[MixerPort::Level as usize].values(ctx.frames);
        for (sample, l) in out.iter_mut().zip(level) {
            *sample *= scale * l;
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn visit_sources(&self, visit: &mut dyn FnMut(NodeId)) {
        for input in &self.inputs {
            visit(input.node);
        }
    }

    fn detach(&mut self, node: NodeId) {
        self.remove_input(node);
    }

    fn kind(&self) -> &'static str {
        "mixer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AudioContext;
    use crate::graph::Graph;
    use approx::assert_relative_eq;

    const SR: f32 = 44100.0;

    /// Render `blocks` blocks of `frames` from `root`, concatenated
    fn run(
        graph: &mut Graph,
        context: &mut AudioContext,
        root: NodeId,
        frames: usize,
        blocks: usize,
    ) -> Vec<f32> {
        let mut rendered = Vec::with_capacity(frames * blocks);
        for _ in 0..blocks {
            let ctx = context.begin_block(frames);
            rendered.extend_from_slice(graph.process(root, &ctx).unwrap());
        }
        rendered
    }

    #[test]
    fn test_sine_periodicity() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        // 44100 / 441 = exactly 100 samples per cycle
        let osc = graph.add("osc", Oscillator::new(Waveform::Sine, 441.0));
        let samples = run(&mut graph, &mut context, osc, 256, 4);

        for i in 0..samples.len() - 100 {
            assert!((samples[i + 100] - samples[i]).abs() < 1e-4, "sample {}", i);
        }
        assert_relative_eq!(samples[25], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_phase_stays_wrapped() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let osc = graph.add("osc", Oscillator::new(Waveform::Sawtooth, 9000.0));
        run(&mut graph, &mut context, osc, 512, 8);
        let phase = graph.node::<Oscillator>(osc).unwrap().phase();
        assert!((0.0..TAU).contains(&phase));
    }

    #[test]
    fn test_waveform_shapes() {
        use std::f64::consts::PI;
        assert_relative_eq!(Waveform::Triangle.sample(0.0, 0.5), -1.0);
        assert_relative_eq!(Waveform::Triangle.sample(PI, 0.5), 1.0);
        assert_relative_eq!(Waveform::Sawtooth.sample(PI / 2.0, 0.5), 0.5);
        assert_relative_eq!(Waveform::InvSawtooth.sample(PI / 2.0, 0.5), -0.5);
        assert_eq!(Waveform::Square.sample(0.5, 0.5), 1.0);
        assert_eq!(Waveform::Square.sample(PI + 0.5, 0.5), -1.0);
        assert_eq!(Waveform::Pulse.sample(0.2 * TAU, 0.25), 1.0);
        assert_eq!(Waveform::Pulse.sample(0.3 * TAU, 0.25), -1.0);
    }

    #[test]
    fn test_detune_shifts_pitch() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        // 220.5 Hz detuned up one octave has the same 100-sample period as 441 Hz
        let osc = graph.add(
            "osc",
            Oscillator::new(Waveform::Sine, 220.5).with_detune(1200.0),
        );
        let samples = run(&mut graph, &mut context, osc, 300, 1);
        for i in 0..200 {
            assert!((samples[i + 100] - samples[i]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_adsr_shape() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let adsr = Adsr::new(0.1, 0.1, 0.5, 0.2);
        let gate = adsr.gate();
        let env = graph.add("env", adsr);

        gate.set(1.0);
        let held = run(&mut graph, &mut context, env, 100, 100);

        // Attack reaches 1.0 at 0.1 s
        let peak = held.iter().position(|&l| l >= 1.0).unwrap();
        assert!((peak as i64 - 4409).abs() <= 1, "peak at {}", peak);
        assert!(held[..peak].windows(2).all(|w| w[1] >= w[0]));

        // Decay reaches sustain by 0.2 s and holds there
        let settled = 8820 + 4;
        assert!(held[settled..].iter().all(|&l| l == 0.5));
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Sustain);

        gate.set(0.0);
        let released = run(&mut graph, &mut context, env, 100, 100);
        assert!(released.windows(2).all(|w| w[1] <= w[0]));
        let quiet = released.iter().position(|&l| l <= 0.01).unwrap();
        // Release slope is sustain / (release * sr), so 0.01 comes within release * sr
        assert!(quiet <= 8820, "quiet after {}", quiet);
        assert_eq!(*released.last().unwrap(), 0.0);
        assert!(graph.node::<Adsr>(env).unwrap().monitor().is_idle());
    }

    #[test]
    fn test_adsr_gate_fall_interrupts_attack() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let adsr = Adsr::new(1.0, 0.1, 0.5, 0.01);
        let gate = adsr.gate();
        let env = graph.add("env", adsr);

        gate.set(1.0);
        run(&mut graph, &mut context, env, 64, 10);
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Attack);

        gate.set(0.0);
        let block = run(&mut graph, &mut context, env, 64, 1);
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Release);
        assert!(block[1] < block[0]);

        // 0.01 s of release from a partial level still ends at zero
        run(&mut graph, &mut context, env, 64, 10);
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Idle);
    }

    #[test]
    fn test_adsr_clamps_settings() {
        let adsr = Adsr::new(0.0, -1.0, 2.0, 0.0);
        assert_eq!(adsr.attack().get(), MIN_STAGE_TIME);
        assert_eq!(adsr.decay().get(), MIN_STAGE_TIME);
        assert_eq!(adsr.sustain().get(), 1.0);
        assert_eq!(adsr.release().get(), MIN_STAGE_TIME);
    }

    #[test]
    fn test_adsr_instant_stages() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let adsr = Adsr::new(0.0, 0.0, 1.0, 0.0);
        adsr.gate().set(1.0);
        let env = graph.add("env", adsr);
        let block = run(&mut graph, &mut context, env, 32, 1);
        assert!(block.iter().all(|&l| l == 1.0));
    }

    #[test]
    fn test_adsr_release_from_decay_uses_sustain_slope() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let adsr = Adsr::new(0.0, 1.0, 0.5, 0.1);
        let gate = adsr.gate();
        let env = graph.add("env", adsr);

        gate.set(1.0);
        let held = run(&mut graph, &mut context, env, 441, 10);
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Decay);
        let last = *held.last().unwrap();
        assert!(last > 0.9);

        gate.set(0.0);
        let released = run(&mut graph, &mut context, env, 64, 1);
        let step = 0.5 / (0.1 * SR);
        assert_relative_eq!(last - released[0], step, epsilon = 1e-6);
        assert_relative_eq!(released[0] - released[1], step, epsilon = 1e-6);
    }

    #[test]
    fn test_adsr_zero_sustain_still_releases() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let adsr = Adsr::new(0.0, 1.0, 0.0, 0.01);
        let gate = adsr.gate();
        let env = graph.add("env", adsr);

        gate.set(1.0);
        run(&mut graph, &mut context, env, 441, 2);
        assert!(graph.node::<Adsr>(env).unwrap().level() > 0.9);

        // Falls from the level at gate-off to zero in 0.01 s (441 samples)
        gate.set(0.0);
        let released = run(&mut graph, &mut context, env, 512, 1);
        assert!(released[..400].iter().all(|&l| l > 0.0));
        assert!(released[445..].iter().all(|&l| l == 0.0));
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Idle);
    }

    #[test]
    fn test_adsr_gate_reopened_during_release() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let adsr = Adsr::new(0.0, 0.0, 1.0, 0.01);
        let gate = adsr.gate();
        let env = graph.add("env", adsr);

        gate.set(1.0);
        run(&mut graph, &mut context, env, 64, 1);
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Sustain);

        gate.set(0.0);
        run(&mut graph, &mut context, env, 64, 1);
        gate.set(1.0);

        // The release runs to completion before the envelope restarts
        let block = run(&mut graph, &mut context, env, 64, 1);
        assert!(block.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Release);

        let block = run(&mut graph, &mut context, env, 512, 1);
        assert!(block.contains(&0.0));
        assert_eq!(*block.last().unwrap(), 1.0);
        assert_eq!(graph.node::<Adsr>(env).unwrap().stage(), EnvelopeStage::Sustain);
    }

    #[test]
    fn test_pulse_width_driven_by_upstream() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        // 100-sample period; the width source replaces the 0.5 base
        let osc = graph.add("osc", Oscillator::new(Waveform::Pulse, 441.0));
        let width = graph.add("width", crate::automation::Automation::new(0.25));
        graph.automate(width, osc, OscillatorPort::PulseWidth).unwrap();

        let samples = run(&mut graph, &mut context, osc, 100, 1);
        let high = samples.iter().filter(|&&s| s > 0.0).count();
        assert!((24..=26).contains(&high), "high for {} samples", high);
    }

    #[test]
    fn test_frequency_modulation_adds_to_base() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        // 220.5 Hz base plus a constant 220.5 Hz offset plays at 441 Hz
        let osc = graph.add("osc", Oscillator::new(Waveform::Sine, 220.5));
        let fm = graph.add("fm", crate::automation::Automation::new(220.5));
        graph.automate(fm, osc, OscillatorPort::Frequency).unwrap();

        let samples = run(&mut graph, &mut context, osc, 300, 1);
        for i in 0..200 {
            assert!((samples[i + 100] - samples[i]).abs() < 1e-3, "sample {}", i);
        }
        assert_relative_eq!(samples[25], 1.0, epsilon = 1e-3);
        assert_eq!(graph.node::<Oscillator>(osc).unwrap().frequency().get(), 220.5);
    }

    #[test]
    fn test_filter_silent_without_input() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let osc = graph.add("osc", Oscillator::new(Waveform::Square, 110.0));
        let filter = graph.add("filter", Lp12Filter::new(800.0, 2.0, 0.0));
        graph.connect(osc, filter).unwrap();
        run(&mut graph, &mut context, filter, 128, 2);

        let before = graph.node::<Lp12Filter>(filter).unwrap().state();
        assert_ne!(before, FilterState::default());

        graph.set_input(filter, None).unwrap();
        let block = run(&mut graph, &mut context, filter, 128, 1);
        assert!(block.iter().all(|&s| s == 0.0));
        assert_eq!(graph.node::<Lp12Filter>(filter).unwrap().state(), before);
    }

    #[test]
    fn test_filter_coefficients_amortized() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let osc = graph.add("osc", Oscillator::new(Waveform::Sawtooth, 220.0));
        let filter = graph.add("filter", Lp12Filter::default());
        graph.connect(osc, filter).unwrap();

        run(&mut graph, &mut context, filter, 256, 4);
        assert_eq!(graph.node::<Lp12Filter>(filter).unwrap().recompute_count(), 1);

        graph.set_param(filter, FilterPort::Cutoff, 1000.0).unwrap();
        run(&mut graph, &mut context, filter, 256, 4);
        assert_eq!(graph.node::<Lp12Filter>(filter).unwrap().recompute_count(), 2);

        // A cutoff sweep recomputes on every changed sample
        let lfo = graph.add("lfo", Oscillator::new(Waveform::Sawtooth, 5.0));
        let depth = graph.add("depth", MulAdd::new(500.0, 1000.0));
        graph.connect(lfo, depth).unwrap();
        graph.automate(depth, filter, FilterPort::Cutoff).unwrap();
        run(&mut graph, &mut context, filter, 64, 1);
        assert!(graph.node::<Lp12Filter>(filter).unwrap().recompute_count() > 2 + 60);
    }

    #[test]
    fn test_filter_passes_dc() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let dc = graph.add("dc", crate::automation::Automation::new(1.0));
        let filter = graph.add("filter", Lp12Filter::new(1000.0, 1.0, 0.0));
        graph.connect(dc, filter).unwrap();
        let out = run(&mut graph, &mut context, filter, 512, 20);
        assert_relative_eq!(*out.last().unwrap(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_gain_scales_input() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let dc = graph.add("dc", crate::automation::Automation::new(0.5));
        let gain = graph.add("gain", Gain::new(3.0));
        graph.connect(dc, gain).unwrap();
        let block = run(&mut graph, &mut context, gain, 16, 1);
        assert!(block.iter().all(|&s| s == 1.5));
    }

    #[test]
    fn test_muladd_rescales_lfo() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let lfo = graph.add("lfo", Oscillator::new(Waveform::Sine, 3.0));
        let scale = graph.add("scale", MulAdd::new(100.0, 440.0));
        graph.connect(lfo, scale).unwrap();
        let block = run(&mut graph, &mut context, scale, 4096, 4);
        assert!(block.iter().all(|&s| (340.0..=540.0).contains(&s)));
        assert_eq!(block[0], 440.0);
    }

    #[test]
    fn test_arithmetic_divide_by_zero() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let dc = graph.add("dc", crate::automation::Automation::new(2.0));
        let div = graph.add("div", Arithmetic::new(Operation::Divide, 0.0));
        graph.connect(dc, div).unwrap();
        let block = run(&mut graph, &mut context, div, 8, 1);
        assert!(block.iter().all(|&s| s == 0.0));

        graph.set_param(div, ArithmeticPort::Value, 4.0).unwrap();
        let block = run(&mut graph, &mut context, div, 8, 1);
        assert!(block.iter().all(|&s| s == 0.5));

        graph.node_mut::<Arithmetic>(div).unwrap().set_operation(Operation::Subtract);
        let block = run(&mut graph, &mut context, div, 8, 1);
        assert!(block.iter().all(|&s| s == -2.0));
    }

    #[test]
    fn test_operations() {
        assert_eq!(Operation::Add.apply(2.0, 3.0), 5.0);
        assert_eq!(Operation::Subtract.apply(2.0, 3.0), -1.0);
        assert_eq!(Operation::Multiply.apply(2.0, 3.0), 6.0);
        assert_eq!(Operation::Divide.apply(3.0, 2.0), 1.5);
    }

    #[test]
    fn test_arithmetic_add_and_multiply() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let dc = graph.add("dc", crate::automation::Automation::new(2.0));
        let op = graph.add("op", Arithmetic::new(Operation::Add, 3.0));
        graph.connect(dc, op).unwrap();
        let block = run(&mut graph, &mut context, op, 8, 1);
        assert!(block.iter().all(|&s| s == 5.0));

        graph.node_mut::<Arithmetic>(op).unwrap().set_operation(Operation::Multiply);
        let block = run(&mut graph, &mut context, op, 8, 1);
        assert!(block.iter().all(|&s| s == 6.0));
    }

    #[test]
    fn test_empty_mixer_outputs_zeros() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let mixer = graph.add("mixer", Mixer::default());
        let block = run(&mut graph, &mut context, mixer, 200, 1);
        assert_eq!(block.len(), 200);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mixer_policies_and_membership() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let a = graph.add("a", crate::automation::Automation::new(1.0));
        let b = graph.add("b", crate::automation::Automation::new(3.0));
        let mixer = graph.add("mixer", Mixer::new(MixPolicy::Sum));

        assert!(graph.add_mixer_input(mixer, a, 1.0).unwrap());
        assert!(graph.add_mixer_input(mixer, b, 0.5).unwrap());
        assert!(!graph.add_mixer_input(mixer, a, 2.0).unwrap());
        assert_eq!(graph.node::<Mixer>(mixer).unwrap().inputs().len(), 2);

        let block = run(&mut graph, &mut context, mixer, 4, 1);
        assert!(block.iter().all(|&s| s == 2.5));

        graph.node_mut::<Mixer>(mixer).unwrap().set_policy(MixPolicy::Average);
        let block = run(&mut graph, &mut context, mixer, 4, 1);
        assert!(block.iter().all(|&s| s == 1.25));

        assert!(graph.set_mixer_gain(mixer, b, 1.0).unwrap());
        assert!(graph.remove_mixer_input(mixer, a).unwrap());
        let block = run(&mut graph, &mut context, mixer, 4, 1);
        assert!(block.iter().all(|&s| s == 3.0));

        // Removing a member node from the graph drops it from the mixer
        graph.remove(b).unwrap();
        assert!(graph.node::<Mixer>(mixer).unwrap().inputs().is_empty());
    }

    #[test]
    fn test_mixer_level_gates_output() {
        let mut graph = Graph::new();
        let mut context = AudioContext::new(SR);
        let a = graph.add("a", crate::automation::Automation::new(1.0));
        let mixer = graph.add("mixer", Mixer::default());
        graph.add_mixer_input(mixer, a, 1.0).unwrap();
        graph.set_param(mixer, MixerPort::Level, 0.0).unwrap();
        let block = run(&mut graph, &mut context, mixer, 4, 1);
        assert!(block.iter().all(|&s| s == 0.0));
    }
}
