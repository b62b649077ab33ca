//! Polyphony Support
//!
//! This module assembles the DSP modules into playable voices and pools them.
//!
//! # Architecture
//!
//! - [`VoiceParams`] - Serializable parameter block for one voice
//! - [`Voice`] - Two oscillators with tremolo, a volume envelope and an output
//!   mixer, wired into a [`Graph`]
//! - [`VoicePool`] - A fixed set of voices summed into one output, with note
//!   allocation
//!
//! A voice lives in the graph as ordinary nodes; the [`Voice`] value held by the
//! control thread only keeps node ids and shared parameter handles, so every
//! setter here is safe to call while the audio thread renders.

use crate::graph::{Graph, GraphError};
use crate::io::{note_to_frequency, EnvelopeMonitor, ParamHandle, WaveformHandle};
use crate::modules::{
    Adsr, EnvelopeStage, Gain, GainPort, MixPolicy, Mixer, MixerPort, Oscillator, Waveform,
};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// Settings of one of the two primary oscillators
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillatorParams {
    pub waveform: Waveform,
    /// Octave offset from the voice pitch
    pub octave: i8,
    /// Detune in cents
    pub detune: f32,
    pub gain: f32,
    /// Tremolo depth
    pub mod_gain: f32,
}

impl Default for OscillatorParams {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            octave: 0,
            detune: 0.0,
            gain: 0.9,
            mod_gain: 0.1,
        }
    }
}

impl OscillatorParams {
    /// Frequency this oscillator plays for a voice pitch
    pub fn frequency_for(&self, pitch: f32) -> f32 {
        pitch * libm::exp2f(self.octave as f32)
    }
}

/// Volume envelope settings, in seconds (sustain is a level)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            attack: 1.1,
            decay: 0.1,
            sustain: 1.0,
            release: 1.5,
        }
    }
}

/// Full parameter block for a voice
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    /// Pitch in Hz before per-oscillator octave offsets
    pub frequency: f32,
    pub mod_waveform: Waveform,
    pub mod_frequency: f32,
    pub oscillator_1: OscillatorParams,
    pub oscillator_2: OscillatorParams,
    pub envelope: EnvelopeParams,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            mod_waveform: Waveform::Sine,
            mod_frequency: 5.0,
            oscillator_1: OscillatorParams::default(),
            oscillator_2: OscillatorParams {
                octave: -1,
                gain: 0.6,
                ..OscillatorParams::default()
            },
            envelope: EnvelopeParams::default(),
        }
    }
}

impl VoiceParams {
    pub fn with_frequency(mut self, hz: f32) -> Self {
        self.frequency = hz;
        self
    }

    pub fn with_mod_waveform(mut self, waveform: Waveform) -> Self {
        self.mod_waveform = waveform;
        self
    }

    pub fn with_mod_frequency(mut self, hz: f32) -> Self {
        self.mod_frequency = hz;
        self
    }

    pub fn with_oscillator(mut self, which: OscillatorSlot, params: OscillatorParams) -> Self {
        *self.oscillator_mut(which) = params;
        self
    }

    pub fn with_waveform(mut self, which: OscillatorSlot, waveform: Waveform) -> Self {
        self.oscillator_mut(which).waveform = waveform;
        self
    }

    pub fn with_octave(mut self, which: OscillatorSlot, octave: i8) -> Self {
        self.oscillator_mut(which).octave = octave;
        self
    }

    pub fn with_detune(mut self, which: OscillatorSlot, cents: f32) -> Self {
        self.oscillator_mut(which).detune = cents;
        self
    }

    pub fn with_gain(mut self, which: OscillatorSlot, gain: f32) -> Self {
        self.oscillator_mut(which).gain = gain;
        self
    }

    pub fn with_mod_gain(mut self, which: OscillatorSlot, gain: f32) -> Self {
        self.oscillator_mut(which).mod_gain = gain;
        self
    }

    pub fn with_envelope(mut self, attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        self.envelope = EnvelopeParams {
            attack,
            decay,
            sustain,
            release,
        };
        self
    }

    pub fn oscillator(&self, which: OscillatorSlot) -> &OscillatorParams {
        match which {
            OscillatorSlot::First => &self.oscillator_1,
            OscillatorSlot::Second => &self.oscillator_2,
        }
    }

    fn oscillator_mut(&mut self, which: OscillatorSlot) -> &mut OscillatorParams {
        match which {
            OscillatorSlot::First => &mut self.oscillator_1,
            OscillatorSlot::Second => &mut self.oscillator_2,
        }
    }
}

/// Selects one of the two primary oscillators of a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscillatorSlot {
    First,
    Second,
}

/// Node ids of a voice's internals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceNodes {
    pub modulator: NodeId,
    pub oscillator_1: NodeId,
    pub oscillator_2: NodeId,
    pub tremolo_1: NodeId,
    pub tremolo_2: NodeId,
    pub gain_1: NodeId,
    pub gain_2: NodeId,
    pub envelope: NodeId,
    pub mixer: NodeId,
}

#[derive(Debug, Clone)]
struct OscillatorControls {
    waveform: WaveformHandle,
    frequency: ParamHandle,
    detune: ParamHandle,
    gain: ParamHandle,
    mod_gain: ParamHandle,
}

impl OscillatorControls {
    fn apply(&self, params: &OscillatorParams, pitch: f32) {
        self.waveform.set(params.waveform);
        self.frequency.set(params.frequency_for(pitch));
        self.detune.set(params.detune);
        self.gain.set(params.gain);
        self.mod_gain.set(params.mod_gain);
    }
}

#[derive(Debug, Clone)]
struct EnvelopeControls {
    gate: ParamHandle,
    attack: ParamHandle,
    decay: ParamHandle,
    sustain: ParamHandle,
    release: ParamHandle,
    monitor: EnvelopeMonitor,
}

/// One playable instance of the synthesis chain
///
/// ```text
/// modulator ─┬─> tremolo_1 ──(gain)──┐
///            └─> tremolo_2 ──(gain)─┐│
/// oscillator_1 ──────────────> gain_1 ──┐
/// oscillator_2 ──────────────> gain_2 ──┴─> mixer ─> out
/// envelope ─────────────────────────(level)──┘
/// ```
#[derive(Debug, Clone)]
pub struct Voice {
    nodes: VoiceNodes,
    params: VoiceParams,
    mod_waveform: WaveformHandle,
    mod_frequency: ParamHandle,
    oscillator_1: OscillatorControls,
    oscillator_2: OscillatorControls,
    envelope: EnvelopeControls,
}

impl Voice {
    /// Add the voice's nodes to `graph` and wire them up
    pub fn build(graph: &mut Graph, params: &VoiceParams) -> Result<Self, GraphError> {
        let modulator = Oscillator::new(params.mod_waveform, params.mod_frequency);
        let mod_waveform = modulator.waveform();
        let mod_frequency = modulator.frequency();
        let modulator = graph.add("modulator", modulator);

        let (oscillator_1, tremolo_1, gain_1, controls_1) = Self::build_oscillator(
            graph,
            modulator,
            &params.oscillator_1,
            params.frequency,
            ["oscillator_1", "tremolo_1", "gain_1"],
        )?;
        let (oscillator_2, tremolo_2, gain_2, controls_2) = Self::build_oscillator(
            graph,
            modulator,
            &params.oscillator_2,
            params.frequency,
            ["oscillator_2", "tremolo_2", "gain_2"],
        )?;

        let env = &params.envelope;
        let adsr = Adsr::new(env.attack, env.decay, env.sustain, env.release);
        let envelope_controls = EnvelopeControls {
            gate: adsr.gate(),
            attack: adsr.attack(),
            decay: adsr.decay(),
            sustain: adsr.sustain(),
            release: adsr.release(),
            monitor: adsr.monitor(),
        };
        let envelope = graph.add("envelope", adsr);

        let mixer = graph.add("voice_mixer", Mixer::with_capacity(MixPolicy::Sum, 2));
        graph.add_mixer_input(mixer, gain_1, 1.0)?;
        graph.add_mixer_input(mixer, gain_2, 1.0)?;
        graph.automate(envelope, mixer, MixerPort::Level)?;

        Ok(Self {
            nodes: VoiceNodes {
                modulator,
                oscillator_1,
                oscillator_2,
                tremolo_1,
                tremolo_2,
                gain_1,
                gain_2,
                envelope,
                mixer,
            },
            params: *params,
            mod_waveform,
            mod_frequency,
            oscillator_1: controls_1,
            oscillator_2: controls_2,
            envelope: envelope_controls,
        })
    }

    fn build_oscillator(
        graph: &mut Graph,
        modulator: NodeId,
        params: &OscillatorParams,
        pitch: f32,
        names: [&str; 3],
    ) -> Result<(NodeId, NodeId, NodeId, OscillatorControls), GraphError> {
        let oscillator = Oscillator::new(params.waveform, params.frequency_for(pitch))
            .with_detune(params.detune);
        let tremolo = Gain::new(params.mod_gain);
        let gain = Gain::new(params.gain);
        let controls = OscillatorControls {
            waveform: oscillator.waveform(),
            frequency: oscillator.frequency(),
            detune: oscillator.detune(),
            gain: gain.gain(),
            mod_gain: tremolo.gain(),
        };

        let [oscillator_name, tremolo_name, gain_name] = names;
        let oscillator = graph.add(oscillator_name, oscillator);
        let tremolo = graph.add(tremolo_name, tremolo);
        let gain = graph.add(gain_name, gain);

        graph.connect(modulator, tremolo)?;
        graph.connect(oscillator, gain)?;
        graph.automate(tremolo, gain, GainPort::Gain)?;
        Ok((oscillator, tremolo, gain, controls))
    }

    /// Node whose output is the voice's rendered signal
    pub fn output(&self) -> NodeId {
        self.nodes.mixer
    }

    pub fn nodes(&self) -> &VoiceNodes {
        &self.nodes
    }

    pub fn params(&self) -> &VoiceParams {
        &self.params
    }

    /// Open the volume envelope's gate
    pub fn note_on(&self) {
        self.envelope.gate.set(1.0);
    }

    /// Close the volume envelope's gate
    pub fn note_off(&self) {
        self.envelope.gate.set(0.0);
    }

    pub fn is_gate_open(&self) -> bool {
        self.envelope.gate.get() != 0.0
    }

    /// Envelope stage as of the last rendered block
    pub fn stage(&self) -> EnvelopeStage {
        self.envelope.monitor.stage()
    }

    /// Gate closed and envelope finished
    pub fn is_idle(&self) -> bool {
        !self.is_gate_open() && self.envelope.monitor.is_idle()
    }

    /// Apply every parameter of `params`
    pub fn set_params(&mut self, params: &VoiceParams) {
        self.params = *params;
        self.mod_waveform.set(params.mod_waveform);
        self.mod_frequency.set(params.mod_frequency);
        self.oscillator_1.apply(&params.oscillator_1, params.frequency);
        self.oscillator_2.apply(&params.oscillator_2, params.frequency);
        self.set_envelope(params.envelope);
    }

    /// Change the pitch; both oscillators follow with their octave offsets
    pub fn set_frequency(&mut self, hz: f32) {
        self.params.frequency = hz;
        for which in [OscillatorSlot::First, OscillatorSlot::Second] {
            let frequency = self.params.oscillator(which).frequency_for(hz);
            self.controls(which).frequency.set(frequency);
        }
    }

    pub fn set_mod_waveform(&mut self, waveform: Waveform) {
        self.params.mod_waveform = waveform;
        self.mod_waveform.set(waveform);
    }

    pub fn set_mod_frequency(&mut self, hz: f32) {
        self.params.mod_frequency = hz;
        self.mod_frequency.set(hz);
    }

    pub fn set_oscillator(&mut self, which: OscillatorSlot, params: OscillatorParams) {
        self.params = self.params.with_oscillator(which, params);
        self.controls(which).apply(&params, self.params.frequency);
    }

    pub fn set_envelope(&mut self, envelope: EnvelopeParams) {
        self.params.envelope = envelope;
        let controls = &self.envelope;
        controls.attack.set(envelope.attack.max(crate::modules::MIN_STAGE_TIME));
        controls.decay.set(envelope.decay.max(crate::modules::MIN_STAGE_TIME));
        controls.sustain.set(envelope.sustain.clamp(0.0, 1.0));
        controls.release.set(envelope.release.max(crate::modules::MIN_STAGE_TIME));
    }

    fn controls(&self, which: OscillatorSlot) -> &OscillatorControls {
        match which {
            OscillatorSlot::First => &self.oscillator_1,
            OscillatorSlot::Second => &self.oscillator_2,
        }
    }
}

#[derive(Debug, Clone)]
struct PooledVoice {
    voice: Voice,
    note: Option<u8>,
    started: u64,
}

/// Fixed-size set of voices summed into one output
///
/// Note allocation: a note already sounding reuses its voice, otherwise the
/// first idle voice is taken, otherwise the voice started longest ago is
/// stolen.
#[derive(Debug, Clone)]
pub struct VoicePool {
    voices: Vec<PooledVoice>,
    output: NodeId,
    clock: u64,
}

impl VoicePool {
    /// Build `count` voices into `graph`, all summed by one mixer
    pub fn build(
        graph: &mut Graph,
        count: usize,
        params: &VoiceParams,
    ) -> Result<Self, GraphError> {
        let output = graph.add("voice_pool", Mixer::with_capacity(MixPolicy::Sum, count));
        let mut voices = Vec::with_capacity(count);
        for _ in 0..count {
            let voice = Voice::build(graph, params)?;
            graph.add_mixer_input(output, voice.output(), 1.0)?;
            voices.push(PooledVoice {
                voice,
                note: None,
                started: 0,
            });
        }
        tracing::debug!(voices = count, output = ?output, "voice pool built");
        Ok(Self {
            voices,
            output,
            clock: 0,
        })
    }

    /// Mixer summing every voice
    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index).map(|slot| &slot.voice)
    }

    pub fn voices(&self) -> impl Iterator<Item = &Voice> {
        self.voices.iter().map(|slot| &slot.voice)
    }

    /// Note held by a voice, if any
    pub fn note(&self, index: usize) -> Option<u8> {
        self.voices.get(index)?.note
    }

    /// Notes currently held
    pub fn active_notes(&self) -> impl Iterator<Item = u8> + '_ {
        self.voices.iter().filter_map(|slot| slot.note)
    }

    /// Start `note`, returning the index of the voice that plays it
    pub fn note_on(&mut self, note: u8) -> Option<usize> {
        let index = self
            .voices
            .iter()
            .position(|slot| slot.note == Some(note))
            .or_else(|| {
                self.voices
                    .iter()
                    .position(|slot| slot.note.is_none() && slot.voice.is_idle())
            })
            .or_else(|| {
                self.voices
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.started)
                    .map(|(index, _)| index)
            })?;

        self.clock += 1;
        let slot = &mut self.voices[index];
        slot.note = Some(note);
        slot.started = self.clock;
        slot.voice.set_frequency(note_to_frequency(note));
        slot.voice.note_on();
        Some(index)
    }

    /// Release `note`, returning the index of the voice that held it
    pub fn note_off(&mut self, note: u8) -> Option<usize> {
        let index = self.voices.iter().position(|slot| slot.note == Some(note))?;
        let slot = &mut self.voices[index];
        slot.note = None;
        slot.voice.note_off();
        Some(index)
    }

    pub fn all_notes_off(&mut self) {
        for slot in &mut self.voices {
            slot.note = None;
            slot.voice.note_off();
        }
    }

    /// Apply `params` to every voice, keeping each voice's current pitch
    pub fn set_params(&mut self, params: &VoiceParams) {
        for slot in &mut self.voices {
            let pitch = slot.voice.params().frequency;
            slot.voice.set_params(&params.with_frequency(pitch));
        }
    }
}
