//! # Phatty: Realtime Synthesis Node Graph
//!
//! `phatty` is a Rust library for building realtime synthesizers out of a
//! directed graph of signal-processing nodes, rendered block by block from an
//! audio driver callback.
//!
//! ## Architecture
//!
//! The library is organized in three layers:
//!
//! - **Node contract** - [`AudioNode`] and automatable [`Param`]eters with
//!   scheduled, sample-accurate automation
//! - **Graph** - A slotmap arena of nodes, pulled depth first with each node
//!   rendered at most once per block regardless of fan-out
//! - **Instruments** - DSP modules assembled into [`Voice`]s, pooled into a
//!   [`VoicePool`] and driven by an [`Engine`]
//!
//! Scalar parameter writes go through lock-free [`ParamHandle`]s; structural
//! edits from a control thread go through the engine's wait-free command
//! queue and land between blocks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use phatty::prelude::*;
//!
//! let mut graph = Graph::new();
//! let mut context = AudioContext::new(44100.0);
//!
//! // Sawtooth through a resonant low-pass, swept by an LFO
//! let osc = graph.add("osc", Oscillator::new(Waveform::Sawtooth, 110.0));
//! let filter = graph.add("filter", Lp12Filter::new(800.0, 4.0, 0.0));
//! let lfo = graph.add("lfo", Oscillator::new(Waveform::Sine, 0.5));
//! let sweep = graph.add("sweep", MulAdd::new(600.0, 900.0));
//!
//! graph.connect(osc, filter).unwrap();
//! graph.connect(lfo, sweep).unwrap();
//! graph.automate(sweep, filter, FilterPort::Cutoff).unwrap();
//!
//! // One audio callback
//! let ctx = context.begin_block(256);
//! let block = graph.process(filter, &ctx).unwrap();
//! assert_eq!(block.len(), 256);
//! ```
//!
//! For a complete polyphonic synth, see [`SynthConfig::build`].

pub mod automation;
pub mod config;
pub mod context;
pub mod engine;
pub mod graph;
pub mod io;
pub mod modules;
pub mod node;
pub mod polyphony;

/// Prelude module for convenient imports
pub mod prelude {
    // Node contract
    pub use crate::node::{AudioNode, NodeId, PortId, RenderIo, Signals};

    // Automation
    pub use crate::automation::{
        Automation, AutomationEvent, AutomationPort, ModulationMode, Param, Timeline,
        SCHEDULE_CAPACITY,
    };

    // Clock
    pub use crate::context::{AudioContext, Generation, ProcessContext, DEFAULT_SAMPLE_RATE};

    // Graph
    pub use crate::graph::{Graph, GraphError};

    // Core DSP Modules
    pub use crate::modules::{
        AdsrPort, ArithmeticPort, FilterPort, GainPort, MixerPort, MulAddPort, OscillatorPort,
    };
    pub use crate::modules::{
        Adsr, Arithmetic, EnvelopeStage, FilterState, Gain, Lp12Filter, MixPolicy, Mixer,
        MixerInput, MulAdd, Operation, Oscillator, Waveform,
    };

    // External I/O
    pub use crate::io::{
        note_to_frequency, AtomicF32, EnvelopeMonitor, ParamHandle, Render, WaveformHandle,
    };

    // Polyphony
    pub use crate::polyphony::{
        EnvelopeParams, OscillatorParams, OscillatorSlot, Voice, VoiceNodes, VoiceParams,
        VoicePool,
    };

    // Engine and configuration
    pub use crate::config::{ConfigError, Synth, SynthConfig};
    pub use crate::engine::{Command, Engine, EngineHandle};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
