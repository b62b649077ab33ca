//! Realtime Engine
//!
//! The engine is split in two halves:
//!
//! - [`Engine`] lives on the audio thread. It owns the clock, the graph and the
//!   root node, and is driven through [`Render`].
//! - [`EngineHandle`] lives on a control thread. Structural edits are sent as
//!   [`Command`]s over a wait-free ring buffer and applied at the start of the
//!   next block, so the audio thread never waits on a lock.
//!
//! Scalar parameter changes do not need the queue at all: they go through the
//! shared [`ParamHandle`](crate::io::ParamHandle)s exposed by the nodes.
//!
//! Applying a command does not allocate as long as mixers stay within the
//! capacity they were created with and each parameter has at most
//! [`SCHEDULE_CAPACITY`](crate::automation::SCHEDULE_CAPACITY) events pending.

use crate::automation::AutomationEvent;
use crate::context::{AudioContext, ProcessContext};
use crate::graph::{Graph, GraphError};
use crate::io::{AtomicF32, Render};
use crate::node::{NodeId, PortId};
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::Arc;

/// Structural graph edit applied between blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetInput {
        node: NodeId,
        input: Option<NodeId>,
    },
    Automate {
        source: NodeId,
        target: NodeId,
        port: PortId,
    },
    RemoveAutomation {
        target: NodeId,
        port: PortId,
    },
    AddMixerInput {
        mixer: NodeId,
        node: NodeId,
        gain: f32,
    },
    RemoveMixerInput {
        mixer: NodeId,
        node: NodeId,
    },
    SetMixerGain {
        mixer: NodeId,
        node: NodeId,
        gain: f32,
    },
    Schedule {
        node: NodeId,
        port: PortId,
        event: AutomationEvent,
    },
    ClearSchedule {
        node: NodeId,
        port: PortId,
    },
}

impl Command {
    /// Apply the edit to `graph`
    pub fn apply(self, graph: &mut Graph) -> Result<(), GraphError> {
        match self {
            Command::SetInput { node, input } => graph.set_input(node, input).map(drop),
            Command::Automate {
                source,
                target,
                port,
            } => graph.automate(source, target, port).map(drop),
            Command::RemoveAutomation { target, port } => {
                graph.remove_automation(target, port).map(drop)
            }
            Command::AddMixerInput { mixer, node, gain } => {
                graph.add_mixer_input(mixer, node, gain).map(drop)
            }
            Command::RemoveMixerInput { mixer, node } => {
                graph.remove_mixer_input(mixer, node).map(drop)
            }
            Command::SetMixerGain { mixer, node, gain } => {
                graph.set_mixer_gain(mixer, node, gain).map(drop)
            }
            Command::Schedule { node, port, event } => graph.schedule(node, port, event),
            Command::ClearSchedule { node, port } => graph.clear_schedule(node, port),
        }
    }
}

/// Audio-thread half of the engine
pub struct Engine {
    context: AudioContext,
    graph: Graph,
    root: NodeId,
    commands: Consumer<Command>,
    silence: Vec<f32>,
}

impl Engine {
    /// Create an engine rendering `root`, plus the handle that feeds it
    /// commands through a queue of `capacity` slots
    pub fn new(
        context: AudioContext,
        mut graph: Graph,
        root: NodeId,
        capacity: usize,
    ) -> (Engine, EngineHandle) {
        // Edits from here on are applied on the audio thread
        graph.set_quiet(true);
        let (producer, consumer) = RingBuffer::new(capacity);
        let handle = EngineHandle {
            commands: producer,
            sample_rate: context.sample_rate_cell(),
        };
        let engine = Engine {
            context,
            graph,
            root,
            commands: consumer,
            silence: Vec::new(),
        };
        (engine, handle)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Direct graph access, for setup before the engine moves to the audio thread
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn context(&self) -> &AudioContext {
        &self.context
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    /// Pre-grow every buffer for blocks of up to `max_frames`
    pub fn prepare(&mut self, max_frames: usize) {
        self.graph.prepare(max_frames);
        if self.silence.len() < max_frames {
            self.silence.resize(max_frames, 0.0);
        }
    }

    /// Apply every queued command; returns how many were applied successfully
    pub fn drain_commands(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.commands.pop() {
            match command.apply(&mut self.graph) {
                Ok(()) => applied += 1,
                Err(error) => tracing::warn!(?command, %error, "dropping graph command"),
            }
        }
        applied
    }

    /// Render one block of `frames` samples
    pub fn process(&mut self, frames: usize) -> &[f32] {
        self.drain_commands();
        let ctx: ProcessContext = self.context.begin_block(frames);
        if self.graph.contains(self.root) {
            if let Some(block) = self.graph.process(self.root, &ctx) {
                return block;
            }
        }
        if self.silence.len() < frames {
            self.silence.resize(frames, 0.0);
        }
        &self.silence[..frames]
    }
}

impl Render for Engine {
    fn render(&mut self, frames: usize) -> &[f32] {
        self.process(frames)
    }

    fn sample_rate(&self) -> f32 {
        self.context.sample_rate()
    }
}

/// Control-thread half of the engine
pub struct EngineHandle {
    commands: Producer<Command>,
    sample_rate: Arc<AtomicF32>,
}

impl EngineHandle {
    /// Queue a command for the next block.
    ///
    /// Gives the command back if the queue is full.
    pub fn send(&mut self, command: Command) -> Result<(), Command> {
        self.commands
            .push(command)
            .map_err(|rtrb::PushError::Full(command)| {
                tracing::warn!(?command, "command queue full");
                command
            })
    }

    /// Free slots in the command queue
    pub fn slots(&self) -> usize {
        self.commands.slots()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate.get()
    }

    /// Change the sample rate from the control side; takes effect next block
    pub fn set_sample_rate(&self, sample_rate: f32) {
        if sample_rate.is_finite() && sample_rate > 0.0 {
            self.sample_rate.set(sample_rate);
        } else {
            tracing::warn!(sample_rate, "ignoring invalid sample rate");
        }
    }

    pub fn set_input(&mut self, node: NodeId, input: Option<NodeId>) -> Result<(), Command> {
        self.send(Command::SetInput { node, input })
    }

    pub fn automate(
        &mut self,
        source: NodeId,
        target: NodeId,
        port: impl Into<PortId>,
    ) -> Result<(), Command> {
        self.send(Command::Automate {
            source,
            target,
            port: port.into(),
        })
    }

    pub fn remove_automation(
        &mut self,
        target: NodeId,
        port: impl Into<PortId>,
    ) -> Result<(), Command> {
        self.send(Command::RemoveAutomation {
            target,
            port: port.into(),
        })
    }

    pub fn add_mixer_input(&mut self, mixer: NodeId, node: NodeId, gain: f32) -> Result<(), Command> {
        self.send(Command::AddMixerInput { mixer, node, gain })
    }

    pub fn remove_mixer_input(&mut self, mixer: NodeId, node: NodeId) -> Result<(), Command> {
        self.send(Command::RemoveMixerInput { mixer, node })
    }

    pub fn set_mixer_gain(&mut self, mixer: NodeId, node: NodeId, gain: f32) -> Result<(), Command> {
        self.send(Command::SetMixerGain { mixer, node, gain })
    }

    pub fn schedule(
        &mut self,
        node: NodeId,
        port: impl Into<PortId>,
        event: AutomationEvent,
    ) -> Result<(), Command> {
        self.send(Command::Schedule {
            node,
            port: port.into(),
            event,
        })
    }

    pub fn clear_schedule(&mut self, node: NodeId, port: impl Into<PortId>) -> Result<(), Command> {
        self.send(Command::ClearSchedule {
            node,
            port: port.into(),
        })
    }
}
