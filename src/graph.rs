//! Node Graph
//!
//! This module provides the runtime graph that owns every node in a slotmap
//! arena. Edges are [`NodeId`] keys: each node has at most one signal input,
//! each parameter at most one automation source, and mixers hold their own
//! membership lists. Processing is a pull: the caller asks for a node's output
//! and the graph recursively processes what it depends on, depth first,
//! computing each node at most once per [`Generation`].

use crate::automation::{AutomationEvent, Param};
use crate::context::{Generation, ProcessContext};
use crate::io::ParamHandle;
use crate::modules::Mixer;
use crate::node::{AudioNode, NodeId, PortId, RenderIo, Signals};
use slotmap::SlotMap;

/// Error types for structural graph operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    InvalidNode,
    InvalidPort { node: NodeId, port: PortId },
    NotAMixer(NodeId),
    SelfLoop(NodeId),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::InvalidNode => write!(f, "Invalid node"),
            GraphError::InvalidPort { node, port } => {
                write!(f, "Invalid port {} on node {:?}", port, node)
            }
            GraphError::NotAMixer(node) => write!(f, "Node {:?} is not a mixer", node),
            GraphError::SelfLoop(node) => write!(f, "Node {:?} cannot feed itself", node),
        }
    }
}

impl std::error::Error for GraphError {}

/// Internal node representation
struct Slot {
    /// `None` only while the node is being rendered
    node: Option<Box<dyn AudioNode>>,
    name: String,
    input: Option<NodeId>,
    buffer: Vec<f32>,
    last_generation: Option<Generation>,
    renders: u64,
}

impl Signals for SlotMap<NodeId, Slot> {
    fn signal(&self, node: NodeId, frames: usize) -> Option<&[f32]> {
        self.get(node)?.buffer.get(..frames)
    }
}

/// The node graph
#[derive(Default)]
pub struct Graph {
    nodes: SlotMap<NodeId, Slot>,
    /// Suppresses per-edit debug logging
    quiet: bool,
}

impl Graph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop (or resume) logging every structural edit.
    ///
    /// An engine sets this once it owns the graph, so edits applied on the
    /// audio thread do not log.
    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Add a node to the graph
    pub fn add<N: AudioNode>(&mut self, name: impl Into<String>, node: N) -> NodeId {
        self.add_boxed(name, Box::new(node))
    }

    /// Add a boxed node to the graph
    pub fn add_boxed(&mut self, name: impl Into<String>, node: Box<dyn AudioNode>) -> NodeId {
        let name = name.into();
        let kind = node.kind();
        let id = self.nodes.insert(Slot {
            node: Some(node),
            name,
            input: None,
            buffer: Vec::new(),
            last_generation: None,
            renders: 0,
        });
        if !self.quiet {
            tracing::debug!(node = ?id, kind, "node added");
        }
        id
    }

    /// Remove a node, detaching every link that refers to it
    pub fn remove(&mut self, id: NodeId) -> Result<Box<dyn AudioNode>, GraphError> {
        let slot = self.nodes.remove(id).ok_or(GraphError::InvalidNode)?;

        for (_, other) in self.nodes.iter_mut() {
            if other.input == Some(id) {
                other.input = None;
            }
            if let Some(node) = other.node.as_deref_mut() {
                for param in node.params_mut() {
                    if param.source() == Some(id) {
                        param.set_source(None);
                    }
                }
                node.detach(id);
            }
        }

        if !self.quiet {
            tracing::debug!(node = ?id, name = %slot.name, "node removed");
        }
        slot.node.ok_or(GraphError::InvalidNode)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id).map(|slot| slot.name.as_str())
    }

    /// Iterate over `(id, name, kind)` of every node
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &str, &'static str)> {
        self.nodes.iter().filter_map(|(id, slot)| {
            slot.node
                .as_deref()
                .map(|node| (id, slot.name.as_str(), node.kind()))
        })
    }

    /// Typed access to a node
    pub fn node<T: AudioNode>(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id)?.node.as_deref()?.downcast_ref::<T>()
    }

    /// Typed mutable access to a node
    pub fn node_mut<T: AudioNode>(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id)?.node.as_deref_mut()?.downcast_mut::<T>()
    }

    fn dyn_node_mut(&mut self, id: NodeId) -> Result<&mut dyn AudioNode, GraphError> {
        self.nodes
            .get_mut(id)
            .and_then(|slot| slot.node.as_deref_mut())
            .ok_or(GraphError::InvalidNode)
    }

    fn param_mut(&mut self, id: NodeId, port: PortId) -> Result<&mut Param, GraphError> {
        self.dyn_node_mut(id)?
            .param_mut(port)
            .ok_or(GraphError::InvalidPort { node: id, port })
    }

    /// Set (or clear) the signal input of `node`, returning the previous input
    pub fn set_input(
        &mut self,
        node: NodeId,
        input: Option<NodeId>,
    ) -> Result<Option<NodeId>, GraphError> {
        if let Some(input) = input {
            if input == node {
                return Err(GraphError::SelfLoop(node));
            }
            if !self.nodes.contains_key(input) {
                return Err(GraphError::InvalidNode);
            }
        }
        let slot = self.nodes.get_mut(node).ok_or(GraphError::InvalidNode)?;
        let previous = std::mem::replace(&mut slot.input, input);
        if !self.quiet {
            tracing::debug!(node = ?node, input = ?input, "input set");
        }
        Ok(previous)
    }

    /// Make `from` the signal input of `to`
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<Option<NodeId>, GraphError> {
        self.set_input(to, Some(from))
    }

    pub fn input(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node)?.input
    }

    /// Drive parameter `port` of `target` with the output of `source`.
    ///
    /// Returns the previously attached source, if any.
    pub fn automate(
        &mut self,
        source: NodeId,
        target: NodeId,
        port: impl Into<PortId>,
    ) -> Result<Option<NodeId>, GraphError> {
        let port = port.into();
        if source == target {
            return Err(GraphError::SelfLoop(target));
        }
        if !self.nodes.contains_key(source) {
            return Err(GraphError::InvalidNode);
        }
        let previous = self.param_mut(target, port)?.set_source(Some(source));
        if !self.quiet {
            tracing::debug!(source = ?source, target = ?target, port, "automation attached");
        }
        Ok(previous)
    }

    /// Detach the automation source of a parameter, returning it so the
    /// caller can splice it elsewhere
    pub fn remove_automation(
        &mut self,
        target: NodeId,
        port: impl Into<PortId>,
    ) -> Result<Option<NodeId>, GraphError> {
        let port = port.into();
        let previous = self.param_mut(target, port)?.set_source(None);
        if !self.quiet {
            tracing::debug!(target = ?target, port, source = ?previous, "automation removed");
        }
        Ok(previous)
    }

    /// Set a parameter's base value
    pub fn set_param(
        &mut self,
        node: NodeId,
        port: impl Into<PortId>,
        value: f32,
    ) -> Result<(), GraphError> {
        self.param_mut(node, port.into())?.set_base(value);
        Ok(())
    }

    /// Shared handle to a parameter's base value
    pub fn param_handle(
        &mut self,
        node: NodeId,
        port: impl Into<PortId>,
    ) -> Result<ParamHandle, GraphError> {
        Ok(self.param_mut(node, port.into())?.handle())
    }

    pub fn schedule(
        &mut self,
        node: NodeId,
        port: impl Into<PortId>,
        event: AutomationEvent,
    ) -> Result<(), GraphError> {
        self.param_mut(node, port.into())?.schedule(event);
        Ok(())
    }

    pub fn clear_schedule(&mut self, node: NodeId, port: impl Into<PortId>) -> Result<(), GraphError> {
        self.param_mut(node, port.into())?.clear_schedule();
        Ok(())
    }

    fn mixer_mut(&mut self, mixer: NodeId) -> Result<&mut Mixer, GraphError> {
        self.dyn_node_mut(mixer)?
            .downcast_mut::<Mixer>()
            .ok_or(GraphError::NotAMixer(mixer))
    }

    /// Add `node` to a mixer; returns `false` if it was already a member
    pub fn add_mixer_input(
        &mut self,
        mixer: NodeId,
        node: NodeId,
        gain: f32,
    ) -> Result<bool, GraphError> {
        if mixer == node {
            return Err(GraphError::SelfLoop(mixer));
        }
        if !self.nodes.contains_key(node) {
            return Err(GraphError::InvalidNode);
        }
        let added = self.mixer_mut(mixer)?.add_input(node, gain);
        if !self.quiet {
            tracing::debug!(mixer = ?mixer, node = ?node, gain, added, "mixer input added");
        }
        Ok(added)
    }

    pub fn remove_mixer_input(&mut self, mixer: NodeId, node: NodeId) -> Result<bool, GraphError> {
        let removed = self.mixer_mut(mixer)?.remove_input(node);
        if !self.quiet {
            tracing::debug!(mixer = ?mixer, node = ?node, removed, "mixer input removed");
        }
        Ok(removed)
    }

    pub fn set_mixer_gain(
        &mut self,
        mixer: NodeId,
        node: NodeId,
        gain: f32,
    ) -> Result<bool, GraphError> {
        Ok(self.mixer_mut(mixer)?.set_input_gain(node, gain))
    }

    /// Grow every node and parameter buffer to `max_frames` so the
    /// first blocks do not allocate
    pub fn prepare(&mut self, max_frames: usize) {
        for (_, slot) in self.nodes.iter_mut() {
            if slot.buffer.len() < max_frames {
                slot.buffer.resize(max_frames, 0.0);
            }
            if let Some(node) = slot.node.as_deref_mut() {
                for param in node.params_mut() {
                    param.ensure_capacity(max_frames);
                }
            }
        }
    }

    /// Process `id` (and everything it depends on) for the pass described
    /// by `ctx`, returning its output block
    pub fn process(&mut self, id: NodeId, ctx: &ProcessContext) -> Option<&[f32]> {
        self.render_node(id, ctx);
        self.output(id, ctx.frames)
    }

    /// Output buffer of a node, as left by its last processing pass
    pub fn output(&self, id: NodeId, frames: usize) -> Option<&[f32]> {
        self.nodes.signal(id, frames)
    }

    /// Current length of a node's output buffer; never shrinks
    pub fn buffer_capacity(&self, id: NodeId) -> Option<usize> {
        self.nodes.get(id).map(|slot| slot.buffer.len())
    }

    /// How many times a node has been rendered
    pub fn render_count(&self, id: NodeId) -> Option<u64> {
        self.nodes.get(id).map(|slot| slot.renders)
    }

    pub fn last_generation(&self, id: NodeId) -> Option<Generation> {
        self.nodes.get(id)?.last_generation
    }

    fn render_node(&mut self, id: NodeId, ctx: &ProcessContext) {
        let frames = ctx.frames;
        let (mut node, input) = {
            let Some(slot) = self.nodes.get_mut(id) else {
                return;
            };
            // Already processed in this pass (or a cycle back into a node in progress)
            if slot.last_generation == Some(ctx.generation) {
                return;
            }
            slot.last_generation = Some(ctx.generation);
            if slot.buffer.len() < frames {
                slot.buffer.resize(frames, 0.0);
            }
            let Some(node) = slot.node.take() else {
                return;
            };
            (node, slot.input)
        };

        if let Some(input) = input {
            self.render_node(input, ctx);
        }
        for index in 0..node.params().len() {
            if let Some(source) = node.params()[index].source() {
                self.render_node(source, ctx);
            }
        }
        node.visit_sources(&mut |source| self.render_node(source, ctx));

        for param in node.params_mut() {
            let upstream = param
                .source()
                .and_then(|source| self.nodes.signal(source, frames));
            param.render(ctx, upstream);
        }

        let Some(slot) = self.nodes.get_mut(id) else {
            return;
        };
        let mut buffer = std::mem::take(&mut slot.buffer);
        {
            let input = input.and_then(|input| self.nodes.signal(input, frames));
            let io = RenderIo::new(input, &self.nodes, frames);
            node.render(ctx, &io, &mut buffer[..frames]);
        }

        if let Some(slot) = self.nodes.get_mut(id) {
            slot.buffer = buffer;
            slot.node = Some(node);
            slot.renders += 1;
        }
    }
}
