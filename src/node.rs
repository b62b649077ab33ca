//! Node Contract
//!
//! Every processing unit in the graph implements [`AudioNode`]. The graph owns
//! the nodes in an arena and handles the shared part of the contract itself:
//! generation memoization, output buffer sizing, the single upstream signal
//! link and rendering of automatable parameters. A node only supplies the
//! per-sample work in [`AudioNode::render`] plus a description of its ports.

use crate::automation::Param;
use crate::context::ProcessContext;
use std::any::Any;

slotmap::new_key_type! {
    /// Unique identifier for a node in the graph
    pub struct NodeId;
}

/// Index of an automatable parameter port within a node
pub type PortId = u32;

/// Read access to the output buffers of other nodes during a pass
pub trait Signals {
    /// The first `frames` samples of a node's output, if it has a buffer
    /// that large
    fn signal(&self, node: NodeId, frames: usize) -> Option<&[f32]>;
}

/// What a node sees of the rest of the graph while it renders
pub struct RenderIo<'a> {
    input: Option<&'a [f32]>,
    signals: &'a dyn Signals,
    frames: usize,
}

impl<'a> RenderIo<'a> {
    pub fn new(input: Option<&'a [f32]>, signals: &'a dyn Signals, frames: usize) -> Self {
        Self {
            input,
            signals,
            frames,
        }
    }

    /// The upstream signal input, already processed for this pass.
    ///
    /// `None` when no input is linked; consumers render silence.
    #[inline]
    pub fn input(&self) -> Option<&'a [f32]> {
        self.input
    }

    /// Output of an arbitrary node, already processed for this pass if the
    /// node declared it through [`AudioNode::visit_sources`]
    #[inline]
    pub fn signal(&self, node: NodeId) -> Option<&'a [f32]> {
        self.signals.signal(node, self.frames)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Signal source with no buffers, for rendering nodes outside a graph
pub struct NoSignals;

impl Signals for NoSignals {
    fn signal(&self, _node: NodeId, _frames: usize) -> Option<&[f32]> {
        None
    }
}

/// Upcasting support so typed handles can be recovered from the arena
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Abstract processing unit
///
/// Implementations must not allocate, lock or panic inside [`render`]:
/// it runs on the realtime thread under the block deadline.
///
/// [`render`]: AudioNode::render
pub trait AudioNode: AsAny + Send {
    /// Compute one block into `out` (exactly `ctx.frames` samples).
    ///
    /// Parameters have already been rendered for this block and can be read
    /// through [`Param::values`].
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]);

    /// Automatable parameters, indexed by [`PortId`]
    fn params(&self) -> &[Param] {
        &[]
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut []
    }

    /// Report every node this one reads besides its signal input and its
    /// parameter sources
    fn visit_sources(&self, _visit: &mut dyn FnMut(NodeId)) {}

    /// Drop any reference to a node that is being removed from the graph
    fn detach(&mut self, _node: NodeId) {}

    /// Node kind identifier
    fn kind(&self) -> &'static str {
        "unknown"
    }
}

impl dyn AudioNode {
    pub fn downcast_ref<T: AudioNode>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: AudioNode>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Parameter at `port`, if the node has one there
    pub fn param(&self, port: PortId) -> Option<&Param> {
        self.params().get(port as usize)
    }

    pub fn param_mut(&mut self, port: PortId) -> Option<&mut Param> {
        self.params_mut().get_mut(port as usize)
    }
}
