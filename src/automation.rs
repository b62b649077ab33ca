//! Parameter Automation
//!
//! A [`Param`] is one automatable scalar port of a node. Per block it renders a
//! buffer of values from three sources:
//!
//! - its base value, a lock-free cell ([`ParamHandle`]) that any thread may
//!   write;
//! - an optional upstream node whose output modulates or replaces the base;
//! - an optional [`Timeline`] of scheduled events that rewrites the base value
//!   with sample accuracy.
//!
//! The same machinery is available as a free-standing node, [`Automation`].

use crate::context::ProcessContext;
use crate::io::ParamHandle;
use crate::node::{AudioNode, NodeId, PortId, RenderIo};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How an upstream signal combines with a parameter's base value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModulationMode {
    /// The upstream sample overrides the base value
    #[default]
    Replace,
    /// The upstream sample is added to the base value
    Offset,
}

/// A scheduled change of a parameter's base value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    /// Jump to `value` at `time` seconds
    SetValue { time: f64, value: f32 },
    /// Starting at `time`, move linearly from `value` toward the value of the
    /// next scheduled event, arriving at that event's time
    LinearRampTo { time: f64, value: f32 },
}

impl AutomationEvent {
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { time, .. } | AutomationEvent::LinearRampTo { time, .. } => {
                time
            }
        }
    }

    pub fn value(&self) -> f32 {
        match *self {
            AutomationEvent::SetValue { value, .. }
            | AutomationEvent::LinearRampTo { value, .. } => value,
        }
    }
}

/// Pending events a parameter's timeline holds without reallocating
pub const SCHEDULE_CAPACITY: usize = 32;

/// Time-ordered queue of scheduled events
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: VecDeque<AutomationEvent>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Events that fit before the queue has to grow
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Insert an event, keeping the queue sorted by time.
    ///
    /// Events with equal timestamps keep their insertion order. Only
    /// allocates once more events are pending than [`Timeline::capacity`].
    pub fn schedule(&mut self, event: AutomationEvent) {
        let at = self.events.partition_point(|e| e.time() <= event.time());
        self.events.insert(at, event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> impl Iterator<Item = &AutomationEvent> {
        self.events.iter()
    }

    /// Consume every event due at `time` and return the resulting value.
    ///
    /// A due ramp stays queued while its target event lies in the future.
    /// A ramp with no following event degrades to a step.
    pub fn advance(&mut self, time: f64, current: f32) -> f32 {
        let mut value = current;
        while let Some(&front) = self.events.front() {
            if front.time() > time {
                break;
            }
            match front {
                AutomationEvent::SetValue { value: v, .. } => {
                    value = v;
                    self.events.pop_front();
                }
                AutomationEvent::LinearRampTo { time: start, value: from } => {
                    match self.events.get(1) {
                        Some(next) if next.time() > time => {
                            let span = next.time() - start;
                            let fraction = if span > 0.0 {
                                ((time - start) / span) as f32
                            } else {
                                1.0
                            };
                            value = from + (next.value() - from) * fraction;
                            break;
                        }
                        _ => {
                            value = from;
                            self.events.pop_front();
                        }
                    }
                }
            }
        }
        value
    }
}

/// One automatable scalar port of a node
#[derive(Debug, Clone)]
pub struct Param {
    name: &'static str,
    base: ParamHandle,
    mode: ModulationMode,
    source: Option<NodeId>,
    timeline: Timeline,
    values: Vec<f32>,
}

impl Param {
    pub fn new(name: &'static str, value: f32) -> Self {
        Self {
            name,
            base: ParamHandle::new(value),
            mode: ModulationMode::Replace,
            source: None,
            timeline: Timeline::with_capacity(SCHEDULE_CAPACITY),
            values: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ModulationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> ModulationMode {
        self.mode
    }

    pub fn base(&self) -> f32 {
        self.base.get()
    }

    /// Safe in any mode; constant mode picks the value up on the next block
    pub fn set_base(&self, value: f32) {
        self.base.set(value);
    }

    /// Shared handle to the base value, for control threads
    pub fn handle(&self) -> ParamHandle {
        self.base.clone()
    }

    /// Upstream node driving this parameter
    pub fn source(&self) -> Option<NodeId> {
        self.source
    }

    /// Attach (or with `None` detach) an upstream node, returning the previous one
    pub(crate) fn set_source(&mut self, source: Option<NodeId>) -> Option<NodeId> {
        std::mem::replace(&mut self.source, source)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn set_value_at_time(&mut self, value: f32, time: f64) {
        self.timeline.schedule(AutomationEvent::SetValue { time, value });
    }

    pub fn linear_ramp_to_value_at_time(&mut self, value: f32, time: f64) {
        self.timeline
            .schedule(AutomationEvent::LinearRampTo { time, value });
    }

    pub fn schedule(&mut self, event: AutomationEvent) {
        self.timeline.schedule(event);
    }

    pub fn clear_schedule(&mut self) {
        self.timeline.clear();
    }

    /// Grow the value buffer to hold at least `frames` samples
    pub fn ensure_capacity(&mut self, frames: usize) {
        if self.values.len() < frames {
            self.values.resize(frames, 0.0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Render this block's values.
    ///
    /// `upstream` is the output of [`Param::source`] for this pass, if any.
    pub fn render(&mut self, ctx: &ProcessContext, upstream: Option<&[f32]>) {
        let frames = ctx.frames;
        self.ensure_capacity(frames);
        let values = &mut self.values[..frames];

        let mut base = self.base.get();
        if self.timeline.is_empty() {
            values.fill(base);
        } else {
            for (i, v) in values.iter_mut().enumerate() {
                base = self.timeline.advance(ctx.time_at(i), base);
                *v = base;
            }
            self.base.set(base);
        }

        if let Some(upstream) = upstream {
            match self.mode {
                ModulationMode::Replace => values.copy_from_slice(&upstream[..frames]),
                ModulationMode::Offset => {
                    for (v, u) in values.iter_mut().zip(upstream) {
                        *v += *u;
                    }
                }
            }
        }
    }

    /// Values rendered for the current block
    #[inline]
    pub fn values(&self, frames: usize) -> &[f32] {
        &self.values[..frames]
    }
}

/// Port of an [`Automation`] node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationPort {
    Value = 0,
}

impl From<AutomationPort> for PortId {
    fn from(port: AutomationPort) -> Self {
        port as PortId
    }
}

/// Free-standing automation source.
///
/// Outputs its signal input unchanged when one is linked, otherwise the
/// rendered values of its `Value` parameter (constant, scheduled or
/// modulated).
#[derive(Debug, Clone)]
pub struct Automation {
    params: [Param; 1],
}

impl Automation {
    pub fn new(value: f32) -> Self {
        Self {
            params: [Param::new("value", value)],
        }
    }

    pub fn value(&self) -> &Param {
        &self.params[AutomationPort::Value as usize]
    }

    pub fn value_mut(&mut self) -> &mut Param {
        &mut self.params[AutomationPort::Value as usize]
    }
}

impl AudioNode for Automation {
    fn render(&mut self, ctx: &ProcessContext, io: &RenderIo<'_>, out: &mut [f32]) {
        match io.input() {
            Some(input) => out.copy_from_slice(&input[..ctx.frames]),
            None => out.copy_from_slice(self.value().values(ctx.frames)),
        }
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn kind(&self) -> &'static str {
        "automation"
    }
}
