//! Step-sequence abstraction consumed by the execution bridge.
//!
//! The rendering engine is an external collaborator. It hands the bridge a
//! [`StepSequence`]: an explicit state object producing chunks one at a
//! time, so a paused sequence is a plain value the bridge can park in a map
//! and hand back later — no coroutine primitive involved.

use serde_json::Value;

/// Marker suffix on a step key requesting navigation back to the caller
/// when the sequence completes.
pub const BOUNCE_BACK_MARKER: char = '^';

/// One unit of rendered output from a step sequence.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Step keys rendered in this chunk.
    pub keys: Vec<String>,
    /// Rendered payload for the client.
    pub data: Value,
    /// A gate requires external input (e.g. a form submission) before the
    /// sequence can continue.
    pub is_gate: bool,
    pub gate_value: Option<Value>,
}

impl Chunk {
    pub fn step(keys: Vec<String>, data: Value) -> Self {
        Self {
            keys,
            data,
            is_gate: false,
            gate_value: None,
        }
    }

    pub fn gate(keys: Vec<String>, data: Value, gate_value: Option<Value>) -> Self {
        Self {
            keys,
            data,
            is_gate: true,
            gate_value,
        }
    }

    /// True when any rendered key carries the bounce-back marker.
    pub fn bounces_back(&self) -> bool {
        self.keys.iter().any(|k| k.ends_with(BOUNCE_BACK_MARKER))
    }

    /// Last rendered key, used as the breadcrumb position while suspended.
    pub fn last_key(&self) -> Option<&str> {
        self.keys.last().map(String::as_str)
    }
}

/// Restartable step sequence. `next` returns `None` when exhausted.
/// Sequence objects are parked in stores shared across connection tasks,
/// so they must be both `Send` and `Sync`.
pub trait StepSequence: Send + Sync {
    fn next(&mut self) -> Option<Chunk>;
}

/// Identifies the declarative source of a step sequence so remaining steps
/// can be re-rendered after a resume. Field names mirror the wire protocol
/// (`zVaFile`, `zVaFolder`, `zBlock`).
#[derive(Clone, Debug, PartialEq)]
pub struct WalkerSource {
    pub file: String,
    pub folder: String,
    pub block: String,
}

/// A step sequence backed by a pre-built list of chunks. Used by tests and
/// by engines that render eagerly.
pub struct ScriptedSequence {
    chunks: std::vec::IntoIter<Chunk>,
}

impl ScriptedSequence {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl StepSequence for ScriptedSequence {
    fn next(&mut self) -> Option<Chunk> {
        self.chunks.next()
    }
}
