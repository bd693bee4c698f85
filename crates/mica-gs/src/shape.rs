//! Classification record shared by the derived-program builders.

use mica_ir::{VarId, MAX_VARYING_SLOTS, MAX_VERTEX_STREAMS, OutputPrimitive};

/// Deepest output ring needed: vertices per decomposed triangle.
pub const MAX_PRIM_OUT_SIZE: usize = 3;

/// Largest static index buffer we are willing to carry in [`GsInfo`]. Bigger
/// static topologies fall back to the dynamic path so serialized shader info
/// stays small.
pub const MAX_STATIC_TOPOLOGY: usize = 64;

/// How the lowered geometry output is fed to the rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsShape {
    /// Index buffer written at runtime by the main program; indexed draw.
    DynamicIndexed,
    /// Small index buffer known at compile time, instanced per input
    /// primitive.
    StaticIndexed,
    /// Non-indexed strip, instanced per input primitive.
    StaticPerPrim,
    /// Non-indexed list covering the whole instance; no per-primitive
    /// instancing.
    StaticPerInstance,
}

/// Immutable result of classifying a geometry shader. Built once by the
/// analysis, then shared read-only by every derived-program builder.
#[derive(Debug, Clone, PartialEq)]
pub struct GsInfo {
    /// Output primitive the rasterizer sees (decomposed for list shapes).
    pub mode: OutputPrimitive,
    pub shape: GsShape,
    /// Per-unrolled-invocation index budget (positions in the index buffer
    /// for [`GsShape::DynamicIndexed`], vertex count otherwise).
    pub max_indices: u32,
    /// Number of per-invocation count-buffer words (streams with unknown
    /// decomposed-primitive counts).
    pub count_words: u32,
    /// Whether the count buffer is prefix-summed between the count prepass
    /// and the main program.
    pub prefix_sum: bool,
    /// Whether transform feedback is active.
    pub xfb: bool,
    /// Static index buffer for [`GsShape::StaticIndexed`]; `0xFF` encodes the
    /// restart sentinel. Empty for other shapes.
    pub topology: Vec<u8>,
}

/// Mutable working state threaded through the lowering passes. The ring
/// variables are allocated by the main-program transform; the counts and
/// indices are fixed by the analysis before any builder runs.
pub(crate) struct LowerState {
    /// Static decomposed-primitive count per stream, -1 when unknown.
    pub static_count: [i32; MAX_VERTEX_STREAMS],
    /// Count-buffer word per stream, -1 when the count is static.
    ///
    /// Invariant: `info.count_words == count_index.iter().filter(|i| **i >= 0).count()`.
    pub count_index: [i32; MAX_VERTEX_STREAMS],
    pub rasterizer_discard: bool,
    /// Output staging ring, slot 0 = most recently emitted vertex.
    pub outputs: [[Option<VarId>; MAX_PRIM_OUT_SIZE]; MAX_VARYING_SLOTS],
}

impl LowerState {
    pub fn new(rasterizer_discard: bool) -> Self {
        LowerState {
            static_count: [-1; MAX_VERTEX_STREAMS],
            count_index: [-1; MAX_VERTEX_STREAMS],
            rasterizer_discard,
            outputs: [[None; MAX_PRIM_OUT_SIZE]; MAX_VARYING_SLOTS],
        }
    }
}
