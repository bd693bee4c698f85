//! The geometry parameter block shared with the runtime, and helpers for
//! addressing it and the buffers it points at from generated IR.

use bytemuck::{Pod, Zeroable};
use mica_ir::{AtomicOp, Builder, Instr, Op, Src, Sysval, ValueId, MAX_XFB_BUFFERS};

/// Primitive restart sentinel written to the dynamic index buffer.
pub const RESTART_INDEX: u32 = 0xFFFF_FFFF;

/// Per-draw state the runtime uploads before launching the derived programs.
///
/// Layout is part of the runtime contract; every field is naturally aligned
/// and there is no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryParams {
    /// Vertex prepass dispatch size (x = vertices per instance).
    pub vs_grid: [u32; 3],
    /// Geometry dispatch size (x = input primitives, y = instances).
    pub gs_grid: [u32; 3],
    /// API input topology (`mica_ir::topology` encoding).
    pub input_topology: u32,
    /// Non-zero when the provoking vertex is last.
    pub provoking_last: u32,
    /// Bitmask of flat-shaded output slots.
    pub flat_outputs: u64,
    /// Device address of the vertex prepass output buffer.
    pub vertex_output_buffer: u64,
    /// Bitmask of varying slots the vertex prepass writes.
    pub vertex_outputs: u64,
    /// Device address of the count buffer.
    pub count_buffer: u64,
    /// Device address of the dynamic index buffer.
    pub output_index_buffer: u64,
    /// Device address of the indirect draw descriptor to patch.
    pub indirect_desc: u64,
    /// log2 of the padded input primitive count, for invertible index math.
    pub primitives_log2: u32,
    /// Mirror of `GsInfo::max_indices` for the patch-up program.
    pub max_indices: u32,
    /// Transform feedback buffer base addresses (offset already applied).
    pub xfb_base: [u64; MAX_XFB_BUFFERS],
    /// Current byte offset into each feedback buffer.
    pub xfb_offset: [u32; MAX_XFB_BUFFERS],
    /// Total byte capacity of each feedback buffer.
    pub xfb_size: [u32; MAX_XFB_BUFFERS],
    /// Primitive capacity per stream for this draw.
    pub xfb_prims: [u32; MAX_XFB_BUFFERS],
    /// Device addresses of pipeline statistics counters.
    pub stats_gs_invocations: u64,
    pub stats_gs_primitives: u64,
    pub stats_c_primitives: u64,
    pub stats_c_invocations: u64,
}

/// A loadable field of [`GeometryParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    VsGrid0,
    GsGrid0,
    GsGrid1,
    InputTopology,
    ProvokingLast,
    FlatOutputs,
    VertexOutputBuffer,
    VertexOutputs,
    CountBuffer,
    OutputIndexBuffer,
    IndirectDesc,
    PrimitivesLog2,
    MaxIndices,
    XfbBase(u8),
    XfbOffset(u8),
    XfbSize(u8),
    XfbPrims(u8),
    StatsGsInvocations,
    StatsGsPrimitives,
    StatsCPrimitives,
    StatsCInvocations,
}

impl Param {
    /// Byte offset and access size of the field.
    pub fn layout(self) -> (u32, u8) {
        use core::mem::offset_of;
        let (offset, bytes) = match self {
            Param::VsGrid0 => (offset_of!(GeometryParams, vs_grid), 4),
            Param::GsGrid0 => (offset_of!(GeometryParams, gs_grid), 4),
            Param::GsGrid1 => (offset_of!(GeometryParams, gs_grid) + 4, 4),
            Param::InputTopology => (offset_of!(GeometryParams, input_topology), 4),
            Param::ProvokingLast => (offset_of!(GeometryParams, provoking_last), 4),
            Param::FlatOutputs => (offset_of!(GeometryParams, flat_outputs), 8),
            Param::VertexOutputBuffer => {
                (offset_of!(GeometryParams, vertex_output_buffer), 8)
            }
            Param::VertexOutputs => (offset_of!(GeometryParams, vertex_outputs), 8),
            Param::CountBuffer => (offset_of!(GeometryParams, count_buffer), 8),
            Param::OutputIndexBuffer => {
                (offset_of!(GeometryParams, output_index_buffer), 8)
            }
            Param::IndirectDesc => (offset_of!(GeometryParams, indirect_desc), 8),
            Param::PrimitivesLog2 => (offset_of!(GeometryParams, primitives_log2), 4),
            Param::MaxIndices => (offset_of!(GeometryParams, max_indices), 4),
            Param::XfbBase(i) => {
                (offset_of!(GeometryParams, xfb_base) + 8 * i as usize, 8)
            }
            Param::XfbOffset(i) => {
                (offset_of!(GeometryParams, xfb_offset) + 4 * i as usize, 4)
            }
            Param::XfbSize(i) => {
                (offset_of!(GeometryParams, xfb_size) + 4 * i as usize, 4)
            }
            Param::XfbPrims(i) => {
                (offset_of!(GeometryParams, xfb_prims) + 4 * i as usize, 4)
            }
            Param::StatsGsInvocations => {
                (offset_of!(GeometryParams, stats_gs_invocations), 8)
            }
            Param::StatsGsPrimitives => {
                (offset_of!(GeometryParams, stats_gs_primitives), 8)
            }
            Param::StatsCPrimitives => {
                (offset_of!(GeometryParams, stats_c_primitives), 8)
            }
            Param::StatsCInvocations => {
                (offset_of!(GeometryParams, stats_c_invocations), 8)
            }
        };
        (offset as u32, bytes)
    }
}

/// Address of a parameter field: parameter base plus its fixed offset.
pub(crate) fn param_address(b: &mut Builder, field: Param) -> (Src, u8) {
    let (offset, bytes) = field.layout();
    assert!(offset % bytes as u32 == 0, "must be naturally aligned");
    let base = b.param_base();
    (b.iadd_imm(base, offset as u64), bytes)
}

/// Load a parameter field as a single scalar.
pub(crate) fn load_param(b: &mut Builder, field: Param) -> Src {
    let (addr, bytes) = param_address(b, field);
    b.load_global(addr, bytes, 1)
}

/// Load a parameter field into an existing destination value (used when
/// rewriting an instruction in place).
pub(crate) fn load_param_into(b: &mut Builder, dst: Option<ValueId>, field: Param) {
    let (addr, bytes) = param_address(b, field);
    b.push_instr(Instr { dst, op: Op::LoadGlobal { addr, bytes, comps: 1 } });
}

/// Store a scalar back into a parameter field (patch-up program only).
pub(crate) fn store_param(b: &mut Builder, field: Param, value: Src) {
    let (addr, _bytes) = param_address(b, field);
    b.store_global(addr, value, mica_ir::ComponentMask::X);
}

/// Unrolled invocation id: `instance * input_primitives + primitive`. Dense,
/// used to address the count buffer.
pub(crate) fn calc_unrolled_id(b: &mut Builder) -> Src {
    let instance = b.sysval(Sysval::InstanceId);
    let prims = load_param(b, Param::GsGrid0);
    let prim = b.sysval(Sysval::PrimitiveId);
    let base = b.imul(instance, prims);
    b.iadd(base, prim)
}

/// Index-buffer value base for the current unrolled invocation. Sparser than
/// [`calc_unrolled_id`] (power-of-two strides throughout) so the
/// rasterization adapter can invert it with shifts and masks.
pub(crate) fn calc_unrolled_index_id(b: &mut Builder, pot_vertex_stride: u32) -> Src {
    let plog2 = load_param(b, Param::PrimitivesLog2);
    let instance = b.sysval(Sysval::InstanceId);
    let shifted = b.ishl(instance, plog2);
    let prim = b.sysval(Sysval::PrimitiveId);
    let unrolled = b.iadd(shifted, prim);
    b.imul_imm(unrolled, pot_vertex_stride as u64)
}

/// Address of one count-buffer word: `count_buffer + 4 * (row * count_words +
/// count_index)`. Row 0 doubles as the totals row in atomic mode.
pub(crate) fn xfb_count_address(
    b: &mut Builder,
    count_index: u32,
    count_words: u32,
    row: Src,
) -> Src {
    let buf = load_param(b, Param::CountBuffer);
    let word = b.imul_imm(row, count_words as u64);
    let word = b.iadd_imm(word, count_index as u64);
    let off = b.imul_imm(word, 4);
    b.iadd(buf, off)
}

/// Atomically add into a pipeline statistics counter whose address lives in
/// the parameter block.
pub(crate) fn bump_stat(b: &mut Builder, field: Param, amount: Src) {
    let addr = load_param(b, field);
    let _ = b.global_atomic(AtomicOp::Add, addr, amount);
}
