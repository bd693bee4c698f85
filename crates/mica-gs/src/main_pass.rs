//! The main geometry transform: turns the counted geometry program into a
//! straight compute program.
//!
//! Outputs are staged in a small ring of variables (slot 0 = newest vertex)
//! so transform feedback can capture whole primitives. For the dynamic shape
//! the strip ends also write the output index buffer; static shapes carry
//! their topology on the side and write nothing at runtime.

use mica_ir::{
    rewrite_program, Builder, ComponentMask, Op, OutputPrimitive, Program, Src, Stage,
    VarId, XfbInfo, MAX_VARYING_SLOTS, MAX_VERTEX_STREAMS,
};

use crate::params::{
    calc_unrolled_id, calc_unrolled_index_id, load_param, xfb_count_address, Param,
    RESTART_INDEX,
};
use crate::shape::{GsInfo, GsShape, LowerState, MAX_PRIM_OUT_SIZE};

struct MainCtx {
    points: bool,
    /// Vertices per decomposed output primitive (ring depth).
    verts: u32,
    max_indices: u32,
    /// Power-of-two per-invocation vertex stride of the index-buffer values.
    pot_stride: u32,
    dynamic: bool,
    discard: bool,
    xfb: Option<XfbInfo>,
    static_count: [i32; MAX_VERTEX_STREAMS],
    count_index: [i32; MAX_VERTEX_STREAMS],
    count_words: u32,
    prefix_sum: bool,
    outputs: [[Option<VarId>; MAX_PRIM_OUT_SIZE]; MAX_VARYING_SLOTS],
    components: [u8; MAX_VARYING_SLOTS],
}

fn mask_for(comps: u8) -> ComponentMask {
    debug_assert!((1..=4).contains(&comps));
    ComponentMask::from_bits_truncate((1u8 << comps).wrapping_sub(1))
}

fn store_index(b: &mut Builder, buffer: Src, pos: Src, value: Src) {
    let off = b.imul_imm(pos, 4);
    let addr = b.iadd(buffer, off);
    b.store_global(addr, value, ComponentMask::X);
}

/// Write the index-buffer run for one completed strip (or, for points, the
/// whole invocation). Positions interleave one restart word per earlier
/// strip; values are dense vertex ids.
fn emit_end_primitive(
    b: &mut Builder,
    ctx: &MainCtx,
    total_vertices: Src,
    vertices_in_prim: Src,
    total_primitives: Src,
) {
    let restart = !ctx.points;
    let buffer = load_param(b, Param::OutputIndexBuffer);
    let unrolled = calc_unrolled_id(b);
    let base_pos = b.imul_imm(unrolled, ctx.max_indices as u64);
    let value_base = calc_unrolled_index_id(b, ctx.pot_stride);

    let prev_verts = b.isub(total_vertices, vertices_in_prim);
    let mut pos0 = b.iadd(base_pos, prev_verts);
    if restart {
        let prev_prims = b.isub(total_primitives, Src::Imm(1));
        pos0 = b.iadd(pos0, prev_prims);
    }
    let val0 = b.iadd(value_base, prev_verts);

    let i = b.prog().alloc_var(1, None);
    b.store_var(i, Src::Imm(0), ComponentMask::X);
    b.loop_(|b| {
        let iv = b.load_var(i);
        let done = b.uge(iv, vertices_in_prim);
        b.if_(done, |b| b.brk());
        let pos = b.iadd(pos0, iv);
        let val = b.iadd(val0, iv);
        store_index(b, buffer, pos, val);
        let next = b.iadd_imm(iv, 1);
        b.store_var(i, next, ComponentMask::X);
    });

    if restart {
        let pos = b.iadd(pos0, vertices_in_prim);
        store_index(b, buffer, pos, Src::Imm(RESTART_INDEX as u64));
    }
}

/// Fill the rest of the invocation's index budget with degenerate primitives
/// repeating the last real vertex, so neighbouring invocations never bleed
/// into each other.
fn emit_pad_indices(b: &mut Builder, ctx: &MainCtx, vertices: Src, primitives: Src) {
    let buffer = load_param(b, Param::OutputIndexBuffer);
    let unrolled = calc_unrolled_id(b);
    let base_pos = b.imul_imm(unrolled, ctx.max_indices as u64);
    let value_base = calc_unrolled_index_id(b, ctx.pot_stride);

    let used = if ctx.points {
        vertices
    } else {
        // One restart word per ended strip.
        b.iadd(vertices, primitives)
    };
    // With zero vertices the pad still needs a harmless value to repeat.
    let nonzero = b.umax(vertices, Src::Imm(1));
    let last_rel = b.isub(nonzero, Src::Imm(1));
    let last = b.iadd(value_base, last_rel);

    let i = b.prog().alloc_var(1, None);
    b.store_var(i, used, ComponentMask::X);
    b.loop_(|b| {
        let iv = b.load_var(i);
        let done = b.uge_imm(iv, ctx.max_indices as u64);
        b.if_(done, |b| b.brk());
        let pos = b.iadd(base_pos, iv);
        store_index(b, buffer, pos, last);
        let next = b.iadd_imm(iv, 1);
        b.store_var(i, next, ComponentMask::X);
    });
}

const SWAP_FLATSHADE_FIRST: [u64; 3] = [0, 2, 1];
const SWAP_PROVOKING_LAST: [u64; 3] = [1, 0, 2];

/// Odd triangles in a strip have two vertices swapped to restore winding;
/// which two depends on the provoking-vertex convention.
fn map_vertex_in_tri_strip(b: &mut Builder, index_in_strip: Src, vert: u32) -> Src {
    let provoking_last = b.sysval(mica_ir::Sysval::ProvokingLast);
    let flatshade_first = b.ieq_imm(provoking_last, 0);
    let parity = b.iand_imm(index_in_strip, 1);
    let even = b.ieq_imm(parity, 0);
    let swapped = b.bcsel(
        flatshade_first,
        Src::Imm(SWAP_FLATSHADE_FIRST[vert as usize]),
        Src::Imm(SWAP_PROVOKING_LAST[vert as usize]),
    );
    b.bcsel(even, Src::Imm(vert as u64), swapped)
}

/// Capture the primitive completed by this emit into the bound feedback
/// buffers, reading the whole primitive out of the staging ring.
fn write_xfb(b: &mut Builder, ctx: &MainCtx, stream: u8, index_in_strip: Src, primitive_id: Src) {
    let Some(xfb) = &ctx.xfb else { return };
    let verts = ctx.verts;
    let s = stream as usize;

    let unrolled = calc_unrolled_id(b);
    let invocation_base = if ctx.static_count[s] >= 0 {
        b.imul_imm(unrolled, ctx.static_count[s] as u64)
    } else {
        // Unknown counts imply a prefix-summed count buffer; our row holds
        // the primitive total of everyone before us.
        debug_assert!(ctx.prefix_sum);
        let addr =
            xfb_count_address(b, ctx.count_index[s] as u32, ctx.count_words, unrolled);
        b.load_global(addr, 4, 1)
    };
    let prim_index = b.iadd(invocation_base, primitive_id);
    let base_vertex = b.imul_imm(prim_index, verts as u64);

    let cap = load_param(b, Param::XfbPrims(stream));
    let in_bounds = b.ult(prim_index, cap);
    b.if_(in_bounds, |b| {
        for output in &xfb.outputs {
            if xfb.buffer_to_stream[output.buffer as usize] != stream {
                continue;
            }
            let stride = xfb.buffers[output.buffer as usize].stride;
            for vert in 0..verts {
                // Ring slot 0 is the newest vertex; feedback vertex 0 is the
                // oldest of the primitive.
                let ring = (verts - 1 - vert) as usize;
                // Captured outputs the shader never writes read as zero.
                let value = match ctx.outputs[output.location as usize][ring] {
                    Some(var) => b.load_var(var),
                    None => Src::Imm(0),
                };
                let value = b.channels(value, output.component_mask);

                let placed = if verts == 3 {
                    map_vertex_in_tri_strip(b, index_in_strip, vert)
                } else {
                    Src::Imm(vert as u64)
                };
                let slot = b.iadd(base_vertex, placed);
                let byte = b.imul_imm(slot, stride as u64);
                let byte = b.iadd_imm(byte, output.offset as u64);
                let base = load_param(b, Param::XfbBase(output.buffer));
                let addr = b.iadd(base, byte);
                b.store_global(addr, value, mask_for(output.component_mask.count() as u8));
            }
        }
    });
}

fn emit_vertex_xfb(b: &mut Builder, ctx: &MainCtx, stream: u8, index_in_strip: Src, primitive_id: Src) {
    // The emit completes a primitive once the ring is full.
    let complete = b.uge_imm(index_in_strip, (ctx.verts - 1) as u64);
    b.if_(complete, |b| write_xfb(b, ctx, stream, index_in_strip, primitive_id));

    // Age the ring under the vertex just stored.
    for loc in 0..MAX_VARYING_SLOTS {
        for v in (1..ctx.verts as usize).rev() {
            if let (Some(from), Some(to)) = (ctx.outputs[loc][v - 1], ctx.outputs[loc][v])
            {
                let val = b.load_var(from);
                b.store_var(to, val, mask_for(ctx.components[loc]));
            }
        }
    }
}

/// Rewrite the counted geometry program in place into the main compute
/// program. Consumes every counted op; output stores become ring stores.
pub(crate) fn lower_main_program(
    gs: &mut Program,
    state: &mut LowerState,
    info: &GsInfo,
    components: &[u8; MAX_VARYING_SLOTS],
) {
    // Slots never stored to are not outputs, whatever the front-end declared.
    for loc in 0..MAX_VARYING_SLOTS {
        if components[loc] == 0 {
            gs.outputs_written &= !(1 << loc);
        }
    }
    gs.output_components = *components;

    let meta = gs.gs_meta().clone();
    let verts = gs.verts_in_output_prim();
    let ring_depth = if gs.xfb.is_some() { verts as usize } else { 0 };
    for loc in 0..MAX_VARYING_SLOTS {
        if gs.outputs_written & (1 << loc) == 0 {
            continue;
        }
        for v in 0..ring_depth {
            state.outputs[loc][v] =
                Some(gs.alloc_var(components[loc], Some(format!("out{loc}_{v}"))));
        }
    }

    let ctx = MainCtx {
        points: meta.output_primitive == OutputPrimitive::Points,
        verts,
        max_indices: info.max_indices,
        pot_stride: meta.max_vertices_out.next_power_of_two(),
        dynamic: info.shape == GsShape::DynamicIndexed,
        discard: state.rasterizer_discard,
        xfb: gs.xfb.clone(),
        static_count: state.static_count,
        count_index: state.count_index,
        count_words: info.count_words,
        prefix_sum: info.prefix_sum,
        outputs: state.outputs,
        components: *components,
    };
    let writes_indices = ctx.dynamic && !ctx.discard;

    rewrite_program(gs, &mut |b, instr| match instr.op {
        Op::StoreOutput { location, component, value } => {
            if let Some(var) = ctx.outputs[location as usize][0] {
                b.store_var(var, value, ComponentMask::component(component));
            }
            true
        }

        Op::EmitVertexCounted { stream, vertex_id: _, index_in_strip, primitive_id } => {
            if ctx.xfb.is_some() {
                emit_vertex_xfb(b, &ctx, stream, index_in_strip, primitive_id);
            }
            true
        }

        Op::EndPrimitiveCounted {
            stream,
            total_vertices,
            vertices_in_prim,
            total_primitives,
        } => {
            if writes_indices && stream == 0 {
                // Dynamic counts end unconditionally; only complete strips
                // reach the index buffer.
                let complete = b.uge_imm(vertices_in_prim, ctx.verts as u64);
                b.if_(complete, |b| {
                    emit_end_primitive(
                        b,
                        &ctx,
                        total_vertices,
                        vertices_in_prim,
                        total_primitives,
                    );
                });
            }
            true
        }

        Op::SetCounts { stream, vertices, primitives, decomposed: _ } => {
            if writes_indices && stream == 0 {
                if ctx.points {
                    // Points have no strip ends; the whole invocation's
                    // indices are written here in one dense run.
                    emit_end_primitive(b, &ctx, vertices, vertices, vertices);
                }
                emit_pad_indices(b, &ctx, vertices, primitives);
            }
            true
        }

        _ => false,
    });

    gs.stage = Stage::Compute;
}
