//! Software input assembly.
//!
//! The vertex prepass shades every index once and writes a flat vertex output
//! buffer; the geometry program applies the API topology itself by recovering
//! the vertex id for each vertex-in-primitive slot, then pulling the varying
//! from the buffer.

use mica_ir::{
    rewrite_program, topology, Builder, ComponentMask, Op, PrimitiveClass, Program,
    Src, Stage, Sysval,
};

use crate::params::{load_param, load_param_into, Param};

/// `values[vert]` for a runtime `vert` in `0..values.len()`.
fn select_by_vert(b: &mut Builder, vert: Src, values: &[Src]) -> Src {
    let mut result = values[values.len() - 1];
    for (i, v) in values.iter().enumerate().rev().skip(1) {
        let is = b.ieq_imm(vert, i as u64);
        result = b.bcsel(is, *v, result);
    }
    result
}

fn is_topology(b: &mut Builder, topo: Src, which: u64) -> Src {
    b.ieq_imm(topo, which)
}

/// Map a vertex-in-primitive slot to the vertex id the input assembler would
/// have produced, given the runtime topology within the declared class.
pub(crate) fn vertex_id_for_topology_class(
    b: &mut Builder,
    vert: Src,
    cls: PrimitiveClass,
) -> Src {
    let prim = b.sysval(Sysval::PrimitiveId);

    match cls {
        PrimitiveClass::Points => prim,

        PrimitiveClass::Lines => {
            let topo = b.sysval(Sysval::InputTopology);
            let nr = load_param(b, Param::GsGrid0);
            let doubled = b.imul_imm(prim, 2);
            let list = b.iadd(doubled, vert);
            let strip = b.iadd(prim, vert);
            let looped = b.umod(strip, nr);

            let is_list = is_topology(b, topo, topology::LINES);
            let is_loop = is_topology(b, topo, topology::LINE_LOOP);
            let strip_or_loop = b.bcsel(is_loop, looped, strip);
            b.bcsel(is_list, list, strip_or_loop)
        }

        PrimitiveClass::Triangles => {
            let topo = b.sysval(Sysval::InputTopology);
            let provoking_last = b.sysval(Sysval::ProvokingLast);
            let flatshade_first = b.ieq_imm(provoking_last, 0);

            let tripled = b.imul_imm(prim, 3);
            let list = b.iadd(tripled, vert);

            // Strips swap two vertices of every odd primitive to keep the
            // winding consistent; which two depends on the provoking vertex.
            let swap_first = select_by_vert(
                b,
                vert,
                &[Src::Imm(0), Src::Imm(2), Src::Imm(1)],
            );
            let swap_last = select_by_vert(
                b,
                vert,
                &[Src::Imm(1), Src::Imm(0), Src::Imm(2)],
            );
            let swapped = b.bcsel(flatshade_first, swap_first, swap_last);
            let parity = b.iand_imm(prim, 1);
            let even = b.ieq_imm(parity, 0);
            let strip_vert = b.bcsel(even, vert, swapped);
            let strip = b.iadd(prim, strip_vert);

            // Fans pivot on vertex 0; its slot moves with the provoking
            // convention.
            let fan_off = b.iadd(prim, vert);
            let last_is_zero = b.ieq_imm(vert, 2);
            let first_is_zero = b.ieq_imm(vert, 0);
            let fan_ff_off = b.iadd_imm(fan_off, 1);
            let fan_ff = b.bcsel(last_is_zero, Src::Imm(0), fan_ff_off);
            let fan_pl = b.bcsel(first_is_zero, Src::Imm(0), fan_off);
            let fan = b.bcsel(flatshade_first, fan_ff, fan_pl);

            let is_list = is_topology(b, topo, topology::TRIANGLES);
            let is_fan = is_topology(b, topo, topology::TRIANGLE_FAN);
            let strip_or_fan = b.bcsel(is_fan, fan, strip);
            b.bcsel(is_list, list, strip_or_fan)
        }

        PrimitiveClass::LinesAdjacency => {
            let topo = b.sysval(Sysval::InputTopology);
            let quad = b.imul_imm(prim, 4);
            let list = b.iadd(quad, vert);
            let strip = b.iadd(prim, vert);
            let is_list = is_topology(b, topo, topology::LINES_ADJACENCY);
            b.bcsel(is_list, list, strip)
        }

        PrimitiveClass::TrianglesAdjacency => {
            let topo = b.sysval(Sysval::InputTopology);
            let six = b.imul_imm(prim, 6);
            let list = b.iadd(six, vert);

            // Strip-adjacency slot offsets relative to 2*prim, middle
            // primitives, by parity (two's-complement immediates).
            const EVEN: [i64; 6] = [0, -2, 2, 6, 4, 5];
            const ODD: [i64; 6] = [2, -2, 0, 5, 4, 6];
            let even_offs: Vec<Src> = EVEN.iter().map(|&o| Src::Imm(o as u64)).collect();
            let odd_offs: Vec<Src> = ODD.iter().map(|&o| Src::Imm(o as u64)).collect();
            let off_even = select_by_vert(b, vert, &even_offs);
            let off_odd = select_by_vert(b, vert, &odd_offs);
            let parity = b.iand_imm(prim, 1);
            let even = b.ieq_imm(parity, 0);
            let off = b.bcsel(even, off_even, off_odd);

            let j = b.imul_imm(prim, 2);
            let idx = b.iadd(j, off);

            // First primitive's trailing-edge neighbour is vertex 1.
            let first = b.ieq_imm(prim, 0);
            let rev_slot = b.ieq_imm(vert, 1);
            let boundary = b.iand(first, rev_slot);
            let idx = b.bcsel(boundary, Src::Imm(1), idx);

            // Last primitive's leading-edge neighbour clamps to the final
            // strip vertex (2 * primitives + 3).
            let nr = load_param(b, Param::GsGrid0);
            let doubled = b.imul_imm(nr, 2);
            let last = b.iadd_imm(doubled, 3);
            let strip = b.umin(idx, last);

            let is_list = is_topology(b, topo, topology::TRIANGLES_ADJACENCY);
            b.bcsel(is_list, list, strip)
        }
    }
}

/// Byte address of one varying component in the vertex output buffer. Each
/// written slot occupies a vec4; the per-vertex stride is the written-slot
/// count.
fn vertex_output_address(
    b: &mut Builder,
    buffer: Src,
    outputs_mask: Src,
    linear_vertex: Src,
    location: u32,
    component: u8,
) -> Src {
    let stride = b.bit_count(outputs_mask);
    let below = b.iand_imm(outputs_mask, (1u64 << location) - 1);
    let slot = b.bit_count(below);
    let word = b.imul(linear_vertex, stride);
    let word = b.iadd(word, slot);
    let byte = b.imul_imm(word, 16);
    let byte = b.iadd_imm(byte, component as u64 * 4);
    b.iadd(buffer, byte)
}

/// Replace per-vertex input loads with topology recovery plus a pull from the
/// vertex output buffer.
pub(crate) fn lower_gs_inputs(gs: &mut Program) {
    let cls = gs.gs_meta().input_primitive;
    rewrite_program(gs, &mut |b, instr| {
        let Op::LoadPerVertexInput { location, component, vertex, comps } = instr.op
        else {
            return false;
        };

        let vertex_id = vertex_id_for_topology_class(b, vertex, cls);
        let verts = load_param(b, Param::VsGrid0);
        let instance = b.sysval(Sysval::InstanceId);
        let base = b.imul(instance, verts);
        let unrolled = b.iadd(base, vertex_id);

        let buffer = load_param(b, Param::VertexOutputBuffer);
        let mask = load_param(b, Param::VertexOutputs);
        let addr =
            vertex_output_address(b, buffer, mask, unrolled, location, component);
        b.push_instr(mica_ir::Instr {
            dst: instr.dst,
            op: Op::LoadGlobal { addr, bytes: 4, comps },
        });
        true
    });
}

/// Rewrite system values for compute execution: the 2-D dispatch index covers
/// (primitive, instance), and the remaining draw state comes from the
/// parameter block.
pub(crate) fn lower_id(prog: &mut Program) {
    rewrite_program(prog, &mut |b, instr| {
        let Op::Sysval(sv) = instr.op else { return false };
        match sv {
            Sysval::PrimitiveId => {
                b.push_instr(mica_ir::Instr { dst: instr.dst, op: Op::DispatchId { channel: 0 } });
            }
            Sysval::InstanceId => {
                b.push_instr(mica_ir::Instr { dst: instr.dst, op: Op::DispatchId { channel: 1 } });
            }
            Sysval::FlatMask => load_param_into(b, instr.dst, Param::FlatOutputs),
            Sysval::InputTopology => load_param_into(b, instr.dst, Param::InputTopology),
            Sysval::ProvokingLast => load_param_into(b, instr.dst, Param::ProvokingLast),
            Sysval::VertexId | Sysval::InvocationId => return false,
        }
        true
    });
}

/// Lower a vertex shader that feeds the geometry stage: it runs as a compute
/// prepass dispatched (vertices, instances), and its output stores become
/// vertex-output-buffer writes.
pub fn lower_vs_before_gs(vs: &mut Program) {
    assert_eq!(vs.stage, Stage::Vertex);
    let outputs_mask = vs.outputs_written;
    let stride = outputs_mask.count_ones() as u64;

    rewrite_program(vs, &mut |b, instr| match instr.op {
        Op::StoreOutput { location, component, value } => {
            let vertex = b.dispatch_id(0);
            let instance = b.dispatch_id(1);
            let nr = load_param(b, Param::VsGrid0);
            let base = b.imul(instance, nr);
            let linear = b.iadd(base, vertex);

            let slot = (outputs_mask & ((1u64 << location) - 1)).count_ones() as u64;
            let word = b.imul_imm(linear, stride);
            let word = b.iadd_imm(word, slot);
            let byte = b.imul_imm(word, 16);
            let byte = b.iadd_imm(byte, component as u64 * 4);
            let buffer = load_param(b, Param::VertexOutputBuffer);
            let addr = b.iadd(buffer, byte);
            b.store_global(addr, value, ComponentMask::X);
            true
        }
        Op::Sysval(Sysval::VertexId) => {
            b.push_instr(mica_ir::Instr { dst: instr.dst, op: Op::DispatchId { channel: 0 } });
            true
        }
        Op::Sysval(Sysval::InstanceId) => {
            b.push_instr(mica_ir::Instr { dst: instr.dst, op: Op::DispatchId { channel: 1 } });
            true
        }
        _ => false,
    });
    vs.stage = Stage::Compute;
}
