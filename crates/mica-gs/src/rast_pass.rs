//! The rasterization adapter: the geometry program re-run as a hardware
//! vertex shader, reduced to "replay until my vertex, then output it".
//!
//! The shader body is kept intact (minus side effects when policy allows) and
//! every emit becomes a compare-and-select against the vertex id this
//! hardware invocation is responsible for. The prelude inverts the shape's
//! index math to recover which invocation and which output vertex that is.

use mica_ir::{
    rewrite_program, slot, AluOp, Builder, ComponentMask, Instr, Op, OutputPrimitive,
    Program, Src, Stage, Sysval, MAX_VARYING_SLOTS,
};

use crate::params::{load_param, load_param_into, Param};
use crate::shape::{GsInfo, GsShape};
use crate::side_effects::strip_side_effects_from_rast;

/// IEEE bits of 1.0, the point size when the shader writes none.
const DEFAULT_PSIZ: u64 = 0x3f80_0000;

fn slot_comps(location: u32) -> u8 {
    match location {
        slot::PSIZ | slot::LAYER | slot::VIEWPORT => 1,
        _ => 4,
    }
}

fn full_mask(comps: u8) -> ComponentMask {
    ComponentMask::from_bits_truncate((1u8 << comps).wrapping_sub(1))
}

struct Recovered {
    output_id: Src,
    primitive_id: Src,
    instance_id: Src,
}

/// Invert the shape's index layout: from the hardware vertex/instance ids
/// back to (unrolled invocation, output vertex).
fn recover_ids(b: &mut Builder, info: &GsInfo, pot_stride: u32) -> Recovered {
    let raw_vertex = b.sysval(Sysval::VertexId);
    let raw_instance = b.sysval(Sysval::InstanceId);

    match info.shape {
        GsShape::DynamicIndexed => {
            // Index-buffer values were laid out with power-of-two strides for
            // exactly this division-free unpacking.
            let output_id = b.umod_imm(raw_vertex, pot_stride as u64);
            let unrolled = b.udiv_imm(raw_vertex, pot_stride as u64);
            let plog2 = load_param(b, Param::PrimitivesLog2);
            let instance_id = b.ushr(unrolled, plog2);
            let prims = b.ishl(Src::Imm(1), plog2);
            let mask = b.isub(prims, Src::Imm(1));
            let primitive_id = b.iand(unrolled, mask);
            Recovered { output_id, primitive_id, instance_id }
        }
        GsShape::StaticIndexed | GsShape::StaticPerPrim => {
            // One hardware instance per input primitive.
            let input_prims = load_param(b, Param::GsGrid0);
            let instance_id = b.udiv(raw_instance, input_prims);
            let primitive_id = b.umod(raw_instance, input_prims);
            Recovered { output_id: raw_vertex, primitive_id, instance_id }
        }
        GsShape::StaticPerInstance => {
            let stride = info.max_indices.max(1) as u64;
            let output_id = b.umod_imm(raw_vertex, stride);
            let primitive_id = b.udiv_imm(raw_vertex, stride);
            Recovered { output_id, primitive_id, instance_id: raw_instance }
        }
    }
}

/// Build the adapter from the counted geometry program. Returns the program
/// and whether it retains side effects (see [`crate::side_effects`]).
pub(crate) fn build_rast_program(gs: &Program, info: &GsInfo) -> (Program, bool) {
    let mut prog = gs.clone();
    prog.name = format!("{}_rast", prog.name);
    prog.stage = Stage::Vertex;
    prog.xfb = None;

    let meta = prog.gs_meta().clone();
    let points = meta.output_primitive == OutputPrimitive::Points;
    if !points {
        // Point size only applies to point output.
        prog.outputs_written &= !(1 << slot::PSIZ);
    }

    let side_effects_for_rast = strip_side_effects_from_rast(&mut prog);

    // Staging per slot: `temp` tracks the current store_output state, and
    // `selected` latches it on the emit whose vertex id is ours.
    let mut temp = [None; MAX_VARYING_SLOTS];
    let mut selected = [None; MAX_VARYING_SLOTS];
    let saved_body = std::mem::take(&mut prog.body);
    for loc in 0..MAX_VARYING_SLOTS {
        if prog.outputs_written & (1 << loc) == 0 {
            continue;
        }
        let comps = slot_comps(loc as u32);
        temp[loc] = Some(prog.alloc_var(comps, Some(format!("rast_tmp{loc}"))));
        selected[loc] = Some(prog.alloc_var(comps, Some(format!("rast_sel{loc}"))));
    }

    let mut b = Builder::new(&mut prog);
    let ids = recover_ids(&mut b, info, meta.max_vertices_out.next_power_of_two());
    for loc in 0..MAX_VARYING_SLOTS {
        let (Some(t), Some(s)) = (temp[loc], selected[loc]) else { continue };
        // The invocation may emit fewer vertices than the budget; zero keeps
        // the unselected slots deterministic.
        let mask = full_mask(slot_comps(loc as u32));
        b.store_var(t, Src::Imm(0), mask);
        b.store_var(s, Src::Imm(0), mask);
    }
    let prelude = b.finish();

    prog.body = saved_body;
    rewrite_program(&mut prog, &mut |b, instr| match instr.op {
        Op::StoreOutput { location, component, value } => {
            if let Some(t) = temp[location as usize] {
                b.store_var(t, value, ComponentMask::component(component));
            }
            true
        }

        Op::EmitVertexCounted { stream, vertex_id, .. } => {
            if stream == 0 {
                let ours = b.ieq(vertex_id, ids.output_id);
                for loc in 0..MAX_VARYING_SLOTS {
                    let (Some(t), Some(s)) = (temp[loc], selected[loc]) else {
                        continue;
                    };
                    let cur = b.load_var(t);
                    let old = b.load_var(s);
                    let new = b.bcsel(ours, cur, old);
                    b.store_var(s, new, full_mask(slot_comps(loc as u32)));
                }
            }
            true
        }

        // Counting and index traffic belong to the other derived programs.
        Op::EndPrimitiveCounted { .. } | Op::SetCounts { .. } => true,

        Op::Sysval(sv) => {
            match sv {
                Sysval::PrimitiveId | Sysval::InstanceId => {
                    let src = if sv == Sysval::PrimitiveId {
                        ids.primitive_id
                    } else {
                        ids.instance_id
                    };
                    b.push_instr(Instr {
                        dst: instr.dst,
                        op: Op::Alu { op: AluOp::Iadd, srcs: vec![src, Src::Imm(0)] },
                    });
                }
                Sysval::FlatMask => load_param_into(b, instr.dst, Param::FlatOutputs),
                Sysval::InputTopology => {
                    load_param_into(b, instr.dst, Param::InputTopology)
                }
                Sysval::ProvokingLast => {
                    load_param_into(b, instr.dst, Param::ProvokingLast)
                }
                Sysval::VertexId | Sysval::InvocationId => return false,
            }
            true
        }

        _ => false,
    });

    let mut body = prelude;
    body.0.extend(std::mem::take(&mut prog.body).0);

    let mut b = Builder::new(&mut prog);
    for loc in 0..MAX_VARYING_SLOTS {
        let Some(s) = selected[loc] else { continue };
        let comps = slot_comps(loc as u32);
        let value = b.load_var(s);
        for c in 0..comps {
            let chan = b.channels(value, ComponentMask::component(c));
            b.store_output(loc as u32, c, chan);
        }
    }
    if points && b.prog().outputs_written & (1 << slot::PSIZ) == 0 {
        b.store_output(slot::PSIZ, 0, Src::Imm(DEFAULT_PSIZ));
        b.prog().outputs_written |= 1 << slot::PSIZ;
        b.prog().output_components[slot::PSIZ as usize] = 1;
    }
    body.0.extend(b.finish().0);
    prog.body = body;
    prog.gs = None;

    (prog, side_effects_for_rast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mica_ir::{AtomicOp, GsMeta, PrimitiveClass, Stage};

    use crate::counters::lower_counted_geometry;

    fn counted_gs(emit_store: bool) -> Program {
        let mut gs = Program::new("gs", Stage::Geometry);
        gs.gs = Some(GsMeta {
            input_primitive: PrimitiveClass::Points,
            output_primitive: OutputPrimitive::TriangleStrip,
            max_vertices_out: 3,
            invocations: 1,
            active_stream_mask: 1,
        });
        gs.outputs_written = 1 << slot::POSITION;
        let mut b = Builder::new(&mut gs);
        let x = b.sysval(Sysval::PrimitiveId);
        if emit_store {
            let base = b.param_base();
            b.store_global(base, x, ComponentMask::X);
        }
        for _ in 0..3 {
            b.store_output(slot::POSITION, 0, x);
            b.push_no_dst(Op::EmitVertex { stream: 0 });
        }
        b.push_no_dst(Op::EndPrimitive { stream: 0 });
        gs.body = b.finish();
        lower_counted_geometry(&mut gs);
        gs
    }

    fn info(shape: GsShape) -> GsInfo {
        GsInfo {
            mode: OutputPrimitive::Triangles,
            shape,
            max_indices: 3,
            count_words: 0,
            prefix_sum: false,
            xfb: false,
            topology: Vec::new(),
        }
    }

    #[test]
    fn adapter_selects_by_vertex_id() {
        let (rast, effects) =
            build_rast_program(&counted_gs(false), &info(GsShape::StaticPerInstance));
        assert_eq!(rast.stage, Stage::Vertex);
        assert!(!effects);

        let text = rast.to_string();
        assert!(!text.contains("emit_vertex_counted"), "{text}");
        assert!(!text.contains("set_counts"), "{text}");
        assert!(text.contains("bcsel"), "{text}");
        assert!(text.contains("store_output"), "{text}");
    }

    #[test]
    fn plain_stores_leave_the_adapter() {
        let (rast, effects) =
            build_rast_program(&counted_gs(true), &info(GsShape::StaticPerInstance));
        assert!(!effects);
        assert!(!rast.to_string().contains("store_global"));
    }

    #[test]
    fn consumed_atomics_pin_side_effects() {
        let mut gs = counted_gs(false);
        // Append an atomic whose result feeds position.
        let mut b = Builder::new(&mut gs);
        let base = b.param_base();
        let old = b.global_atomic(AtomicOp::Add, base, Src::Imm(1));
        b.store_output(slot::POSITION, 1, old);
        let tail = b.finish();
        gs.body.0.extend(tail.0);

        let (rast, effects) =
            build_rast_program(&gs, &info(GsShape::StaticPerInstance));
        assert!(effects);
        assert!(rast.to_string().contains("atomic.Add"));
    }

    #[test]
    fn dynamic_shape_unpacks_with_shifts() {
        let (rast, _) = build_rast_program(&counted_gs(false), &info(GsShape::DynamicIndexed));
        let text = rast.to_string();
        assert!(text.contains("ushr"), "{text}");
        assert!(text.contains("iand"), "{text}");
    }
}
