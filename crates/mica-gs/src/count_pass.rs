//! The count prepass: the geometry program stripped down to its final
//! per-stream counts, routed into the count buffer. Skipped entirely when
//! every count is known at compile time.

use mica_ir::{opt, rewrite_program, AtomicOp, ComponentMask, Op, Program, Src, Stage};

use crate::inputs::lower_id;
use crate::params::{calc_unrolled_id, xfb_count_address};
use crate::shape::{GsInfo, LowerState};

pub(crate) fn build_count_program(
    gs: &Program,
    state: &LowerState,
    info: &GsInfo,
) -> Program {
    let mut prog = gs.clone();
    prog.name = format!("{}_count", prog.name);
    prog.stage = Stage::Compute;

    rewrite_program(&mut prog, &mut |b, instr| match instr.op {
        // Main-program concerns; the counts are all that survive here.
        Op::EmitVertexCounted { .. }
        | Op::EndPrimitiveCounted { .. }
        | Op::StoreOutput { .. } => true,

        Op::SetCounts { stream, decomposed, .. } => {
            let s = stream as usize;
            if state.count_index[s] < 0 {
                return true;
            }
            // Prefix-summed buffers get one row per unrolled invocation;
            // otherwise everyone accumulates into row 0.
            let row =
                if info.prefix_sum { calc_unrolled_id(b) } else { Src::Imm(0) };
            let addr = xfb_count_address(
                b,
                state.count_index[s] as u32,
                info.count_words,
                row,
            );
            if info.prefix_sum {
                b.store_global(addr, decomposed, ComponentMask::X);
            } else {
                let _ = b.global_atomic(AtomicOp::Add, addr, decomposed);
            }
            true
        }

        _ => false,
    });

    lower_id(&mut prog);
    opt::optimize(&mut prog);
    prog.gs = None;
    prog
}

#[cfg(test)]
mod tests {
    use super::*;
    use mica_ir::{Builder, GsMeta, OutputPrimitive, PrimitiveClass, Sysval};

    use crate::counters::lower_counted_geometry;
    use crate::shape::GsShape;

    #[test]
    fn count_program_is_a_compute_kernel() {
        let mut gs = Program::new("gs", Stage::Geometry);
        gs.gs = Some(GsMeta {
            input_primitive: PrimitiveClass::Triangles,
            output_primitive: OutputPrimitive::TriangleStrip,
            max_vertices_out: 3,
            invocations: 1,
            active_stream_mask: 1,
        });
        let mut b = Builder::new(&mut gs);
        let cond = b.sysval(Sysval::PrimitiveId);
        b.if_(cond, |b| {
            for _ in 0..3 {
                b.push_no_dst(Op::EmitVertex { stream: 0 });
            }
            b.push_no_dst(Op::EndPrimitive { stream: 0 });
        });
        gs.body = b.finish();
        lower_counted_geometry(&mut gs);

        let mut state = LowerState::new(false);
        state.count_index[0] = 0;
        let info = GsInfo {
            mode: OutputPrimitive::TriangleStrip,
            shape: GsShape::DynamicIndexed,
            max_indices: 4,
            count_words: 1,
            prefix_sum: false,
            xfb: false,
            topology: Vec::new(),
        };
        let count = build_count_program(&gs, &state, &info);

        assert_eq!(count.stage, Stage::Compute);
        assert!(count.gs.is_none());
        let text = count.to_string();
        assert!(text.contains("atomic.Add"), "{text}");
        assert!(!text.contains("emit_vertex"), "{text}");
    }
}
