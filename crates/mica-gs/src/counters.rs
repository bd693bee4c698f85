//! Rewrites raw `EmitVertex`/`EndPrimitive` into counted ops carrying vertex,
//! strip and decomposed-primitive counters, and appends the final per-stream
//! `SetCounts`.
//!
//! While emission stays in the entry block the counters are tracked here as
//! compile-time constants, so the downstream analysis sees immediates without
//! needing a constant folder. Emission under control flow falls back to
//! counter variables with select-based updates, which the analysis correctly
//! reports as unknown.

use mica_ir::{
    rewrite_program, Block, Builder, ComponentMask, Op, OutputPrimitive, Program, Src,
    VarId, MAX_VERTEX_STREAMS,
};

#[derive(Clone, Copy, Default)]
struct StaticStream {
    verts: u64,
    in_strip: u64,
    strips: u64,
    decomposed: u64,
}

#[derive(Clone, Copy)]
struct DynStream {
    verts: VarId,
    in_strip: VarId,
    strips: VarId,
    decomposed: VarId,
}

pub(crate) fn lower_counted_geometry(gs: &mut Program) {
    let meta = gs.gs_meta().clone();
    let points = meta.output_primitive == OutputPrimitive::Points;
    let min = meta.output_primitive.vertices_per_decomposed() as u64;
    let mask = meta.active_stream_mask;

    if !any_geometry_op_nested(&gs.body) {
        lower_static(gs, points, min, mask);
    } else {
        lower_dynamic(gs, points, min, mask);
    }
}

fn any_geometry_op_nested(block: &Block) -> bool {
    fn scan(block: &Block, nested: bool) -> bool {
        block.0.iter().any(|instr| match &instr.op {
            Op::EmitVertex { .. } | Op::EndPrimitive { .. } => nested,
            Op::If { then_block, else_block, .. } => {
                scan(then_block, true) || scan(else_block, true)
            }
            Op::Loop { body } => scan(body, true),
            _ => false,
        })
    }
    scan(block, false)
}

fn lower_static(gs: &mut Program, points: bool, min: u64, mask: u8) {
    let mut streams = [StaticStream::default(); MAX_VERTEX_STREAMS];

    let end = |b: &mut Builder, c: &mut StaticStream, stream: u8| {
        if c.in_strip < min {
            // Incomplete strip: rewind so later vertices overwrite it.
            c.verts -= c.in_strip;
        } else {
            c.strips += 1;
            b.push_no_dst(Op::EndPrimitiveCounted {
                stream,
                total_vertices: Src::Imm(c.verts),
                vertices_in_prim: Src::Imm(c.in_strip),
                total_primitives: Src::Imm(c.strips),
            });
        }
        c.in_strip = 0;
    };

    rewrite_program(gs, &mut |b, instr| match instr.op {
        Op::EmitVertex { stream } => {
            assert!(mask & (1 << stream) != 0, "emit on inactive stream");
            let c = &mut streams[stream as usize];
            b.push_no_dst(Op::EmitVertexCounted {
                stream,
                vertex_id: Src::Imm(c.verts),
                index_in_strip: Src::Imm(c.in_strip),
                primitive_id: Src::Imm(c.decomposed),
            });
            c.verts += 1;
            c.in_strip += 1;
            if c.in_strip >= min {
                c.decomposed += 1;
            }
            true
        }
        Op::EndPrimitive { stream } => {
            // Points are self-contained; their strip ends carry nothing.
            if !points {
                end(b, &mut streams[stream as usize], stream);
            }
            true
        }
        _ => false,
    });

    let mut b = Builder::new(gs);
    for stream in 0..MAX_VERTEX_STREAMS as u8 {
        if mask & (1 << stream) == 0 {
            continue;
        }
        let c = &mut streams[stream as usize];
        if !points {
            // Force a final end so trailing vertices are never lost.
            end(&mut b, c, stream);
        }
        let (prims, decomposed) =
            if points { (c.verts, c.verts) } else { (c.strips, c.decomposed) };
        b.push_no_dst(Op::SetCounts {
            stream,
            vertices: Src::Imm(c.verts),
            primitives: Src::Imm(prims),
            decomposed: Src::Imm(decomposed),
        });
    }
    let tail = b.finish();
    gs.body.0.extend(tail.0);
}

fn lower_dynamic(gs: &mut Program, points: bool, min: u64, mask: u8) {
    let mut streams: [Option<DynStream>; MAX_VERTEX_STREAMS] =
        [None; MAX_VERTEX_STREAMS];
    for (s, slot) in streams.iter_mut().enumerate() {
        if mask & (1 << s) != 0 {
            *slot = Some(DynStream {
                verts: gs.alloc_var(1, Some(format!("verts{s}"))),
                in_strip: gs.alloc_var(1, Some(format!("in_strip{s}"))),
                strips: gs.alloc_var(1, Some(format!("strips{s}"))),
                decomposed: gs.alloc_var(1, Some(format!("decomposed{s}"))),
            });
        }
    }

    let init = {
        let mut body = std::mem::take(&mut gs.body);
        let mut b = Builder::new(gs);
        for c in streams.iter().flatten() {
            for var in [c.verts, c.in_strip, c.strips, c.decomposed] {
                b.store_var(var, Src::Imm(0), ComponentMask::X);
            }
        }
        let init = b.finish();
        std::mem::swap(&mut gs.body, &mut body);
        init
    };

    let end = |b: &mut Builder, c: DynStream, stream: u8| {
        let verts = b.load_var(c.verts);
        let in_strip = b.load_var(c.in_strip);
        let strips = b.load_var(c.strips);
        let incomplete = b.ult(in_strip, Src::Imm(min));
        let rewound = b.isub(verts, in_strip);
        let verts = b.bcsel(incomplete, rewound, verts);
        let bumped = b.iadd_imm(strips, 1);
        let strips = b.bcsel(incomplete, strips, bumped);
        b.push_no_dst(Op::EndPrimitiveCounted {
            stream,
            total_vertices: verts,
            vertices_in_prim: in_strip,
            total_primitives: strips,
        });
        b.store_var(c.verts, verts, ComponentMask::X);
        b.store_var(c.in_strip, Src::Imm(0), ComponentMask::X);
        b.store_var(c.strips, strips, ComponentMask::X);
    };

    rewrite_program(gs, &mut |b, instr| match instr.op {
        Op::EmitVertex { stream } => {
            assert!(mask & (1 << stream) != 0, "emit on inactive stream");
            let c = streams[stream as usize].unwrap();
            let verts = b.load_var(c.verts);
            let in_strip = b.load_var(c.in_strip);
            let decomposed = b.load_var(c.decomposed);
            b.push_no_dst(Op::EmitVertexCounted {
                stream,
                vertex_id: verts,
                index_in_strip: in_strip,
                primitive_id: decomposed,
            });
            let verts = b.iadd_imm(verts, 1);
            let in_strip = b.iadd_imm(in_strip, 1);
            b.store_var(c.verts, verts, ComponentMask::X);
            b.store_var(c.in_strip, in_strip, ComponentMask::X);
            let completed = b.uge_imm(in_strip, min);
            let bumped = b.iadd_imm(decomposed, 1);
            let decomposed = b.bcsel(completed, bumped, decomposed);
            b.store_var(c.decomposed, decomposed, ComponentMask::X);
            true
        }
        Op::EndPrimitive { stream } => {
            if !points {
                end(b, streams[stream as usize].unwrap(), stream);
            }
            true
        }
        _ => false,
    });

    let mut b = Builder::new(gs);
    for (s, c) in streams.iter().enumerate() {
        let Some(c) = *c else { continue };
        if !points {
            end(&mut b, c, s as u8);
        }
        let verts = b.load_var(c.verts);
        let (prims, decomposed) = if points {
            (verts, verts)
        } else {
            (b.load_var(c.strips), b.load_var(c.decomposed))
        };
        b.push_no_dst(Op::SetCounts {
            stream: s as u8,
            vertices: verts,
            primitives: prims,
            decomposed,
        });
    }
    let tail = b.finish();

    let mut body = init;
    body.0.extend(std::mem::take(&mut gs.body).0);
    body.0.extend(tail.0);
    gs.body = body;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::count_vertices_and_primitives;
    use mica_ir::{GsMeta, PrimitiveClass, Stage, Sysval};

    fn strip_gs(max_out: u32) -> Program {
        let mut prog = Program::new("gs", Stage::Geometry);
        prog.gs = Some(GsMeta {
            input_primitive: PrimitiveClass::Triangles,
            output_primitive: OutputPrimitive::TriangleStrip,
            max_vertices_out: max_out,
            invocations: 1,
            active_stream_mask: 1,
        });
        prog
    }

    fn raw_emit(prog: &mut Program, n: u32) {
        for _ in 0..n {
            prog.body.0.push(mica_ir::Instr {
                dst: None,
                op: Op::EmitVertex { stream: 0 },
            });
        }
    }

    fn raw_end(prog: &mut Program) {
        prog.body.0.push(mica_ir::Instr { dst: None, op: Op::EndPrimitive { stream: 0 } });
    }

    #[test]
    fn static_counts_for_single_strip() {
        let mut gs = strip_gs(4);
        raw_emit(&mut gs, 4);
        raw_end(&mut gs);
        lower_counted_geometry(&mut gs);

        let counts = count_vertices_and_primitives(&gs);
        assert_eq!(counts.vertices[0], 4);
        assert_eq!(counts.primitives[0], 1);
        assert_eq!(counts.decomposed[0], 2);
    }

    #[test]
    fn incomplete_strip_is_rewound() {
        let mut gs = strip_gs(8);
        raw_emit(&mut gs, 2);
        raw_end(&mut gs);
        raw_emit(&mut gs, 3);
        raw_end(&mut gs);
        lower_counted_geometry(&mut gs);

        let counts = count_vertices_and_primitives(&gs);
        assert_eq!(counts.vertices[0], 3);
        assert_eq!(counts.primitives[0], 1);
        assert_eq!(counts.decomposed[0], 1);
    }

    #[test]
    fn trailing_vertices_get_a_forced_end() {
        let mut gs = strip_gs(8);
        raw_emit(&mut gs, 3);
        lower_counted_geometry(&mut gs);

        let counts = count_vertices_and_primitives(&gs);
        assert_eq!(counts.vertices[0], 3);
        assert_eq!(counts.primitives[0], 1);
        assert_eq!(counts.decomposed[0], 1);
    }

    #[test]
    fn point_counts_are_all_vertices() {
        let mut gs = strip_gs(5);
        gs.gs.as_mut().unwrap().output_primitive = OutputPrimitive::Points;
        raw_emit(&mut gs, 5);
        raw_end(&mut gs);
        lower_counted_geometry(&mut gs);

        let counts = count_vertices_and_primitives(&gs);
        assert_eq!(counts.vertices[0], 5);
        assert_eq!(counts.primitives[0], 5);
        assert_eq!(counts.decomposed[0], 5);
        let text = gs.to_string();
        assert!(!text.contains("end_primitive"), "{text}");
    }

    #[test]
    fn control_flow_emission_goes_dynamic() {
        let mut gs = strip_gs(8);
        let mut b = Builder::new(&mut gs);
        let cond = b.sysval(Sysval::PrimitiveId);
        b.if_(cond, |b| {
            b.push_no_dst(Op::EmitVertex { stream: 0 });
        });
        gs.body = b.finish();
        lower_counted_geometry(&mut gs);

        let counts = count_vertices_and_primitives(&gs);
        assert_eq!(counts.vertices[0], -1);
        assert_eq!(counts.primitives[0], -1);
        assert_eq!(counts.decomposed[0], -1);
    }
}
