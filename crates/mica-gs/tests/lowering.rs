//! End-to-end lowering tests: front-end geometry programs in, derived
//! program sets out.

use pretty_assertions::assert_eq;

use mica_gs::{lower_geometry_shader, GsShape, LowerOptions, RESTART_INDEX};
use mica_ir::{
    slot, Builder, ComponentMask, GsMeta, Op, OutputPrimitive, PrimitiveClass,
    Program, Stage, Sysval, XfbBuffer, XfbInfo, XfbOutput, MAX_XFB_BUFFERS,
};

fn gs_program(
    input: PrimitiveClass,
    output: OutputPrimitive,
    max_vertices_out: u32,
) -> Program {
    let mut prog = Program::new("gs", Stage::Geometry);
    prog.gs = Some(GsMeta {
        input_primitive: input,
        output_primitive: output,
        max_vertices_out,
        invocations: 1,
        active_stream_mask: 1,
    });
    prog.outputs_written = 1 << slot::POSITION;
    prog
}

/// Emit `n` position-carrying vertices on stream 0, then end the primitive.
fn emit_strip(prog: &mut Program, n: u32) {
    let mut b = Builder::new(prog);
    let pid = b.sysval(Sysval::PrimitiveId);
    for _ in 0..n {
        b.store_output(slot::POSITION, 0, pid);
        b.push_no_dst(Op::EmitVertex { stream: 0 });
    }
    b.push_no_dst(Op::EndPrimitive { stream: 0 });
    let tail = b.finish();
    prog.body.0.extend(tail.0);
}

fn lower(prog: Program) -> mica_gs::GsLowering {
    lower_geometry_shader(prog, &LowerOptions::default()).unwrap()
}

#[test]
fn single_triangle_collapses_to_per_instance_list() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        3,
    );
    emit_strip(&mut gs, 3);
    let lowered = lower(gs);

    assert_eq!(lowered.info.shape, GsShape::StaticPerInstance);
    assert_eq!(lowered.info.mode, OutputPrimitive::Triangles);
    assert_eq!(lowered.info.max_indices, 3);
    assert_eq!(lowered.info.count_words, 0);
    assert!(lowered.count.is_none());
    assert_eq!(lowered.xfb_key.static_count[0], 1);
}

#[test]
fn four_vertex_strip_becomes_per_prim_strip() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        4,
    );
    emit_strip(&mut gs, 4);
    let lowered = lower(gs);

    assert_eq!(lowered.info.shape, GsShape::StaticPerPrim);
    assert_eq!(lowered.info.mode, OutputPrimitive::TriangleStrip);
    assert_eq!(lowered.info.max_indices, 4);
}

#[test]
fn two_triangles_collapse_to_per_instance_list() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        6,
    );
    emit_strip(&mut gs, 3);
    emit_strip(&mut gs, 3);
    let lowered = lower(gs);

    assert_eq!(lowered.info.shape, GsShape::StaticPerInstance);
    assert_eq!(lowered.info.mode, OutputPrimitive::Triangles);
    assert_eq!(lowered.info.max_indices, 6);
}

#[test]
fn unequal_strips_become_a_static_index_buffer() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        7,
    );
    emit_strip(&mut gs, 4);
    emit_strip(&mut gs, 3);
    let lowered = lower(gs);

    // Neither a uniform list nor one big strip, but small enough to carry
    // the u8-encoded topology on the side.
    assert_eq!(lowered.info.shape, GsShape::StaticIndexed);
    assert_eq!(lowered.info.mode, OutputPrimitive::TriangleStrip);
    assert_eq!(lowered.info.max_indices, 8);
    assert_eq!(lowered.info.topology, vec![0, 1, 2, 3, 0xFF, 4, 5, 6]);
    assert_eq!(lowered.info.count_words, 0);
    assert!(lowered.count.is_none());
}

#[test]
fn oversized_static_topology_falls_back_to_dynamic() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        64,
    );
    for _ in 0..16 {
        emit_strip(&mut gs, 4);
    }
    let lowered = lower(gs);

    // 64 vertices plus 16 restarts blow past the static topology bound.
    assert_eq!(lowered.info.shape, GsShape::DynamicIndexed);
    assert!(lowered.info.topology.is_empty());
    // The restart word dropped for the instanced shapes is restored, so the
    // full budget of 64 vertices + 16 restarts survives the fallback.
    assert_eq!(lowered.info.max_indices, 80);
    // Static counts need no prepass even on the dynamic path.
    assert_eq!(lowered.info.count_words, 0);
    assert!(lowered.count.is_none());
    assert_eq!(lowered.xfb_key.static_count[0], 32);
}

fn conditional_gs() -> Program {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        3,
    );
    let mut b = Builder::new(&mut gs);
    let pid = b.sysval(Sysval::PrimitiveId);
    let cond = b.uge_imm(pid, 1);
    b.if_(cond, |b| {
        for _ in 0..3 {
            b.store_output(slot::POSITION, 0, pid);
            b.push_no_dst(Op::EmitVertex { stream: 0 });
        }
        b.push_no_dst(Op::EndPrimitive { stream: 0 });
    });
    gs.body = b.finish();
    gs
}

#[test]
fn conditional_emission_goes_dynamic() {
    let lowered = lower(conditional_gs());

    assert_eq!(lowered.info.shape, GsShape::DynamicIndexed);
    assert_eq!(lowered.info.count_words, 1);
    assert!(!lowered.info.prefix_sum);
    assert_eq!(lowered.info.max_indices, 4);
    assert_eq!(lowered.xfb_key.static_count[0], -1);
    assert_eq!(lowered.xfb_key.count_index[0], 0);

    // Without feedback a single atomic total is enough.
    let count = lowered.count.expect("dynamic counts need a prepass");
    assert_eq!(count.stage, Stage::Compute);
    let text = count.to_string();
    assert!(text.contains("atomic.Add"), "{text}");
    assert!(!text.contains("emit_vertex"), "{text}");

    // The main program writes and restarts the index buffer.
    let main = lowered.main.to_string();
    assert!(main.contains("store_global"), "{main}");
    assert!(main.contains(&format!("#{RESTART_INDEX}")), "{main}");
}

#[test]
fn derived_programs_have_their_stages() {
    let lowered = lower(conditional_gs());
    assert_eq!(lowered.main.stage, Stage::Compute);
    assert_eq!(lowered.pre_gs.stage, Stage::Compute);
    assert_eq!(lowered.rast.as_ref().unwrap().stage, Stage::Vertex);

    // Nothing geometry-flavored survives in the main program.
    let main = lowered.main.to_string();
    assert!(!main.contains("emit_vertex"), "{main}");
    assert!(!main.contains("end_primitive"), "{main}");
    assert!(!main.contains("set_counts"), "{main}");
    assert!(!main.contains("sysval"), "{main}");
}

#[test]
fn lowering_is_deterministic() {
    assert_eq!(lower(conditional_gs()), lower(conditional_gs()));
}

#[test]
fn plain_stores_run_in_main_not_rast() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        3,
    );
    {
        let mut b = Builder::new(&mut gs);
        let pid = b.sysval(Sysval::PrimitiveId);
        let base = b.param_base();
        b.store_global(base, pid, ComponentMask::X);
        gs.body = b.finish();
    }
    emit_strip(&mut gs, 3);
    let lowered = lower(gs);

    assert!(lowered.main.to_string().contains("store_global"));
    assert!(!lowered.rast.unwrap().to_string().contains("store_global"));
}

#[test]
fn rasterizer_discard_drops_adapter_and_index_traffic() {
    let lowered = lower_geometry_shader(
        conditional_gs(),
        &LowerOptions { rasterizer_discard: true },
    )
    .unwrap();

    assert!(lowered.rast.is_none());
    // No draw, no index buffer; counts still run for queries and feedback.
    assert!(!lowered.main.to_string().contains("store_global"));
    assert!(lowered.count.is_some());
}

#[test]
fn transform_feedback_writes_from_the_main_program() {
    let mut gs = gs_program(
        PrimitiveClass::Triangles,
        OutputPrimitive::TriangleStrip,
        3,
    );
    gs.xfb = Some(XfbInfo {
        buffers_written: 1,
        buffers: {
            let mut buffers = [XfbBuffer::default(); MAX_XFB_BUFFERS];
            buffers[0] = XfbBuffer { stride: 16 };
            buffers
        },
        buffer_to_stream: [0; MAX_XFB_BUFFERS],
        outputs: vec![XfbOutput {
            buffer: 0,
            location: slot::POSITION,
            component_mask: ComponentMask::XYZW,
            offset: 0,
        }],
    });
    emit_strip(&mut gs, 3);
    let lowered = lower(gs);

    // Static shape, yet the feedback stores stay in the main program.
    assert_eq!(lowered.info.shape, GsShape::StaticPerInstance);
    assert!(lowered.info.xfb);
    let main = lowered.main.to_string();
    assert!(main.contains("store_global"), "{main}");

    assert_eq!(lowered.xfb_key.buffers_written, 1);
    assert_eq!(lowered.xfb_key.stride[0], 16);
    assert_eq!(lowered.xfb_key.output_end[0], 16);
    assert_eq!(lowered.xfb_key.vertices_per_prim, 3);
}

#[test]
fn multi_stream_points_count_per_stream() {
    let mut gs = gs_program(PrimitiveClass::Points, OutputPrimitive::Points, 3);
    gs.gs.as_mut().unwrap().active_stream_mask = 0b11;
    let mut b = Builder::new(&mut gs);
    let pid = b.sysval(Sysval::PrimitiveId);
    b.store_output(slot::POSITION, 0, pid);
    b.push_no_dst(Op::EmitVertex { stream: 0 });
    b.push_no_dst(Op::EmitVertex { stream: 0 });
    b.push_no_dst(Op::EmitVertex { stream: 1 });
    gs.body = b.finish();
    let lowered = lower(gs);

    assert_eq!(lowered.info.count_words, 0);
    assert_eq!(lowered.xfb_key.streams, 0b11);
    assert_eq!(lowered.xfb_key.static_count[0], 2);
    assert_eq!(lowered.xfb_key.static_count[1], 1);
}

#[test]
fn instancing_multiplies_the_vertex_budget() {
    let mut gs = gs_program(PrimitiveClass::Points, OutputPrimitive::Points, 1);
    gs.gs.as_mut().unwrap().invocations = 2;
    let mut b = Builder::new(&mut gs);
    let inv = b.sysval(Sysval::InvocationId);
    b.store_output(slot::POSITION, 0, inv);
    b.push_no_dst(Op::EmitVertex { stream: 0 });
    gs.body = b.finish();
    let lowered = lower(gs);

    // Emission sits inside the invocation loop, so counts are dynamic.
    assert_eq!(lowered.info.shape, GsShape::DynamicIndexed);
    assert_eq!(lowered.xfb_key.invocations, 2);
    // Budget for both invocations, points need no restarts.
    assert_eq!(lowered.info.max_indices, 2);
}

#[test]
fn non_geometry_input_is_rejected() {
    let err = lower_geometry_shader(
        Program::new("vs", Stage::Vertex),
        &LowerOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "program `vs` is not a geometry shader");
}
