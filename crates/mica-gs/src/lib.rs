//! Geometry shader lowering for GPUs that run geometry work as compute.
//!
//! One geometry program goes in; up to four derived programs come out:
//!
//! * a count prepass that runs the shader for its per-stream primitive
//!   counts only (skipped when every count is a compile-time constant),
//! * the main compute program, which emits the dynamic index buffer and the
//!   transform feedback writes,
//! * a rasterization adapter, the shader replayed as a hardware vertex
//!   shader selecting the one vertex each invocation owns (skipped under
//!   rasterizer discard),
//! * a patch-up program finalizing the indirect draw, the pipeline
//!   statistics and the feedback bookkeeping.
//!
//! The classification of how the output reaches the rasterizer lives in
//! [`GsInfo`]; the runtime contract for the shared parameter block is
//! [`GeometryParams`].

mod analysis;
mod count_pass;
mod counters;
mod inputs;
mod instancing;
mod main_pass;
pub mod params;
mod pre_pass;
mod rast_pass;
pub mod shape;
mod side_effects;

use mica_ir::validate::{validate_gs, ValidateError};
use mica_ir::{opt, Block, Op, Program, MAX_VARYING_SLOTS, MAX_VERTEX_STREAMS};
use tracing::debug;

pub use inputs::lower_vs_before_gs;
pub use params::{GeometryParams, Param, RESTART_INDEX};
pub use pre_pass::XfbKey;
pub use shape::{GsInfo, GsShape, MAX_STATIC_TOPOLOGY};

use shape::LowerState;

/// Per-pipeline knobs affecting the lowering.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowerOptions {
    /// The draw never rasterizes; index-buffer traffic and the adapter are
    /// dropped, leaving counts, side effects and transform feedback.
    pub rasterizer_discard: bool,
}

/// The derived programs and metadata for one lowered geometry shader.
#[derive(Debug, Clone, PartialEq)]
pub struct GsLowering {
    /// Count prepass, present iff `info.count_words > 0`.
    pub count: Option<Program>,
    /// Main compute program, dispatched (input primitives, instances).
    pub main: Program,
    /// Rasterization adapter, absent under rasterizer discard.
    pub rast: Option<Program>,
    /// Patch-up program, dispatched as a single thread after `main`.
    pub pre_gs: Program,
    pub info: GsInfo,
    /// Cache key for `pre_gs`.
    pub xfb_key: XfbKey,
}

/// Highest component written per varying slot, from the stores actually
/// present.
fn collect_components(prog: &Program) -> [u8; MAX_VARYING_SLOTS] {
    fn scan(block: &Block, counts: &mut [u8; MAX_VARYING_SLOTS]) {
        for instr in &block.0 {
            match &instr.op {
                Op::StoreOutput { location, component, .. } => {
                    let slot = &mut counts[*location as usize];
                    *slot = (*slot).max(component + 1);
                }
                Op::If { then_block, else_block, .. } => {
                    scan(then_block, counts);
                    scan(else_block, counts);
                }
                Op::Loop { body } => scan(body, counts),
                _ => {}
            }
        }
    }
    let mut counts = [0; MAX_VARYING_SLOTS];
    scan(&prog.body, &mut counts);
    counts
}

/// Lower a geometry program into its derived compute/vertex programs.
///
/// The input must be a validated geometry-stage program still carrying raw
/// `emit_vertex`/`end_primitive` ops and per-vertex input loads.
pub fn lower_geometry_shader(
    mut gs: Program,
    opts: &LowerOptions,
) -> Result<GsLowering, ValidateError> {
    validate_gs(&gs)?;

    let mut state = LowerState::new(opts.rasterizer_discard);
    let components = collect_components(&gs);

    if gs.gs_meta().invocations > 1 {
        instancing::lower_gs_instancing(&mut gs);
    } else {
        instancing::smash_invocation_id(&mut gs);
    }

    inputs::lower_gs_inputs(&mut gs);
    counters::lower_counted_geometry(&mut gs);
    opt::optimize(&mut gs);

    let counts = analysis::count_vertices_and_primitives(&gs);
    state.static_count = counts.decomposed;

    // Streams with unknown counts get a word in the count buffer.
    let mut count_words = 0u32;
    for s in 0..MAX_VERTEX_STREAMS {
        if gs.gs_meta().active_stream_mask & (1 << s) != 0 && counts.decomposed[s] < 0 {
            state.count_index[s] = count_words as i32;
            count_words += 1;
        }
    }

    let meta = gs.gs_meta().clone();
    let max_indices = analysis::calculate_max_indices(
        meta.output_primitive,
        meta.max_vertices_out,
        counts.vertices[0],
        counts.primitives[0],
    );

    let mut info = GsInfo {
        mode: meta.output_primitive,
        shape: GsShape::DynamicIndexed,
        max_indices,
        count_words,
        // Transform feedback addresses primitives by prefix sums over the
        // count buffer; without it a single atomic total suffices.
        prefix_sum: count_words > 0 && gs.xfb.is_some(),
        xfb: gs.xfb.is_some(),
        topology: Vec::new(),
    };

    if counts.vertices[0] >= 0 && counts.primitives[0] >= 0 {
        analysis::optimize_static_topology(&mut info, &gs);
    }
    debug!(
        shape = ?info.shape,
        max_indices = info.max_indices,
        count_words,
        prefix_sum = info.prefix_sum,
        "classified geometry program"
    );

    // The adapter replays the counted program with hardware ids, so it is
    // cloned before the compute id lowering.
    let (rast, side_effects_for_rast) = if opts.rasterizer_discard {
        (None, false)
    } else {
        let (rast, side_effects) = rast_pass::build_rast_program(&gs, &info);
        (Some(rast), side_effects)
    };

    inputs::lower_id(&mut gs);

    let count = if info.count_words > 0 {
        Some(count_pass::build_count_program(&gs, &state, &info))
    } else {
        None
    };

    main_pass::lower_main_program(&mut gs, &mut state, &info, &components);
    // With the side effects pinned to the adapter, the main program only
    // needs its atomics when the adapter might never run.
    let rasterizes = !opts.rasterizer_discard && counts.vertices[0] > 0;
    if side_effects_for_rast && rasterizes {
        side_effects::strip_side_effects_from_main(&mut gs);
    }
    opt::optimize(&mut gs);
    inputs::lower_id(&mut gs);

    let xfb_key = XfbKey::new(&gs, &state, &info);
    let pre_gs = pre_pass::build_pre_gs(&xfb_key);

    Ok(GsLowering { count, main: gs, rast, pre_gs, info, xfb_key })
}
