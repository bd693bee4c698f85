//! Static analysis of counted geometry programs: per-stream counts, topology
//! simulation, and shape classification.

use mica_ir::{Block, Op, OutputPrimitive, Program, Src, MAX_VERTEX_STREAMS};

use crate::params::RESTART_INDEX;
use crate::shape::{GsInfo, GsShape, MAX_STATIC_TOPOLOGY};

/// Simulation scratch. Bounds every topology we are willing to evaluate at
/// compile time; anything larger goes dynamic.
const TOPOLOGY_SCRATCH: usize = 384;

/// Final per-stream counts recovered from `SetCounts`, -1 when not a
/// compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StaticCounts {
    pub vertices: [i32; MAX_VERTEX_STREAMS],
    /// Ended strips.
    pub primitives: [i32; MAX_VERTEX_STREAMS],
    pub decomposed: [i32; MAX_VERTEX_STREAMS],
}

fn const_or_neg1(src: Src) -> i32 {
    match src.as_imm() {
        Some(v) => i32::try_from(v).unwrap_or(-1),
        None => -1,
    }
}

/// Scan for the per-stream `SetCounts` the counter insertion appended.
pub(crate) fn count_vertices_and_primitives(prog: &Program) -> StaticCounts {
    let mut counts = StaticCounts {
        vertices: [0; MAX_VERTEX_STREAMS],
        primitives: [0; MAX_VERTEX_STREAMS],
        decomposed: [0; MAX_VERTEX_STREAMS],
    };
    for instr in &prog.body.0 {
        if let Op::SetCounts { stream, vertices, primitives, decomposed } = &instr.op {
            let s = *stream as usize;
            counts.vertices[s] = const_or_neg1(*vertices);
            counts.primitives[s] = const_or_neg1(*primitives);
            counts.decomposed[s] = const_or_neg1(*decomposed);
        }
    }
    counts
}

/// Index budget per unrolled invocation: the declared vertex bound (tightened
/// by the static count when known) plus room for one restart per strip.
pub(crate) fn calculate_max_indices(
    prim: OutputPrimitive,
    mut verts: u32,
    static_verts: i32,
    static_prims: i32,
) -> u32 {
    if static_verts >= 0 {
        verts = verts.min(static_verts as u32);
    }

    if prim.decomposed() == OutputPrimitive::Points {
        verts
    } else if static_prims >= 0 {
        verts + static_prims as u32
    } else {
        // Worst case: primitives emitted one at a time.
        verts + verts / prim.vertices_per_decomposed()
    }
}

/// CPU mirror of the index-buffer write performed for one ended strip.
///
/// The strip's `vertices_in_prim` vertices occupy positions starting after
/// every earlier vertex and (when restart is used) every earlier restart
/// word; values are contiguous vertex ids from `value_base`.
pub(crate) fn end_primitive_indices(
    topology: &mut [u32],
    total_vertices: u32,
    vertices_in_prim: u32,
    total_primitives: u32,
    index_base_pos: u32,
    value_base: u32,
    restart: bool,
) {
    let prev_verts = total_vertices - vertices_in_prim;
    let mut pos = index_base_pos + prev_verts;
    if restart {
        pos += total_primitives - 1;
    }

    for i in 0..vertices_in_prim {
        topology[(pos + i) as usize] = value_base + prev_verts + i;
    }
    if restart {
        topology[(pos + vertices_in_prim) as usize] = RESTART_INDEX;
    }
}

/// Replay the counted geometry ops at compile time. Returns the simulated
/// index buffer, or `None` when the topology is not static (non-constant
/// counts, emission under control flow, or an oversized result).
fn evaluate_topology(gs: &Program, max_indices: u32) -> Option<Vec<u32>> {
    if max_indices as usize > TOPOLOGY_SCRATCH {
        return None;
    }

    let points = gs.gs_meta().output_primitive == OutputPrimitive::Points;
    let min = gs.verts_in_output_prim();

    // Every strip end must execute exactly once, which holds when they all
    // sit in the entry block.
    if any_counted_end_nested(&gs.body, points) {
        return None;
    }

    let mut topology = vec![0u32; max_indices as usize];
    for instr in &gs.body.0 {
        let (stream, srcs) = match &instr.op {
            Op::EndPrimitiveCounted {
                stream,
                total_vertices,
                vertices_in_prim,
                total_primitives,
            } => {
                assert!(!points, "strip ends for points should have been removed");
                (*stream, [*total_vertices, *vertices_in_prim, *total_primitives])
            }
            Op::SetCounts { stream, vertices, primitives, decomposed: _ } if points => {
                (*stream, [*vertices, *primitives, *primitives])
            }
            _ => continue,
        };

        // Only the rasterization stream shapes the index buffer.
        if stream != 0 {
            continue;
        }

        let [total, in_prim, prims] = [
            srcs[0].as_imm()?,
            srcs[1].as_imm()?,
            srcs[2].as_imm()?,
        ];

        if in_prim >= min as u64 {
            end_primitive_indices(
                &mut topology,
                total as u32,
                in_prim as u32,
                prims as u32,
                0,
                0,
                !points,
            );
        }
    }
    Some(topology)
}

fn any_counted_end_nested(block: &Block, points: bool) -> bool {
    fn scan(block: &Block, points: bool, nested: bool) -> bool {
        block.0.iter().any(|instr| match &instr.op {
            Op::EndPrimitiveCounted { stream: 0, .. } => nested,
            Op::SetCounts { stream: 0, .. } => points && nested,
            Op::If { then_block, else_block, .. } => {
                scan(then_block, points, true) || scan(else_block, points, true)
            }
            Op::Loop { body } => scan(body, points, true),
            _ => false,
        })
    }
    scan(block, points, false)
}

/// Pattern match the index buffer with restart against a list topology:
/// `0, 1, 2, -1, 3, 4, 5, -1, ...`
fn match_list_topology(info: &mut GsInfo, count: u32, topology: &[u32]) -> bool {
    let count_with_restart = count + 1;

    // Must be an integer number of primitives.
    if info.max_indices % count_with_restart != 0 {
        return false;
    }

    for i in 0..info.max_indices {
        let restart = (i % count_with_restart) == count;
        let expected =
            if restart { RESTART_INDEX } else { i - (i / count_with_restart) };
        if topology[i as usize] != expected {
            return false;
        }
    }

    // Matched: drop the indexing entirely and draw decomposed lists.
    info.shape = GsShape::StaticPerInstance;
    info.mode = info.mode.decomposed();
    info.max_indices = (info.max_indices / count_with_restart) * count;
    true
}

fn is_strip_topology(indices: &[u32]) -> bool {
    indices.iter().enumerate().all(|(i, v)| *v == i as u32)
}

/// Try to replace the dynamic index buffer with a static shape. Many geometry
/// shaders have compile-time topologies; identifying them removes the runtime
/// index-buffer traffic, and for simple shapes the whole count/index plumbing.
pub(crate) fn optimize_static_topology(info: &mut GsInfo, gs: &Program) {
    let Some(topology) = evaluate_topology(gs, info.max_indices) else {
        info.shape = GsShape::DynamicIndexed;
        return;
    };

    // Points are always lists.
    if gs.gs_meta().output_primitive == OutputPrimitive::Points {
        info.shape = GsShape::StaticPerInstance;
        return;
    }

    let count = gs.verts_in_output_prim();
    if match_list_topology(info, count, &topology) {
        return;
    }

    // Instancing per input primitive lets us drop the trailing restart.
    info.max_indices -= 1;

    if is_strip_topology(&topology[..info.max_indices as usize]) {
        info.shape = GsShape::StaticPerPrim;
        return;
    }

    // Small static index buffer. Indices must fit a byte with 0xFF reserved
    // for restart; otherwise take the dynamic path (restoring the budget the
    // restart drop assumed).
    if info.max_indices as usize >= MAX_STATIC_TOPOLOGY
        || topology[..info.max_indices as usize]
            .iter()
            .any(|&v| v >= 0xFF && v != RESTART_INDEX)
    {
        info.max_indices += 1;
        info.shape = GsShape::DynamicIndexed;
        return;
    }

    info.topology = topology[..info.max_indices as usize]
        .iter()
        .map(|&v| if v == RESTART_INDEX { 0xFF } else { v as u8 })
        .collect();
    info.shape = GsShape::StaticIndexed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const R: u32 = RESTART_INDEX;

    #[test]
    fn end_primitive_writes_strip_runs() {
        let mut topo = vec![0u32; 8];
        end_primitive_indices(&mut topo, 3, 3, 1, 0, 0, true);
        end_primitive_indices(&mut topo, 6, 3, 2, 0, 0, true);
        assert_eq!(topo, vec![0, 1, 2, R, 3, 4, 5, R]);
    }

    #[test]
    fn end_primitive_points_are_dense() {
        let mut topo = vec![0u32; 4];
        end_primitive_indices(&mut topo, 4, 4, 4, 0, 0, false);
        assert_eq!(topo, vec![0, 1, 2, 3]);
    }

    fn info(mode: OutputPrimitive, max_indices: u32) -> GsInfo {
        GsInfo {
            mode,
            shape: GsShape::DynamicIndexed,
            max_indices,
            count_words: 0,
            prefix_sum: false,
            xfb: false,
            topology: Vec::new(),
        }
    }

    #[test]
    fn list_pattern_collapses_to_per_instance() {
        let mut i = info(OutputPrimitive::TriangleStrip, 8);
        assert!(match_list_topology(&mut i, 3, &[0, 1, 2, R, 3, 4, 5, R]));
        assert_eq!(i.shape, GsShape::StaticPerInstance);
        assert_eq!(i.mode, OutputPrimitive::Triangles);
        assert_eq!(i.max_indices, 6);
    }

    #[test]
    fn non_list_pattern_is_rejected() {
        let mut i = info(OutputPrimitive::TriangleStrip, 8);
        assert!(!match_list_topology(&mut i, 3, &[0, 1, 2, 3, R, 4, 5, R]));
        assert_eq!(i.shape, GsShape::DynamicIndexed);
    }

    #[test]
    fn strip_topology_is_the_identity() {
        assert!(is_strip_topology(&[0, 1, 2, 3, 4]));
        assert!(!is_strip_topology(&[0, 1, 2, R]));
    }

    #[test]
    fn max_indices_formula() {
        // 12 vertices forming 4 strips: one restart per strip.
        assert_eq!(
            calculate_max_indices(OutputPrimitive::TriangleStrip, 12, 12, 4),
            16
        );
        // Points never need restarts.
        assert_eq!(calculate_max_indices(OutputPrimitive::Points, 12, 12, 12), 12);
        // Unknown primitive count: worst case of one primitive per end.
        assert_eq!(
            calculate_max_indices(OutputPrimitive::TriangleStrip, 12, -1, -1),
            16
        );
        // A tighter static vertex bound wins over the declared maximum.
        assert_eq!(
            calculate_max_indices(OutputPrimitive::TriangleStrip, 256, 3, 1),
            4
        );
    }
}
