//! The patch-up program that runs between the count prepass and the draw: it
//! finalizes the indirect draw descriptor, accumulates pipeline statistics,
//! and advances the transform feedback bookkeeping for the next draw.
//!
//! Everything it needs is summarized in [`XfbKey`], so runtimes can cache the
//! compiled program per key instead of per shader.

use mica_ir::{
    Builder, ComponentMask, Program, Src, Stage, MAX_VERTEX_STREAMS, MAX_XFB_BUFFERS,
};

use crate::params::{
    bump_stat, load_param, store_param, xfb_count_address, Param,
};
use crate::shape::{GsInfo, LowerState};

/// Everything the patch-up program depends on. Two shaders with equal keys
/// get byte-identical patch-up programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XfbKey {
    /// Bitmask of active vertex streams.
    pub streams: u8,
    /// Bitmask of transform feedback buffers written.
    pub buffers_written: u8,
    pub buffer_to_stream: [u8; MAX_XFB_BUFFERS],
    /// Count-buffer word per stream, -1 when the count is static.
    pub count_index: [i8; MAX_VERTEX_STREAMS],
    /// Byte stride per feedback buffer.
    pub stride: [u16; MAX_XFB_BUFFERS],
    /// One past the last byte any captured output writes per vertex, per
    /// buffer. Zero when the buffer captures nothing.
    pub output_end: [u16; MAX_XFB_BUFFERS],
    /// Static decomposed primitives per invocation, -1 when dynamic.
    pub static_count: [i16; MAX_VERTEX_STREAMS],
    pub invocations: u16,
    /// Vertices per decomposed output primitive.
    pub vertices_per_prim: u16,
    pub count_words: u32,
    pub prefix_sum: bool,
}

impl XfbKey {
    pub(crate) fn new(gs: &Program, state: &LowerState, info: &GsInfo) -> Self {
        let meta = gs.gs_meta();
        let mut key = XfbKey {
            streams: meta.active_stream_mask,
            invocations: meta.invocations as u16,
            vertices_per_prim: gs.verts_in_output_prim() as u16,
            count_words: info.count_words,
            prefix_sum: info.prefix_sum,
            ..XfbKey::default()
        };
        for s in 0..MAX_VERTEX_STREAMS {
            key.count_index[s] = state.count_index[s] as i8;
            key.static_count[s] = state.static_count[s] as i16;
        }
        if let Some(xfb) = &gs.xfb {
            key.buffers_written = xfb.buffers_written;
            key.buffer_to_stream = xfb.buffer_to_stream;
            for buf in 0..MAX_XFB_BUFFERS {
                key.stride[buf] = xfb.buffers[buf].stride as u16;
            }
            for out in &xfb.outputs {
                let end = (out.offset + 4 * out.component_mask.count()) as u16;
                let slot = &mut key.output_end[out.buffer as usize];
                *slot = (*slot).max(end);
            }
        }
        key
    }
}

/// Total decomposed primitives per active stream, as runtime values.
fn stream_primitives(
    b: &mut Builder,
    key: &XfbKey,
    input_prims: Src,
) -> [Option<Src>; MAX_VERTEX_STREAMS] {
    let mut prims = [None; MAX_VERTEX_STREAMS];
    for (s, slot) in prims.iter_mut().enumerate() {
        if key.streams & (1 << s) == 0 {
            continue;
        }
        *slot = Some(if key.static_count[s] >= 0 {
            b.imul_imm(input_prims, key.static_count[s] as u64)
        } else {
            // Prefix mode appends a totals row after the per-invocation rows;
            // atomic mode accumulates everything into row 0.
            let row = if key.prefix_sum { input_prims } else { Src::Imm(0) };
            let addr =
                xfb_count_address(b, key.count_index[s] as u32, key.count_words, row);
            b.load_global(addr, 4, 1)
        });
    }
    prims
}

/// Build the patch-up program. Dispatched as a single thread.
pub(crate) fn build_pre_gs(key: &XfbKey) -> Program {
    let mut prog = Program::new("pre_gs", Stage::Compute);
    let mut b = Builder::new(&mut prog);

    // Finalize the indirect draw: the grid always draws the full index
    // budget, with padding making the unused tail degenerate.
    let desc = load_param(&mut b, Param::IndirectDesc);
    let g0 = load_param(&mut b, Param::GsGrid0);
    let g1 = load_param(&mut b, Param::GsGrid1);
    let max_indices = load_param(&mut b, Param::MaxIndices);
    let per_instance = b.imul(max_indices, g0);
    let index_count = b.imul(per_instance, g1);
    b.store_global(desc, index_count, ComponentMask::X);
    for (word, value) in [(1u64, 1u64), (2, 0), (3, 0), (4, 0)] {
        let addr = b.iadd_imm(desc, 4 * word);
        b.store_global(addr, Src::Imm(value), ComponentMask::X);
    }

    let input_prims = b.imul(g0, g1);
    let prims = stream_primitives(&mut b, key, input_prims);

    // Pipeline statistics.
    let gs_invocations = b.imul_imm(input_prims, key.invocations as u64);
    bump_stat(&mut b, Param::StatsGsInvocations, gs_invocations);
    let mut total: Option<Src> = None;
    for p in prims.iter().flatten() {
        total = Some(match total {
            Some(t) => b.iadd(t, *p),
            None => *p,
        });
    }
    if let Some(t) = total {
        bump_stat(&mut b, Param::StatsGsPrimitives, t);
    }
    if let Some(p0) = prims[0] {
        bump_stat(&mut b, Param::StatsCPrimitives, p0);
        bump_stat(&mut b, Param::StatsCInvocations, p0);
    }

    // Advance the feedback write offsets past what this draw captured
    // (clamped to the per-stream capacity, matching the main program's
    // overflow guard).
    let mut new_offset = [None; MAX_XFB_BUFFERS];
    for buf in 0..MAX_XFB_BUFFERS {
        if key.buffers_written & (1 << buf) == 0 {
            continue;
        }
        let stream = key.buffer_to_stream[buf] as usize;
        let Some(p) = prims[stream] else { continue };
        let cap = load_param(&mut b, Param::XfbPrims(stream as u8));
        let written = b.umin(p, cap);
        let verts = b.imul_imm(written, key.vertices_per_prim as u64);
        let bytes = b.imul_imm(verts, key.stride[buf] as u64);
        let old = load_param(&mut b, Param::XfbOffset(buf as u8));
        let advanced = b.iadd(old, bytes);
        store_param(&mut b, Param::XfbOffset(buf as u8), advanced);
        new_offset[buf] = Some(advanced);
    }

    // Recompute each stream's primitive capacity from the space left behind
    // the advanced offsets; the next draw's overflow guard reads it.
    for s in 0..MAX_VERTEX_STREAMS {
        if key.streams & (1 << s) == 0 {
            continue;
        }
        let mut cap: Option<Src> = None;
        for buf in 0..MAX_XFB_BUFFERS {
            if key.buffers_written & (1 << buf) == 0
                || key.buffer_to_stream[buf] as usize != s
            {
                continue;
            }
            let Some(off) = new_offset[buf] else { continue };
            let prim_bytes = key.stride[buf] as u64 * key.vertices_per_prim as u64;
            if prim_bytes == 0 || key.output_end[buf] == 0 {
                continue;
            }
            let size = load_param(&mut b, Param::XfbSize(buf as u8));
            let space = b.isub(size, off);
            // A primitive fits when its last vertex's bytes do; beyond the
            // first, each one costs a full stride.
            let fits = b.uge_imm(space, key.output_end[buf] as u64);
            let beyond = b.isub(space, Src::Imm(key.output_end[buf] as u64));
            let more = b.udiv_imm(beyond, prim_bytes);
            let fitting = b.iadd_imm(more, 1);
            let this = b.bcsel(fits, fitting, Src::Imm(0));
            cap = Some(match cap {
                Some(prev) => b.umin(prev, this),
                None => this,
            });
        }
        if let Some(c) = cap {
            store_param(&mut b, Param::XfbPrims(s as u8), c);
        }
    }

    prog.body = b.finish();
    prog
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> XfbKey {
        XfbKey {
            streams: 1,
            buffers_written: 1,
            buffer_to_stream: [0; 4],
            count_index: [-1; 4],
            stride: [16, 0, 0, 0],
            output_end: [16, 0, 0, 0],
            static_count: [2, -1, -1, -1],
            invocations: 1,
            vertices_per_prim: 3,
            count_words: 0,
            prefix_sum: false,
        }
    }

    #[test]
    fn equal_keys_build_identical_programs() {
        assert_eq!(build_pre_gs(&key()), build_pre_gs(&key()));
    }

    #[test]
    fn patches_all_five_descriptor_words() {
        let prog = build_pre_gs(&key());
        let stores = prog
            .to_string()
            .lines()
            .filter(|l| l.contains("store_global"))
            .count();
        // 5 descriptor words, 1 offset advance, 1 capacity store.
        assert_eq!(stores, 7);
    }

    #[test]
    fn dynamic_counts_change_the_program() {
        let mut k = key();
        k.static_count[0] = -1;
        k.count_index[0] = 0;
        k.count_words = 1;
        k.prefix_sum = true;
        assert_ne!(build_pre_gs(&k), build_pre_gs(&key()));
    }
}
