//! Placement of memory side effects between the main program and the
//! rasterization adapter.
//!
//! The adapter re-executes the shader once per rasterized vertex, so a side
//! effect cannot run in both programs without being observed multiple times,
//! and an atomic whose result feeds a rasterized output cannot leave the
//! adapter at all. The policy, in order of preference:
//!
//! 1. Run side effects in the main program only. It executes once per API
//!    invocation, which is what applications expect.
//! 2. If any atomic result is consumed by the adapter, run *all* side effects
//!    in the adapter so plain stores and atomics stay consistent with each
//!    other.
//! 3. When at least one vertex is guaranteed to rasterize, additionally strip
//!    the main program of the atomics nothing there consumes.
//!
//! Rather than a one-shot analysis, we clone the program and try to strip it;
//! looping with dead-code removal handles side effects buried in control flow
//! that a single pass cannot judge.

use std::collections::HashSet;

use mica_ir::{opt, Block, Op, Program, ValueId};
use tracing::debug;

fn strip_rast_block(block: &mut Block, used: &HashSet<ValueId>, any: &mut bool) -> bool {
    let mut progress = false;
    block.0.retain_mut(|instr| match &mut instr.op {
        Op::If { then_block, else_block, .. } => {
            progress |= strip_rast_block(then_block, used, any);
            progress |= strip_rast_block(else_block, used, any);
            true
        }
        Op::Loop { body } => {
            progress |= strip_rast_block(body, used, any);
            true
        }
        Op::StoreGlobal { .. } => {
            progress = true;
            false
        }
        Op::GlobalAtomic { .. } | Op::GlobalAtomicSwap { .. } => {
            let required = instr.dst.is_some_and(|d| used.contains(&d));
            if required {
                *any = true;
            } else {
                progress = true;
            }
            required
        }
        _ => true,
    });
    progress
}

/// Strip as much as possible; returns whether everything came out.
fn try_strip_rast(prog: &mut Program) -> bool {
    loop {
        let used = opt::used_values(prog);
        let mut any = false;
        let p1 = strip_rast_block(&mut prog.body, &used, &mut any);
        let p2 = opt::dce(prog);
        let p3 = opt::dead_cf(prog);
        if !(p1 || p2 || p3) {
            return !any;
        }
    }
}

/// Apply the placement policy to the adapter-to-be. Returns true when side
/// effects must execute in the adapter (case 2), in which case the program is
/// left untouched.
pub(crate) fn strip_side_effects_from_rast(prog: &mut Program) -> bool {
    let mut probe = prog.clone();
    if !try_strip_rast(&mut probe) {
        debug!(program = %prog.name, "side effects pinned to rasterization adapter");
        return true;
    }

    let fully = try_strip_rast(prog);
    debug_assert!(fully);
    false
}

fn strip_main_block(block: &mut Block, used: &HashSet<ValueId>) -> bool {
    let mut progress = false;
    block.0.retain_mut(|instr| match &mut instr.op {
        Op::If { then_block, else_block, .. } => {
            progress |= strip_main_block(then_block, used);
            progress |= strip_main_block(else_block, used);
            true
        }
        Op::Loop { body } => {
            progress |= strip_main_block(body, used);
            true
        }
        Op::GlobalAtomic { .. } | Op::GlobalAtomicSwap { .. } => {
            let live = instr.dst.is_some_and(|d| used.contains(&d));
            progress |= !live;
            live
        }
        _ => true,
    });
    progress
}

/// Case 3: the adapter runs every side effect, so dead atomics can leave the
/// main program. Plain stores stay; the adapter's copies shadow them but the
/// values written agree.
pub(crate) fn strip_side_effects_from_main(prog: &mut Program) {
    loop {
        let used = opt::used_values(prog);
        let p1 = strip_main_block(&mut prog.body, &used);
        let p2 = opt::dce(prog);
        let p3 = opt::dead_cf(prog);
        if !(p1 || p2 || p3) {
            break;
        }
    }
}
