//! Cleanup passes run between lowering stages.
//!
//! Two passes, iterated to a fixed point: dead-code elimination over
//! instructions, and dead-control-flow removal for `If`/`Loop` constructs
//! whose subtrees can no longer observe or be observed. The derived-program
//! builders lean on these to shed whatever the rewrites orphaned.

use std::collections::HashSet;

use crate::ir::{Block, Op, Program, Src, ValueId};

/// Run [`dce`] and [`dead_cf`] until neither makes progress.
pub fn optimize(prog: &mut Program) {
    loop {
        let progress = dce(prog) | dead_cf(prog);
        if !progress {
            break;
        }
    }
}

fn child_blocks(op: &Op) -> impl Iterator<Item = &Block> {
    match op {
        Op::If { then_block, else_block, .. } => {
            vec![then_block, else_block].into_iter()
        }
        Op::Loop { body } => vec![body].into_iter(),
        _ => vec![].into_iter(),
    }
}

fn collect_uses(block: &Block, used: &mut HashSet<ValueId>) {
    for instr in &block.0 {
        instr.op.visit_srcs(&mut |src| {
            if let Src::Value(v) = *src {
                used.insert(v);
            }
        });
        for child in child_blocks(&instr.op) {
            collect_uses(child, used);
        }
    }
}

/// The set of values referenced by any source in the program.
pub fn used_values(prog: &Program) -> HashSet<ValueId> {
    let mut used = HashSet::new();
    collect_uses(&prog.body, &mut used);
    used
}

/// Remove instructions whose defined value is unused and whose operation has
/// no side effect. Returns whether anything was removed.
pub fn dce(prog: &mut Program) -> bool {
    let mut used = HashSet::new();
    collect_uses(&prog.body, &mut used);
    dce_block(&mut prog.body, &used)
}

fn dce_block(block: &mut Block, used: &HashSet<ValueId>) -> bool {
    let mut progress = false;
    block.0.retain_mut(|instr| {
        match &mut instr.op {
            Op::If { then_block, else_block, .. } => {
                progress |= dce_block(then_block, used);
                progress |= dce_block(else_block, used);
                return true;
            }
            Op::Loop { body } => {
                progress |= dce_block(body, used);
                return true;
            }
            _ => {}
        }
        if instr.op.has_side_effect() {
            return true;
        }
        let live = match instr.dst {
            Some(dst) => used.contains(&dst),
            None => false,
        };
        progress |= !live;
        live
    });
    progress
}

/// Whether executing `block` can affect anything outside it. A `Break` at
/// `loop_depth` 0 escapes to an enclosing loop outside the subtree under
/// consideration; one inside a nested loop does not.
fn has_escaping_effect(block: &Block, loop_depth: u32) -> bool {
    block.0.iter().any(|instr| match &instr.op {
        Op::Break => loop_depth == 0,
        Op::If { then_block, else_block, .. } => {
            has_escaping_effect(then_block, loop_depth)
                || has_escaping_effect(else_block, loop_depth)
        }
        Op::Loop { body } => has_escaping_effect(body, loop_depth + 1),
        op => op.has_side_effect(),
    })
}

fn defines_used_value(block: &Block, used: &HashSet<ValueId>) -> bool {
    block.0.iter().any(|instr| {
        if instr.dst.is_some_and(|dst| used.contains(&dst)) {
            return true;
        }
        child_blocks(&instr.op).any(|child| defines_used_value(child, used))
    })
}

/// Fold `If` constructs with constant conditions and drop `If`/`Loop`
/// constructs whose subtrees neither escape nor feed live values.
pub fn dead_cf(prog: &mut Program) -> bool {
    let mut used = HashSet::new();
    collect_uses(&prog.body, &mut used);
    dead_cf_block(&mut prog.body, &used)
}

fn dead_cf_block(block: &mut Block, used: &HashSet<ValueId>) -> bool {
    let mut progress = false;
    let mut out = Vec::with_capacity(block.0.len());
    for mut instr in block.0.drain(..) {
        match &mut instr.op {
            Op::If { cond: Src::Imm(c), then_block, else_block } => {
                let taken = if *c != 0 { then_block } else { else_block };
                progress = true;
                let mut taken = std::mem::take(taken);
                dead_cf_block(&mut taken, used);
                out.append(&mut taken.0);
                continue;
            }
            Op::If { then_block, else_block, .. } => {
                if !has_escaping_effect(then_block, 0)
                    && !has_escaping_effect(else_block, 0)
                    && !defines_used_value(then_block, used)
                    && !defines_used_value(else_block, used)
                {
                    progress = true;
                    continue;
                }
                progress |= dead_cf_block(then_block, used);
                progress |= dead_cf_block(else_block, used);
            }
            Op::Loop { body } => {
                // Any Break in the subtree targets a loop within it.
                if !has_escaping_effect(body, 1)
                    && !defines_used_value(body, used)
                {
                    progress = true;
                    continue;
                }
                progress |= dead_cf_block(body, used);
            }
            _ => {}
        }
        out.push(instr);
    }
    block.0 = out;
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::ir::{AtomicOp, ComponentMask, Stage};

    fn listing(prog: &Program) -> String {
        prog.to_string()
    }

    #[test]
    fn dce_removes_unused_pure_chain() {
        let mut prog = Program::new("t", Stage::Compute);
        let mut b = Builder::new(&mut prog);
        let x = b.dispatch_id(0);
        let y = b.iadd_imm(x, 7);
        let _dead = b.imul_imm(y, 3);
        let addr = b.param_base();
        b.store_global(addr, x, ComponentMask::X);
        prog.body = b.finish();

        optimize(&mut prog);
        let text = listing(&prog);
        assert!(!text.contains("imul"), "{text}");
        assert!(!text.contains("iadd"), "{text}");
        assert!(text.contains("store_global"), "{text}");
    }

    #[test]
    fn dce_keeps_atomics_with_unused_result() {
        let mut prog = Program::new("t", Stage::Compute);
        let mut b = Builder::new(&mut prog);
        let addr = b.param_base();
        let one = b.imm(1);
        let _old = b.global_atomic(AtomicOp::Add, addr, one);
        prog.body = b.finish();

        optimize(&mut prog);
        assert!(listing(&prog).contains("atomic"));
    }

    #[test]
    fn dead_cf_drops_effect_free_if() {
        let mut prog = Program::new("t", Stage::Compute);
        let mut b = Builder::new(&mut prog);
        let x = b.dispatch_id(0);
        let cond = b.uge_imm(x, 4);
        b.if_(cond, |b| {
            let v = b.iadd_imm(x, 1);
            let _ = b.imul_imm(v, 2);
        });
        prog.body = b.finish();

        optimize(&mut prog);
        assert!(!listing(&prog).contains("if "), "{}", listing(&prog));
    }

    #[test]
    fn dead_cf_folds_constant_condition() {
        let mut prog = Program::new("t", Stage::Compute);
        let mut b = Builder::new(&mut prog);
        let addr = b.param_base();
        b.if_else(
            Src::Imm(1),
            |b| {
                let v = b.imm(10);
                b.store_global(addr, v, ComponentMask::X);
            },
            |b| {
                let v = b.imm(20);
                b.store_global(addr, v, ComponentMask::X);
            },
        );
        prog.body = b.finish();

        optimize(&mut prog);
        let text = listing(&prog);
        assert!(!text.contains("if "), "{text}");
        assert!(text.contains("#10"), "{text}");
        assert!(!text.contains("#20"), "{text}");
    }

    #[test]
    fn break_keeps_if_inside_loop_live() {
        let mut prog = Program::new("t", Stage::Compute);
        let mut b = Builder::new(&mut prog);
        let addr = b.param_base();
        b.loop_(|b| {
            let x = b.load_global(addr, 4, 1);
            let cond = b.uge_imm(x, 4);
            b.if_(cond, |b| b.brk());
            let one = b.imm(1);
            b.store_global(addr, one, ComponentMask::X);
        });
        prog.body = b.finish();

        optimize(&mut prog);
        let text = listing(&prog);
        assert!(text.contains("loop"), "{text}");
        assert!(text.contains("break"), "{text}");
    }
}
