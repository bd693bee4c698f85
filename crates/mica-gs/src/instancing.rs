//! Geometry shader instancing runs the shader a small static number of times
//! per input primitive. Turning that into a loop inside the program keeps the
//! feature from leaking into the dispatch sizing and the counts.

use mica_ir::{AluOp, Block, Builder, ComponentMask, Op, Program, Src, Sysval};

fn rewrite_invocation_id(block: &mut Block, replacement: Src) {
    for instr in &mut block.0 {
        match &mut instr.op {
            Op::Sysval(Sysval::InvocationId) => {
                instr.op = match replacement {
                    Src::Imm(v) => Op::Imm(v),
                    Src::Value(_) => Op::Alu {
                        op: AluOp::Iadd,
                        srcs: vec![replacement, Src::Imm(0)],
                    },
                };
            }
            Op::If { then_block, else_block, .. } => {
                rewrite_invocation_id(then_block, replacement);
                rewrite_invocation_id(else_block, replacement);
            }
            Op::Loop { body } => rewrite_invocation_id(body, replacement),
            _ => {}
        }
    }
}

/// No instancing: the invocation id is always zero.
pub(crate) fn smash_invocation_id(gs: &mut Program) {
    rewrite_invocation_id(&mut gs.body, Src::Imm(0));
}

/// Wrap the shader body in a counted loop, one iteration per declared
/// invocation, with the loop counter standing in for the invocation id.
pub(crate) fn lower_gs_instancing(gs: &mut Program) {
    let invocations = gs.gs_meta().invocations;
    assert!(invocations > 1);

    // Each iteration may emit up to the declared bound, so the overall bound
    // scales with the invocation count.
    gs.gs.as_mut().unwrap().max_vertices_out *= invocations;

    let mut body = std::mem::take(&mut gs.body);
    let counter = gs.alloc_var(1, Some("invocation".into()));

    let mut b = Builder::new(gs);
    b.store_var(counter, Src::Imm(0), ComponentMask::X);
    b.loop_(|b| {
        let index = b.load_var(counter);
        let done = b.uge_imm(index, invocations as u64);
        b.if_(done, |b| b.brk());

        rewrite_invocation_id(&mut body, index);
        for instr in body.0.drain(..) {
            b.push_instr(instr);
        }

        let next = b.iadd_imm(index, 1);
        b.store_var(counter, next, ComponentMask::X);

        // End the primitive between invocations. If the shader already did,
        // the extra end is a no-op after counting.
        b.push_no_dst(Op::EndPrimitive { stream: 0 });
    });
    gs.body = b.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mica_ir::{GsMeta, Instr, OutputPrimitive, PrimitiveClass, Stage};

    fn instanced_gs(invocations: u32) -> Program {
        let mut prog = Program::new("gs", Stage::Geometry);
        prog.gs = Some(GsMeta {
            input_primitive: PrimitiveClass::Points,
            output_primitive: OutputPrimitive::Points,
            max_vertices_out: 2,
            invocations,
            active_stream_mask: 1,
        });
        prog
    }

    #[test]
    fn wraps_body_in_counted_loop() {
        let mut gs = instanced_gs(4);
        let mut b = Builder::new(&mut gs);
        let id = b.sysval(Sysval::InvocationId);
        b.store_output(mica_ir::slot::POSITION, 0, id);
        b.push_no_dst(Op::EmitVertex { stream: 0 });
        gs.body = b.finish();

        lower_gs_instancing(&mut gs);
        assert_eq!(gs.gs_meta().max_vertices_out, 8);

        let text = gs.to_string();
        assert!(text.contains("loop"), "{text}");
        assert!(text.contains("break"), "{text}");
        // The invocation id is the loop counter now.
        assert!(!text.contains("InvocationId"), "{text}");
    }

    #[test]
    fn single_invocation_id_becomes_zero() {
        let mut gs = instanced_gs(1);
        let dst = gs.alloc_value();
        gs.body.0.push(Instr {
            dst: Some(dst),
            op: Op::Sysval(Sysval::InvocationId),
        });
        smash_invocation_id(&mut gs);
        assert!(matches!(gs.body.0[0].op, Op::Imm(0)));
    }
}
