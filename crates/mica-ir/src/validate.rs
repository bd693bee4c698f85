//! Structural validation of front-end geometry programs.
//!
//! The lowering pipeline assumes well-formed input and asserts internally;
//! this module is the boundary where untrusted front-end output gets rejected
//! with a real error instead.

use std::collections::HashSet;

use thiserror::Error;

use crate::ir::*;

/// Upper bound on declared GS instancing (matches the API minimum-maximum).
pub const MAX_GS_INVOCATIONS: u32 = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("program `{0}` is not a geometry shader")]
    NotGeometry(String),
    #[error("geometry shader is missing stage metadata")]
    MissingMeta,
    #[error("unsupported output primitive {0:?}")]
    BadOutputPrimitive(OutputPrimitive),
    #[error("max_vertices_out is zero")]
    ZeroMaxVertices,
    #[error("invocations {0} outside 1..={MAX_GS_INVOCATIONS}")]
    BadInvocations(u32),
    #[error("stream mask {0:#x} uses undefined streams")]
    BadStreamMask(u8),
    #[error("multiple streams require point output")]
    MultiStreamNotPoints,
    #[error("geometry op on undeclared stream {0}")]
    BadStream(u8),
    #[error("feedback output references buffer {0}")]
    BadXfbBuffer(u8),
    #[error("feedback buffer {0} written but not declared")]
    XfbBufferNotDeclared(u8),
    #[error("feedback output location {0} out of range")]
    BadXfbLocation(u32),
    #[error("feedback output with empty component mask")]
    EmptyXfbMask,
    #[error("feedback output at offset {offset} overruns buffer stride {stride}")]
    XfbOverrun { offset: u32, stride: u32 },
    #[error("feedback buffer {0} mapped to stream {1}")]
    BadXfbStream(u8, u8),
    #[error("value %{0} used before definition")]
    UseBeforeDef(u32),
    #[error("value %{0} defined twice")]
    Redefined(u32),
    #[error("variable v{0} out of range")]
    BadVar(u32),
    #[error("alu op {op:?} expects {expect} sources, got {got}")]
    BadAluArity { op: AluOp, expect: usize, got: usize },
    #[error("counted geometry op in front-end input")]
    CountedOpInInput,
    #[error("break outside of a loop")]
    BreakOutsideLoop,
}

/// Validate a front-end geometry program before lowering.
pub fn validate_gs(prog: &Program) -> Result<(), ValidateError> {
    if prog.stage != Stage::Geometry {
        return Err(ValidateError::NotGeometry(prog.name.clone()));
    }
    let meta = prog.gs.as_ref().ok_or(ValidateError::MissingMeta)?;

    match meta.output_primitive {
        OutputPrimitive::Points
        | OutputPrimitive::LineStrip
        | OutputPrimitive::TriangleStrip => {}
        p => return Err(ValidateError::BadOutputPrimitive(p)),
    }
    if meta.max_vertices_out == 0 {
        return Err(ValidateError::ZeroMaxVertices);
    }
    if meta.invocations == 0 || meta.invocations > MAX_GS_INVOCATIONS {
        return Err(ValidateError::BadInvocations(meta.invocations));
    }
    if meta.active_stream_mask & !((1u8 << MAX_VERTEX_STREAMS) - 1) != 0 {
        return Err(ValidateError::BadStreamMask(meta.active_stream_mask));
    }
    if meta.active_stream_mask & !1 != 0
        && meta.output_primitive != OutputPrimitive::Points
    {
        return Err(ValidateError::MultiStreamNotPoints);
    }

    if let Some(xfb) = &prog.xfb {
        for (b, stream) in xfb.buffer_to_stream.iter().enumerate() {
            if xfb.buffers_written & (1 << b) != 0
                && *stream as usize >= MAX_VERTEX_STREAMS
            {
                return Err(ValidateError::BadXfbStream(b as u8, *stream));
            }
        }
        for out in &xfb.outputs {
            if out.buffer as usize >= MAX_XFB_BUFFERS {
                return Err(ValidateError::BadXfbBuffer(out.buffer));
            }
            if xfb.buffers_written & (1 << out.buffer) == 0 {
                return Err(ValidateError::XfbBufferNotDeclared(out.buffer));
            }
            if out.location as usize >= MAX_VARYING_SLOTS {
                return Err(ValidateError::BadXfbLocation(out.location));
            }
            if out.component_mask.is_empty() {
                return Err(ValidateError::EmptyXfbMask);
            }
            let stride = xfb.buffers[out.buffer as usize].stride;
            if out.offset + 4 * out.component_mask.count() > stride {
                return Err(ValidateError::XfbOverrun { offset: out.offset, stride });
            }
        }
    }

    let mut defined = HashSet::new();
    validate_block(prog, meta, &prog.body, &mut defined, 0)
}

fn validate_block(
    prog: &Program,
    meta: &GsMeta,
    block: &Block,
    defined: &mut HashSet<ValueId>,
    loop_depth: u32,
) -> Result<(), ValidateError> {
    for instr in &block.0 {
        let mut src_err = None;
        instr.op.visit_srcs(&mut |src| {
            if let Src::Value(v) = *src {
                if !defined.contains(&v) && src_err.is_none() {
                    src_err = Some(ValidateError::UseBeforeDef(v.0));
                }
            }
        });
        if let Some(err) = src_err {
            return Err(err);
        }

        match &instr.op {
            Op::Alu { op, srcs } => {
                if srcs.len() != op.num_srcs() {
                    return Err(ValidateError::BadAluArity {
                        op: *op,
                        expect: op.num_srcs(),
                        got: srcs.len(),
                    });
                }
            }
            Op::LoadVar(var) | Op::StoreVar { var, .. } => {
                if var.0 as usize >= prog.vars.len() {
                    return Err(ValidateError::BadVar(var.0));
                }
            }
            Op::EmitVertex { stream } | Op::EndPrimitive { stream } => {
                if meta.active_stream_mask & (1 << stream) == 0 {
                    return Err(ValidateError::BadStream(*stream));
                }
            }
            Op::EmitVertexCounted { .. }
            | Op::EndPrimitiveCounted { .. }
            | Op::SetCounts { .. } => {
                return Err(ValidateError::CountedOpInInput);
            }
            Op::If { then_block, else_block, .. } => {
                validate_block(prog, meta, then_block, defined, loop_depth)?;
                validate_block(prog, meta, else_block, defined, loop_depth)?;
            }
            Op::Loop { body } => {
                validate_block(prog, meta, body, defined, loop_depth + 1)?;
            }
            Op::Break => {
                if loop_depth == 0 {
                    return Err(ValidateError::BreakOutsideLoop);
                }
            }
            _ => {}
        }

        if let Some(dst) = instr.dst {
            if !defined.insert(dst) {
                return Err(ValidateError::Redefined(dst.0));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::builder::Builder;

    fn point_gs(max_vertices_out: u32) -> Program {
        let mut prog = Program::new("gs", Stage::Geometry);
        prog.gs = Some(GsMeta {
            input_primitive: PrimitiveClass::Triangles,
            output_primitive: OutputPrimitive::Points,
            max_vertices_out,
            invocations: 1,
            active_stream_mask: 1,
        });
        prog
    }

    #[test]
    fn accepts_simple_gs() {
        let mut prog = point_gs(1);
        let mut b = Builder::new(&mut prog);
        let pid = b.sysval(Sysval::PrimitiveId);
        b.store_output(slot::POSITION, 0, pid);
        b.push_no_dst(Op::EmitVertex { stream: 0 });
        prog.body = b.finish();
        assert_eq!(validate_gs(&prog), Ok(()));
    }

    #[test]
    fn rejects_wrong_stage() {
        let prog = Program::new("vs", Stage::Vertex);
        assert_eq!(
            validate_gs(&prog),
            Err(ValidateError::NotGeometry("vs".into()))
        );
    }

    #[test]
    fn rejects_list_output() {
        let mut prog = point_gs(3);
        prog.gs.as_mut().unwrap().output_primitive = OutputPrimitive::Triangles;
        assert_eq!(
            validate_gs(&prog),
            Err(ValidateError::BadOutputPrimitive(OutputPrimitive::Triangles))
        );
    }

    #[test]
    fn rejects_multi_stream_strips() {
        let mut prog = point_gs(4);
        let meta = prog.gs.as_mut().unwrap();
        meta.output_primitive = OutputPrimitive::TriangleStrip;
        meta.active_stream_mask = 0b11;
        assert_eq!(validate_gs(&prog), Err(ValidateError::MultiStreamNotPoints));
    }

    #[test]
    fn rejects_use_before_def() {
        let mut prog = point_gs(1);
        prog.body.0.push(Instr {
            dst: None,
            op: Op::StoreOutput {
                location: slot::POSITION,
                component: 0,
                value: Src::Value(ValueId(42)),
            },
        });
        assert_eq!(validate_gs(&prog), Err(ValidateError::UseBeforeDef(42)));
    }

    #[test]
    fn rejects_emit_on_inactive_stream() {
        let mut prog = point_gs(1);
        prog.body.0.push(Instr { dst: None, op: Op::EmitVertex { stream: 2 } });
        assert_eq!(validate_gs(&prog), Err(ValidateError::BadStream(2)));
    }

    #[test]
    fn rejects_xfb_overrun() {
        let mut prog = point_gs(1);
        prog.xfb = Some(XfbInfo {
            buffers_written: 1,
            buffers: [XfbBuffer { stride: 8 }; MAX_XFB_BUFFERS],
            buffer_to_stream: [0; MAX_XFB_BUFFERS],
            outputs: vec![XfbOutput {
                buffer: 0,
                location: slot::VAR0,
                component_mask: ComponentMask::XYZW,
                offset: 0,
            }],
        });
        assert_eq!(
            validate_gs(&prog),
            Err(ValidateError::XfbOverrun { offset: 0, stride: 8 })
        );
    }

    #[test]
    fn rejects_break_at_top_level() {
        let mut prog = point_gs(1);
        prog.body.0.push(Instr { dst: None, op: Op::Break });
        assert_eq!(validate_gs(&prog), Err(ValidateError::BreakOutsideLoop));
    }
}
