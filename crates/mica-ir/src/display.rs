//! Textual program listings, mainly for tests and trace output.

use std::fmt;

use crate::ir::*;

impl fmt::Display for Src {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Src::Value(v) => write!(f, "%{}", v.0),
            Src::Imm(v) => write!(f, "#{v}"),
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {:?} {{", self.name, self.stage)?;
        for (i, var) in self.vars.iter().enumerate() {
            match &var.name {
                Some(name) => writeln!(f, "  var v{i}.{}c \"{name}\"", var.comps)?,
                None => writeln!(f, "  var v{i}.{}c", var.comps)?,
            }
        }
        fmt_block(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        write!(f, "  ")?;
    }
    Ok(())
}

fn fmt_block(f: &mut fmt::Formatter<'_>, block: &Block, depth: usize) -> fmt::Result {
    for instr in &block.0 {
        indent(f, depth)?;
        if let Some(dst) = instr.dst {
            write!(f, "%{} = ", dst.0)?;
        }
        fmt_op(f, &instr.op, depth)?;
        writeln!(f)?;
    }
    Ok(())
}

fn fmt_op(f: &mut fmt::Formatter<'_>, op: &Op, depth: usize) -> fmt::Result {
    match op {
        Op::Imm(v) => write!(f, "imm #{v}"),
        Op::Undef { comps } => write!(f, "undef.{comps}c"),
        Op::Alu { op, srcs } => {
            write!(f, "{}", alu_name(*op))?;
            for s in srcs {
                write!(f, " {s}")?;
            }
            Ok(())
        }
        Op::Channels { value, mask } => {
            write!(f, "channels {value} mask={:#x}", mask.bits())
        }
        Op::Sysval(sv) => write!(f, "sysval {sv:?}"),
        Op::DispatchId { channel } => write!(f, "dispatch_id.{channel}"),
        Op::ParamBase => write!(f, "param_base"),
        Op::LoadGlobal { addr, bytes, comps } => {
            write!(f, "load_global.{bytes}b.{comps}c {addr}")
        }
        Op::StoreGlobal { addr, value, mask } => {
            write!(f, "store_global {addr} {value} mask={:#x}", mask.bits())
        }
        Op::GlobalAtomic { op, addr, value } => {
            write!(f, "atomic.{op:?} {addr} {value}")
        }
        Op::GlobalAtomicSwap { addr, compare, value } => {
            write!(f, "atomic.CmpSwap {addr} {compare} {value}")
        }
        Op::LoadVar(var) => write!(f, "load_var v{}", var.0),
        Op::StoreVar { var, value, mask } => {
            write!(f, "store_var v{} {value} mask={:#x}", var.0, mask.bits())
        }
        Op::LoadPerVertexInput { location, component, vertex, comps } => {
            write!(f, "load_input loc{location}.{component} vtx={vertex} {comps}c")
        }
        Op::StoreOutput { location, component, value } => {
            write!(f, "store_output loc{location}.{component} {value}")
        }
        Op::EmitVertex { stream } => write!(f, "emit_vertex s{stream}"),
        Op::EndPrimitive { stream } => write!(f, "end_primitive s{stream}"),
        Op::EmitVertexCounted { stream, vertex_id, index_in_strip, primitive_id } => {
            write!(
                f,
                "emit_vertex_counted s{stream} vtx={vertex_id} strip={index_in_strip} prim={primitive_id}"
            )
        }
        Op::EndPrimitiveCounted {
            stream,
            total_vertices,
            vertices_in_prim,
            total_primitives,
        } => {
            write!(
                f,
                "end_primitive_counted s{stream} verts={total_vertices} in_prim={vertices_in_prim} prims={total_primitives}"
            )
        }
        Op::SetCounts { stream, vertices, primitives, decomposed } => {
            write!(
                f,
                "set_counts s{stream} verts={vertices} prims={primitives} decomposed={decomposed}"
            )
        }
        Op::If { cond, then_block, else_block } => {
            writeln!(f, "if {cond} {{")?;
            fmt_block(f, then_block, depth + 1)?;
            if !else_block.0.is_empty() {
                indent(f, depth)?;
                writeln!(f, "}} else {{")?;
                fmt_block(f, else_block, depth + 1)?;
            }
            indent(f, depth)?;
            write!(f, "}}")
        }
        Op::Loop { body } => {
            writeln!(f, "loop {{")?;
            fmt_block(f, body, depth + 1)?;
            indent(f, depth)?;
            write!(f, "}}")
        }
        Op::Break => write!(f, "break"),
    }
}

fn alu_name(op: AluOp) -> &'static str {
    match op {
        AluOp::Iadd => "iadd",
        AluOp::Isub => "isub",
        AluOp::Imul => "imul",
        AluOp::Udiv => "udiv",
        AluOp::Umod => "umod",
        AluOp::Ishl => "ishl",
        AluOp::Ushr => "ushr",
        AluOp::Iand => "iand",
        AluOp::Ior => "ior",
        AluOp::Ixor => "ixor",
        AluOp::Inot => "inot",
        AluOp::Ieq => "ieq",
        AluOp::Ine => "ine",
        AluOp::Ult => "ult",
        AluOp::Uge => "uge",
        AluOp::Umin => "umin",
        AluOp::Umax => "umax",
        AluOp::BitCount => "bit_count",
        AluOp::Bcsel => "bcsel",
    }
}
