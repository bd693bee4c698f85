//! Cursor-style IR construction.
//!
//! A [`Builder`] borrows a [`Program`] for value/variable allocation and
//! accumulates instructions into a block stack; nested control flow is built
//! with closure-scoped `if_`/`loop_` helpers. Lowering passes typically take
//! the old body out of the program, rebuild it through a builder, and put the
//! result back.

use crate::ir::*;

pub struct Builder<'p> {
    prog: &'p mut Program,
    stack: Vec<Block>,
}

impl<'p> Builder<'p> {
    /// Start building a fresh block sequence for `prog`.
    pub fn new(prog: &'p mut Program) -> Self {
        Builder { prog, stack: vec![Block::default()] }
    }

    /// Finish and return the built top-level block.
    pub fn finish(mut self) -> Block {
        assert_eq!(self.stack.len(), 1, "unclosed control flow");
        self.stack.pop().unwrap()
    }

    pub fn prog(&mut self) -> &mut Program {
        self.prog
    }

    fn cur(&mut self) -> &mut Block {
        self.stack.last_mut().unwrap()
    }

    /// Append an instruction that defines a value.
    pub fn push(&mut self, op: Op) -> Src {
        let dst = self.prog.alloc_value();
        self.cur().0.push(Instr { dst: Some(dst), op });
        Src::Value(dst)
    }

    /// Append an instruction with no defined value.
    pub fn push_no_dst(&mut self, op: Op) {
        self.cur().0.push(Instr { dst: None, op });
    }

    /// Append a pre-formed instruction (pass-through during rewrites).
    pub fn push_instr(&mut self, instr: Instr) {
        self.cur().0.push(instr);
    }

    pub fn imm(&mut self, v: u64) -> Src {
        Src::Imm(v)
    }

    fn alu(&mut self, op: AluOp, srcs: Vec<Src>) -> Src {
        debug_assert_eq!(srcs.len(), op.num_srcs());
        self.push(Op::Alu { op, srcs })
    }

    pub fn iadd(&mut self, a: Src, b: Src) -> Src {
        match (a, b) {
            (Src::Imm(x), Src::Imm(y)) => Src::Imm(x.wrapping_add(y)),
            (x, Src::Imm(0)) | (Src::Imm(0), x) => x,
            _ => self.alu(AluOp::Iadd, vec![a, b]),
        }
    }

    pub fn iadd_imm(&mut self, a: Src, b: u64) -> Src {
        self.iadd(a, Src::Imm(b))
    }

    pub fn isub(&mut self, a: Src, b: Src) -> Src {
        match (a, b) {
            (Src::Imm(x), Src::Imm(y)) => Src::Imm(x.wrapping_sub(y)),
            (x, Src::Imm(0)) => x,
            _ => self.alu(AluOp::Isub, vec![a, b]),
        }
    }

    pub fn imul(&mut self, a: Src, b: Src) -> Src {
        match (a, b) {
            (Src::Imm(x), Src::Imm(y)) => Src::Imm(x.wrapping_mul(y)),
            (x, Src::Imm(1)) | (Src::Imm(1), x) => x,
            _ => self.alu(AluOp::Imul, vec![a, b]),
        }
    }

    pub fn imul_imm(&mut self, a: Src, b: u64) -> Src {
        self.imul(a, Src::Imm(b))
    }

    pub fn udiv(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Udiv, vec![a, b])
    }

    pub fn udiv_imm(&mut self, a: Src, b: u64) -> Src {
        self.udiv(a, Src::Imm(b))
    }

    pub fn umod(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Umod, vec![a, b])
    }

    pub fn umod_imm(&mut self, a: Src, b: u64) -> Src {
        self.umod(a, Src::Imm(b))
    }

    pub fn ishl(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Ishl, vec![a, b])
    }

    pub fn ushr(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Ushr, vec![a, b])
    }

    pub fn iand(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Iand, vec![a, b])
    }

    pub fn iand_imm(&mut self, a: Src, b: u64) -> Src {
        self.iand(a, Src::Imm(b))
    }

    pub fn ior(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Ior, vec![a, b])
    }

    pub fn inot(&mut self, a: Src) -> Src {
        self.alu(AluOp::Inot, vec![a])
    }

    pub fn ieq(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Ieq, vec![a, b])
    }

    pub fn ieq_imm(&mut self, a: Src, b: u64) -> Src {
        self.ieq(a, Src::Imm(b))
    }

    pub fn ine(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Ine, vec![a, b])
    }

    pub fn ult(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Ult, vec![a, b])
    }

    pub fn uge(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Uge, vec![a, b])
    }

    pub fn uge_imm(&mut self, a: Src, b: u64) -> Src {
        self.uge(a, Src::Imm(b))
    }

    pub fn umin(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Umin, vec![a, b])
    }

    pub fn umax(&mut self, a: Src, b: Src) -> Src {
        self.alu(AluOp::Umax, vec![a, b])
    }

    pub fn bit_count(&mut self, a: Src) -> Src {
        match a {
            Src::Imm(x) => Src::Imm(x.count_ones() as u64),
            _ => self.alu(AluOp::BitCount, vec![a]),
        }
    }

    pub fn bcsel(&mut self, cond: Src, a: Src, b: Src) -> Src {
        match cond {
            Src::Imm(0) => b,
            Src::Imm(_) => a,
            _ => self.alu(AluOp::Bcsel, vec![cond, a, b]),
        }
    }

    pub fn undef(&mut self, comps: u8) -> Src {
        self.push(Op::Undef { comps })
    }

    pub fn channels(&mut self, value: Src, mask: ComponentMask) -> Src {
        self.push(Op::Channels { value, mask })
    }

    pub fn sysval(&mut self, sv: Sysval) -> Src {
        self.push(Op::Sysval(sv))
    }

    pub fn dispatch_id(&mut self, channel: u8) -> Src {
        self.push(Op::DispatchId { channel })
    }

    pub fn param_base(&mut self) -> Src {
        self.push(Op::ParamBase)
    }

    pub fn load_global(&mut self, addr: Src, bytes: u8, comps: u8) -> Src {
        self.push(Op::LoadGlobal { addr, bytes, comps })
    }

    pub fn store_global(&mut self, addr: Src, value: Src, mask: ComponentMask) {
        self.push_no_dst(Op::StoreGlobal { addr, value, mask });
    }

    pub fn global_atomic(&mut self, op: AtomicOp, addr: Src, value: Src) -> Src {
        self.push(Op::GlobalAtomic { op, addr, value })
    }

    pub fn load_var(&mut self, var: VarId) -> Src {
        self.push(Op::LoadVar(var))
    }

    pub fn store_var(&mut self, var: VarId, value: Src, mask: ComponentMask) {
        self.push_no_dst(Op::StoreVar { var, value, mask });
    }

    pub fn store_output(&mut self, location: u32, component: u8, value: Src) {
        self.push_no_dst(Op::StoreOutput { location, component, value });
    }

    /// Build a block out of line without attaching it to anything.
    pub fn sub_block(&mut self, f: impl FnOnce(&mut Self)) -> Block {
        self.stack.push(Block::default());
        f(self);
        self.stack.pop().unwrap()
    }

    pub fn push_if(&mut self, cond: Src, then_block: Block, else_block: Block) {
        self.push_no_dst(Op::If { cond, then_block, else_block });
    }

    pub fn push_loop(&mut self, body: Block) {
        self.push_no_dst(Op::Loop { body });
    }

    /// Build `if (cond) { f() }`.
    pub fn if_(&mut self, cond: Src, f: impl FnOnce(&mut Self)) {
        self.if_else(cond, f, |_| {});
    }

    /// Build `if (cond) { f_then() } else { f_else() }`.
    pub fn if_else(
        &mut self,
        cond: Src,
        f_then: impl FnOnce(&mut Self),
        f_else: impl FnOnce(&mut Self),
    ) {
        let then_block = self.sub_block(f_then);
        let else_block = self.sub_block(f_else);
        self.push_if(cond, then_block, else_block);
    }

    /// Build `loop { f() }`; the body must break out.
    pub fn loop_(&mut self, f: impl FnOnce(&mut Self)) {
        let body = self.sub_block(f);
        self.push_loop(body);
    }

    pub fn brk(&mut self) {
        self.push_no_dst(Op::Break);
    }
}

/// Rebuild a program's body through `f`.
///
/// `f` sees every non-control-flow instruction in order. Returning `false`
/// passes the instruction through untouched; returning `true` means `f`
/// consumed it (typically after pushing a replacement sequence, reusing
/// `instr.dst` on the final instruction so existing uses stay valid).
/// `If`/`Loop` structure is preserved and recursed into.
pub fn rewrite_program(
    prog: &mut Program,
    f: &mut dyn FnMut(&mut Builder, &Instr) -> bool,
) {
    let body = std::mem::take(&mut prog.body);
    let mut b = Builder::new(prog);
    rewrite_into(&mut b, body, f);
    prog.body = b.finish();
}

fn rewrite_into(
    b: &mut Builder,
    block: Block,
    f: &mut dyn FnMut(&mut Builder, &Instr) -> bool,
) {
    for mut instr in block.0 {
        if let Op::If { cond, then_block, else_block } = &mut instr.op {
            let cond = *cond;
            let tb = std::mem::take(then_block);
            let eb = std::mem::take(else_block);
            let tb = b.sub_block(|b| rewrite_into(b, tb, &mut *f));
            let eb = b.sub_block(|b| rewrite_into(b, eb, &mut *f));
            b.push_if(cond, tb, eb);
            continue;
        }
        if let Op::Loop { body } = &mut instr.op {
            let body = std::mem::take(body);
            let body = b.sub_block(|b| rewrite_into(b, body, &mut *f));
            b.push_loop(body);
            continue;
        }
        if !f(b, &instr) {
            b.push_instr(instr);
        }
    }
}
