use super::{CodeGen, Environment, PendingCall, Slot};
use crate::ast::{BinOp, Expr, FlowMode, MechMode, UnOp};
use crate::error::{CompileError, Result};
use crate::types::Type;
use crate::vm::{Instr, PLACEHOLDER};

fn arith_instr(op: BinOp) -> Result<Instr> {
    Ok(match op {
        BinOp::Times => Instr::MultInt,
        BinOp::DivT => Instr::DivTruncInt,
        BinOp::ModT => Instr::ModTruncInt,
        BinOp::DivF => Instr::DivFloorInt,
        BinOp::ModF => Instr::ModFloorInt,
        BinOp::DivE => Instr::DivEuclInt,
        BinOp::ModE => Instr::ModEuclInt,
        BinOp::Plus => Instr::AddInt,
        BinOp::Minus => Instr::SubInt,
        BinOp::Eq => Instr::EqInt,
        BinOp::Ne => Instr::NeInt,
        BinOp::Lt => Instr::LtInt,
        BinOp::Gt => Instr::GtInt,
        BinOp::Le => Instr::LeInt,
        BinOp::Ge => Instr::GeInt,
        BinOp::Cand | BinOp::Cor => {
            return Err(CompileError::Internal(format!("{op} is not a plain operator")))
        }
    })
}

impl CodeGen<'_> {
    /// Pushes the address of the location `e` denotes.
    pub(super) fn gen_lvalue(&mut self, e: &Expr, loc: usize, env: &Environment<'_>) -> Result<usize> {
        match e {
            Expr::Store { name, .. } => self.gen_address(env.slot(name)?, None, loc),
            Expr::Field { base, path } => {
                let offset = match &env.scope.lookup(base)?.ty {
                    Type::Record(rec) => rec.field_offset(path)?,
                    other => {
                        return Err(CompileError::Internal(format!(
                            "{base} of type {other} has no fields"
                        )))
                    }
                };
                self.gen_address(env.slot(base)?, Some(offset as i64), loc)
            }
            other => Err(CompileError::Internal(format!("{other} has no address"))),
        }
    }

    fn gen_address(&mut self, slot: Slot, offset: Option<i64>, loc: usize) -> Result<usize> {
        let off = offset.unwrap_or(0);
        match (slot.local, slot.direct) {
            (false, true) => self.emit(loc, Instr::LoadImInt(slot.addr + off)),
            (true, true) => self.emit(loc, Instr::LoadAddrRel(slot.addr + off)),
            (true, false) => {
                let mut loc = self.emit(loc, Instr::LoadAddrRel(slot.addr))?;
                loc = self.emit(loc, Instr::Deref)?;
                if let Some(off) = offset {
                    loc = self.emit(loc, Instr::LoadImInt(off))?;
                    loc = self.emit(loc, Instr::AddInt)?;
                }
                Ok(loc)
            }
            (false, false) => Err(CompileError::Internal(
                "globals are never accessed indirectly".into(),
            )),
        }
    }

    /// Pushes the value of `e`; a record value occupies one cell per scalar field.
    pub(super) fn gen_rvalue(&mut self, e: &Expr, loc: usize, env: &Environment<'_>) -> Result<usize> {
        match e {
            Expr::Bool(b) => self.emit(loc, Instr::LoadImInt(i64::from(*b))),
            Expr::Int(v) => self.emit(loc, Instr::LoadImInt(*v)),
            Expr::Store { .. } | Expr::Field { .. } => match e.type_of(env.scope, self.ctx)? {
                Type::Record(rec) => {
                    let mut loc = loc;
                    for i in 0..rec.size() {
                        loc = self.gen_lvalue(e, loc, env)?;
                        loc = self.emit(loc, Instr::LoadImInt(i as i64))?;
                        loc = self.emit(loc, Instr::AddInt)?;
                        loc = self.emit(loc, Instr::Deref)?;
                    }
                    Ok(loc)
                }
                _ => {
                    let loc = self.gen_lvalue(e, loc, env)?;
                    self.emit(loc, Instr::Deref)
                }
            },
            Expr::Call(name, args) => self.gen_call(name, args, loc, env),
            Expr::RecordCall(_, args) => {
                let mut loc = loc;
                for a in args {
                    loc = self.gen_rvalue(a, loc, env)?;
                }
                Ok(loc)
            }
            Expr::Unary(UnOp::Not, operand) => {
                let loc = self.emit(loc, Instr::LoadImInt(1))?;
                let loc = self.gen_rvalue(operand, loc, env)?;
                self.emit(loc, Instr::SubInt)
            }
            Expr::Unary(UnOp::Plus, operand) => self.gen_rvalue(operand, loc, env),
            Expr::Unary(UnOp::Minus, operand) => {
                let loc = self.gen_rvalue(operand, loc, env)?;
                let loc = self.emit(loc, Instr::LoadImInt(-1))?;
                self.emit(loc, Instr::MultInt)
            }
            Expr::Binary(l, BinOp::Cand, r) => {
                let mut loc = self.gen_rvalue(l, loc, env)?;
                let to_false = loc;
                loc = self.emit(loc, Instr::CondJump(PLACEHOLDER))?;
                loc = self.gen_rvalue(r, loc, env)?;
                let to_end = loc;
                loc = self.emit(loc, Instr::UncondJump(PLACEHOLDER))?;
                self.code.put(to_false, Instr::CondJump(loc))?;
                loc = self.emit(loc, Instr::LoadImInt(0))?;
                self.code.put(to_end, Instr::UncondJump(loc))?;
                Ok(loc)
            }
            Expr::Binary(l, BinOp::Cor, r) => {
                // 1 - l is zero exactly when l holds, which skips r
                let mut loc = self.emit(loc, Instr::LoadImInt(1))?;
                loc = self.gen_rvalue(l, loc, env)?;
                loc = self.emit(loc, Instr::SubInt)?;
                let to_true = loc;
                loc = self.emit(loc, Instr::CondJump(PLACEHOLDER))?;
                loc = self.gen_rvalue(r, loc, env)?;
                let to_end = loc;
                loc = self.emit(loc, Instr::UncondJump(PLACEHOLDER))?;
                self.code.put(to_true, Instr::CondJump(loc))?;
                loc = self.emit(loc, Instr::LoadImInt(1))?;
                self.code.put(to_end, Instr::UncondJump(loc))?;
                Ok(loc)
            }
            Expr::Binary(l, op, r) => {
                let loc = self.gen_rvalue(l, loc, env)?;
                let loc = self.gen_rvalue(r, loc, env)?;
                self.emit(loc, arith_instr(*op)?)
            }
        }
    }

    /// Emits argument passing and a call awaiting its target.
    pub(super) fn gen_call(
        &mut self,
        name: &str,
        args: &[Expr],
        loc: usize,
        env: &Environment<'_>,
    ) -> Result<usize> {
        let ctx = self.ctx;
        let sig = ctx.routine(name)?;
        let mut loc = loc;
        if let Some(ret) = sig.ret_type() {
            loc = self.emit(loc, Instr::AllocBlock(ret.size()))?;
        }
        for (a, (_, p)) in args.iter().zip(&sig.params) {
            loc = match (p.mech, p.flow) {
                (MechMode::Ref, _) => self.gen_lvalue(a, loc, env)?,
                (MechMode::Copy, FlowMode::Out) => self.emit(loc, Instr::AllocBlock(p.ty.size()))?,
                _ => self.gen_rvalue(a, loc, env)?,
            };
        }
        self.pending.push(PendingCall {
            location: loc,
            routine: name.to_string(),
        });
        self.emit(loc, Instr::Call(PLACEHOLDER))
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::generate;
    use crate::parser::parse_program;
    use crate::sema::check_program;
    use crate::vm::Instr::{self, *};

    /// Instructions emitted for the right side of the first assignment.
    fn rvalue_code(decls: &str, expr: &str) -> Vec<Instr> {
        let src = format!("program p() global var sink: int32; var flag: bool; {decls} do sink := 0; flag := {expr} endprogram");
        let prog = parse_program(&src).expect("parse");
        let checked = check_program(&prog).expect("check");
        let asm = generate(&checked, 4096).expect("generate");
        let code = asm.code.instructions();
        let globals = code.iter().take_while(|i| matches!(i, AllocBlock(_))).count();
        // skip `sink := 0` and the target address of `flag`
        let start = globals + 4;
        let end = code.iter().position(|i| *i == Stop).expect("stop") - 1;
        code[start..end].to_vec()
    }

    #[test]
    fn conditional_and_layout() {
        let code = rvalue_code("var a: bool; var b: bool", "a /\\? b");
        // a at 2, b at 3
        assert_eq!(code.len(), 7);
        assert_eq!(code[0], LoadImInt(2));
        assert_eq!(code[1], Deref);
        assert!(matches!(code[2], CondJump(_)));
        assert_eq!(&code[3..5], &[LoadImInt(3), Deref]);
        assert!(matches!(code[5], UncondJump(_)));
        assert_eq!(code[6], LoadImInt(0));
    }

    #[test]
    fn conditional_or_negates_left() {
        let code = rvalue_code("var a: bool; var b: bool", "a \\/? b");
        assert_eq!(&code[..4], &[LoadImInt(1), LoadImInt(2), Deref, SubInt]);
        assert_eq!(code.last(), Some(&LoadImInt(1)));
    }

    #[test]
    fn not_and_negation() {
        assert_eq!(
            rvalue_code("", "not flag"),
            vec![LoadImInt(1), LoadImInt(1), Deref, SubInt]
        );
        assert_eq!(
            rvalue_code("", "-sink < 0"),
            vec![LoadImInt(0), Deref, LoadImInt(-1), MultInt, LoadImInt(0), LtInt]
        );
    }

    #[test]
    fn record_field_access_uses_static_offset() {
        let code = rvalue_code(
            "record In(c: int32, d: bool); record Out(a: int32, b: In); var o: Out",
            "o.b.d",
        );
        // o starts at 2, d sits two cells in
        assert_eq!(code, vec![LoadImInt(4), Deref]);
    }

    #[test]
    fn function_call_reserves_result_and_passes_arguments() {
        let code = rvalue_code(
            "fun f(in copy n: int32, in ref const m: int32) returns var r: bool do r := n < m endfun",
            "f(7, sink)",
        );
        assert_eq!(code[0], AllocBlock(1));
        assert_eq!(code[1], LoadImInt(7));
        // ref argument passes the address only
        assert_eq!(code[2], LoadImInt(0));
        assert!(matches!(code[3], Call(t) if t != crate::vm::PLACEHOLDER));
    }
}
