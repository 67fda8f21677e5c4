use std::collections::HashMap;

use log::{debug, info};

use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::scope::SymbolTable;
use crate::sema::{CheckedProgram, CompilationContext};
use crate::types::{AccessMode, Type};
use crate::vm::{CodeArray, Instr, PLACEHOLDER};

mod expr;

/// Where a variable lives: an absolute global address or a frame offset,
/// holding either the value itself or its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub addr: i64,
    pub local: bool,
    pub direct: bool,
}

/// Storage descriptors for the names visible in one region.
pub struct Environment<'a> {
    pub scope: &'a SymbolTable,
    slots: HashMap<String, Slot>,
}

impl Environment<'_> {
    fn slot(&self, name: &str) -> Result<Slot> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::Internal(format!("no storage assigned to {name}")))
    }
}

/// Resolved addresses: globals by name, routine entry points by name.
#[derive(Debug, Default)]
pub struct LayoutTable {
    pub globals: HashMap<String, i64>,
    pub entries: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct PendingCall {
    pub location: usize,
    pub routine: String,
}

pub struct Assembled {
    pub code: CodeArray,
    pub layout: LayoutTable,
}

pub struct CodeGen<'a> {
    ctx: &'a CompilationContext,
    code: CodeArray,
    layout: LayoutTable,
    pending: Vec<PendingCall>,
}

pub fn generate(checked: &CheckedProgram, capacity: usize) -> Result<Assembled> {
    CodeGen::new(&checked.context, capacity).gen_program(&checked.program)
}

fn input_instr(ty: &Type, label: String) -> Instr {
    match ty {
        Type::Bool => Instr::InputBool(label),
        _ => Instr::InputInt(label),
    }
}

fn output_instr(ty: &Type, label: String) -> Instr {
    match ty {
        Type::Bool => Instr::OutputBool(label),
        _ => Instr::OutputInt(label),
    }
}

fn io_label(e: &Expr) -> String {
    match e {
        Expr::Store { name, .. } => name.clone(),
        other => other.to_string(),
    }
}

impl<'a> CodeGen<'a> {
    pub fn new(ctx: &'a CompilationContext, capacity: usize) -> Self {
        Self {
            ctx,
            code: CodeArray::new(capacity),
            layout: LayoutTable::default(),
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, loc: usize, instr: Instr) -> Result<usize> {
        self.code.put(loc, instr)?;
        Ok(loc + 1)
    }

    pub fn gen_program(mut self, prog: &Program) -> Result<Assembled> {
        let ctx = self.ctx;
        let mut loc = 0;
        let mut next_addr: i64 = 0;
        let mut slots = HashMap::new();

        let globals = prog
            .params
            .iter()
            .map(|p| &p.ident.name)
            .chain(prog.decls.iter().filter_map(|d| match d {
                Decl::Storage(s) => Some(&s.ident.name),
                _ => None,
            }));
        for name in globals {
            let size = ctx.globals.lookup(name)?.ty.size();
            slots.insert(
                name.clone(),
                Slot {
                    addr: next_addr,
                    local: false,
                    direct: true,
                },
            );
            self.layout.globals.insert(name.clone(), next_addr);
            debug!("global {name} at {next_addr}, {size} cells");
            loc = self.emit(loc, Instr::AllocBlock(size))?;
            next_addr += size as i64;
        }
        let env = Environment {
            scope: &ctx.globals,
            slots,
        };

        for p in &prog.params {
            if matches!(p.flow, FlowMode::In | FlowMode::InOut) {
                let sig = ctx.globals.lookup(&p.ident.name)?;
                loc = self.emit(loc, Instr::LoadImInt(env.slot(&p.ident.name)?.addr))?;
                loc = self.emit(loc, input_instr(&sig.ty, p.ident.name.clone()))?;
            }
        }
        loc = self.gen_cmds(&prog.cmds, loc, &env)?;
        for p in &prog.params {
            if matches!(p.flow, FlowMode::Out | FlowMode::InOut) {
                let sig = ctx.globals.lookup(&p.ident.name)?;
                loc = self.emit(loc, Instr::LoadImInt(env.slot(&p.ident.name)?.addr))?;
                loc = self.emit(loc, Instr::Deref)?;
                loc = self.emit(loc, output_instr(&sig.ty, p.ident.name.clone()))?;
            }
        }
        loc = self.emit(loc, Instr::Stop)?;

        for d in &prog.decls {
            if let Some(rd) = d.as_routine() {
                loc = self.gen_routine(&rd, loc)?;
            }
        }
        self.backpatch()?;
        info!("program {}: {loc} instructions", prog.name);
        Ok(Assembled {
            code: self.code,
            layout: self.layout,
        })
    }

    fn gen_routine(&mut self, rd: &RoutineDecl<'_>, mut loc: usize) -> Result<usize> {
        let ctx = self.ctx;
        let sig = ctx.routine(rd.name)?;
        let scope = ctx.local_scope(rd.name)?;
        self.layout.entries.insert(rd.name.to_string(), loc);
        info!("routine {} at {loc}", rd.name);

        let mut slots = HashMap::new();
        // Arguments sit below the frame pointer, the last one nearest.
        let mut rel: i64 = 0;
        for (name, p) in sig.params.iter().rev() {
            rel -= p.slot_size() as i64;
            slots.insert(
                name.clone(),
                Slot {
                    addr: rel,
                    local: true,
                    direct: p.access() == AccessMode::Direct,
                },
            );
        }
        if let Some((name, r)) = &sig.ret {
            rel -= r.ty.size() as i64;
            slots.insert(
                name.clone(),
                Slot {
                    addr: rel,
                    local: true,
                    direct: true,
                },
            );
        }
        for (name, _) in &sig.imports {
            let addr = *self.layout.globals.get(name).ok_or_else(|| {
                CompileError::Internal(format!("import {name} has no global address"))
            })?;
            slots.insert(
                name.clone(),
                Slot {
                    addr,
                    local: false,
                    direct: true,
                },
            );
        }
        // Slots 0..2 of the frame hold the saved registers.
        let mut next: i64 = 3;
        for l in rd.locals {
            let size = scope.lookup(&l.ident.name)?.ty.size();
            slots.insert(
                l.ident.name.clone(),
                Slot {
                    addr: next,
                    local: true,
                    direct: true,
                },
            );
            loc = self.emit(loc, Instr::AllocBlock(size))?;
            next += size as i64;
        }

        let env = Environment { scope, slots };
        loc = self.gen_cmds(rd.body, loc, &env)?;
        self.emit(loc, Instr::Return(sig.param_area()))
    }

    fn backpatch(&mut self) -> Result<()> {
        for call in std::mem::take(&mut self.pending) {
            let target = *self.layout.entries.get(&call.routine).ok_or_else(|| {
                CompileError::Internal(format!("{} has no entry address", call.routine))
            })?;
            debug!("call at {} patched to {} ({target})", call.location, call.routine);
            self.code.put(call.location, Instr::Call(target))?;
        }
        Ok(())
    }

    fn gen_cmds(&mut self, cmds: &[Cmd], mut loc: usize, env: &Environment<'_>) -> Result<usize> {
        for c in cmds {
            loc = self.gen_cmd(c, loc, env)?;
        }
        Ok(loc)
    }

    fn gen_cmd(&mut self, cmd: &Cmd, loc: usize, env: &Environment<'_>) -> Result<usize> {
        match cmd {
            Cmd::Skip => Ok(loc),
            Cmd::Assign(lhs, rhs) => match rhs.type_of(env.scope, self.ctx)? {
                Type::Record(rec) => {
                    // Field values are on the stack in order; store from the last.
                    let mut loc = self.gen_rvalue(rhs, loc, env)?;
                    for i in (0..rec.size()).rev() {
                        loc = self.gen_lvalue(lhs, loc, env)?;
                        loc = self.emit(loc, Instr::LoadImInt(i as i64))?;
                        loc = self.emit(loc, Instr::AddInt)?;
                        loc = self.emit(loc, Instr::StoreRev)?;
                    }
                    Ok(loc)
                }
                _ => {
                    let loc = self.gen_lvalue(lhs, loc, env)?;
                    let loc = self.gen_rvalue(rhs, loc, env)?;
                    self.emit(loc, Instr::Store)
                }
            },
            Cmd::If(cond, then_cmds, else_cmds) => {
                let mut loc = self.gen_rvalue(cond, loc, env)?;
                let to_else = loc;
                loc = self.emit(loc, Instr::CondJump(PLACEHOLDER))?;
                loc = self.gen_cmds(then_cmds, loc, env)?;
                let to_end = loc;
                loc = self.emit(loc, Instr::UncondJump(PLACEHOLDER))?;
                self.code.put(to_else, Instr::CondJump(loc))?;
                loc = self.gen_cmds(else_cmds, loc, env)?;
                self.code.put(to_end, Instr::UncondJump(loc))?;
                Ok(loc)
            }
            Cmd::While(cond, body) => {
                let start = loc;
                let mut loc = self.gen_rvalue(cond, loc, env)?;
                let to_exit = loc;
                loc = self.emit(loc, Instr::CondJump(PLACEHOLDER))?;
                loc = self.gen_cmds(body, loc, env)?;
                loc = self.emit(loc, Instr::UncondJump(start))?;
                self.code.put(to_exit, Instr::CondJump(loc))?;
                Ok(loc)
            }
            Cmd::Call { name, args, .. } => self.gen_call(name, args, loc, env),
            Cmd::DebugIn(e) => {
                let ty = e.type_of(env.scope, self.ctx)?;
                let loc = self.gen_lvalue(e, loc, env)?;
                self.emit(loc, input_instr(&ty, io_label(e)))
            }
            Cmd::DebugOut(e) => {
                let ty = e.type_of(env.scope, self.ctx)?;
                let mut loc = self.gen_rvalue(e, loc, env)?;
                match &ty {
                    Type::Record(rec) => {
                        for (label, field_ty) in rec.flatten(&io_label(e)).into_iter().rev() {
                            loc = self.emit(loc, output_instr(&field_ty, label))?;
                        }
                        Ok(loc)
                    }
                    scalar => self.emit(loc, output_instr(scalar, io_label(e))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::sema::check_program;
    use crate::vm::Machine;
    use Instr::*;

    fn assemble_with(src: &str, capacity: usize) -> Result<Assembled> {
        let prog = parse_program(src).expect("test program should parse");
        let checked = check_program(&prog).expect("test program should check");
        generate(&checked, capacity)
    }

    fn assemble(src: &str) -> Assembled {
        assemble_with(src, 4096).expect("code generation failed")
    }

    fn run(src: &str, input: &str) -> String {
        let asm = assemble(src);
        let mut m = Machine::new(asm.code.instructions(), 1024);
        let mut out = Vec::new();
        let mut tokens = input.split_whitespace().map(str::to_string);
        m.run(&mut tokens, &mut out).expect("program should run");
        String::from_utf8(out).unwrap()
    }

    fn call_targets(asm: &Assembled) -> Vec<usize> {
        asm.code
            .instructions()
            .iter()
            .filter_map(|i| match i {
                Call(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scalar_assignment_shape() {
        let asm = assemble("program p() global var x: int32 do x := 7 endprogram");
        assert_eq!(
            asm.code.instructions(),
            &[AllocBlock(1), LoadImInt(0), LoadImInt(7), Store, Stop]
        );
    }

    #[test]
    fn recursive_call_is_patched_to_own_entry() {
        let src = "program p() global \
                   proc down(in copy n: int32) do \
                     if n > 0 then debugout n; call down(n - 1) else skip endif \
                   endproc \
                   do call down(3) endprogram";
        let asm = assemble(src);
        let entry = asm.layout.entries["down"];
        assert_eq!(call_targets(&asm), vec![entry, entry]);
        assert_eq!(run(src, ""), "n = 3\nn = 2\nn = 1\n");
    }

    #[test]
    fn forward_call_is_patched_to_later_routine() {
        let src = "program p() global \
                   proc a() do call b(5) endproc; \
                   proc b(in copy n: int32) do debugout n endproc \
                   do call a() endprogram";
        let asm = assemble(src);
        let (a, b) = (asm.layout.entries["a"], asm.layout.entries["b"]);
        assert!(a < b);
        let targets = call_targets(&asm);
        assert_eq!(targets, vec![a, b]);
        assert!(!targets.contains(&PLACEHOLDER));
        assert_eq!(run(src, ""), "n = 5\n");
    }

    #[test]
    fn mutual_recursion() {
        let src = "program p(in n: int32) global \
                   fun even(in copy k: int32) returns var r: bool do \
                     if k = 0 then r := true else r := odd(k - 1) endif endfun; \
                   fun odd(in copy k: int32) returns var r: bool do \
                     if k = 0 then r := false else r := even(k - 1) endif endfun \
                   do debugout even(n) endprogram";
        assert_eq!(run(src, "7"), "even(n) = false\n");
        assert_eq!(run(src, "10"), "even(n) = true\n");
    }

    #[test]
    fn short_circuit_skips_right_operand() {
        let src = "program p() global var b: bool; \
                   fun loud() returns var r: bool do debugout 99; r := true endfun \
                   do b := false /\\? loud(); debugout b; \
                      b := true \\/? loud(); debugout b; \
                      b := true /\\? loud(); debugout b; \
                      b := false \\/? loud(); debugout b \
                   endprogram";
        assert_eq!(
            run(src, ""),
            "b = false\nb = true\n99 = 99\nb = true\n99 = 99\nb = true\n"
        );
    }

    #[test]
    fn factorial_through_program_parameters() {
        let src = "program fact(in n: int64, out var r: int64) global \
                   fun f(in copy k: int64) returns var v: int64 do \
                     if k <= 1 then v := 1 else v := k * f(k - 1) endif \
                   endfun \
                   do r := f(n) endprogram";
        assert_eq!(run(src, "5"), "r = 120\n");
        assert_eq!(run(src, "1"), "r = 1\n");
    }

    #[test]
    fn ref_parameters_write_through() {
        let src = "program p() global var x: int32; \
                   proc bump(inout ref var v: int32, in copy by: int32) do v := v + by endproc \
                   do x := 40; call bump(x, 2); debugout x endprogram";
        assert_eq!(run(src, ""), "x = 42\n");
        let asm = assemble(src);
        // the ref slot is read through its stored address
        let body = &asm.code.instructions()[asm.layout.entries["bump"]..];
        assert_eq!(&body[..2], &[LoadAddrRel(-2), Deref]);
    }

    #[test]
    fn out_ref_initializes_constant() {
        let src = "program p() global const c: int32; \
                   proc set(out ref var v: int32) do v init := 9 endproc \
                   do call set(c init) init c; debugout c endprogram";
        assert_eq!(run(src, ""), "c = 9\n");
    }

    #[test]
    fn globals_reached_through_imports() {
        let src = "program p() global var total: int32; \
                   proc add(in copy n: int32) global inout var total local var t: int32 do \
                     t := n * 2; total := total + t \
                   endproc \
                   do total := 1; call add(3); call add(4); debugout total endprogram";
        assert_eq!(run(src, ""), "total = 15\n");
    }

    #[test]
    fn loops_and_division_families() {
        let src = "program gcd(in a: int32, in b: int32) global var x: int32; var y: int32; var t: int32 \
                   do x := a; y := b; \
                      while y /= 0 do t := x modT y; x := y; y := t endwhile; \
                      debugout x; debugout -7 divF 2; debugout -7 modE 2; debugout -7 divT 2 \
                   endprogram";
        assert_eq!(
            run(src, "84 36"),
            "x = 12\n(-7 divF 2) = -4\n(-7 modE 2) = 1\n(-7 divT 2) = -3\n"
        );
    }

    #[test]
    fn records_copy_and_print() {
        let src = "program p() global \
                   record In(c: int32, d: bool); \
                   record Out(a: int32, b: In); \
                   var o: Out; var q: Out \
                   do o := Out(1, In(2, true)); o.b.c := o.b.c + 40; q := o; \
                      debugout q; debugout q.b.c endprogram";
        assert_eq!(
            run(src, ""),
            "q.b.d = true\nq.b.c = 42\nq.a = 1\nq.b.c = 42\n"
        );
    }

    #[test]
    fn record_parameters_and_results() {
        let src = "program p() global \
                   record P(x: int32, y: int32); var a: P; var b: P; \
                   fun swap(in copy v: P) returns var w: P do w := P(v.y, v.x) endfun; \
                   proc shift(inout ref var v: P) do v.x := v.x + 100 endproc \
                   do a := P(1, 2); b := swap(a); call shift(b); debugout b endprogram";
        assert_eq!(run(src, ""), "b.y = 1\nb.x = 102\n");
    }

    #[test]
    fn debugin_reads_scalars_and_fields() {
        let src = "program p() global record R(n: int32, f: bool); var r: R; var x: int32 \
                   do debugin x; debugin r.f; r.n := x * 3; debugout r endprogram";
        assert_eq!(run(src, "5 true"), "r.f = true\nr.n = 15\n");
    }

    #[test]
    fn monadic_operators() {
        let src = "program p() global var b: bool; var x: int32 \
                   do x := 5; b := not (x > 3); debugout b; debugout -x; debugout +x endprogram";
        assert_eq!(run(src, ""), "b = false\n-x = -5\n+x = 5\n");
    }

    #[test]
    fn capacity_is_enforced() {
        let src = "program p() global var x: int32 do x := 1; x := 2 endprogram";
        assert!(matches!(
            assemble_with(src, 4),
            Err(CompileError::Capacity { capacity: 4 })
        ));
        assert!(assemble_with(src, 9).is_ok());
    }

    #[test]
    fn routine_frames() {
        let src = "program p() global var g: int32; \
                   fun f(in copy a: int32, in ref const b: int32) returns var r: int32 \
                   local var t: int32; var u: int32 do \
                     t := a; u := b; r := t + u \
                   endfun \
                   do g := 2; debugout f(1, g) endprogram";
        let asm = assemble(src);
        let entry = asm.layout.entries["f"];
        let code = asm.code.instructions();
        assert_eq!(&code[entry..entry + 2], &[AllocBlock(1), AllocBlock(1)]);
        // t := a
        assert_eq!(
            &code[entry + 2..entry + 6],
            &[LoadAddrRel(3), LoadAddrRel(-2), Deref, Store]
        );
        assert_eq!(code.last(), Some(&Return(2)));
        assert_eq!(run(src, ""), "f(1, g) = 3\n");
    }
}
