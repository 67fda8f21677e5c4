use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, info};

use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::scope::SymbolTable;
use crate::types::*;

/// Declaration registry and scopes of a single compilation.
#[derive(Debug)]
pub struct CompilationContext {
    pub records: HashMap<String, Rc<RecordSignature>>,
    pub routines: HashMap<String, RoutineSignature>,
    pub globals: SymbolTable,
    /// Finalized local scope of each routine, keyed by routine name.
    pub scopes: HashMap<String, SymbolTable>,
}

pub enum Callee<'a> {
    Procedure(&'a RoutineSignature),
    Function(&'a RoutineSignature),
    Record(&'a Rc<RecordSignature>),
    Unknown,
}

pub struct CheckedProgram {
    pub program: Program,
    pub context: CompilationContext,
}

impl CompilationContext {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            routines: HashMap::new(),
            globals: SymbolTable::new(ScopeClass::Global),
            scopes: HashMap::new(),
        }
    }

    pub fn callee(&self, name: &str) -> Callee<'_> {
        if let Some(sig) = self.routines.get(name) {
            if sig.is_function() {
                return Callee::Function(sig);
            }
            return Callee::Procedure(sig);
        }
        match self.records.get(name) {
            Some(rec) => Callee::Record(rec),
            None => Callee::Unknown,
        }
    }

    pub fn routine(&self, name: &str) -> Result<&RoutineSignature> {
        self.routines
            .get(name)
            .ok_or_else(|| CompileError::Internal(format!("routine {name} was never registered")))
    }

    pub fn local_scope(&self, routine: &str) -> Result<&SymbolTable> {
        self.scopes
            .get(routine)
            .ok_or_else(|| CompileError::Internal(format!("no local scope for {routine}")))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.routines.contains_key(name) || self.records.contains_key(name)
    }

    pub fn resolve_type(&self, tr: &TypeRef) -> Result<Type> {
        match tr {
            TypeRef::Bool => Ok(Type::Bool),
            TypeRef::Int(w) => Ok(Type::Int(*w)),
            TypeRef::Named(n) => self
                .records
                .get(n)
                .map(|r| Type::Record(r.clone()))
                .ok_or_else(|| CompileError::context(format!("unknown record type: {n}"))),
        }
    }
}

pub fn check_program(prog: &Program) -> Result<CheckedProgram> {
    let mut ctx = CompilationContext::new();

    for p in &prog.params {
        declare_prog_param(&mut ctx, p)?;
    }

    // Signatures first, so every body sees every routine.
    for d in &prog.decls {
        match d {
            Decl::Storage(s) => {
                let ty = ctx.resolve_type(&s.ident.ty)?;
                ctx.globals
                    .declare(&s.ident.name, VariableSignature::new(ty, s.change, ScopeClass::Global))?;
            }
            Decl::Record(r) => register_record(&mut ctx, r)?,
            Decl::Procedure(_) | Decl::Function(_) => {
                let rd = d
                    .as_routine()
                    .ok_or_else(|| CompileError::Internal("routine view missing".into()))?;
                register_routine(&mut ctx, &rd)?;
            }
        }
    }

    let mut decls = Vec::with_capacity(prog.decls.len());
    for d in &prog.decls {
        let checked = match d {
            Decl::Procedure(p) => {
                let (scope, body) = check_routine(&ctx, &p.name, &p.locals, &p.body)?;
                ctx.scopes.insert(p.name.clone(), scope);
                Decl::Procedure(ProcDecl {
                    body,
                    ..p.clone()
                })
            }
            Decl::Function(f) => {
                let (scope, body) = check_routine(&ctx, &f.name, &f.locals, &f.body)?;
                ctx.scopes.insert(f.name.clone(), scope);
                Decl::Function(FunDecl {
                    body,
                    ..f.clone()
                })
            }
            other => other.clone(),
        };
        decls.push(checked);
    }

    let cmds = check_cmds(&prog.cmds, &ctx.globals, &ctx)?;
    info!(
        "checked program {}: {} routines, {} records",
        prog.name,
        ctx.routines.len(),
        ctx.records.len()
    );
    Ok(CheckedProgram {
        program: Program {
            name: prog.name.clone(),
            params: prog.params.clone(),
            decls,
            cmds,
        },
        context: ctx,
    })
}

fn declare_prog_param(ctx: &mut CompilationContext, p: &ProgParam) -> Result<()> {
    let ty = ctx.resolve_type(&p.ident.ty)?;
    if ty.is_record() {
        return Err(CompileError::context(format!(
            "program parameter {} cannot have record type",
            p.ident.name
        )));
    }
    let mut sig = VariableSignature::new(ty, p.change, ScopeClass::Global);
    sig.flow = p.flow;
    ctx.globals.declare(&p.ident.name, sig)
}

fn register_record(ctx: &mut CompilationContext, r: &RecordDecl) -> Result<()> {
    if ctx.name_taken(&r.name) {
        return Err(CompileError::context(format!("name already declared: {}", r.name)));
    }
    let mut fields: Vec<RecordField> = Vec::with_capacity(r.fields.len());
    for f in &r.fields {
        if fields.iter().any(|x| x.name == f.name) {
            return Err(CompileError::context(format!(
                "duplicate field {} in record {}",
                f.name, r.name
            )));
        }
        let ty = ctx.resolve_type(&f.ty)?;
        fields.push(RecordField {
            name: f.name.clone(),
            ty,
        });
    }
    let sig = RecordSignature {
        name: r.name.clone(),
        fields,
    };
    debug!("record {} registered, size {}", r.name, sig.size());
    ctx.records.insert(r.name.clone(), Rc::new(sig));
    Ok(())
}

fn check_param_modes(routine: &str, p: &Param, is_function: bool) -> Result<()> {
    let name = &p.ident.name;
    if is_function && p.flow != FlowMode::In {
        return Err(CompileError::context(format!(
            "parameter {name} of function {routine} must have flow mode in"
        )));
    }
    match (p.flow, p.mech, p.change) {
        (FlowMode::In, MechMode::Ref, ChangeMode::Var) => Err(CompileError::context(format!(
            "parameter {name} of {routine}: in ref var is invalid"
        ))),
        (FlowMode::Out | FlowMode::InOut, MechMode::Copy, _) => Err(CompileError::context(
            format!("parameter {name} of {routine}: out/inout copy is not supported"),
        )),
        _ => Ok(()),
    }
}

fn register_routine(ctx: &mut CompilationContext, rd: &RoutineDecl<'_>) -> Result<()> {
    if ctx.name_taken(rd.name) {
        return Err(CompileError::context(format!("name already declared: {}", rd.name)));
    }
    let is_function = rd.ret.is_some();
    let mut seen = SymbolTable::new(ScopeClass::Local);

    let mut params = Vec::with_capacity(rd.params.len());
    for p in rd.params {
        check_param_modes(rd.name, p, is_function)?;
        let sig = VariableSignature {
            ty: ctx.resolve_type(&p.ident.ty)?,
            flow: p.flow,
            change: p.change,
            mech: p.mech,
            scope: ScopeClass::Local,
        };
        seen.declare(&p.ident.name, sig.clone()).map_err(|_| {
            CompileError::context(format!(
                "duplicate parameter {} in {}",
                p.ident.name, rd.name
            ))
        })?;
        params.push((p.ident.name.clone(), sig));
    }

    let mut imports = Vec::with_capacity(rd.imports.len());
    for imp in rd.imports {
        let outer = ctx.globals.get(&imp.name).ok_or_else(|| {
            CompileError::context(format!(
                "global import {} of {} not found",
                imp.name, rd.name
            ))
        })?;
        if seen.contains(&imp.name) {
            return Err(CompileError::context(format!(
                "global import {} clashes with a local name of {}",
                imp.name, rd.name
            )));
        }
        if imp.change == ChangeMode::Var && outer.change == ChangeMode::Const {
            return Err(CompileError::context(format!(
                "constant global {} cannot be imported as var into {}",
                imp.name, rd.name
            )));
        }
        let sig = VariableSignature {
            ty: outer.ty.clone(),
            flow: imp.flow,
            change: imp.change,
            mech: outer.mech,
            scope: ScopeClass::Global,
        };
        seen.declare(&imp.name, sig.clone())?;
        imports.push((imp.name.clone(), sig));
    }

    let ret = match rd.ret {
        Some(sd) => {
            let name = &sd.ident.name;
            if seen.contains(name) {
                return Err(CompileError::context(format!(
                    "return value {name} of {} clashes with a parameter or import",
                    rd.name
                )));
            }
            let ty = ctx.resolve_type(&sd.ident.ty)?;
            Some((name.clone(), VariableSignature::new(ty, sd.change, ScopeClass::Local)))
        }
        None => None,
    };

    debug!(
        "{} {} registered: {} params, {} imports",
        if is_function { "function" } else { "procedure" },
        rd.name,
        params.len(),
        imports.len()
    );
    ctx.routines.insert(
        rd.name.to_string(),
        RoutineSignature {
            name: rd.name.to_string(),
            params,
            imports,
            ret,
        },
    );
    Ok(())
}

fn check_routine(
    ctx: &CompilationContext,
    name: &str,
    locals: &[StorageDecl],
    body: &[Cmd],
) -> Result<(SymbolTable, Vec<Cmd>)> {
    let sig = ctx.routine(name)?;
    let mut scope = SymbolTable::new(ScopeClass::Local);
    for (n, s) in sig.params.iter().chain(&sig.imports).chain(&sig.ret) {
        scope.declare(n, s.clone())?;
    }
    for l in locals {
        let ty = ctx.resolve_type(&l.ident.ty)?;
        scope
            .declare(&l.ident.name, VariableSignature::new(ty, l.change, ScopeClass::Local))
            .map_err(|_| {
                CompileError::context(format!(
                    "local {} of {name} is already declared",
                    l.ident.name
                ))
            })?;
    }
    let body = check_cmds(body, &scope, ctx)?;
    debug!("routine {name} checked with {} bindings", scope.len());
    Ok((scope, body))
}

fn check_cmds(cmds: &[Cmd], scope: &SymbolTable, ctx: &CompilationContext) -> Result<Vec<Cmd>> {
    cmds.iter().map(|c| check_cmd(c, scope, ctx)).collect()
}

fn check_cmd(cmd: &Cmd, scope: &SymbolTable, ctx: &CompilationContext) -> Result<Cmd> {
    match cmd {
        Cmd::Skip => Ok(Cmd::Skip),
        Cmd::Assign(lhs, rhs) => {
            let l = lhs.check(scope, ctx)?;
            let r = rhs.check(scope, ctx)?;
            if !l.is_valid_left() {
                return Err(CompileError::context(format!("cannot assign to {l}")));
            }
            if !r.is_valid_right() {
                return Err(CompileError::context(format!("{r} cannot be read")));
            }
            let lt = l.type_of(scope, ctx)?;
            let rt = r.type_of(scope, ctx)?;
            if lt != rt {
                return Err(CompileError::type_mismatch(format!("assignment to {l}"), rt, lt));
            }
            check_writable(&l, scope)?;
            Ok(Cmd::Assign(l, r))
        }
        Cmd::If(cond, then_cmds, else_cmds) => Ok(Cmd::If(
            check_condition(cond, "if condition", scope, ctx)?,
            check_cmds(then_cmds, scope, ctx)?,
            check_cmds(else_cmds, scope, ctx)?,
        )),
        Cmd::While(cond, body) => Ok(Cmd::While(
            check_condition(cond, "while condition", scope, ctx)?,
            check_cmds(body, scope, ctx)?,
        )),
        Cmd::Call { name, args, inits } => {
            let sig = match ctx.callee(name) {
                Callee::Procedure(sig) => sig,
                Callee::Function(_) => {
                    return Err(CompileError::context(format!(
                        "{name} is a function and cannot be called as a procedure"
                    )))
                }
                Callee::Record(_) => {
                    return Err(CompileError::context(format!(
                        "{name} is a record, not a procedure"
                    )))
                }
                Callee::Unknown => {
                    return Err(CompileError::context(format!("unknown procedure: {name}")))
                }
            };
            let args = check_args(name, args, &sig.params, scope, ctx)?;
            for i in inits {
                scope.lookup(i)?;
            }
            Ok(Cmd::Call {
                name: name.clone(),
                args,
                inits: inits.clone(),
            })
        }
        Cmd::DebugIn(e) => {
            let e = e.check(scope, ctx)?;
            if !e.is_valid_left() {
                return Err(CompileError::context(format!("debugin target {e} is not a location")));
            }
            if e.type_of(scope, ctx)?.is_record() {
                return Err(CompileError::context(format!(
                    "debugin of record {e} is not supported"
                )));
            }
            Ok(Cmd::DebugIn(e))
        }
        Cmd::DebugOut(e) => {
            let e = e.check(scope, ctx)?;
            if !e.is_valid_right() {
                return Err(CompileError::context(format!("{e} cannot be read")));
            }
            Ok(Cmd::DebugOut(e))
        }
    }
}

fn check_condition(
    cond: &Expr,
    what: &str,
    scope: &SymbolTable,
    ctx: &CompilationContext,
) -> Result<Expr> {
    let c = cond.check(scope, ctx)?;
    if !c.is_valid_right() {
        return Err(CompileError::context(format!("{c} cannot be read")));
    }
    expect_type(&c.type_of(scope, ctx)?, &Type::Bool, what)?;
    Ok(c)
}

/// Rejects writes to constants; `x init` is the one permitted write.
fn check_writable(target: &Expr, scope: &SymbolTable) -> Result<()> {
    match target {
        Expr::Store { name, init: false } if scope.lookup(name)?.change == ChangeMode::Const => {
            Err(CompileError::context(format!("cannot assign to constant {name}")))
        }
        Expr::Field { base, .. } if scope.lookup(base)?.change == ChangeMode::Const => Err(
            CompileError::context(format!("cannot assign to a field of constant record {base}")),
        ),
        _ => Ok(()),
    }
}

fn check_args(
    callee: &str,
    args: &[Expr],
    params: &[(String, VariableSignature)],
    scope: &SymbolTable,
    ctx: &CompilationContext,
) -> Result<Vec<Expr>> {
    if args.len() != params.len() {
        return Err(CompileError::context(format!(
            "{callee} expects {} arguments, got {}",
            params.len(),
            args.len()
        )));
    }
    let mut checked = Vec::with_capacity(args.len());
    for (i, (arg, (pname, p))) in args.iter().zip(params).enumerate() {
        let a = arg.check(scope, ctx)?;
        match p.mech {
            MechMode::Ref => {
                if !a.is_valid_left() {
                    return Err(CompileError::context(format!(
                        "argument {} of {callee} must be a location for ref parameter {pname}",
                        i + 1
                    )));
                }
                if p.change == ChangeMode::Var {
                    check_writable(&a, scope)?;
                }
            }
            MechMode::Copy => {
                if !a.is_valid_right() {
                    return Err(CompileError::context(format!(
                        "argument {} of {callee} cannot be read",
                        i + 1
                    )));
                }
            }
        }
        let at = a.type_of(scope, ctx)?;
        expect_type(&at, &p.ty, &format!("argument {} of {callee}", i + 1))?;
        checked.push(a);
    }
    Ok(checked)
}

fn expect_type(found: &Type, expected: &Type, location: &str) -> Result<()> {
    if found != expected {
        return Err(CompileError::type_mismatch(location, found, expected));
    }
    Ok(())
}

fn expect_int(found: &Type, location: &str) -> Result<u32> {
    match found {
        Type::Int(w) => Ok(*w),
        other => Err(CompileError::type_mismatch(location, other, "int")),
    }
}

fn field_path_type(base: &str, path: &[String], scope: &SymbolTable) -> Result<Type> {
    let mut ty = scope.lookup(base)?.ty.clone();
    let mut walked = base.to_string();
    for seg in path {
        let rec = match &ty {
            Type::Record(r) => r.clone(),
            other => {
                return Err(CompileError::context(format!(
                    "{walked} has type {other} and no field {seg}"
                )))
            }
        };
        let f = rec.field(seg).ok_or_else(|| {
            CompileError::context(format!("record {} has no field {seg}", rec.name))
        })?;
        ty = f.ty.clone();
        walked.push('.');
        walked.push_str(seg);
    }
    Ok(ty)
}

impl Expr {
    /// Validates the expression and returns its checked form; checking a
    /// checked expression returns it unchanged.
    pub fn check(&self, scope: &SymbolTable, ctx: &CompilationContext) -> Result<Expr> {
        match self {
            Expr::Bool(_) | Expr::Int(_) => Ok(self.clone()),
            Expr::Store { name, .. } => {
                scope.lookup(name)?;
                Ok(self.clone())
            }
            Expr::Call(name, args) => match ctx.callee(name) {
                Callee::Record(_) => Expr::RecordCall(name.clone(), args.clone()).check(scope, ctx),
                Callee::Function(sig) => Ok(Expr::Call(
                    name.clone(),
                    check_args(name, args, &sig.params, scope, ctx)?,
                )),
                Callee::Procedure(_) => Err(CompileError::type_mismatch(
                    format!("call of {name}"),
                    "procedure",
                    "function",
                )),
                Callee::Unknown => Err(CompileError::context(format!("unknown function: {name}"))),
            },
            Expr::RecordCall(name, args) => {
                let rec = match ctx.callee(name) {
                    Callee::Record(r) => r,
                    _ => return Err(CompileError::context(format!("unknown record: {name}"))),
                };
                if args.len() != rec.fields.len() {
                    return Err(CompileError::context(format!(
                        "record {name} has {} fields, got {} values",
                        rec.fields.len(),
                        args.len()
                    )));
                }
                let mut checked = Vec::with_capacity(args.len());
                for (a, f) in args.iter().zip(&rec.fields) {
                    let a = a.check(scope, ctx)?;
                    if !a.is_valid_right() {
                        return Err(CompileError::context(format!("{a} cannot be read")));
                    }
                    expect_type(
                        &a.type_of(scope, ctx)?,
                        &f.ty,
                        &format!("field {} of {name}", f.name),
                    )?;
                    checked.push(a);
                }
                Ok(Expr::RecordCall(name.clone(), checked))
            }
            Expr::Field { base, path } => {
                field_path_type(base, path, scope)?;
                Ok(self.clone())
            }
            Expr::Unary(op, e) => {
                let e = e.check(scope, ctx)?;
                if !e.is_valid_right() {
                    return Err(CompileError::context(format!("{e} cannot be read")));
                }
                let t = e.type_of(scope, ctx)?;
                let location = format!("operand of {}", op.to_string().trim());
                match op {
                    UnOp::Not => expect_type(&t, &Type::Bool, &location)?,
                    UnOp::Plus | UnOp::Minus => {
                        expect_int(&t, &location)?;
                    }
                }
                Ok(Expr::Unary(*op, Box::new(e)))
            }
            Expr::Binary(lhs, op, rhs) => {
                let l = lhs.check(scope, ctx)?;
                let r = rhs.check(scope, ctx)?;
                for side in [&l, &r] {
                    if !side.is_valid_right() {
                        return Err(CompileError::context(format!("{side} cannot be read")));
                    }
                }
                let lt = l.type_of(scope, ctx)?;
                let rt = r.type_of(scope, ctx)?;
                let location = format!("operand of {op}");
                match op {
                    BinOp::Cand | BinOp::Cor => {
                        expect_type(&lt, &Type::Bool, &location)?;
                        expect_type(&rt, &Type::Bool, &location)?;
                    }
                    BinOp::Eq | BinOp::Ne if lt == Type::Bool && rt == Type::Bool => {}
                    _ => {
                        expect_int(&lt, &location)?;
                        expect_int(&rt, &location)?;
                    }
                }
                Ok(Expr::Binary(Box::new(l), *op, Box::new(r)))
            }
        }
    }

    pub fn type_of(&self, scope: &SymbolTable, ctx: &CompilationContext) -> Result<Type> {
        match self {
            Expr::Bool(_) => Ok(Type::Bool),
            Expr::Int(_) => Ok(Type::Int(64)),
            Expr::Store { name, .. } => Ok(scope.lookup(name)?.ty.clone()),
            Expr::Call(name, _) | Expr::RecordCall(name, _) => match ctx.callee(name) {
                Callee::Function(sig) => sig.ret_type().cloned().ok_or_else(|| {
                    CompileError::Internal(format!("function {name} has no return slot"))
                }),
                Callee::Record(rec) => Ok(Type::Record(rec.clone())),
                Callee::Procedure(_) => Err(CompileError::type_mismatch(
                    format!("call of {name}"),
                    "procedure",
                    "function",
                )),
                Callee::Unknown => Err(CompileError::context(format!("unknown function: {name}"))),
            },
            Expr::Field { base, path } => field_path_type(base, path, scope),
            Expr::Unary(_, e) => e.type_of(scope, ctx),
            Expr::Binary(l, op, r) => match op {
                BinOp::Eq
                | BinOp::Ne
                | BinOp::Lt
                | BinOp::Gt
                | BinOp::Le
                | BinOp::Ge
                | BinOp::Cand
                | BinOp::Cor => Ok(Type::Bool),
                _ => {
                    let location = format!("operand of {op}");
                    let lw = expect_int(&l.type_of(scope, ctx)?, &location)?;
                    let rw = expect_int(&r.type_of(scope, ctx)?, &location)?;
                    Ok(Type::Int(lw.max(rw)))
                }
            },
        }
    }
}
