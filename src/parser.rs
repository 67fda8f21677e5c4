use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use crate::ast::*;
use crate::error::{CompileError, Result};

#[derive(Parser)]
#[grammar = "iml.pest"]
struct ImlParser;

pub fn parse_program(src: &str) -> Result<Program> {
    scan_alphabet(src)?;
    let mut pairs = ImlParser::parse(Rule::program, src).map_err(|e| {
        let (line, col) = match e.line_col {
            pest::error::LineColLocation::Pos((l, c)) => (l, c),
            pest::error::LineColLocation::Span((l, c), _) => (l, c),
        };
        CompileError::Grammar(format!(
            "line {line}, column {col}: {}",
            e.variant.message()
        ))
    })?;
    let p = pairs
        .next()
        .ok_or_else(|| CompileError::Grammar("empty program".into()))?;
    build_program(p)
}

fn is_iml_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c.is_ascii_whitespace()
        || "_(),;:.=/\\<>+-*?".contains(c)
}

/// Reports the first character no token can start with, ignoring comments.
fn scan_alphabet(src: &str) -> Result<()> {
    for (li, line) in src.lines().enumerate() {
        let code = line.split("//").next().unwrap_or("");
        if let Some((ci, c)) = code.chars().enumerate().find(|(_, c)| !is_iml_char(*c)) {
            return Err(CompileError::Lexical(format!(
                "line {}, column {}: unexpected character {c:?}",
                li + 1,
                ci + 1
            )));
        }
    }
    Ok(())
}

fn next<'i>(it: &mut Pairs<'i, Rule>, what: &str) -> Result<Pair<'i, Rule>> {
    it.next()
        .ok_or_else(|| CompileError::Grammar(format!("missing {what}")))
}

fn unexpected(p: &Pair<Rule>) -> CompileError {
    CompileError::Internal(format!("unexpected {:?} in syntax tree", p.as_rule()))
}

fn build_program(p: Pair<Rule>) -> Result<Program> {
    let mut it = p.into_inner();
    let name = next(&mut it, "program name")?.as_str().to_string();
    let params = next(&mut it, "program parameters")?
        .into_inner()
        .map(build_prog_param)
        .collect::<Result<Vec<_>>>()?;
    let mut decls = vec![];
    let mut cmds = vec![];
    for x in it {
        match x.as_rule() {
            Rule::cps_decl => {
                decls = x.into_inner().map(build_decl).collect::<Result<Vec<_>>>()?;
            }
            Rule::cps_cmd => cmds = build_cmds(x)?,
            _ => {}
        }
    }
    Ok(Program {
        name,
        params,
        decls,
        cmds,
    })
}

fn build_flowmode(p: &Pair<Rule>) -> FlowMode {
    match p.as_str() {
        "out" => FlowMode::Out,
        "inout" => FlowMode::InOut,
        _ => FlowMode::In,
    }
}

fn build_mechmode(p: &Pair<Rule>) -> MechMode {
    match p.as_str() {
        "ref" => MechMode::Ref,
        _ => MechMode::Copy,
    }
}

fn build_changemode(p: &Pair<Rule>) -> ChangeMode {
    match p.as_str() {
        "var" => ChangeMode::Var,
        _ => ChangeMode::Const,
    }
}

fn build_prog_param(p: Pair<Rule>) -> Result<ProgParam> {
    let mut flow = FlowMode::default();
    let mut change = ChangeMode::default();
    let mut ident = None;
    for x in p.into_inner() {
        match x.as_rule() {
            Rule::flowmode => flow = build_flowmode(&x),
            Rule::changemode => change = build_changemode(&x),
            Rule::typed_ident => ident = Some(build_typed_ident(x)?),
            _ => return Err(unexpected(&x)),
        }
    }
    Ok(ProgParam {
        flow,
        change,
        ident: ident.ok_or_else(|| CompileError::Grammar("missing parameter name".into()))?,
    })
}

fn build_typed_ident(p: Pair<Rule>) -> Result<TypedIdent> {
    let mut it = p.into_inner();
    let name = next(&mut it, "identifier")?.as_str().to_string();
    let t = next(&mut it, "type")?;
    let ty = match (t.as_rule(), t.as_str()) {
        (Rule::prim_type, "bool") => TypeRef::Bool,
        (Rule::prim_type, "int32") => TypeRef::Int(32),
        (Rule::prim_type, "int64") => TypeRef::Int(64),
        (Rule::prim_type, "int1024") => TypeRef::Int(1024),
        (Rule::ident, n) => TypeRef::Named(n.to_string()),
        _ => return Err(unexpected(&t)),
    };
    Ok(TypedIdent { name, ty })
}

fn build_sto_decl(p: Pair<Rule>) -> Result<StorageDecl> {
    let mut change = ChangeMode::default();
    let mut ident = None;
    for x in p.into_inner() {
        match x.as_rule() {
            Rule::changemode => change = build_changemode(&x),
            Rule::typed_ident => ident = Some(build_typed_ident(x)?),
            _ => return Err(unexpected(&x)),
        }
    }
    Ok(StorageDecl {
        change,
        ident: ident.ok_or_else(|| CompileError::Grammar("missing declaration name".into()))?,
    })
}

fn build_param(p: Pair<Rule>) -> Result<Param> {
    let mut flow = FlowMode::default();
    let mut mech = MechMode::default();
    let mut change = ChangeMode::default();
    let mut ident = None;
    for x in p.into_inner() {
        match x.as_rule() {
            Rule::flowmode => flow = build_flowmode(&x),
            Rule::mechmode => mech = build_mechmode(&x),
            Rule::changemode => change = build_changemode(&x),
            Rule::typed_ident => ident = Some(build_typed_ident(x)?),
            _ => return Err(unexpected(&x)),
        }
    }
    Ok(Param {
        flow,
        mech,
        change,
        ident: ident.ok_or_else(|| CompileError::Grammar("missing parameter name".into()))?,
    })
}

fn build_glob_imp(p: Pair<Rule>) -> Result<GlobalImport> {
    let mut flow = FlowMode::default();
    let mut change = ChangeMode::default();
    let mut name = None;
    for x in p.into_inner() {
        match x.as_rule() {
            Rule::flowmode => flow = build_flowmode(&x),
            Rule::changemode => change = build_changemode(&x),
            Rule::ident => name = Some(x.as_str().to_string()),
            _ => return Err(unexpected(&x)),
        }
    }
    Ok(GlobalImport {
        flow,
        change,
        name: name.ok_or_else(|| CompileError::Grammar("missing import name".into()))?,
    })
}

/// Parameters, imports, locals and body shared by `proc` and `fun`.
struct RoutineParts {
    params: Vec<Param>,
    ret: Option<StorageDecl>,
    imports: Vec<GlobalImport>,
    locals: Vec<StorageDecl>,
    body: Vec<Cmd>,
}

fn build_routine_parts(it: Pairs<Rule>) -> Result<RoutineParts> {
    let mut parts = RoutineParts {
        params: vec![],
        ret: None,
        imports: vec![],
        locals: vec![],
        body: vec![],
    };
    for x in it {
        match x.as_rule() {
            Rule::param_list => {
                parts.params = x.into_inner().map(build_param).collect::<Result<Vec<_>>>()?
            }
            Rule::sto_decl => parts.ret = Some(build_sto_decl(x)?),
            Rule::glob_imps => {
                parts.imports = x
                    .into_inner()
                    .map(build_glob_imp)
                    .collect::<Result<Vec<_>>>()?
            }
            Rule::local_decls => {
                parts.locals = x
                    .into_inner()
                    .map(build_sto_decl)
                    .collect::<Result<Vec<_>>>()?
            }
            Rule::cps_cmd => parts.body = build_cmds(x)?,
            _ => return Err(unexpected(&x)),
        }
    }
    Ok(parts)
}

fn build_decl(p: Pair<Rule>) -> Result<Decl> {
    match p.as_rule() {
        Rule::sto_decl => Ok(Decl::Storage(build_sto_decl(p)?)),
        Rule::record_decl => {
            let mut it = p.into_inner();
            let name = next(&mut it, "record name")?.as_str().to_string();
            let fields = it.map(build_typed_ident).collect::<Result<Vec<_>>>()?;
            Ok(Decl::Record(RecordDecl { name, fields }))
        }
        Rule::proc_decl => {
            let mut it = p.into_inner();
            let name = next(&mut it, "procedure name")?.as_str().to_string();
            let parts = build_routine_parts(it)?;
            Ok(Decl::Procedure(ProcDecl {
                name,
                params: parts.params,
                imports: parts.imports,
                locals: parts.locals,
                body: parts.body,
            }))
        }
        Rule::fun_decl => {
            let mut it = p.into_inner();
            let name = next(&mut it, "function name")?.as_str().to_string();
            let parts = build_routine_parts(it)?;
            let ret = parts
                .ret
                .ok_or_else(|| CompileError::Grammar(format!("function {name} lacks a return value")))?;
            Ok(Decl::Function(FunDecl {
                name,
                params: parts.params,
                ret,
                imports: parts.imports,
                locals: parts.locals,
                body: parts.body,
            }))
        }
        _ => Err(unexpected(&p)),
    }
}

fn build_cmds(p: Pair<Rule>) -> Result<Vec<Cmd>> {
    p.into_inner().map(build_cmd).collect()
}

fn build_cmd(p: Pair<Rule>) -> Result<Cmd> {
    match p.as_rule() {
        Rule::skip_cmd => Ok(Cmd::Skip),
        Rule::assign_cmd => {
            let mut it = p.into_inner();
            let lhs = build_expr(next(&mut it, "assignment target")?)?;
            let rhs = build_expr(next(&mut it, "assigned value")?)?;
            Ok(Cmd::Assign(lhs, rhs))
        }
        Rule::if_cmd => {
            let mut it = p.into_inner();
            let cond = build_expr(next(&mut it, "if condition")?)?;
            let then_cmds = build_cmds(next(&mut it, "then branch")?)?;
            let else_cmds = match it.next() {
                Some(e) => build_cmds(next(&mut e.into_inner(), "else branch")?)?,
                None => vec![],
            };
            Ok(Cmd::If(cond, then_cmds, else_cmds))
        }
        Rule::while_cmd => {
            let mut it = p.into_inner();
            let cond = build_expr(next(&mut it, "while condition")?)?;
            let body = build_cmds(next(&mut it, "loop body")?)?;
            Ok(Cmd::While(cond, body))
        }
        Rule::call_cmd => {
            let mut it = p.into_inner();
            let name = next(&mut it, "procedure name")?.as_str().to_string();
            let args = build_expr_list(next(&mut it, "argument list")?)?;
            let inits = match it.next() {
                Some(g) => g
                    .into_inner()
                    .filter(|x| x.as_rule() == Rule::ident)
                    .map(|x| x.as_str().to_string())
                    .collect(),
                None => vec![],
            };
            Ok(Cmd::Call { name, args, inits })
        }
        Rule::debugin_cmd => Ok(Cmd::DebugIn(build_expr(next(
            &mut p.into_inner(),
            "debugin target",
        )?)?)),
        Rule::debugout_cmd => Ok(Cmd::DebugOut(build_expr(next(
            &mut p.into_inner(),
            "debugout value",
        )?)?)),
        _ => Err(unexpected(&p)),
    }
}

fn build_expr_list(p: Pair<Rule>) -> Result<Vec<Expr>> {
    p.into_inner().map(build_expr).collect()
}

fn build_binop(p: &Pair<Rule>) -> Result<BinOp> {
    Ok(match p.as_str() {
        "*" => BinOp::Times,
        "divE" => BinOp::DivE,
        "divF" => BinOp::DivF,
        "divT" => BinOp::DivT,
        "modE" => BinOp::ModE,
        "modF" => BinOp::ModF,
        "modT" => BinOp::ModT,
        "+" => BinOp::Plus,
        "-" => BinOp::Minus,
        "=" => BinOp::Eq,
        "/=" => BinOp::Ne,
        "<" => BinOp::Lt,
        ">" => BinOp::Gt,
        "<=" => BinOp::Le,
        ">=" => BinOp::Ge,
        "/\\?" => BinOp::Cand,
        "\\/?" => BinOp::Cor,
        _ => return Err(unexpected(p)),
    })
}

fn build_int(p: &Pair<Rule>) -> Result<Expr> {
    let (line, col) = p.line_col();
    match p.as_str().parse::<i64>() {
        Ok(v) if v <= i64::from(i32::MAX) => Ok(Expr::Int(v)),
        _ => Err(CompileError::Lexical(format!(
            "line {line}, column {col}: integer literal {} is too large",
            p.as_str()
        ))),
    }
}

fn build_expr(p: Pair<Rule>) -> Result<Expr> {
    match p.as_rule() {
        // left-associative chains
        Rule::expr | Rule::term1 | Rule::term2 | Rule::term3 => {
            let mut it = p.into_inner();
            let mut e = build_expr(next(&mut it, "operand")?)?;
            while let Some(op) = it.next() {
                let rhs = build_expr(next(&mut it, "right operand")?)?;
                e = Expr::Binary(Box::new(e), build_binop(&op)?, Box::new(rhs));
            }
            Ok(e)
        }
        Rule::int_lit => build_int(&p),
        Rule::bool_lit => Ok(Expr::Bool(p.as_str() == "true")),
        Rule::ident_factor => Ok(Expr::Store {
            name: p.as_str().trim().to_string(),
            init: false,
        }),
        Rule::init_factor => {
            let name = next(&mut p.into_inner(), "identifier")?.as_str().to_string();
            Ok(Expr::Store { name, init: true })
        }
        Rule::call_factor => {
            let mut it = p.into_inner();
            let name = next(&mut it, "function name")?.as_str().to_string();
            let args = build_expr_list(next(&mut it, "argument list")?)?;
            Ok(Expr::Call(name, args))
        }
        Rule::record_access => {
            let mut it = p.into_inner();
            let base = next(&mut it, "record name")?.as_str().to_string();
            let path = it.map(|x| x.as_str().to_string()).collect();
            Ok(Expr::Field { base, path })
        }
        Rule::monadic_factor => {
            let mut it = p.into_inner();
            let op = match next(&mut it, "operator")?.as_str() {
                "not" => UnOp::Not,
                "+" => UnOp::Plus,
                _ => UnOp::Minus,
            };
            let operand = build_expr(next(&mut it, "operand")?)?;
            Ok(Expr::Unary(op, Box::new(operand)))
        }
        _ => Err(unexpected(&p)),
    }
}
