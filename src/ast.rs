use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowMode {
    #[default]
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MechMode {
    #[default]
    Copy,
    Ref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeMode {
    #[default]
    Const,
    Var,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub params: Vec<ProgParam>,
    pub decls: Vec<Decl>,
    pub cmds: Vec<Cmd>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgParam {
    pub flow: FlowMode,
    pub change: ChangeMode,
    pub ident: TypedIdent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedIdent {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Bool,
    Int(u32),
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Storage(StorageDecl),
    Record(RecordDecl),
    Procedure(ProcDecl),
    Function(FunDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageDecl {
    pub change: ChangeMode,
    pub ident: TypedIdent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordDecl {
    pub name: String,
    pub fields: Vec<TypedIdent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub flow: FlowMode,
    pub mech: MechMode,
    pub change: ChangeMode,
    pub ident: TypedIdent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalImport {
    pub flow: FlowMode,
    pub change: ChangeMode,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub imports: Vec<GlobalImport>,
    pub locals: Vec<StorageDecl>,
    pub body: Vec<Cmd>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: StorageDecl,
    pub imports: Vec<GlobalImport>,
    pub locals: Vec<StorageDecl>,
    pub body: Vec<Cmd>,
}

/// Borrowed view over the parts procedures and functions share.
pub struct RoutineDecl<'a> {
    pub name: &'a str,
    pub params: &'a [Param],
    pub ret: Option<&'a StorageDecl>,
    pub imports: &'a [GlobalImport],
    pub locals: &'a [StorageDecl],
    pub body: &'a [Cmd],
}

impl Decl {
    pub fn as_routine(&self) -> Option<RoutineDecl<'_>> {
        match self {
            Decl::Procedure(p) => Some(RoutineDecl {
                name: &p.name,
                params: &p.params,
                ret: None,
                imports: &p.imports,
                locals: &p.locals,
                body: &p.body,
            }),
            Decl::Function(f) => Some(RoutineDecl {
                name: &f.name,
                params: &f.params,
                ret: Some(&f.ret),
                imports: &f.imports,
                locals: &f.locals,
                body: &f.body,
            }),
            Decl::Storage(_) | Decl::Record(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    Skip,
    Assign(Expr, Expr),
    If(Expr, Vec<Cmd>, Vec<Cmd>),
    While(Expr, Vec<Cmd>),
    Call {
        name: String,
        args: Vec<Expr>,
        inits: Vec<String>,
    },
    DebugIn(Expr),
    DebugOut(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Times,
    DivE,
    DivF,
    DivT,
    ModE,
    ModF,
    ModT,
    Plus,
    Minus,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Cand,
    Cor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Int(i64),
    Store {
        name: String,
        init: bool,
    },
    /// Call of a function, or of a record name before checking.
    Call(String, Vec<Expr>),
    /// Record construction; only produced by the checker.
    RecordCall(String, Vec<Expr>),
    Field {
        base: String,
        path: Vec<String>,
    },
    Unary(UnOp, Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

impl Expr {
    /// `(valid as l-value, valid as r-value)`
    pub fn capabilities(&self) -> (bool, bool) {
        match self {
            Expr::Store { init, .. } => (true, !init),
            Expr::Field { .. } => (true, true),
            Expr::Bool(_)
            | Expr::Int(_)
            | Expr::Call(..)
            | Expr::RecordCall(..)
            | Expr::Unary(..)
            | Expr::Binary(..) => (false, true),
        }
    }

    pub fn is_valid_left(&self) -> bool {
        self.capabilities().0
    }

    pub fn is_valid_right(&self) -> bool {
        self.capabilities().1
    }
}

impl fmt::Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnOp::Not => "not ",
            UnOp::Plus => "+",
            UnOp::Minus => "-",
        })
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinOp::Times => "*",
            BinOp::DivE => "divE",
            BinOp::DivF => "divF",
            BinOp::DivT => "divT",
            BinOp::ModE => "modE",
            BinOp::ModF => "modF",
            BinOp::ModT => "modT",
            BinOp::Plus => "+",
            BinOp::Minus => "-",
            BinOp::Eq => "=",
            BinOp::Ne => "/=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Cand => "/\\?",
            BinOp::Cor => "\\/?",
        })
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, name: &str, args: &[Expr]) -> fmt::Result {
    write!(f, "{name}(")?;
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{a}")?;
    }
    f.write_str(")")
}

// Rendered text doubles as the label of debug I/O instructions.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Int(v) => write!(f, "{v}"),
            Expr::Store { name, init: false } => f.write_str(name),
            Expr::Store { name, init: true } => write!(f, "{name} init"),
            Expr::Call(name, args) | Expr::RecordCall(name, args) => write_args(f, name, args),
            Expr::Field { base, path } => write!(f, "{base}.{}", path.join(".")),
            Expr::Unary(op, e) => write!(f, "{op}{e}"),
            Expr::Binary(l, op, r) => write!(f, "({l} {op} {r})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str, init: bool) -> Expr {
        Expr::Store {
            name: name.to_string(),
            init,
        }
    }

    #[test]
    fn capability_pairs() {
        assert_eq!(store("x", false).capabilities(), (true, true));
        assert_eq!(store("x", true).capabilities(), (true, false));
        assert_eq!(Expr::Int(3).capabilities(), (false, true));
        let field = Expr::Field {
            base: "r".into(),
            path: vec!["a".into()],
        };
        assert!(field.is_valid_left() && field.is_valid_right());
        let call = Expr::Call("f".into(), vec![]);
        assert!(!call.is_valid_left());
    }

    #[test]
    fn labels_render_source_form() {
        let e = Expr::Binary(
            Box::new(store("x", false)),
            BinOp::DivE,
            Box::new(Expr::Unary(UnOp::Minus, Box::new(Expr::Int(2)))),
        );
        assert_eq!(e.to_string(), "(x divE -2)");
        let f = Expr::Field {
            base: "p".into(),
            path: vec!["q".into(), "r".into()],
        };
        assert_eq!(f.to_string(), "p.q.r");
        assert_eq!(store("y", true).to_string(), "y init");
    }
}
