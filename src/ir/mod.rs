use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CheckerConfig;
use crate::parser::type_annotations::{parse_bound, parse_type};

pub mod build;

/// Name used for a binding whose type is not known until its first assignment
/// (`let r;`).
pub const INFERRED_TYPE: &str = "_";

/// Lifetime name of `'static`, stored without the apostrophe like every other
/// lifetime in the IR.
pub const STATIC_LIFETIME: &str = "static";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrProgram {
    #[serde(default)]
    pub config: Option<CheckerConfig>,
    #[serde(default)]
    pub types: Vec<TypeDecl>,
    #[serde(default)]
    pub functions: Vec<IrFunction>,
}

/// A user-declared aggregate type (`struct Holder<'a> { r: &'a String }`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default)]
    pub lifetimes: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    /// `Some(true)` marks a type as holding an external resource even when no
    /// field does; `Some(false)` exempts a type whose fields own resources.
    #[serde(default)]
    pub owns_resource: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFunction {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub ret: Option<TypeExpr>,
    /// Outlives bounds from the signature's `where` clause, e.g. `'a: 'b`
    #[serde(default)]
    pub bounds: Vec<LifetimeBound>,
    #[serde(default)]
    pub body: Vec<IrStatement>,
    /// Signature-only declaration: callable, but its body is not checked
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub line: usize,
}

impl IrFunction {
    /// The receiver is the first parameter when it is named `self`.
    pub fn receiver(&self) -> Option<&Param> {
        self.params.first().filter(|p| p.name == "self")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
    #[serde(default)]
    pub mutable: bool,
}

/// `'longer: 'shorter`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LifetimeBound {
    pub longer: String,
    pub shorter: String,
}

impl TryFrom<String> for LifetimeBound {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_bound(&value)
    }
}

impl From<LifetimeBound> for String {
    fn from(bound: LifetimeBound) -> Self {
        bound.to_string()
    }
}

impl fmt::Display for LifetimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}: '{}", self.longer, self.shorter)
    }
}

/// Syntactic type as written in the IR. Serialized as its display string,
/// e.g. `"&'a mut Vec<String>"` or `"Holder<'a>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeExpr {
    Named {
        name: String,
        lifetimes: Vec<String>,
        args: Vec<TypeExpr>,
    },
    Ref {
        mutable: bool,
        lifetime: Option<String>,
        inner: Box<TypeExpr>,
    },
}

impl TypeExpr {
    pub fn named(name: &str) -> Self {
        TypeExpr::Named {
            name: name.to_string(),
            lifetimes: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn generic(name: &str, args: Vec<TypeExpr>) -> Self {
        TypeExpr::Named {
            name: name.to_string(),
            lifetimes: Vec::new(),
            args,
        }
    }

    pub fn reference(inner: TypeExpr, mutable: bool, lifetime: Option<&str>) -> Self {
        TypeExpr::Ref {
            mutable,
            lifetime: lifetime.map(str::to_string),
            inner: Box::new(inner),
        }
    }

    pub fn unit() -> Self {
        Self::named("()")
    }

    pub fn inferred() -> Self {
        Self::named(INFERRED_TYPE)
    }

    pub fn is_inferred(&self) -> bool {
        matches!(self, TypeExpr::Named { name, .. } if name == INFERRED_TYPE)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, TypeExpr::Ref { .. })
    }

    pub fn is_mutable_reference(&self) -> bool {
        matches!(self, TypeExpr::Ref { mutable: true, .. })
    }

    /// Name of the outermost named type, looking through references.
    pub fn base_name(&self) -> &str {
        match self {
            TypeExpr::Named { name, .. } => name,
            TypeExpr::Ref { inner, .. } => inner.base_name(),
        }
    }

    pub fn args(&self) -> &[TypeExpr] {
        match self {
            TypeExpr::Named { args, .. } => args,
            TypeExpr::Ref { .. } => &[],
        }
    }

    /// Strips every layer of reference.
    pub fn referent(&self) -> &TypeExpr {
        match self {
            TypeExpr::Ref { inner, .. } => inner.referent(),
            named => named,
        }
    }

    /// All lifetime names written anywhere in the type, outermost first.
    pub fn lifetimes(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_lifetimes(&mut out);
        out
    }

    fn collect_lifetimes(&self, out: &mut Vec<String>) {
        match self {
            TypeExpr::Named { lifetimes, args, .. } => {
                for lt in lifetimes {
                    if !out.contains(lt) {
                        out.push(lt.clone());
                    }
                }
                for arg in args {
                    arg.collect_lifetimes(out);
                }
            }
            TypeExpr::Ref { lifetime, inner, .. } => {
                if let Some(lt) = lifetime {
                    if !out.contains(lt) {
                        out.push(lt.clone());
                    }
                }
                inner.collect_lifetimes(out);
            }
        }
    }
}

impl TryFrom<String> for TypeExpr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_type(&value)
    }
}

impl From<TypeExpr> for String {
    fn from(ty: TypeExpr) -> Self {
        ty.to_string()
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Named { name, lifetimes, args } => {
                write!(f, "{}", name)?;
                if lifetimes.is_empty() && args.is_empty() {
                    return Ok(());
                }
                let parts: Vec<String> = lifetimes
                    .iter()
                    .map(|lt| format!("'{}", lt))
                    .chain(args.iter().map(|a| a.to_string()))
                    .collect();
                write!(f, "<{}>", parts.join(", "))
            }
            TypeExpr::Ref { mutable, lifetime, inner } => {
                write!(f, "&")?;
                if let Some(lt) = lifetime {
                    write!(f, "'{} ", lt)?;
                }
                if *mutable {
                    write!(f, "mut ")?;
                }
                write!(f, "{}", inner)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrStatement {
    /// `let [mut] name[: ty] [= init];`
    Let {
        name: String,
        #[serde(default)]
        ty: Option<TypeExpr>,
        #[serde(default)]
        mutable: bool,
        #[serde(default)]
        init: Option<IrExpression>,
        #[serde(default)]
        line: usize,
    },
    Assign {
        target: String,
        value: IrExpression,
        #[serde(default)]
        line: usize,
    },
    /// Read of a binding (through it, for references)
    Use {
        name: String,
        #[serde(default)]
        line: usize,
    },
    /// In-place mutation of a binding (through it, for references)
    Write {
        name: String,
        #[serde(default)]
        line: usize,
    },
    /// Expression statement; the result is a temporary
    Eval {
        expr: IrExpression,
        #[serde(default)]
        line: usize,
    },
    Block {
        body: Vec<IrStatement>,
    },
    If {
        then_branch: Vec<IrStatement>,
        #[serde(default)]
        else_branch: Option<Vec<IrStatement>>,
        #[serde(default)]
        line: usize,
    },
    /// Zero or more iterations of `body`
    Loop {
        body: Vec<IrStatement>,
        #[serde(default)]
        line: usize,
    },
    Break {
        #[serde(default)]
        line: usize,
    },
    Return {
        #[serde(default)]
        value: Option<IrExpression>,
        #[serde(default)]
        line: usize,
    },
    /// Unwinds every open scope of the current function
    Panic {
        #[serde(default)]
        line: usize,
    },
    Spawn {
        #[serde(default)]
        handle: Option<String>,
        #[serde(default)]
        captures: Vec<Capture>,
        body: Vec<IrStatement>,
        #[serde(default)]
        line: usize,
    },
    Join {
        handle: String,
        #[serde(default)]
        line: usize,
    },
}

impl IrStatement {
    pub fn line(&self) -> usize {
        match self {
            IrStatement::Let { line, .. }
            | IrStatement::Assign { line, .. }
            | IrStatement::Use { line, .. }
            | IrStatement::Write { line, .. }
            | IrStatement::Eval { line, .. }
            | IrStatement::If { line, .. }
            | IrStatement::Loop { line, .. }
            | IrStatement::Break { line }
            | IrStatement::Return { line, .. }
            | IrStatement::Panic { line }
            | IrStatement::Spawn { line, .. }
            | IrStatement::Join { line, .. } => *line,
            IrStatement::Block { .. } => 0,
        }
    }

    /// Number of program points this statement occupies: one for itself plus
    /// one per nested statement, numbered in pre-order.
    pub fn span(&self) -> usize {
        1 + match self {
            IrStatement::Block { body } | IrStatement::Loop { body, .. } | IrStatement::Spawn { body, .. } => {
                block_span(body)
            }
            IrStatement::If { then_branch, else_branch, .. } => {
                block_span(then_branch) + else_branch.as_deref().map_or(0, block_span)
            }
            _ => 0,
        }
    }

    /// Sets the source line reported in diagnostics for this statement.
    pub fn at(mut self, new_line: usize) -> Self {
        match &mut self {
            IrStatement::Let { line, .. }
            | IrStatement::Assign { line, .. }
            | IrStatement::Use { line, .. }
            | IrStatement::Write { line, .. }
            | IrStatement::Eval { line, .. }
            | IrStatement::If { line, .. }
            | IrStatement::Loop { line, .. }
            | IrStatement::Break { line }
            | IrStatement::Return { line, .. }
            | IrStatement::Panic { line }
            | IrStatement::Spawn { line, .. }
            | IrStatement::Join { line, .. } => *line = new_line,
            IrStatement::Block { .. } => {}
        }
        self
    }
}

pub fn block_span(body: &[IrStatement]) -> usize {
    body.iter().map(IrStatement::span).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub name: String,
    #[serde(default)]
    pub mode: CaptureMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Move,
    Ref,
    MutRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrExpression {
    /// By-value use: moves non-`Copy` values, copies `Copy` ones
    Var(String),
    /// `&name` / `&mut name`
    Ref {
        name: String,
        #[serde(default)]
        mutable: bool,
    },
    /// A fresh value of the given type (constructor, literal, allocation)
    New(TypeExpr),
    Clone(String),
    Call {
        func: String,
        #[serde(default)]
        args: Vec<IrExpression>,
    },
    /// One of several candidates, chosen at run time
    Cond(Vec<IrExpression>),
    Struct {
        ty: TypeExpr,
        #[serde(default)]
        fields: Vec<FieldInit>,
    },
    /// `name.lock()` on a `Mutex` (possibly behind `Arc` or a reference)
    Lock(String),
    /// `Rc::downgrade(&name)` / `Arc::downgrade(&name)`
    Downgrade(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInit {
    pub name: String,
    pub value: IrExpression,
}
