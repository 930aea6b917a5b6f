//! Shorthand constructors for IR, used by tests and by hosts that build
//! programs in code rather than loading them from JSON.

use super::{Capture, CaptureMode, FieldInit, IrExpression, IrFunction, IrStatement, Param, TypeExpr};
use crate::parser::type_annotations::parse_type;

/// Parses a type literal. Every helper here that takes a type string goes
/// through it; use `parse_type` for text that is not a literal.
///
/// # Panics
///
/// Panics if `s` is not a well-formed type.
pub fn ty(s: &str) -> TypeExpr {
    parse_type(s).unwrap_or_else(|e| panic!("invalid type literal `{}`: {}", s, e))
}

pub fn function(name: &str, body: Vec<IrStatement>) -> IrFunction {
    IrFunction {
        name: name.to_string(),
        params: Vec::new(),
        ret: None,
        bounds: Vec::new(),
        body,
        external: false,
        line: 0,
    }
}

pub fn param(name: &str, type_str: &str) -> Param {
    Param {
        name: name.to_string(),
        ty: ty(type_str),
        mutable: false,
    }
}

pub fn let_(name: &str, init: IrExpression) -> IrStatement {
    IrStatement::Let {
        name: name.to_string(),
        ty: None,
        mutable: false,
        init: Some(init),
        line: 0,
    }
}

pub fn let_mut(name: &str, init: IrExpression) -> IrStatement {
    IrStatement::Let {
        name: name.to_string(),
        ty: None,
        mutable: true,
        init: Some(init),
        line: 0,
    }
}

/// `let name;`
pub fn let_uninit(name: &str) -> IrStatement {
    IrStatement::Let {
        name: name.to_string(),
        ty: None,
        mutable: false,
        init: None,
        line: 0,
    }
}

pub fn assign(target: &str, value: IrExpression) -> IrStatement {
    IrStatement::Assign {
        target: target.to_string(),
        value,
        line: 0,
    }
}

pub fn use_(name: &str) -> IrStatement {
    IrStatement::Use {
        name: name.to_string(),
        line: 0,
    }
}

pub fn write(name: &str) -> IrStatement {
    IrStatement::Write {
        name: name.to_string(),
        line: 0,
    }
}

pub fn eval(expr: IrExpression) -> IrStatement {
    IrStatement::Eval { expr, line: 0 }
}

pub fn block(body: Vec<IrStatement>) -> IrStatement {
    IrStatement::Block { body }
}

pub fn if_(then_branch: Vec<IrStatement>, else_branch: Option<Vec<IrStatement>>) -> IrStatement {
    IrStatement::If {
        then_branch,
        else_branch,
        line: 0,
    }
}

pub fn loop_(body: Vec<IrStatement>) -> IrStatement {
    IrStatement::Loop { body, line: 0 }
}

pub fn break_() -> IrStatement {
    IrStatement::Break { line: 0 }
}

pub fn ret(value: Option<IrExpression>) -> IrStatement {
    IrStatement::Return { value, line: 0 }
}

pub fn panic() -> IrStatement {
    IrStatement::Panic { line: 0 }
}

pub fn spawn(handle: Option<&str>, captures: Vec<Capture>, body: Vec<IrStatement>) -> IrStatement {
    IrStatement::Spawn {
        handle: handle.map(str::to_string),
        captures,
        body,
        line: 0,
    }
}

pub fn join(handle: &str) -> IrStatement {
    IrStatement::Join {
        handle: handle.to_string(),
        line: 0,
    }
}

pub fn capture(name: &str, mode: CaptureMode) -> Capture {
    Capture {
        name: name.to_string(),
        mode,
    }
}

pub fn var(name: &str) -> IrExpression {
    IrExpression::Var(name.to_string())
}

pub fn new(type_str: &str) -> IrExpression {
    IrExpression::New(ty(type_str))
}

pub fn borrow(name: &str) -> IrExpression {
    IrExpression::Ref {
        name: name.to_string(),
        mutable: false,
    }
}

pub fn borrow_mut(name: &str) -> IrExpression {
    IrExpression::Ref {
        name: name.to_string(),
        mutable: true,
    }
}

pub fn clone(name: &str) -> IrExpression {
    IrExpression::Clone(name.to_string())
}

pub fn call(func: &str, args: Vec<IrExpression>) -> IrExpression {
    IrExpression::Call {
        func: func.to_string(),
        args,
    }
}

pub fn cond(candidates: Vec<IrExpression>) -> IrExpression {
    IrExpression::Cond(candidates)
}

pub fn struct_(type_str: &str, fields: Vec<(&str, IrExpression)>) -> IrExpression {
    IrExpression::Struct {
        ty: ty(type_str),
        fields: fields
            .into_iter()
            .map(|(name, value)| FieldInit {
                name: name.to_string(),
                value,
            })
            .collect(),
    }
}

pub fn lock(name: &str) -> IrExpression {
    IrExpression::Lock(name.to_string())
}

pub fn downgrade(name: &str) -> IrExpression {
    IrExpression::Downgrade(name.to_string())
}
