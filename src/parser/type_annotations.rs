// Type and lifetime annotation strings used inside serialized IR.
//
// Grammar:
//   type   := '&' lifetime? 'mut'? type
//           | '()'
//           | ident ( '<' arg (',' arg)* '>' )?
//   arg    := lifetime | type
//   bound  := lifetime ':' lifetime
//
// Lifetimes are stored without the leading apostrophe.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ir::{LifetimeBound, TypeExpr};

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s*(&|<|>|,|\(\)|'[A-Za-z_][A-Za-z0-9_]*|[A-Za-z_][A-Za-z0-9_]*(?:::[A-Za-z_][A-Za-z0-9_]*)*)")
        .unwrap()
});

static BOUND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*'([A-Za-z_][A-Za-z0-9_]*)\s*:\s*'([A-Za-z_][A-Za-z0-9_]*)\s*$").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Amp,
    Lt,
    Gt,
    Comma,
    Unit,
    Lifetime(String),
    Ident(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while !rest.trim_start().is_empty() {
        let caps = TOKEN_RE
            .captures(rest)
            .filter(|c| c.get(0).is_some_and(|m| m.start() == 0))
            .ok_or_else(|| format!("unexpected input at `{}`", rest.trim_start()))?;
        let whole = caps.get(0).map(|m| m.end()).unwrap_or(rest.len());
        let text = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        tokens.push(match text {
            "&" => Token::Amp,
            "<" => Token::Lt,
            ">" => Token::Gt,
            "," => Token::Comma,
            "()" => Token::Unit,
            lt if lt.starts_with('\'') => Token::Lifetime(lt[1..].to_string()),
            ident => Token::Ident(ident.to_string()),
        });
        rest = &rest[whole..];
    }
    Ok(tokens)
}

struct TypeParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl TypeParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_type(&mut self) -> Result<TypeExpr, String> {
        match self.next() {
            Some(Token::Amp) => {
                let lifetime = match self.peek() {
                    Some(Token::Lifetime(lt)) => {
                        let lt = lt.clone();
                        self.pos += 1;
                        Some(lt)
                    }
                    _ => None,
                };
                let mutable = matches!(self.peek(), Some(Token::Ident(kw)) if kw == "mut");
                if mutable {
                    self.pos += 1;
                }
                let inner = self.parse_type()?;
                Ok(TypeExpr::Ref {
                    mutable,
                    lifetime,
                    inner: Box::new(inner),
                })
            }
            Some(Token::Unit) => Ok(TypeExpr::unit()),
            Some(Token::Ident(name)) => {
                let mut lifetimes = Vec::new();
                let mut args = Vec::new();
                if self.peek() == Some(&Token::Lt) {
                    self.pos += 1;
                    loop {
                        match self.peek() {
                            Some(Token::Lifetime(lt)) => {
                                lifetimes.push(lt.clone());
                                self.pos += 1;
                            }
                            Some(_) => args.push(self.parse_type()?),
                            None => return Err(format!("unclosed `<` after `{}`", name)),
                        }
                        match self.next() {
                            Some(Token::Comma) => continue,
                            Some(Token::Gt) => break,
                            other => return Err(format!("expected `,` or `>`, found {:?}", other)),
                        }
                    }
                }
                Ok(TypeExpr::Named { name, lifetimes, args })
            }
            other => Err(format!("expected a type, found {:?}", other)),
        }
    }
}

/// Parses a type string such as `&'a mut Vec<String>` or `Holder<'a>`.
pub fn parse_type(input: &str) -> Result<TypeExpr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty type".to_string());
    }
    let mut parser = TypeParser { tokens, pos: 0 };
    let ty = parser.parse_type()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("trailing input in type `{}`", input));
    }
    Ok(ty)
}

/// Parses an outlives bound of the form `'a: 'b`.
pub fn parse_bound(input: &str) -> Result<LifetimeBound, String> {
    let caps = BOUND_RE
        .captures(input)
        .ok_or_else(|| format!("invalid lifetime bound `{}`, expected `'a: 'b`", input))?;
    Ok(LifetimeBound {
        longer: caps[1].to_string(),
        shorter: caps[2].to_string(),
    })
}
