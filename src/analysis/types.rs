//! Value/type registry.
//!
//! Every type is classified once, at registration, into a closed `ValueKind`.
//! Use sites only ever look the classification up.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::debug_println;
use crate::diagnostics::BorrowError;
use crate::ir::{TypeDecl, TypeExpr, INFERRED_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    /// Duplicated bitwise on assignment; never moved
    Copy,
    /// Moved on assignment and released exactly once
    Owning,
    /// Moved on assignment, nothing to release
    Move,
}

impl ValueKind {
    pub fn is_copy(self) -> bool {
        self == ValueKind::Copy
    }

    pub fn owns_resource(self) -> bool {
        self == ValueKind::Owning
    }

    /// Classification of an aggregate from its parts.
    fn combine(kinds: impl IntoIterator<Item = ValueKind>) -> ValueKind {
        let mut result = ValueKind::Copy;
        for kind in kinds {
            match kind {
                ValueKind::Owning => return ValueKind::Owning,
                ValueKind::Move => result = ValueKind::Move,
                ValueKind::Copy => {}
            }
        }
        result
    }
}

/// Reference-counted handle flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SharedKind {
    Rc,
    Arc,
}

impl SharedKind {
    pub fn is_atomic(self) -> bool {
        self == SharedKind::Arc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Fixed(ValueKind),
    /// `Option<T>` and friends: classified like their arguments
    FromArgs,
    Shared(SharedKind),
    Weak,
    Mutex,
    Guard,
}

static BUILTINS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for name in [
        "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32", "u64", "u128", "usize",
        "f32", "f64", "bool", "char", "str", "()",
    ] {
        table.insert(name, Builtin::Fixed(ValueKind::Copy));
    }
    for name in ["String", "Vec", "Box", "File", "HashMap", "HashSet", "BTreeMap", "VecDeque", "JoinHandle"] {
        table.insert(name, Builtin::Fixed(ValueKind::Owning));
    }
    table.insert("Option", Builtin::FromArgs);
    table.insert("Rc", Builtin::Shared(SharedKind::Rc));
    table.insert("Arc", Builtin::Shared(SharedKind::Arc));
    table.insert("Weak", Builtin::Weak);
    table.insert("Mutex", Builtin::Mutex);
    table.insert("MutexGuard", Builtin::Guard);
    table.insert(INFERRED_TYPE, Builtin::Fixed(ValueKind::Move));
    table
});

/// Registered information for a user-declared type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeInfo {
    pub name: String,
    pub kind: ValueKind,
    pub lifetimes: Vec<String>,
    /// At least one field is a reference, directly or through another type
    pub carries_references: bool,
    pub thread_safe: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        BUILTINS.contains_key(name) || self.types.contains_key(name)
    }

    /// Registers a single declaration. Every field type must already be known.
    pub fn register(&mut self, decl: &TypeDecl) -> Result<ValueKind, BorrowError> {
        let info = self.classify(decl, &HashSet::new())?.ok_or_else(|| {
            BorrowError::unknown_type(&decl.name)
        })?;
        let kind = info.kind;
        debug_println!("TYPES: Registered '{}' as {:?}", decl.name, kind);
        self.types.insert(decl.name.clone(), info);
        Ok(kind)
    }

    /// Registers a batch of declarations in dependency order. Declarations may
    /// refer to each other in any order; a type may contain itself only through
    /// an owning indirection such as `Box` or `Vec`.
    pub fn register_all(&mut self, decls: &[TypeDecl]) -> Result<(), BorrowError> {
        let mut pending: Vec<&TypeDecl> = decls.iter().collect();
        let declared: HashSet<&str> = decls.iter().map(|d| d.name.as_str()).collect();

        while !pending.is_empty() {
            let mut progressed = false;
            let mut still_pending = Vec::new();
            for decl in pending {
                match self.classify(decl, &declared)? {
                    Some(info) => {
                        debug_println!("TYPES: Registered '{}' as {:?}", decl.name, info.kind);
                        self.types.insert(decl.name.clone(), info);
                        progressed = true;
                    }
                    None => still_pending.push(decl),
                }
            }
            if !progressed {
                let stuck = still_pending[0];
                return Err(BorrowError::UnknownType {
                    name: stuck.name.clone(),
                    detail: " (contains itself without indirection)".to_string(),
                });
            }
            pending = still_pending;
        }
        Ok(())
    }

    /// `Ok(None)` means a field embeds a declared-but-unregistered type.
    fn classify(&self, decl: &TypeDecl, declared: &HashSet<&str>) -> Result<Option<TypeInfo>, BorrowError> {
        let mut kinds = Vec::new();
        let mut carries_references = false;
        let mut thread_safe = true;
        for field in &decl.fields {
            match self.resolve(&field.ty, declared)? {
                Some(kind) => kinds.push(kind),
                None => return Ok(None),
            }
            carries_references |= self.carries_references(&field.ty);
            thread_safe &= self.is_thread_safe(&field.ty);
        }
        let structural = ValueKind::combine(kinds);
        let kind = match decl.owns_resource {
            Some(true) => ValueKind::Owning,
            Some(false) if structural == ValueKind::Owning => ValueKind::Move,
            _ => structural,
        };
        Ok(Some(TypeInfo {
            name: decl.name.clone(),
            kind,
            lifetimes: decl.lifetimes.clone(),
            carries_references,
            thread_safe,
        }))
    }

    /// Classifies any type expression.
    pub fn kind_of(&self, ty: &TypeExpr) -> Result<ValueKind, BorrowError> {
        self.resolve(ty, &HashSet::new())?
            .ok_or_else(|| BorrowError::unknown_type(ty.base_name()))
    }

    fn resolve(&self, ty: &TypeExpr, declared: &HashSet<&str>) -> Result<Option<ValueKind>, BorrowError> {
        match ty {
            TypeExpr::Ref { mutable, inner, .. } => {
                self.check_known(inner, declared)?;
                Ok(Some(if *mutable { ValueKind::Move } else { ValueKind::Copy }))
            }
            TypeExpr::Named { name, args, .. } => {
                if let Some(builtin) = BUILTINS.get(name.as_str()) {
                    return match builtin {
                        Builtin::Fixed(kind) => {
                            for arg in args {
                                self.check_known(arg, declared)?;
                            }
                            Ok(Some(*kind))
                        }
                        Builtin::FromArgs => {
                            let mut kinds = Vec::new();
                            for arg in args {
                                match self.resolve(arg, declared)? {
                                    Some(kind) => kinds.push(kind),
                                    None => return Ok(None),
                                }
                            }
                            Ok(Some(ValueKind::combine(kinds)))
                        }
                        Builtin::Shared(_) | Builtin::Mutex | Builtin::Guard => {
                            for arg in args {
                                self.check_known(arg, declared)?;
                            }
                            Ok(Some(ValueKind::Owning))
                        }
                        Builtin::Weak => {
                            for arg in args {
                                self.check_known(arg, declared)?;
                            }
                            Ok(Some(ValueKind::Move))
                        }
                    };
                }
                if let Some(info) = self.types.get(name) {
                    return Ok(Some(info.kind));
                }
                if declared.contains(name.as_str()) {
                    return Ok(None);
                }
                Err(BorrowError::unknown_type(name))
            }
        }
    }

    /// Checks that every name in `ty` exists, without classifying it.
    fn check_known(&self, ty: &TypeExpr, declared: &HashSet<&str>) -> Result<(), BorrowError> {
        match ty {
            TypeExpr::Ref { inner, .. } => self.check_known(inner, declared),
            TypeExpr::Named { name, args, .. } => {
                if !self.is_known(name) && !declared.contains(name.as_str()) {
                    return Err(BorrowError::unknown_type(name));
                }
                args.iter().try_for_each(|arg| self.check_known(arg, declared))
            }
        }
    }

    /// Whether values of `ty` hold references and must be lifetime-checked.
    pub fn carries_references(&self, ty: &TypeExpr) -> bool {
        match ty {
            TypeExpr::Ref { .. } => true,
            TypeExpr::Named { name, lifetimes, args } => {
                !lifetimes.is_empty()
                    || self.types.get(name).is_some_and(|info| info.carries_references)
                    || args.iter().any(|arg| self.carries_references(arg))
            }
        }
    }

    /// A non-atomic count (`Rc`) anywhere inside a type makes it unsafe to
    /// hand to another thread.
    pub fn is_thread_safe(&self, ty: &TypeExpr) -> bool {
        match ty {
            TypeExpr::Ref { inner, .. } => self.is_thread_safe(inner),
            TypeExpr::Named { name, args, .. } => {
                if self.shared_kind_of(name).is_some_and(|kind| !kind.is_atomic()) {
                    return false;
                }
                if self.types.get(name).is_some_and(|info| !info.thread_safe) {
                    return false;
                }
                args.iter().all(|arg| self.is_thread_safe(arg))
            }
        }
    }

    fn shared_kind_of(&self, name: &str) -> Option<SharedKind> {
        match BUILTINS.get(name) {
            Some(Builtin::Shared(kind)) => Some(*kind),
            _ => None,
        }
    }

    /// The handle flavor when `ty` itself is `Rc<_>` or `Arc<_>`.
    pub fn shared_kind(&self, ty: &TypeExpr) -> Option<SharedKind> {
        match ty {
            TypeExpr::Named { name, .. } => self.shared_kind_of(name),
            TypeExpr::Ref { .. } => None,
        }
    }

    /// Payload type of a lockable value: `Mutex<T>`, `Arc<Mutex<T>>`, or a
    /// reference to either.
    pub fn mutex_payload<'t>(&self, ty: &'t TypeExpr) -> Option<&'t TypeExpr> {
        let ty = ty.referent();
        match ty {
            TypeExpr::Named { name, args, .. } if name == "Mutex" => args.first(),
            TypeExpr::Named { args, .. } if self.shared_kind(ty).is_some() => {
                args.first().and_then(|inner| self.mutex_payload(inner))
            }
            _ => None,
        }
    }

    pub fn is_guard(&self, ty: &TypeExpr) -> bool {
        matches!(BUILTINS.get(ty.base_name()), Some(Builtin::Guard)) && !ty.is_reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::ty;
    use crate::ir::FieldDecl;

    fn decl(name: &str, fields: &[(&str, &str)]) -> TypeDecl {
        TypeDecl {
            name: name.to_string(),
            lifetimes: Vec::new(),
            fields: fields
                .iter()
                .map(|(n, t)| FieldDecl {
                    name: n.to_string(),
                    ty: ty(t),
                })
                .collect(),
            owns_resource: None,
        }
    }

    #[test]
    fn test_builtin_classification() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.kind_of(&ty("i32")).unwrap(), ValueKind::Copy);
        assert_eq!(registry.kind_of(&ty("String")).unwrap(), ValueKind::Owning);
        assert_eq!(registry.kind_of(&ty("&String")).unwrap(), ValueKind::Copy);
        assert_eq!(registry.kind_of(&ty("&mut String")).unwrap(), ValueKind::Move);
        assert_eq!(registry.kind_of(&ty("Option<i32>")).unwrap(), ValueKind::Copy);
        assert_eq!(registry.kind_of(&ty("Option<Box<i32>>")).unwrap(), ValueKind::Owning);
        assert_eq!(registry.kind_of(&ty("Weak<String>")).unwrap(), ValueKind::Move);
    }

    #[test]
    fn test_all_copy_fields_make_copy_type() {
        let mut registry = TypeRegistry::new();
        let kind = registry.register(&decl("Point", &[("x", "i32"), ("y", "i32")])).unwrap();
        assert!(kind.is_copy());
    }

    #[test]
    fn test_owning_field_makes_owning_type() {
        let mut registry = TypeRegistry::new();
        let kind = registry.register(&decl("Named", &[("id", "u32"), ("name", "String")])).unwrap();
        assert!(kind.owns_resource());
    }

    #[test]
    fn test_explicit_resource_flags() {
        let mut registry = TypeRegistry::new();
        let mut handle = decl("Fd", &[("raw", "i32")]);
        handle.owns_resource = Some(true);
        assert_eq!(registry.register(&handle).unwrap(), ValueKind::Owning);

        let mut view = decl("Exempt", &[("buf", "Vec<u8>")]);
        view.owns_resource = Some(false);
        assert_eq!(registry.register(&view).unwrap(), ValueKind::Move);
    }

    #[test]
    fn test_register_all_out_of_order_and_recursive() {
        let mut registry = TypeRegistry::new();
        let decls = vec![
            decl("Outer", &[("inner", "Inner")]),
            decl("Inner", &[("data", "String")]),
            decl("Node", &[("next", "Option<Box<Node>>"), ("value", "i32")]),
        ];
        registry.register_all(&decls).unwrap();
        assert_eq!(registry.info("Outer").unwrap().kind, ValueKind::Owning);
        assert_eq!(registry.info("Node").unwrap().kind, ValueKind::Owning);
    }

    #[test]
    fn test_unknown_and_infinite_types() {
        let mut registry = TypeRegistry::new();
        let err = registry.register(&decl("Bad", &[("x", "Missing")])).unwrap_err();
        assert_eq!(err.kind(), crate::diagnostics::ErrorKind::UnknownType);

        let err = registry.register_all(&[decl("Loop", &[("me", "Loop")])]).unwrap_err();
        assert!(err.to_string().contains("without indirection"));
    }

    #[test]
    fn test_only_atomic_handles_cross_threads() {
        let registry = TypeRegistry::new();
        assert!(SharedKind::Arc.is_atomic());
        assert!(!SharedKind::Rc.is_atomic());
        assert!(registry.is_thread_safe(&ty("Option<Arc<String>>")));
        assert!(!registry.is_thread_safe(&ty("Option<Rc<String>>")));
        assert!(!registry.is_thread_safe(&ty("Vec<&Rc<i32>>")));
    }

    #[test]
    fn test_reference_carrying_and_thread_safety() {
        let mut registry = TypeRegistry::new();
        let mut holder = decl("Holder", &[("r", "&'a String")]);
        holder.lifetimes = vec!["a".to_string()];
        registry.register(&holder).unwrap();
        assert!(registry.carries_references(&ty("Holder<'a>")));
        assert!(registry.carries_references(&ty("Holder")));
        assert!(!registry.carries_references(&ty("String")));

        assert!(registry.is_thread_safe(&ty("Arc<Mutex<i32>>")));
        assert!(!registry.is_thread_safe(&ty("Rc<i32>")));
        registry.register(&decl("Cache", &[("shared", "Rc<String>")])).unwrap();
        assert!(!registry.is_thread_safe(&ty("&Cache")));
    }

    #[test]
    fn test_mutex_payload() {
        let registry = TypeRegistry::new();
        let arc = ty("Arc<Mutex<Vec<i32>>>");
        assert_eq!(registry.mutex_payload(&arc).unwrap().base_name(), "Vec");
        assert!(registry.mutex_payload(&ty("Arc<i32>")).is_none());
        assert!(registry.mutex_payload(&ty("&Mutex<i32>")).is_some());
    }
}
