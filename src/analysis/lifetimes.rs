//! Lifetime solver.
//!
//! Regions form an "outlives" graph: `'static` outlives every signature
//! lifetime, each signature lifetime outlives the function body, and every
//! scope outlives the scopes nested in it. A `'a: 'b` bound adds an edge.
//! `outlives(a, b)` is reachability from `a` to `b`.
//!
//! Each reference-like binding has a points-to set of loan targets. A use
//! is valid only while every local target is still live.

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::analysis::scope::{BindingId, BindingState, ScopeId, ScopeStack};
use crate::analysis::types::TypeRegistry;
use crate::debug_println;
use crate::diagnostics::BorrowError;
use crate::ir::{IrFunction, LifetimeBound, STATIC_LIFETIME};

/// What a reference may point to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LoanTarget {
    Local(BindingId),
    /// Borrowed from the caller, through a parameter with this lifetime
    Param(String),
    Static,
}

impl LoanTarget {
    pub fn from_lifetime(lifetime: &str) -> Self {
        if lifetime == STATIC_LIFETIME {
            LoanTarget::Static
        } else {
            LoanTarget::Param(lifetime.to_string())
        }
    }
}

pub type PointsTo = BTreeSet<LoanTarget>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Region {
    Static,
    Named(String),
    Scope(ScopeId),
}

/// Where the reference returned by a function borrows from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    NotReference,
    Static,
    /// Any of the listed parameters (indices), all carrying `lifetime`
    Params { lifetime: String, params: Vec<usize> },
}

/// Lifetimes of a signature after elision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureLifetimes {
    /// Per parameter; elided lifetimes get fresh names `_0`, `_1`, ...
    pub params: Vec<Vec<String>>,
    pub output: OutputSource,
    pub bounds: Vec<LifetimeBound>,
}

impl SignatureLifetimes {
    /// Loan targets of parameter `index` as seen from inside the body.
    pub fn param_targets(&self, index: usize) -> PointsTo {
        self.params
            .get(index)
            .into_iter()
            .flatten()
            .map(|lt| LoanTarget::from_lifetime(lt))
            .collect()
    }

    /// Used when a signature failed to resolve: the result may borrow from
    /// any reference parameter.
    pub fn conservative(function: &IrFunction, registry: &TypeRegistry) -> Self {
        let params = param_lifetimes(function, registry);
        let carrying: Vec<usize> = (0..params.len()).filter(|i| !params[*i].is_empty()).collect();
        let output = match &function.ret {
            Some(ret) if registry.carries_references(ret) && !carrying.is_empty() => OutputSource::Params {
                lifetime: params[carrying[0]][0].clone(),
                params: carrying,
            },
            Some(ret) if registry.carries_references(ret) => OutputSource::Static,
            _ => OutputSource::NotReference,
        };
        Self {
            params,
            output,
            bounds: function.bounds.clone(),
        }
    }
}

fn param_lifetimes(function: &IrFunction, registry: &TypeRegistry) -> Vec<Vec<String>> {
    function
        .params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let explicit = param.ty.lifetimes();
            if !explicit.is_empty() {
                explicit
            } else if registry.carries_references(&param.ty) {
                vec![format!("_{}", i)]
            } else {
                Vec::new()
            }
        })
        .collect()
}

/// Applies the elision rules to a signature.
///
/// 1. An explicit output lifetime binds to every parameter carrying it.
/// 2. Elided, with a reference receiver: the receiver.
/// 3. Elided, with exactly one reference parameter: that parameter.
/// 4. Otherwise the output is ambiguous.
pub fn resolve_signature(function: &IrFunction, registry: &TypeRegistry) -> Result<SignatureLifetimes, BorrowError> {
    let params = param_lifetimes(function, registry);
    let output = match &function.ret {
        Some(ret) if registry.carries_references(ret) => resolve_output(function, &params, ret.lifetimes())?,
        _ => OutputSource::NotReference,
    };
    debug_println!("LIFETIME: Signature of '{}': params {:?}, output {:?}", function.name, params, output);
    Ok(SignatureLifetimes {
        params,
        output,
        bounds: function.bounds.clone(),
    })
}

fn resolve_output(
    function: &IrFunction,
    params: &[Vec<String>],
    explicit: Vec<String>,
) -> Result<OutputSource, BorrowError> {
    if let Some(lifetime) = explicit.first() {
        if lifetime == STATIC_LIFETIME {
            return Ok(OutputSource::Static);
        }
        let carrying: Vec<usize> = (0..params.len()).filter(|i| params[*i].contains(lifetime)).collect();
        if carrying.is_empty() {
            return Err(BorrowError::UndeclaredLifetime {
                function: function.name.clone(),
                lifetime: lifetime.clone(),
            });
        }
        return Ok(OutputSource::Params {
            lifetime: lifetime.clone(),
            params: carrying,
        });
    }

    if function.receiver().is_some() {
        if let Some(lifetime) = params[0].first() {
            return Ok(OutputSource::Params {
                lifetime: lifetime.clone(),
                params: vec![0],
            });
        }
    }

    let carrying: Vec<usize> = (0..params.len()).filter(|i| !params[*i].is_empty()).collect();
    match carrying.as_slice() {
        [only] if params[*only].len() == 1 => Ok(OutputSource::Params {
            lifetime: params[*only][0].clone(),
            params: vec![*only],
        }),
        [] => Err(BorrowError::AmbiguousLifetime {
            function: function.name.clone(),
            detail: "no parameter is a reference to borrow from".to_string(),
        }),
        _ => {
            let names: Vec<String> = carrying
                .iter()
                .map(|i| format!("`{}`", function.params[*i].name))
                .collect();
            Err(BorrowError::AmbiguousLifetime {
                function: function.name.clone(),
                detail: format!("the return value could borrow from {}", names.join(" or ")),
            })
        }
    }
}

/// Computed interval of a reference binding, for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceLifetime {
    pub name: String,
    pub start: usize,
    pub last_use: Option<usize>,
    pub targets: Vec<String>,
    /// The target with the shortest region; the reference cannot outlive it
    pub bounded_by: Option<String>,
    /// Point at which `bounded_by` went out of scope, if it has
    pub end: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct LifetimeSolver {
    graph: DiGraph<Region, ()>,
    nodes: HashMap<Region, NodeIndex>,
    points_to: HashMap<BindingId, PointsTo>,
    /// Every target a binding ever pointed to; survives flow restores
    history: HashMap<BindingId, PointsTo>,
    last_use: HashMap<BindingId, usize>,
}

impl Default for LifetimeSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeSolver {
    pub fn new() -> Self {
        let mut solver = Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            points_to: HashMap::new(),
            history: HashMap::new(),
            last_use: HashMap::new(),
        };
        solver.node(Region::Static);
        solver
    }

    fn node(&mut self, region: Region) -> NodeIndex {
        if let Some(idx) = self.nodes.get(&region) {
            return *idx;
        }
        let idx = self.graph.add_node(region.clone());
        self.nodes.insert(region, idx);
        idx
    }

    fn outlives_edge(&mut self, longer: Region, shorter: Region) {
        let a = self.node(longer);
        let b = self.node(shorter);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    fn named(lifetime: &str) -> Region {
        if lifetime == STATIC_LIFETIME {
            Region::Static
        } else {
            Region::Named(lifetime.to_string())
        }
    }

    pub fn add_scope(&mut self, scope: ScopeId, parent: Option<ScopeId>) {
        self.node(Region::Scope(scope));
        if let Some(parent) = parent {
            self.outlives_edge(Region::Scope(parent), Region::Scope(scope));
        }
    }

    /// Signature lifetimes live for the whole call, so they outlive the body.
    pub fn declare_signature(&mut self, signature: &SignatureLifetimes, body: ScopeId) {
        for lifetime in signature.params.iter().flatten() {
            let region = Self::named(lifetime);
            if region != Region::Static {
                self.outlives_edge(Region::Static, region.clone());
                self.outlives_edge(region, Region::Scope(body));
            }
        }
        for bound in &signature.bounds {
            self.outlives_edge(Self::named(&bound.longer), Self::named(&bound.shorter));
        }
    }

    pub fn outlives(&self, longer: &Region, shorter: &Region) -> bool {
        if longer == shorter || *longer == Region::Static {
            return true;
        }
        match (self.nodes.get(longer), self.nodes.get(shorter)) {
            (Some(a), Some(b)) => has_path_connecting(&self.graph, *a, *b, None),
            _ => false,
        }
    }

    pub fn region_of(target: &LoanTarget, scopes: &ScopeStack) -> Region {
        match target {
            LoanTarget::Local(id) => Region::Scope(scopes.binding(*id).scope),
            LoanTarget::Param(lifetime) => Self::named(lifetime),
            LoanTarget::Static => Region::Static,
        }
    }

    /// The most restrictive region in `targets`: the one every other target
    /// outlives. When no single region qualifies, the deepest scope wins.
    pub fn shortest_region(&self, targets: &PointsTo, scopes: &ScopeStack) -> Option<(LoanTarget, Region)> {
        let regions: Vec<(LoanTarget, Region)> = targets
            .iter()
            .map(|t| (t.clone(), Self::region_of(t, scopes)))
            .collect();
        let shortest = regions
            .iter()
            .find(|(_, candidate)| regions.iter().all(|(_, other)| self.outlives(other, candidate)));
        if let Some(found) = shortest {
            return Some(found.clone());
        }
        regions.into_iter().max_by_key(|(_, region)| match region {
            Region::Scope(id) => scopes.scope(*id).depth + 1,
            _ => 0,
        })
    }

    pub fn set_points_to(&mut self, binding: BindingId, targets: PointsTo) {
        if targets.is_empty() {
            self.points_to.remove(&binding);
        } else {
            debug_println!("LIFETIME: #{} may point to {:?}", binding.0, targets);
            self.history.entry(binding).or_default().extend(targets.iter().cloned());
            self.points_to.insert(binding, targets);
        }
    }

    pub fn points_to(&self, binding: BindingId) -> Option<&PointsTo> {
        self.points_to.get(&binding)
    }

    pub fn targets_of(&self, binding: BindingId) -> PointsTo {
        self.points_to.get(&binding).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self, binding: BindingId) {
        self.points_to.remove(&binding);
    }

    pub fn record_use(&mut self, binding: BindingId, point: usize) {
        let entry = self.last_use.entry(binding).or_insert(point);
        *entry = (*entry).max(point);
    }

    /// A use of `reference` is valid only while every local it may point to
    /// (directly or through other references) is still live.
    pub fn check(&self, reference: BindingId, scopes: &ScopeStack) -> Result<(), BorrowError> {
        let mut visited = HashSet::new();
        self.check_from(reference, reference, scopes, &mut visited)
    }

    fn check_from(
        &self,
        reference: BindingId,
        current: BindingId,
        scopes: &ScopeStack,
        visited: &mut HashSet<BindingId>,
    ) -> Result<(), BorrowError> {
        if !visited.insert(current) {
            return Ok(());
        }
        let Some(targets) = self.points_to.get(&current) else {
            return Ok(());
        };
        for target in targets {
            let LoanTarget::Local(id) = target else {
                continue;
            };
            let binding = scopes.binding(*id);
            if matches!(binding.state, BindingState::Dropped { .. } | BindingState::Moved { .. }) {
                debug_println!(
                    "LIFETIME: '{}' dangles: target '{}' is {:?}",
                    scopes.binding(reference).name, binding.name, binding.state
                );
                return Err(BorrowError::DanglingReference {
                    reference: scopes.binding(reference).name.clone(),
                    target: binding.name.clone(),
                });
            }
            self.check_from(reference, *id, scopes, visited)?;
        }
        Ok(())
    }

    /// A returned reference may only borrow from the caller, with a lifetime
    /// that outlives the declared output lifetime.
    pub fn check_return(
        &self,
        targets: &PointsTo,
        signature: &SignatureLifetimes,
        scopes: &ScopeStack,
    ) -> Result<(), BorrowError> {
        let expected = match &signature.output {
            OutputSource::NotReference => return Ok(()),
            OutputSource::Static => Region::Static,
            OutputSource::Params { lifetime, .. } => Self::named(lifetime),
        };
        for target in targets {
            match target {
                LoanTarget::Local(id) => {
                    return Err(BorrowError::DanglingReference {
                        reference: "return value".to_string(),
                        target: scopes.binding(*id).name.clone(),
                    });
                }
                LoanTarget::Param(found) => {
                    if !self.outlives(&Self::named(found), &expected) {
                        return Err(BorrowError::LifetimeMismatch {
                            found: found.clone(),
                            expected: match &expected {
                                Region::Named(name) => name.clone(),
                                _ => STATIC_LIFETIME.to_string(),
                            },
                        });
                    }
                }
                LoanTarget::Static => {}
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> HashMap<BindingId, PointsTo> {
        self.points_to.clone()
    }

    pub fn restore(&mut self, points_to: HashMap<BindingId, PointsTo>) {
        self.points_to = points_to;
    }

    /// After a join a reference may point to anything it pointed to on
    /// either path.
    pub fn join(
        a: &HashMap<BindingId, PointsTo>,
        b: &HashMap<BindingId, PointsTo>,
    ) -> HashMap<BindingId, PointsTo> {
        let mut out = a.clone();
        for (binding, targets) in b {
            out.entry(*binding).or_default().extend(targets.iter().cloned());
        }
        out
    }

    /// Interval of every binding that ever pointed somewhere, in declaration
    /// order.
    pub fn report(&self, scopes: &ScopeStack) -> Vec<ReferenceLifetime> {
        let history = &self.history;
        let mut ids: Vec<&BindingId> = history.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let binding = scopes.binding(*id);
                let targets = &history[id];
                let (bounded_by, end) = match self.shortest_region(targets, scopes) {
                    Some((target, region)) => {
                        let end = match region {
                            Region::Scope(scope) => scopes.scope(scope).closed_at,
                            _ => None,
                        };
                        (Some(describe(&target, scopes)), end)
                    }
                    None => (None, None),
                };
                ReferenceLifetime {
                    name: binding.name.clone(),
                    start: binding.declared_at,
                    last_use: self.last_use.get(id).copied(),
                    targets: targets.iter().map(|t| describe(t, scopes)).collect(),
                    bounded_by,
                    end,
                }
            })
            .collect()
    }
}

fn describe(target: &LoanTarget, scopes: &ScopeStack) -> String {
    match target {
        LoanTarget::Local(id) => scopes.binding(*id).name.clone(),
        LoanTarget::Param(lifetime) => format!("'{}", lifetime),
        LoanTarget::Static => format!("'{}", STATIC_LIFETIME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ownership::{DropCause, DropEngine};
    use crate::analysis::scope::{NewBinding, ScopeKind};
    use crate::analysis::types::ValueKind;
    use crate::config::CheckerConfig;
    use crate::diagnostics::ErrorKind;
    use crate::ir::build::{function, param, ty};

    fn signature(params: &[(&str, &str)], ret: Option<&str>) -> IrFunction {
        let mut f = function("f", vec![]);
        f.params = params.iter().map(|(n, t)| param(n, t)).collect();
        f.ret = ret.map(ty);
        f
    }

    #[test]
    fn test_elision_single_reference_param() {
        let registry = TypeRegistry::new();
        let f = signature(&[("x", "&String"), ("n", "i32")], Some("&String"));
        let sig = resolve_signature(&f, &registry).unwrap();
        assert_eq!(
            sig.output,
            OutputSource::Params {
                lifetime: "_0".to_string(),
                params: vec![0]
            }
        );
    }

    #[test]
    fn test_elision_prefers_receiver() {
        let registry = TypeRegistry::new();
        let f = signature(&[("self", "&Vec<i32>"), ("key", "&String")], Some("&i32"));
        let sig = resolve_signature(&f, &registry).unwrap();
        assert_eq!(
            sig.output,
            OutputSource::Params {
                lifetime: "_0".to_string(),
                params: vec![0]
            }
        );
    }

    #[test]
    fn test_elision_two_params_is_ambiguous() {
        let registry = TypeRegistry::new();
        let f = signature(&[("x", "&String"), ("y", "&String")], Some("&String"));
        let err = resolve_signature(&f, &registry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousLifetime);

        let f = signature(&[("n", "i32")], Some("&String"));
        assert_eq!(resolve_signature(&f, &registry).unwrap_err().kind(), ErrorKind::AmbiguousLifetime);
    }

    #[test]
    fn test_explicit_lifetime_unifies_params() {
        let registry = TypeRegistry::new();
        let f = signature(&[("x", "&'a String"), ("y", "&'a String")], Some("&'a String"));
        let sig = resolve_signature(&f, &registry).unwrap();
        assert_eq!(
            sig.output,
            OutputSource::Params {
                lifetime: "a".to_string(),
                params: vec![0, 1]
            }
        );

        let f = signature(&[("x", "&'a String")], Some("&'b String"));
        assert_eq!(resolve_signature(&f, &registry).unwrap_err().kind(), ErrorKind::UndeclaredLifetime);

        let f = signature(&[], Some("&'static str"));
        assert_eq!(resolve_signature(&f, &registry).unwrap().output, OutputSource::Static);
    }

    #[test]
    fn test_region_graph_outlives() {
        let mut stack = ScopeStack::new(&CheckerConfig::default());
        let mut solver = LifetimeSolver::new();
        let outer = stack.push_scope(ScopeKind::Function, 0);
        solver.add_scope(outer, None);
        let inner = stack.push_scope(ScopeKind::Block, 1);
        solver.add_scope(inner, Some(outer));

        let registry = TypeRegistry::new();
        let mut f = signature(&[("x", "&'a String"), ("y", "&'b String")], Some("&'b String"));
        f.bounds = vec![crate::parser::parse_bound("'a: 'b").unwrap()];
        let sig = resolve_signature(&f, &registry).unwrap();
        solver.declare_signature(&sig, outer);

        let a = Region::Named("a".to_string());
        let b = Region::Named("b".to_string());
        assert!(solver.outlives(&Region::Scope(outer), &Region::Scope(inner)));
        assert!(!solver.outlives(&Region::Scope(inner), &Region::Scope(outer)));
        assert!(solver.outlives(&a, &b));
        assert!(!solver.outlives(&b, &a));
        assert!(solver.outlives(&b, &Region::Scope(inner)));
        assert!(solver.outlives(&Region::Static, &a));
    }

    #[test]
    fn test_shortest_region_is_deepest_scope() {
        let mut stack = ScopeStack::new(&CheckerConfig::default());
        let mut solver = LifetimeSolver::new();
        let outer = stack.push_scope(ScopeKind::Function, 0);
        solver.add_scope(outer, None);
        let s1 = stack
            .declare(NewBinding::live("s1", ty("String"), ValueKind::Owning, false), 1)
            .unwrap();
        let inner = stack.push_scope(ScopeKind::Block, 2);
        solver.add_scope(inner, Some(outer));
        let s2 = stack
            .declare(NewBinding::live("s2", ty("String"), ValueKind::Owning, false), 3)
            .unwrap();

        let targets: PointsTo = [LoanTarget::Local(s1), LoanTarget::Local(s2)].into_iter().collect();
        let (target, region) = solver.shortest_region(&targets, &stack).unwrap();
        assert_eq!(target, LoanTarget::Local(s2));
        assert_eq!(region, Region::Scope(inner));
    }

    #[test]
    fn test_check_detects_dropped_target() {
        let mut stack = ScopeStack::new(&CheckerConfig::default());
        let mut engine = DropEngine::new();
        let mut solver = LifetimeSolver::new();
        stack.push_scope(ScopeKind::Function, 0);
        let r = stack
            .declare(NewBinding::live("r", ty("&String"), ValueKind::Copy, false), 1)
            .unwrap();
        let block = stack.push_scope(ScopeKind::Block, 2);
        let x = stack
            .declare(NewBinding::live("x", ty("String"), ValueKind::Owning, false), 3)
            .unwrap();
        solver.set_points_to(r, [LoanTarget::Local(x)].into_iter().collect());
        assert!(solver.check(r, &stack).is_ok());

        stack.pop_scope(block, &mut engine, 4).unwrap();
        let err = solver.check(r, &stack).unwrap_err();
        assert_eq!(
            err,
            BorrowError::DanglingReference {
                reference: "r".to_string(),
                target: "x".to_string()
            }
        );
        assert_eq!(engine.log()[0].cause, DropCause::ScopeExit);
    }

    #[test]
    fn test_check_return_rules() {
        let registry = TypeRegistry::new();
        let mut stack = ScopeStack::new(&CheckerConfig::default());
        let mut solver = LifetimeSolver::new();
        let body = stack.push_scope(ScopeKind::Function, 0);
        solver.add_scope(body, None);
        let local = stack
            .declare(NewBinding::live("local", ty("String"), ValueKind::Owning, false), 1)
            .unwrap();

        let f = signature(&[("x", "&'a String"), ("y", "&'b String")], Some("&'a String"));
        let sig = resolve_signature(&f, &registry).unwrap();
        solver.declare_signature(&sig, body);

        let ok: PointsTo = [LoanTarget::Param("a".to_string()), LoanTarget::Static].into_iter().collect();
        assert!(solver.check_return(&ok, &sig, &stack).is_ok());

        let wrong: PointsTo = [LoanTarget::Param("b".to_string())].into_iter().collect();
        assert_eq!(
            solver.check_return(&wrong, &sig, &stack).unwrap_err(),
            BorrowError::LifetimeMismatch {
                found: "b".to_string(),
                expected: "a".to_string()
            }
        );

        let dangling: PointsTo = [LoanTarget::Local(local)].into_iter().collect();
        assert_eq!(
            solver.check_return(&dangling, &sig, &stack).unwrap_err().kind(),
            ErrorKind::DanglingReference
        );
    }
}
