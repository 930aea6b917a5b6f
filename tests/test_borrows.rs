use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rusty_borrowck::analysis::borrows::{BorrowId, BorrowKind, BorrowTracker};
use rusty_borrowck::analysis::check_program;
use rusty_borrowck::analysis::scope::{Binding, BindingId, BindingState, ScopeId};
use rusty_borrowck::analysis::types::ValueKind;
use rusty_borrowck::config::CheckerConfig;
use rusty_borrowck::diagnostics::{BorrowError, ErrorKind};
use rusty_borrowck::ir::build::*;
use rusty_borrowck::ir::{IrFunction, IrProgram, TypeExpr};

fn kinds_with(functions: Vec<IrFunction>, config: &CheckerConfig) -> Vec<ErrorKind> {
    let prog = IrProgram {
        config: None,
        types: Vec::new(),
        functions,
    };
    check_program(&prog, config).diagnostics().map(|d| d.kind()).collect()
}

fn kinds(functions: Vec<IrFunction>) -> Vec<ErrorKind> {
    kinds_with(functions, &CheckerConfig::default())
}

fn external(name: &str, params: &[(&str, &str)], ret: Option<&str>) -> IrFunction {
    let mut f = function(name, vec![]);
    f.params = params.iter().map(|(n, t)| param(n, t)).collect();
    f.ret = ret.map(ty);
    f.external = true;
    f
}

#[test]
fn test_many_shared_borrows_are_fine() {
    let main = function(
        "main",
        vec![
            let_("v", new("Vec<i32>")),
            let_("a", borrow("v")),
            let_("b", borrow("v")),
            let_("c", var("a")),
            use_("a"),
            use_("b"),
            use_("c"),
            use_("v"),
        ],
    );
    assert!(kinds(vec![main]).is_empty());
}

#[test]
fn test_read_of_exclusively_borrowed_owner() {
    let main = function(
        "main",
        vec![let_mut("v", new("Vec<i32>")), let_("m", borrow_mut("v")), use_("v"), write("m")],
    );
    assert_eq!(kinds(vec![main.clone()]), vec![ErrorKind::ConflictingBorrow]);
    // Once `m` is dead the owner is readable again, but `m` is used afterwards
    assert_eq!(
        kinds_with(vec![main], &CheckerConfig::default().non_lexical()),
        vec![ErrorKind::ConflictingBorrow]
    );
}

#[test]
fn test_write_while_shared_borrowed() {
    let main = function(
        "main",
        vec![let_mut("v", new("Vec<i32>")), let_("r", borrow("v")), write("v"), use_("r")],
    );
    assert_eq!(kinds(vec![main]), vec![ErrorKind::ConflictingBorrow]);
}

#[test]
fn test_borrow_ends_with_its_block() {
    let main = function(
        "main",
        vec![
            let_mut("v", new("Vec<i32>")),
            block(vec![let_("m", borrow_mut("v")), write("m")]),
            let_("r", borrow("v")),
            use_("r"),
        ],
    );
    assert!(kinds(vec![main]).is_empty());
}

#[test]
fn test_move_while_borrowed() {
    let main = function(
        "main",
        vec![let_("s", new("String")), let_("r", borrow("s")), let_("t", var("s")), use_("r")],
    );
    assert_eq!(kinds(vec![main.clone()]), vec![ErrorKind::MovedWhileBorrowed]);
    assert_eq!(
        kinds_with(vec![main], &CheckerConfig::default().non_lexical()),
        vec![ErrorKind::MovedWhileBorrowed]
    );
}

#[test]
fn test_move_after_last_use_with_non_lexical_scoping() {
    let main = function(
        "main",
        vec![let_("s", new("String")), let_("r", borrow("s")), use_("r"), let_("t", var("s"))],
    );
    assert_eq!(kinds(vec![main.clone()]), vec![ErrorKind::MovedWhileBorrowed]);
    assert!(kinds_with(vec![main], &CheckerConfig::default().non_lexical()).is_empty());
}

#[test]
fn test_mutable_borrow_of_immutable_binding() {
    let main = function("main", vec![let_("v", new("Vec<i32>")), let_("m", borrow_mut("v"))]);
    assert_eq!(kinds(vec![main]), vec![ErrorKind::MutabilityViolation]);
}

#[test]
fn test_write_through_shared_reference() {
    let main = function(
        "main",
        vec![let_mut("v", new("Vec<i32>")), let_("r", borrow("v")), write("r")],
    );
    assert_eq!(kinds(vec![main]), vec![ErrorKind::MutabilityViolation]);
}

#[test]
fn test_temporary_borrow_released_after_call() {
    let main = function(
        "main",
        vec![
            let_mut("v", new("Vec<i32>")),
            let_("n", call("len", vec![borrow("v")])),
            eval(call("push", vec![borrow_mut("v")])),
            let_("w", var("v")),
        ],
    );
    let functions = vec![
        external("len", &[("v", "&Vec<i32>")], Some("usize")),
        external("push", &[("v", "&mut Vec<i32>")], None),
        main,
    ];
    assert!(kinds(functions).is_empty());
}

#[test]
fn test_call_result_keeps_argument_borrowed() {
    let main = function(
        "main",
        vec![
            let_mut("v", new("Vec<i32>")),
            let_("first", call("first", vec![borrow("v")])),
            eval(call("push", vec![borrow_mut("v")])),
            use_("first"),
        ],
    );
    let functions = vec![
        external("first", &[("v", "&Vec<i32>")], Some("&i32")),
        external("push", &[("v", "&mut Vec<i32>")], None),
        main,
    ];
    assert_eq!(kinds(functions), vec![ErrorKind::ConflictingBorrow]);
}

#[test]
fn test_batch_mode_reports_each_violation() {
    let main = function(
        "main",
        vec![
            let_mut("v", new("Vec<i32>")),
            let_("m", borrow_mut("v")),
            let_("a", borrow("v")),
            let_("b", borrow("v")),
            write("m"),
        ],
    );
    assert_eq!(
        kinds_with(vec![main], &CheckerConfig::default().batch()),
        vec![ErrorKind::ConflictingBorrow, ErrorKind::ConflictingBorrow]
    );
}

// ============================================================================
// Randomized: the tracker never holds an exclusive borrow next to another one
// ============================================================================

#[test]
fn test_branch_borrows_are_joined_conservatively() {
    let main = function(
        "main",
        vec![
            let_mut("v", new("Vec<i32>")),
            let_uninit("r"),
            if_(vec![assign("r", borrow_mut("v"))], Some(vec![assign("r", borrow("v"))])),
            let_("s", borrow("v")),
        ],
    );
    let prog = IrProgram {
        config: None,
        types: Vec::new(),
        functions: vec![main],
    };
    let report = check_program(&prog, &CheckerConfig::default());
    let errors: Vec<_> = report.diagnostics().map(|d| d.error.clone()).collect();
    assert_eq!(
        errors,
        vec![BorrowError::ConflictingBorrow {
            name: "v".to_string(),
            requested: BorrowKind::Shared,
            existing: BorrowKind::Exclusive,
        }]
    );
}

fn target(id: usize) -> Binding {
    Binding {
        id: BindingId(id),
        name: format!("t{}", id),
        ty: TypeExpr::named("String"),
        kind: ValueKind::Owning,
        mutable: true,
        state: BindingState::Live,
        scope: ScopeId(0),
        declared_at: 0,
        is_parameter: false,
    }
}

#[test]
fn test_random_borrow_sequences_keep_aliasing_invariant() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let targets: Vec<Binding> = (0..4).map(target).collect();

    for _round in 0..50 {
        let mut tracker = BorrowTracker::new();
        let mut live: Vec<(BorrowId, usize, BorrowKind)> = Vec::new();

        for point in 0..200 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let (id, _, _) = live.swap_remove(rng.gen_range(0..live.len()));
                tracker.release(id, point);
                continue;
            }
            let t = rng.gen_range(0..targets.len());
            let kind = if rng.gen_bool(0.3) { BorrowKind::Exclusive } else { BorrowKind::Shared };
            let on_target: Vec<BorrowKind> = live.iter().filter(|(_, tt, _)| *tt == t).map(|(_, _, k)| *k).collect();
            let allowed = match kind {
                BorrowKind::Exclusive => on_target.is_empty(),
                BorrowKind::Shared => !on_target.contains(&BorrowKind::Exclusive),
            };

            let result = tracker.borrow(&targets[t], kind, ScopeId(0), point);
            assert_eq!(result.is_ok(), allowed, "point {}: {:?} borrow of t{}", point, kind, t);
            if let Ok(id) = result {
                live.push((id, t, kind));
            } else {
                assert_eq!(result.unwrap_err().kind(), ErrorKind::ConflictingBorrow);
            }

            for binding in &targets {
                let active: Vec<_> = tracker.active_on(binding.id).collect();
                let exclusive = active.iter().filter(|b| b.kind == BorrowKind::Exclusive).count();
                assert!(exclusive == 0 || active.len() == 1);
                assert_eq!(tracker.can_move(binding.id), active.is_empty());
            }
        }
    }
}
