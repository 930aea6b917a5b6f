use rusty_borrowck::analysis::ownership::{DropAction, DropCause};
use rusty_borrowck::analysis::{check_program, CheckReport};
use rusty_borrowck::config::CheckerConfig;
use rusty_borrowck::diagnostics::{BorrowError, ErrorKind};
use rusty_borrowck::ir::build::*;
use rusty_borrowck::ir::{CaptureMode, IrProgram, IrStatement};

fn check(body: Vec<IrStatement>) -> CheckReport {
    let prog = IrProgram {
        config: None,
        types: Vec::new(),
        functions: vec![function("main", body)],
    };
    check_program(&prog, &CheckerConfig::default())
}

fn kinds(body: Vec<IrStatement>) -> Vec<ErrorKind> {
    check(body).diagnostics().map(|d| d.kind()).collect()
}

#[test]
fn test_scoped_borrow_joined_in_time() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(Some("h"), vec![capture("v", CaptureMode::Ref)], vec![use_("v")]),
        join("h"),
        use_("v"),
    ];
    assert!(kinds(body).is_empty());
}

#[test]
fn test_unjoined_handle_dropped_with_borrow() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(Some("h"), vec![capture("v", CaptureMode::Ref)], vec![use_("v")]),
    ];
    let report = check(body);
    let errors: Vec<_> = report.diagnostics().map(|d| d.error.clone()).collect();
    assert_eq!(errors, vec![BorrowError::ThreadBorrowEscapes { name: "v".to_string() }]);
}

#[test]
fn test_target_goes_out_of_scope_before_join() {
    let body = vec![
        let_uninit("h"),
        block(vec![
            let_("v", new("Vec<i32>")),
            spawn(Some("t"), vec![capture("v", CaptureMode::Ref)], vec![use_("v")]),
            assign("h", var("t")),
        ]),
        join("h"),
    ];
    assert_eq!(kinds(body), vec![ErrorKind::ThreadBorrowEscapes]);
}

#[test]
fn test_detached_spawn_may_not_borrow() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(None, vec![capture("v", CaptureMode::Ref)], vec![use_("v")]),
    ];
    assert_eq!(kinds(body), vec![ErrorKind::ThreadBorrowEscapes]);
}

#[test]
fn test_detached_spawn_with_move_is_fine() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(None, vec![capture("v", CaptureMode::Move)], vec![use_("v")]),
    ];
    let report = check(body);
    assert!(report.is_ok());
    let drops = &report.functions[0].drops;
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].cause, DropCause::ThreadExit);
}

#[test]
fn test_moved_capture_unusable_afterwards() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(Some("h"), vec![capture("v", CaptureMode::Move)], vec![]),
        join("h"),
        use_("v"),
    ];
    assert_eq!(kinds(body), vec![ErrorKind::UseOfMovedValue]);
}

#[test]
fn test_thread_sees_only_captures() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(Some("h"), vec![], vec![use_("v")]),
        join("h"),
    ];
    assert_eq!(kinds(body), vec![ErrorKind::UnknownName]);
}

#[test]
fn test_exclusive_capture_blocks_outer_access() {
    let body = vec![
        let_mut("v", new("Vec<i32>")),
        spawn(Some("h"), vec![capture("v", CaptureMode::MutRef)], vec![write("v")]),
        use_("v"),
        join("h"),
    ];
    assert_eq!(kinds(body), vec![ErrorKind::ConflictingBorrow]);
}

#[test]
fn test_rc_cannot_cross_thread_boundary() {
    let body = vec![
        let_("shared", new("Rc<String>")),
        spawn(Some("h"), vec![capture("shared", CaptureMode::Move)], vec![]),
        join("h"),
    ];
    let report = check(body);
    let errors: Vec<_> = report.diagnostics().map(|d| d.error.clone()).collect();
    assert_eq!(
        errors,
        vec![BorrowError::NotThreadSafe {
            name: "shared".to_string(),
            ty: "Rc<String>".to_string(),
        }]
    );
}

#[test]
fn test_arc_mutex_shared_with_thread() {
    let body = vec![
        let_("counter", new("Arc<Mutex<i32>>")),
        let_("worker", clone("counter")),
        spawn(
            Some("h"),
            vec![capture("worker", CaptureMode::Move)],
            vec![let_mut("guard", lock("worker")), write("guard")],
        ),
        join("h"),
        let_mut("guard", lock("counter")),
        write("guard"),
    ];
    let report = check(body);
    assert!(report.is_ok(), "{:?}", report.diagnostics().collect::<Vec<_>>());

    let drops = &report.functions[0].drops;
    let unlocks = drops.iter().filter(|d| d.actions.contains(&DropAction::Unlock)).count();
    assert_eq!(unlocks, 2);
    let released: Vec<_> = drops
        .iter()
        .filter(|d| d.actions.iter().any(|a| matches!(a, DropAction::ReleaseShared { .. })))
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(released, vec!["counter"]);
}

#[test]
fn test_mutation_through_arc_without_lock() {
    let body = vec![let_mut("data", new("Arc<Vec<i32>>")), write("data")];
    assert_eq!(kinds(body), vec![ErrorKind::UnsynchronizedMutation]);
}

#[test]
fn test_lock_requires_mutex() {
    let body = vec![let_("data", new("Arc<Vec<i32>>")), let_("g", lock("data"))];
    let report = check(body);
    let error = &report.diagnostics().next().unwrap().error;
    assert_eq!(error.kind(), ErrorKind::UnsynchronizedMutation);
    assert!(error.to_string().contains("is not a Mutex"));
}

#[test]
fn test_join_of_non_thread() {
    let body = vec![let_("v", new("Vec<i32>")), join("v")];
    assert_eq!(kinds(body), vec![ErrorKind::UnknownName]);
}

#[test]
fn test_double_join() {
    let body = vec![
        let_("v", new("Vec<i32>")),
        spawn(Some("h"), vec![capture("v", CaptureMode::Ref)], vec![]),
        join("h"),
        join("h"),
    ];
    assert_eq!(kinds(body), vec![ErrorKind::UseOfMovedValue]);
}
