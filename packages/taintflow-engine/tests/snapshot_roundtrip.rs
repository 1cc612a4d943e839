//! Saving a finished analysis and picking it up in a fresh process
//!
//! Images are keyed by the content hash of the serialized state, so
//! identical analyses land on one file and a restored engine must be
//! observably the same as the one that saved it, including its ability
//! to keep analyzing incrementally.

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use taintflow_engine::{
    AnalysisConfig, Callable, CallableFacts, FactStore, FixpointEngine, FixpointStatus,
    FlowInstruction, Location, Operand, Scheduler, SnapshotStore, TaintRule,
};

const SOURCE: &str = "http.params";
const SINK: &str = "db.query";

fn call(target: Option<Operand>, callee: &str, arguments: Vec<Operand>, line: u32) -> FlowInstruction {
    FlowInstruction::Call {
        target,
        callee: Callable::new(callee),
        arguments,
        location: Location::new(line, 0),
    }
}

fn ret(value: Operand, line: u32) -> FlowInstruction {
    FlowInstruction::Return {
        value,
        location: Location::new(line, 0),
    }
}

fn program() -> FactStore {
    let mut facts = FactStore::new();

    let mut fetch = CallableFacts::new("svc.fetch", 0);
    fetch.push(call(Some(Operand::Local(0)), SOURCE, vec![], 1));
    fetch.push(ret(Operand::Local(0), 2));
    facts.insert(fetch);

    let mut handler = CallableFacts::new("app.handler", 0);
    handler.push(call(Some(Operand::Local(0)), "svc.fetch", vec![], 1));
    handler.push(call(None, SINK, vec![Operand::Local(0)], 2));
    facts.insert(handler);

    facts
}

fn rules() -> Vec<TaintRule> {
    vec![
        TaintRule::source(SOURCE, "UserControlled"),
        TaintRule::sink(SINK, 0, "Sql"),
    ]
}

fn analyzed_engine() -> FixpointEngine {
    let mut engine = FixpointEngine::new(
        Scheduler::sequential(),
        AnalysisConfig::new().sequential(),
    );
    let status = engine.compute(program(), &rules()).unwrap();
    assert_eq!(status, FixpointStatus::Converged);
    engine
}

#[test]
fn test_restored_engine_matches_the_saved_one() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(dir.path()).unwrap();

    let engine = analyzed_engine();
    let path = engine.save_image(&store).unwrap();

    let restored = FixpointEngine::load_image(
        &store,
        &path,
        Scheduler::sequential(),
        AnalysisConfig::new().sequential(),
    )
    .unwrap();

    assert_eq!(restored.get_iterations(), engine.get_iterations());
    assert_eq!(restored.status(), engine.status());
    assert_eq!(restored.all_issues(), engine.all_issues());
    for callable in program().callables() {
        assert_eq!(restored.get_model(&callable), engine.get_model(&callable));
        assert_eq!(restored.get_result(&callable), engine.get_result(&callable));
    }
}

#[test]
fn test_identical_analyses_share_one_image() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(dir.path()).unwrap();

    let first = analyzed_engine().save_image(&store).unwrap();
    let second = analyzed_engine().save_image(&store).unwrap();

    assert_eq!(first, second);
    assert_eq!(store.images().unwrap().len(), 1);
}

#[test]
fn test_unchanged_inputs_skip_recomputation() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(dir.path()).unwrap();

    let mut first = FixpointEngine::new(
        Scheduler::sequential(),
        AnalysisConfig::new().sequential(),
    );
    let status = first.compute_cached(program(), &rules(), &store).unwrap();
    assert_eq!(status, FixpointStatus::Converged);
    assert_eq!(first.get_iterations(), 2);
    assert_eq!(store.images().unwrap().len(), 1);

    // The second engine would cap at one pass if it actually computed;
    // seeing the producing run's two passes proves it restored.
    let mut second = FixpointEngine::new(
        Scheduler::sequential(),
        AnalysisConfig::new().sequential().with_max_iterations(1),
    );
    let status = second.compute_cached(program(), &rules(), &store).unwrap();
    assert_eq!(status, FixpointStatus::Converged);
    assert_eq!(second.get_iterations(), 2);
    assert_eq!(second.all_issues(), first.all_issues());
    assert_eq!(store.images().unwrap().len(), 1);

    // Changed inputs miss the key and get their own image.
    let mut third = FixpointEngine::new(
        Scheduler::sequential(),
        AnalysisConfig::new().sequential(),
    );
    let mut extended = program();
    let mut extra = CallableFacts::new("app.other", 0);
    extra.push(call(Some(Operand::Local(0)), SOURCE, vec![], 1));
    extended.insert(extra);
    third.compute_cached(extended, &rules(), &store).unwrap();
    assert_eq!(store.images().unwrap().len(), 2);
}

#[test]
fn test_restored_engine_keeps_analyzing() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(dir.path()).unwrap();
    let path = analyzed_engine().save_image(&store).unwrap();

    let mut restored = FixpointEngine::load_image(
        &store,
        &path,
        Scheduler::sequential(),
        AnalysisConfig::new().sequential(),
    )
    .unwrap();
    let before = restored.all_issues().len();

    // A body added after the snapshot still gets analyzed against the
    // restored summaries.
    let mut late = CallableFacts::new("app.late_handler", 0);
    late.push(call(Some(Operand::Local(0)), "svc.fetch", vec![], 1));
    late.push(call(None, SINK, vec![Operand::Local(0)], 2));
    let status = restored.recompute(vec![late]).unwrap();

    assert_eq!(status, FixpointStatus::Converged);
    assert_eq!(restored.all_issues().len(), before + 1);
    assert_eq!(
        restored
            .get_result(&Callable::new("app.late_handler"))
            .unwrap()
            .len(),
        1
    );
}
