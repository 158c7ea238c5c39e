use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use staffa::cycle::SnapshotCycle;
use staffa::input::hestia::Hestia;
use staffa::result::{DeltaModel, ResultModel};
use staffa::view::{ClientState, ViewClient, ViewProcessor};

const TIMEOUT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

fn processor_over(source: &Arc<Hestia>) -> ViewProcessor {
    let source = source.clone();
    ViewProcessor::new(move |_| Arc::new(SnapshotCycle::new(source.clone())))
}

fn result_channel(client: &Arc<ViewClient>) -> mpsc::Receiver<ResultModel> {
    let (tx, rx) = mpsc::channel();
    client
        .set_result_listener(Box::new(move |result| {
            let _ = tx.send(result.clone());
        }))
        .unwrap();
    rx
}

fn delta_channel(client: &Arc<ViewClient>) -> mpsc::Receiver<DeltaModel> {
    let (tx, rx) = mpsc::channel();
    client
        .set_delta_listener(Box::new(move |delta| {
            let _ = tx.send(delta.clone());
        }))
        .unwrap();
    rx
}

/// Receives results until one satisfies the predicate.
fn recv_until(
    rx: &mpsc::Receiver<ResultModel>,
    predicate: impl Fn(&ResultModel) -> bool,
) -> ResultModel {
    loop {
        let result = rx.recv_timeout(TIMEOUT).expect("no result before timeout");
        if predicate(&result) {
            return result;
        }
    }
}

#[test]
fn live_results_track_the_data_feed() {
    let _ = env_logger::try_init();
    let source = Arc::new(Hestia::new());
    source.set("p1", 1.0);
    source.set("p2", 2.0);

    let processor = processor_over(&source);
    let view = processor.get_or_create_view("risk").unwrap();
    source.connect_view(&view);

    let client = view.create_client("alice").unwrap();
    let results = result_channel(&client);
    client.start_live().unwrap();

    // The first cycle runs without any external trigger.
    let first = results.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.get("p1"), Some(1.0));
    assert_eq!(first.get("p2"), Some(2.0));

    source.set("p1", 3.0);
    source.set("p2", 4.0);
    let updated = recv_until(&results, |r| {
        r.get("p1") == Some(3.0) && r.get("p2") == Some(4.0)
    });
    assert_eq!(updated.len(), 2);

    processor.stop();
}

#[test]
fn deltas_carry_changed_keys_only() {
    let _ = env_logger::try_init();
    let source = Arc::new(Hestia::new());
    source.set("p1", 1.0);
    source.set("p2", 2.0);

    let processor = processor_over(&source);
    let view = processor.get_or_create_view("risk").unwrap();
    source.connect_view(&view);

    let client = view.create_client("alice").unwrap();
    let results = result_channel(&client);
    let deltas = delta_channel(&client);
    client.start_live().unwrap();
    results.recv_timeout(TIMEOUT).unwrap();

    source.set("p1", 3.0);
    let delta = deltas.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(delta.get("p1"), Some(3.0));
    assert_eq!(delta.get("p2"), None);
    assert_eq!(delta.len(), 1);

    processor.stop();
}

#[test]
fn paused_client_resumes_with_one_merged_callback() {
    let _ = env_logger::try_init();
    let source = Arc::new(Hestia::new());
    source.set("p1", 1.0);
    source.set("p2", 2.0);

    let processor = processor_over(&source);
    let view = processor.get_or_create_view("risk").unwrap();
    source.connect_view(&view);

    let client = view.create_client("alice").unwrap();
    let results = result_channel(&client);
    client.start_live().unwrap();
    results.recv_timeout(TIMEOUT).unwrap();

    client.pause_live().unwrap();
    assert!(view.is_live_computation_running());

    // Two separate changes while paused; wait until each cycle has landed
    // on the view so the merge genuinely spans two cycles.
    source.set("p1", 3.0);
    wait_for_latest(&view, |r| r.get("p1") == Some(3.0));
    source.set("p2", 4.0);
    wait_for_latest(&view, |r| r.get("p2") == Some(4.0));

    // Let any residual coalesced cycle land while still paused.
    std::thread::sleep(QUIET);
    assert!(results.try_recv().is_err());

    client.start_live().unwrap();
    let merged = results.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(merged.get("p1"), Some(3.0));
    assert_eq!(merged.get("p2"), Some(4.0));

    // Exactly one callback for the whole pause.
    assert!(results.recv_timeout(QUIET).is_err());

    processor.stop();
}

#[test]
fn processor_stop_cascades_to_clients_and_workers() {
    let _ = env_logger::try_init();
    let source = Arc::new(Hestia::random(vec!["p1", "p2"]));
    let processor = processor_over(&source);
    let view = processor.get_or_create_view("risk").unwrap();
    source.connect_view(&view);

    let a = view.create_client("alice").unwrap();
    let b = view.create_client("bob").unwrap();
    a.start_live().unwrap();
    b.start_live().unwrap();
    assert!(view.is_live_computation_running());

    processor.stop();

    assert_eq!(a.state(), ClientState::Terminated);
    assert_eq!(b.state(), ClientState::Terminated);
    assert!(!view.is_live_computation_running());
    assert!(a.start_live().is_err());
}

fn wait_for_latest(view: &Arc<staffa::view::View>, predicate: impl Fn(&ResultModel) -> bool) {
    for _ in 0..200 {
        if let Some(latest) = view.latest_result() {
            if predicate(&latest) {
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("view never reached the expected result");
}
