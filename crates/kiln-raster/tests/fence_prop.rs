mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kiln_raster::backend::testing::RecordingBackend;
use kiln_raster::backend::{Backend, BackendContextId};
use kiln_raster::{DeferredWork, Fence};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Attach,
    Submit,
    CompleteNext,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Attach),
        2 => Just(Op::Submit),
        2 => Just(Op::CompleteNext),
    ]
}

/// `(id, target)` of every work item that ran, in run order.
type RunLog = Arc<Mutex<Vec<(usize, u64)>>>;

fn logged(log: &RunLog, id: usize, target: u64) -> DeferredWork {
    let log = Arc::clone(log);
    DeferredWork::callback(move || log.lock().unwrap().push((id, target)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn deferred_work_runs_once_in_attach_order(ops in proptest::collection::vec(op(), 1..80)) {
        common::init_tracing();
        let backend = RecordingBackend::deferred();
        let ctx = backend.create_context();
        let fence = Fence::new();
        let log: RunLog = Arc::default();

        let mut targets = Vec::new();
        let mut last_read = 0;
        for op in ops {
            match op {
                Op::Attach => {
                    let target = fence.write() + 1;
                    fence.attach(logged(&log, targets.len(), target));
                    targets.push(target);
                }
                Op::Submit => {
                    fence.submit(&backend, ctx);
                }
                Op::CompleteNext => {
                    backend.complete_next();
                }
            }

            let read = fence.read();
            prop_assert!(read >= last_read, "read went backwards: {last_read} -> {read}");
            prop_assert!(read <= fence.write());
            last_read = read;

            // Exactly the items whose target has completed have run.
            let ran = log.lock().unwrap().len();
            let due = targets.iter().filter(|&&target| target <= read).count();
            prop_assert_eq!(ran, due);
        }

        fence.submit(&backend, ctx);
        while backend.complete_next() {}
        prop_assert!(fence.is_done());

        let log = log.lock().unwrap();
        let ids: Vec<usize> = log.iter().map(|(id, _)| *id).collect();
        let expected: Vec<usize> = (0..targets.len()).collect();
        prop_assert_eq!(ids, expected);
        prop_assert_eq!(fence.queued_work(), 0);
    }
}

#[test]
fn racing_submitters_run_each_item_exactly_once() {
    const THREADS: usize = 4;
    const ITEMS: usize = 200;

    common::init_tracing();
    let backend = Arc::new(RecordingBackend::deferred());
    let ctx: BackendContextId = backend.create_context();
    let fence = Fence::new();
    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..THREADS * ITEMS).map(|_| AtomicUsize::new(0)).collect());
    let order: Arc<Mutex<Vec<(usize, usize)>>> = Arc::default();
    let producers_done = Arc::new(AtomicBool::new(false));

    let completer = {
        let backend = Arc::clone(&backend);
        let producers_done = Arc::clone(&producers_done);
        std::thread::spawn(move || loop {
            if !backend.complete_next() {
                if producers_done.load(Ordering::Acquire) && backend.pending_syncs() == 0 {
                    break;
                }
                std::thread::yield_now();
            }
        })
    };

    let producers: Vec<_> = (0..THREADS)
        .map(|thread| {
            let backend = Arc::clone(&backend);
            let fence = Arc::clone(&fence);
            let counters = Arc::clone(&counters);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                for seq in 0..ITEMS {
                    let counters = Arc::clone(&counters);
                    let order = Arc::clone(&order);
                    fence.attach(DeferredWork::callback(move || {
                        counters[thread * ITEMS + seq].fetch_add(1, Ordering::SeqCst);
                        order.lock().unwrap().push((thread, seq));
                    }));
                    if seq % 3 == 0 {
                        fence.submit(&*backend, ctx);
                    }
                }
                fence.submit(&*backend, ctx);
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    producers_done.store(true, Ordering::Release);
    completer.join().unwrap();

    assert!(fence.is_done());
    assert_eq!(fence.queued_work(), 0);
    for (i, counter) in counters.iter().enumerate() {
        assert_eq!(counter.load(Ordering::SeqCst), 1, "item {i} ran the wrong number of times");
    }

    // Per producer, items ran in the order they were attached.
    let order = order.lock().unwrap();
    for thread in 0..THREADS {
        let seqs: Vec<usize> = order
            .iter()
            .filter(|(t, _)| *t == thread)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (0..ITEMS).collect::<Vec<_>>());
    }
}

#[test]
fn fenceless_work_runs_immediately() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    kiln_raster::fence::defer(None, DeferredWork::callback(move || flag.store(true, Ordering::SeqCst)));
    assert!(ran.load(Ordering::SeqCst));
}
