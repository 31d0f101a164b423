use gradsync::{GradStore, HookRegistry, HookTable, Reducer};
use std::sync::Arc;
use std::thread;

use super::helpers::{
    f32_params, grad_for, local_reducers, run_pass, run_ranks, single_rank, snapshot, test_config,
};

const THREADS: usize = 4;

/// Fire every parameter's gradient from `THREADS` threads, striped by index.
fn mark_concurrently(reducer: &Arc<Reducer>, rank: u32) {
    let params = reducer.descriptors().to_vec();
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let reducer = Arc::clone(reducer);
            let params = params.clone();
            thread::spawn(move || {
                for p in params.iter().skip(t).step_by(THREADS) {
                    reducer.mark_variable_ready(p.id, &grad_for(p, rank)).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn concurrent_marking_matches_sequential() {
    let params = f32_params(&[5, 9, 2, 14, 3, 3, 8, 1, 6, 11, 4, 2]);
    let sequential = {
        let r = single_rank(&params, test_config());
        let order: Vec<usize> = (0..params.len()).collect();
        snapshot(&run_pass(&r, &params, &order, 0), &params)
    };

    let r = Arc::new(single_rank(&params, test_config()));
    for _ in 0..20 {
        mark_concurrently(&r, 0);
        assert_eq!(r.outstanding(), r.num_buckets());
        let mut store = GradStore::new();
        let report = r.finalize_backward(&mut store).unwrap();
        assert!(report.forced.is_empty());
        assert_eq!(snapshot(&store, &params), sequential);
    }
}

#[test]
fn concurrent_hooks_across_ranks() {
    let params = f32_params(&[7, 3, 12, 5, 9, 2, 2, 16]);
    let ranks = local_reducers(3, &params, test_config());

    let results = run_ranks(&ranks, |rank, reducer| {
        let mut table = HookTable::new();
        reducer.register_hooks(&mut table);
        let table = Arc::new(table);

        let params = reducer.descriptors().to_vec();
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = Arc::clone(&table);
                let params = params.clone();
                thread::spawn(move || {
                    for p in params.iter().rev().skip(t).step_by(THREADS) {
                        table.fire(p.id, &grad_for(p, rank)).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let mut store = GradStore::new();
        reducer.finalize_backward(&mut store).unwrap();
        snapshot(&store, &params)
    });

    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}

/// A backward engine that only knows the registry interface.
struct CountingEngine {
    inner: HookTable,
    registered: usize,
}

impl HookRegistry for CountingEngine {
    fn register_ready_hook(&mut self, param: gradsync::ParamId, hook: gradsync::ReadyHook) {
        self.registered += 1;
        self.inner.register_ready_hook(param, hook);
    }
}

#[test]
fn hooks_installed_once_per_parameter() {
    let params = f32_params(&[1, 2, 3]);
    let r = Arc::new(single_rank(&params, test_config()));
    let mut engine = CountingEngine {
        inner: HookTable::new(),
        registered: 0,
    };
    assert_eq!(r.register_hooks(&mut engine), 3);
    assert_eq!(engine.registered, 3);
    assert_eq!(engine.inner.len(), 3);
}
