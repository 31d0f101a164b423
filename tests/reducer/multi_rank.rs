use gradsync::{DispatchOrder, GradStore, GradSyncConfig, ParamDescriptor};

use super::helpers::{f32_params, grad_for, local_reducers, run_ranks, snapshot, test_config};

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-5, "{x} != {y}");
    }
}

/// Rank-dependent arrival order: rotated, and reversed on odd ranks.
fn order_for(rank: u32, n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).map(|i| (i + rank as usize * 2) % n).collect();
    if rank % 2 == 1 {
        order.reverse();
    }
    order
}

fn expected_average(param: &ParamDescriptor, world_size: u32) -> Vec<f32> {
    let mut acc = vec![0.0f32; param.size_bytes / 4];
    for rank in 0..world_size {
        let g = grad_for(param, rank);
        for (a, v) in acc.iter_mut().zip(g.as_dense().unwrap().to_f32_vec().unwrap()) {
            *a += v;
        }
    }
    acc.iter().map(|v| v / world_size as f32).collect()
}

fn run_world(world_size: u32, config: GradSyncConfig, passes: usize) {
    let params = f32_params(&[20, 9, 16, 3, 7, 1, 12]);
    let ranks = local_reducers(world_size, &params, config);
    assert!(ranks[0].1.num_buckets() > 2);

    let shared = params.clone();
    let results = run_ranks(&ranks, move |rank, reducer| {
        let mut snapshots = Vec::new();
        for _ in 0..passes {
            for i in order_for(rank, shared.len()) {
                reducer
                    .mark_variable_ready(shared[i].id, &grad_for(&shared[i], rank)).unwrap();
            }
            let mut store = GradStore::new();
            let report = reducer.finalize_backward(&mut store).unwrap();
            assert!(report.forced.is_empty());
            snapshots.push(snapshot(&store, &shared));
        }
        snapshots
    });

    // Bit-identical on every rank.
    for r in &results[1..] {
        assert_eq!(r, &results[0]);
    }
    for pass in &results[0] {
        for (param, values) in params.iter().zip(pass) {
            assert_close(values, &expected_average(param, world_size));
        }
    }
}

#[test]
fn two_ranks_average() {
    run_world(2, test_config(), 1);
}

#[test]
fn four_ranks_several_passes() {
    run_world(4, test_config(), 3);
}

#[test]
fn ordered_dispatch_across_ranks() {
    run_world(
        3,
        GradSyncConfig {
            dispatch_order: DispatchOrder::InOrder,
            ..test_config()
        },
        2,
    );
}

#[test]
fn sum_without_averaging() {
    let params = f32_params(&[4, 4]);
    let ranks = local_reducers(
        3,
        &params,
        GradSyncConfig {
            average: false,
            ..test_config()
        },
    );
    let shared = params.clone();
    let results = run_ranks(&ranks, move |rank, reducer| {
        for p in &shared {
            reducer.mark_variable_ready(p.id, &grad_for(p, rank)).unwrap();
        }
        let mut store = GradStore::new();
        reducer.finalize_backward(&mut store).unwrap();
        snapshot(&store, &shared)
    });
    for (param, values) in params.iter().zip(&results[0]) {
        let avg = expected_average(param, 3);
        let sum: Vec<f32> = avg.iter().map(|v| v * 3.0).collect();
        assert_close(values, &sum);
    }
}

#[test]
fn forced_completion_is_consistent_across_ranks() {
    let params = f32_params(&[4, 4, 4]);
    let ranks = local_reducers(2, &params, test_config());
    let shared = params.clone();
    let results = run_ranks(&ranks, move |rank, reducer| {
        // Parameter 1 is unused on every rank this pass.
        for i in [2usize, 0] {
            reducer
                .mark_variable_ready(shared[i].id, &grad_for(&shared[i], rank)).unwrap();
        }
        let mut store = GradStore::new();
        let report = reducer.finalize_backward(&mut store).unwrap();
        assert_eq!(report.forced, vec![shared[1].id]);
        snapshot(&store, &shared)
    });
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0][1], vec![0.0; 4]);
}
