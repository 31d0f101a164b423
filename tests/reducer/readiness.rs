use gradsync::{
    BucketState, CollectiveTag, CommBackend, CommHandle, GradStore, GradSyncConfig,
    GradSyncError, Gradient, NoOpBackend, ParamId, PassPhase, Rank, ReduceOp, Reducer,
    collective_tag,
};
use std::sync::{Arc, Mutex};

use super::helpers::{
    f32_params, grad_for, permutations, run_pass, single_rank, snapshot, test_config,
};

/// Records every dispatch and completes it immediately.
#[derive(Default)]
struct RecordingBackend {
    tags: Mutex<Vec<CollectiveTag>>,
}

impl CommBackend for RecordingBackend {
    fn rank(&self) -> Rank {
        0
    }

    fn world_size(&self) -> u32 {
        1
    }

    fn reduce_async(&self, tag: CollectiveTag, payload: Gradient, op: ReduceOp) -> CommHandle {
        self.tags.lock().unwrap().push(tag);
        NoOpBackend::new().reduce_async(tag, payload, op)
    }
}

#[test]
fn reverse_order_matches_forward_order() {
    let params = f32_params(&[25, 12, 8, 5, 3, 2]);
    let forward: Vec<usize> = (0..params.len()).collect();
    let reverse: Vec<usize> = forward.iter().rev().copied().collect();

    let r = single_rank(&params, test_config());
    let a = snapshot(&run_pass(&r, &params, &forward, 0), &params);
    let b = snapshot(&run_pass(&r, &params, &reverse, 0), &params);
    assert_eq!(a, b);
    assert_eq!(r.pass().unwrap(), 2);
}

#[test]
fn every_arrival_order_gives_same_result() {
    let params = f32_params(&[10, 6, 4, 3, 1]);
    let r = single_rank(&params, test_config());
    assert!(r.num_buckets() > 1);

    let baseline = snapshot(&run_pass(&r, &params, &[0, 1, 2, 3, 4], 0), &params);
    for order in permutations(params.len()) {
        let got = snapshot(&run_pass(&r, &params, &order, 0), &params);
        assert_eq!(got, baseline, "order {order:?}");
    }
}

#[test]
fn duplicate_ready_is_rejected_without_side_effects() {
    let params = f32_params(&[4, 4]);
    let r = single_rank(
        &params,
        GradSyncConfig {
            bucket_size_limits: vec![1024],
            ..test_config()
        },
    );
    r.mark_variable_ready(ParamId(0), &grad_for(&params[0], 0)).unwrap();
    let before = r.bucket_summaries().unwrap();

    let err = r
        .mark_variable_ready(ParamId(0), &grad_for(&params[0], 9))
        .unwrap_err();
    assert!(matches!(err, GradSyncError::DuplicateReady { param: ParamId(0), pass: 0 }));
    assert_eq!(r.bucket_summaries().unwrap(), before);

    r.mark_variable_ready(ParamId(1), &grad_for(&params[1], 0)).unwrap();
    let mut store = GradStore::new();
    r.finalize_backward(&mut store).unwrap();
    // The rejected duplicate did not overwrite the first gradient.
    let expected = grad_for(&params[0], 0);
    assert_eq!(store.get(ParamId(0)).unwrap(), &expected);
}

#[test]
fn unknown_parameter_is_rejected() {
    let params = f32_params(&[4]);
    let r = single_rank(&params, test_config());
    let err = r
        .mark_variable_ready(ParamId(77), &grad_for(&params[0], 0))
        .unwrap_err();
    assert!(matches!(err, GradSyncError::UnassignedParameter { param: ParamId(77) }));
    assert_eq!(r.phase().unwrap(), PassPhase::Idle);
}

#[test]
fn mismatched_gradient_is_rejected() {
    let params = f32_params(&[4, 2]);
    let r = single_rank(&params, test_config());
    let wrong = grad_for(&params[1], 0);
    assert!(matches!(
        r.mark_variable_ready(ParamId(0), &wrong),
        Err(GradSyncError::GradientMismatch { .. })
    ));
    let slot = r.slot_of(ParamId(0)).unwrap();
    assert_eq!(
        r.bucket_summaries().unwrap()[slot.bucket_index].pending,
        r.bucket_summaries().unwrap()[slot.bucket_index].members.len()
    );
    // A rejected gradient leaves the pass unopened.
    assert_eq!(r.phase().unwrap(), PassPhase::Idle);
    r.reset_pass().unwrap();
    assert_eq!(r.pass().unwrap(), 0);
}

#[test]
fn bucket_dispatches_exactly_once_at_zero_pending() {
    // 4 params of 8 bytes each, 16-byte buckets: [[0,1],[2,3]].
    let params = f32_params(&[2, 2, 2, 2]);
    let backend = Arc::new(RecordingBackend::default());
    let r = Reducer::with_planned_buckets(
        params.clone(),
        Arc::clone(&backend) as Arc<dyn CommBackend>,
        GradSyncConfig {
            bucket_size_limits: vec![16],
            ..test_config()
        },
    )
    .unwrap();
    assert_eq!(r.num_buckets(), 2);

    r.mark_variable_ready(ParamId(3), &grad_for(&params[3], 0)).unwrap();
    assert!(backend.tags.lock().unwrap().is_empty());
    assert_eq!(r.bucket_summaries().unwrap()[1].state, BucketState::Pending);

    r.mark_variable_ready(ParamId(2), &grad_for(&params[2], 0)).unwrap();
    assert_eq!(*backend.tags.lock().unwrap(), vec![collective_tag(0, 1)]);

    // A rejected duplicate must not dispatch again.
    assert!(r
        .mark_variable_ready(ParamId(2), &grad_for(&params[2], 0))
        .is_err());
    assert_eq!(backend.tags.lock().unwrap().len(), 1);

    r.mark_variable_ready(ParamId(0), &grad_for(&params[0], 0)).unwrap();
    r.mark_variable_ready(ParamId(1), &grad_for(&params[1], 0)).unwrap();
    let mut store = GradStore::new();
    r.finalize_backward(&mut store).unwrap();
    assert_eq!(
        *backend.tags.lock().unwrap(),
        vec![collective_tag(0, 1), collective_tag(0, 0)]
    );

    // Next pass uses fresh tags.
    run_pass(&r, &params, &[0, 1, 2, 3], 0);
    let tags = backend.tags.lock().unwrap();
    assert_eq!(tags.len(), 4);
    assert_eq!(&tags[2..], &[collective_tag(1, 0), collective_tag(1, 1)]);
}
