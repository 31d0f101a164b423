use gradsync::{
    DataType, DenseGrad, GradStore, GradSyncConfig, Gradient, LocalBackend, LocalGroup,
    NoOpBackend, ParamDescriptor, ParamId, Reducer,
};
use std::sync::Arc;
use std::time::Duration;

/// Dense f32 parameters with the given element counts, ids 0..n.
pub fn f32_params(numels: &[usize]) -> Vec<ParamDescriptor> {
    numels
        .iter()
        .enumerate()
        .map(|(i, &n)| ParamDescriptor::dense(i as u64, n, DataType::F32))
        .collect()
}

/// Deterministic per-rank gradient for a parameter.
pub fn grad_for(param: &ParamDescriptor, rank: u32) -> Gradient {
    let numel = param.size_bytes / 4;
    let values: Vec<f32> = (0..numel)
        .map(|i| (param.id.0 as f32 + 1.0) * 0.5 + i as f32 * 0.25 + rank as f32)
        .collect();
    DenseGrad::from_f32(&values).into()
}

/// Config with small buckets and short timeouts so tests run fast.
pub fn test_config() -> GradSyncConfig {
    GradSyncConfig {
        bucket_size_limits: vec![64, 128],
        collective_timeout: Duration::from_secs(5),
        ..GradSyncConfig::default()
    }
}

/// Single-rank reducer over a no-op backend.
pub fn single_rank(params: &[ParamDescriptor], config: GradSyncConfig) -> Reducer {
    Reducer::with_planned_buckets(params.to_vec(), Arc::new(NoOpBackend::new()), config).unwrap()
}

/// Mark every parameter ready in `order` and finalize.
pub fn run_pass(
    reducer: &Reducer,
    params: &[ParamDescriptor],
    order: &[usize],
    rank: u32,
) -> GradStore {
    for &i in order {
        reducer
            .mark_variable_ready(params[i].id, &grad_for(&params[i], rank))
            .unwrap();
    }
    let mut store = GradStore::new();
    reducer.finalize_backward(&mut store).unwrap();
    store
}

/// Bootstrap an in-process group and one reducer per rank.
pub fn local_reducers(
    world_size: u32,
    params: &[ParamDescriptor],
    config: GradSyncConfig,
) -> Vec<(Arc<LocalBackend>, Arc<Reducer>)> {
    LocalGroup::bootstrap(world_size, &config)
        .unwrap()
        .into_iter()
        .map(|b| {
            let backend = Arc::new(b);
            let reducer = Reducer::with_planned_buckets(
                params.to_vec(),
                Arc::clone(&backend) as Arc<dyn gradsync::CommBackend>,
                config.clone(),
            )
            .unwrap();
            (backend, Arc::new(reducer))
        })
        .collect()
}

/// Run `f` for every rank on its own thread and collect the results in rank order.
pub fn run_ranks<F, T>(ranks: &[(Arc<LocalBackend>, Arc<Reducer>)], f: F) -> Vec<T>
where
    F: Fn(u32, Arc<Reducer>) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let threads: Vec<_> = ranks
        .iter()
        .enumerate()
        .map(|(rank, (_, reducer))| {
            let f = Arc::clone(&f);
            let reducer = Arc::clone(reducer);
            std::thread::spawn(move || f(rank as u32, reducer))
        })
        .collect();
    threads.into_iter().map(|t| t.join().unwrap()).collect()
}

/// All permutations of `0..n` (Heap's algorithm).
pub fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn heap(k: usize, items: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        heap(k - 1, items, out);
        for i in 0..k - 1 {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            heap(k - 1, items, out);
        }
    }
    let mut items: Vec<usize> = (0..n).collect();
    let mut out = Vec::new();
    heap(n, &mut items, &mut out);
    out
}

/// Dense f32 values of every parameter, in id order.
pub fn snapshot(store: &GradStore, params: &[ParamDescriptor]) -> Vec<Vec<f32>> {
    params
        .iter()
        .map(|p| store.dense_f32(p.id).unwrap())
        .collect()
}

pub fn ids(ids: &[u64]) -> Vec<ParamId> {
    ids.iter().map(|&i| ParamId(i)).collect()
}
