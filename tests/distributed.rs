use approx::assert_relative_eq;
use layergraph::layers::{ActivationFunction, ActivationLayer, DenseLayer, LossLayer};
use layergraph::network::{Model, ModelParameter, Topology};
use layergraph::optim::{PrecomputedObjective, Sgd};
use layergraph::train::{DistributedPartialResult, PartialResult};
use layergraph::{DistributedStep1Local, DistributedStep2Master, Tensor, TrainingInput, TrainingParameter};

fn topology() -> Topology {
    let mut topology = Topology::new();
    topology.push_back(ActivationLayer::identity());
    topology.push_back(DenseLayer::new(2));
    topology.push_back(ActivationLayer::new(ActivationFunction::Tanh));
    topology.push_back(DenseLayer::new(1));
    topology.push_back(LossLayer::mse());
    for i in 0..4 {
        topology.add_next(i, i + 1).unwrap();
    }
    topology
}

fn shard(first: usize, n: usize) -> TrainingInput {
    let data = (first * 3..(first + n) * 3).map(|i| (i as f64 * 0.3).sin()).collect();
    let truth = (first..first + n).map(|i| (i as f64 * 0.5).cos()).collect();
    TrainingInput::new(Tensor::from_vec(&[n, 3], data).unwrap(), Tensor::from_vec(&[n, 1], truth).unwrap())
}

fn local_partial(input: &TrainingInput) -> PartialResult {
    let mut worker = DistributedStep1Local::new(2);
    worker.initialize(input.data.dims(), &topology(), &ModelParameter::default()).unwrap();
    let before = worker.model().unwrap().get_weights_and_biases().unwrap();
    let partial = worker.compute(input).unwrap();
    assert_eq!(worker.model().unwrap().get_weights_and_biases().unwrap(), before);
    partial
}

fn master() -> DistributedStep2Master {
    let solver = Sgd::new(Box::new(PrecomputedObjective::new()), 0.1);
    let mut master = DistributedStep2Master::new(TrainingParameter::new(Box::new(solver)));
    master.initialize(&[1, 3], &topology()).unwrap();
    master
}

#[test]
fn test_partials_cover_local_batches() {
    let partial = local_partial(&shard(0, 5));
    assert_eq!(partial.n_iterations, 2);
    assert_eq!(partial.n_samples, 4);
    assert_eq!(partial.derivatives.len(), 3 * 2 + 2 + 2 + 1);
    assert!(partial.loss >= 0.0);
}

#[test]
fn test_reduction_ignores_arrival_order() {
    let p1 = local_partial(&shard(0, 4));
    let p2 = local_partial(&shard(4, 6));

    let mut forward_order = DistributedPartialResult::new();
    forward_order.insert(1, p1.clone());
    forward_order.insert(2, p2.clone());
    let mut reverse_order = DistributedPartialResult::new();
    reverse_order.insert(2, p2.clone());
    reverse_order.insert(1, p1.clone());

    let mut a = master();
    let mut b = master();
    let initial = a.model().unwrap().get_weights_and_biases().unwrap();
    let report_a = a.compute(&forward_order).unwrap();
    let report_b = b.compute(&reverse_order).unwrap();

    assert_eq!(report_a, report_b);
    assert_eq!(report_a.n_iterations, 1);
    assert_eq!(report_a.n_samples, 10);
    assert_eq!(report_a.n_partials, 2);
    let weights_a = a.model().unwrap().get_weights_and_biases().unwrap();
    assert_eq!(weights_a, b.model().unwrap().get_weights_and_biases().unwrap());
    assert_ne!(weights_a, initial);

    // streamed in the opposite order: same step up to rounding
    let mut c = master();
    c.add_partial(&p2).unwrap();
    c.add_partial(&p1).unwrap();
    let report_c = c.finalize_compute().unwrap();
    assert_relative_eq!(report_c.loss, report_a.loss, epsilon = 1e-12);
    let weights_c = c.model().unwrap().get_weights_and_biases().unwrap().to_vec();
    for (x, y) in weights_c.iter().zip(weights_a.to_vec()) {
        assert_relative_eq!(*x, y, epsilon = 1e-12);
    }
}

#[test]
fn test_step_follows_sample_weighted_mean() {
    let p1 = local_partial(&shard(0, 2));
    let p2 = local_partial(&shard(2, 6));

    let mut m = master();
    let initial = m.model().unwrap().get_weights_and_biases().unwrap().to_vec();
    let mut partials = DistributedPartialResult::new();
    partials.insert(0, p1.clone());
    partials.insert(1, p2.clone());
    m.compute(&partials).unwrap();
    let updated = m.model().unwrap().get_weights_and_biases().unwrap().to_vec();

    let (d1, d2) = (p1.derivatives.to_vec(), p2.derivatives.to_vec());
    for k in 0..initial.len() {
        let mean = (2.0 * d1[k] + 6.0 * d2[k]) / 8.0;
        assert_relative_eq!(updated[k], initial[k] - 0.1 * mean, epsilon = 1e-12);
    }
}

#[test]
fn test_finalize_without_partials_fails() {
    let mut m = master();
    assert!(m.finalize_compute().is_err());
    assert!(m.compute(&DistributedPartialResult::new()).is_err());
}

fn assert_send<T: Send>() {}

#[test]
fn test_engine_types_are_send() {
    assert_send::<PartialResult>();
    assert_send::<DistributedPartialResult>();
    assert_send::<TrainingInput>();
    assert_send::<Model>();
    assert_send::<DistributedStep1Local>();
    assert_send::<DistributedStep2Master>();
}

#[test]
fn test_reduce_partials_from_worker_threads() {
    let workers: Vec<_> = [(0, 4), (4, 6)]
        .into_iter()
        .enumerate()
        .map(|(worker, (first, n))| std::thread::spawn(move || (worker, local_partial(&shard(first, n)))))
        .collect();
    let mut partials = DistributedPartialResult::new();
    for worker in workers {
        let (id, partial) = worker.join().unwrap();
        partials.insert(id, partial);
    }

    let mut expected = DistributedPartialResult::new();
    expected.insert(0, local_partial(&shard(0, 4)));
    expected.insert(1, local_partial(&shard(4, 6)));
    assert_eq!(partials, expected);

    // the master runs on its own thread and hands the model back
    let reducer = std::thread::spawn(move || {
        let mut m = master();
        let report = m.compute(&partials).unwrap();
        (report, m.into_model().unwrap())
    });
    let (report, model) = reducer.join().unwrap();
    assert_eq!(report.n_samples, 10);

    let mut local = master();
    local.compute(&expected).unwrap();
    assert_eq!(
        model.get_weights_and_biases().unwrap(),
        local.model().unwrap().get_weights_and_biases().unwrap()
    );
}
