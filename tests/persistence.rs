use approx::assert_relative_eq;
use layergraph::layers::{ActivationFunction, ActivationLayer, DenseLayer, LayerRegistry, LossLayer};
use layergraph::network::{Model, ModelMode, PackedParameters, StorageKind, Topology};
use layergraph::optim::{PrecomputedObjective, Sgd};
use layergraph::{PredictionBatch, Tensor, TrainingBatch, TrainingInput, TrainingParameter};

fn topology() -> Topology {
    let mut topology = Topology::new();
    topology.push_back(ActivationLayer::identity());
    topology.push_back(DenseLayer::new(3));
    topology.push_back(ActivationLayer::new(ActivationFunction::Sigmoid));
    topology.push_back(DenseLayer::new(2));
    topology.push_back(LossLayer::mse());
    for i in 0..4 {
        topology.add_next(i, i + 1).unwrap();
    }
    topology
}

fn input() -> TrainingInput {
    let data = (0..16).map(|i| (i as f64 * 0.7).cos()).collect();
    let truth = (0..8).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
    TrainingInput::new(Tensor::from_vec(&[4, 4], data).unwrap(), Tensor::from_vec(&[4, 2], truth).unwrap())
}

fn trained() -> TrainingBatch {
    let solver = Sgd::new(Box::new(PrecomputedObjective::new()), 0.2);
    let mut batch = TrainingBatch::new(TrainingParameter::new(Box::new(solver)).with_batch_size(2));
    batch.initialize(&[4, 4], &topology()).unwrap();
    batch.compute(&input()).unwrap();
    batch
}

fn assert_same_values(a: &Tensor, b: &Tensor) {
    assert_eq!(a.dims(), b.dims());
    for (x, y) in a.to_vec().iter().zip(b.to_vec()) {
        assert_relative_eq!(*x, y, max_relative = 1e-15);
    }
}

#[test]
fn test_model_archive_roundtrip() {
    let batch = trained();
    let model = batch.model().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    let path = path.to_str().unwrap();
    model.save_json(path).unwrap();

    let restored = Model::load_json(path, &LayerRegistry::with_builtin_layers()).unwrap();
    assert_eq!(restored.mode(), ModelMode::Training);
    assert_eq!(restored.layer_count(), model.layer_count());
    assert_eq!(restored.next_layers(), model.next_layers());
    assert_eq!(restored.sample_dims(), Some(&[2usize, 4][..]));
    assert_eq!(restored.weights_and_biases().unwrap().kind(), StorageKind::Table);
    assert_eq!(
        restored.weights_and_biases().unwrap().layout(),
        model.weights_and_biases().unwrap().layout()
    );
    assert_same_values(
        &restored.get_weights_and_biases().unwrap(),
        &model.get_weights_and_biases().unwrap(),
    );
}

#[test]
fn test_restored_model_keeps_training() {
    let batch = trained();
    let archive = batch.model().unwrap().to_archive().unwrap();
    let restored = Model::from_archive(archive, &LayerRegistry::with_builtin_layers()).unwrap();
    let before = restored.get_weights_and_biases().unwrap();

    let solver = Sgd::new(Box::new(PrecomputedObjective::new()), 0.2);
    let mut resumed = TrainingBatch::new(TrainingParameter::new(Box::new(solver)).with_batch_size(2));
    resumed.set_model(restored);
    let report = resumed.compute(&input()).unwrap();
    assert_eq!(report.n_iterations, 2);
    assert_ne!(resumed.model().unwrap().get_weights_and_biases().unwrap(), before);
}

#[test]
fn test_unknown_layer_kind_is_rejected() {
    let archive = trained().model().unwrap().to_archive().unwrap();
    let mut registry = LayerRegistry::new();
    registry.register("dense", layergraph::layers::registry::construct_from_config::<DenseLayer>);
    assert!(Model::from_archive(archive, &registry).is_err());
}

#[test]
fn test_topology_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("topology.json");
    let path = path.to_str().unwrap();
    let original = topology();
    original.save_json(path).unwrap();

    let loaded = Topology::load_json(path, &LayerRegistry::with_builtin_layers()).unwrap();
    assert_eq!(loaded.len(), original.len());
    assert_eq!(loaded.to_records().unwrap(), original.to_records().unwrap());
}

#[test]
fn test_prediction_matches_training_forward() {
    let mut batch = trained();
    let input = input();
    let mut expected = Vec::new();
    {
        let model = batch.model_mut().unwrap();
        for start in [0, 2] {
            model.set_input(input.data.sub_tensor(start, 2).unwrap()).unwrap();
            model.forward().unwrap();
            expected.extend(model.result(3).unwrap().to_vec());
        }
    }

    let mut prediction = batch.model().unwrap().to_prediction_model().unwrap();
    assert_eq!(prediction.mode(), ModelMode::Prediction);
    let result = PredictionBatch::new(2).compute(&mut prediction, &input.data).unwrap();
    assert_eq!(result.n_samples, 4);
    let output = result.output(4).unwrap();
    assert_eq!(output.dims(), &[4, 2]);
    for (x, y) in output.to_vec().iter().zip(&expected) {
        assert_relative_eq!(x, y, epsilon = 1e-12);
    }
}
