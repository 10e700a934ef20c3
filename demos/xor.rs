use layergraph::{
    train_epochs, ActivationFunction, ActivationLayer, DenseLayer, LossLayer, PredictionBatch, Tensor, Topology,
    TrainConfig, TrainingBatch, TrainingConfig, TrainingInput,
};

fn main() -> Result<(), layergraph::NnError> {
    // input -> dense(4) -> tanh -> dense(1) -> sigmoid -> mse
    let mut topology = Topology::new();
    let input = topology.push_back(ActivationLayer::identity());
    let hidden = topology.push_back(DenseLayer::new(4));
    let tanh = topology.push_back(ActivationLayer::new(ActivationFunction::Tanh));
    let output = topology.push_back(DenseLayer::new(1));
    let sigmoid = topology.push_back(ActivationLayer::new(ActivationFunction::Sigmoid));
    let loss = topology.push_back(LossLayer::mse());
    topology.add_next(input, hidden)?;
    topology.add_next(hidden, tanh)?;
    topology.add_next(tanh, output)?;
    topology.add_next(output, sigmoid)?;
    topology.add_next(sigmoid, loss)?;

    let data = Tensor::from_rows(&[vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 1.0], vec![0.0, 0.0]])?;
    let expected = Tensor::from_rows(&[vec![1.0], vec![0.0], vec![1.0], vec![0.0]])?;

    let config = TrainingConfig { batch_size: 4, epochs: 5000, learning_rate: 0.5, momentum: 0.9, ..TrainingConfig::default() };
    let mut batch = TrainingBatch::new(config.to_parameter()?);
    batch.initialize(data.dims(), &topology)?;

    let training = TrainingInput::new(data.clone(), expected);
    let final_loss = train_epochs(&mut batch, &training, None, &TrainConfig::new(config.epochs))?;
    println!("final loss = {final_loss:.6}");

    let trained = batch.model().ok_or(layergraph::NnError::NullModel)?;
    let mut prediction = trained.to_prediction_model()?;
    let result = PredictionBatch::new(4).compute(&mut prediction, &data)?;
    if let Some(outputs) = result.output(loss) {
        for (row, value) in data.to_vec().chunks(2).zip(outputs.to_vec()) {
            println!("Input: {row:?} -> Output: {value:.4}");
        }
    }
    Ok(())
}
