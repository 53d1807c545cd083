use rdnn::estimator::{ArrayInput, LossHistory};
use rdnn::export::ExportOptions;
use rdnn::features::{bucketized_column, embedding_column, real_valued_column, sparse_column_with_keys, Value};
use rdnn::prelude::*;
use rdnn::{DnnClassifier, DnnRegressor};
use tracing_subscriber::EnvFilter;

const COLORS: [&str; 3] = ["red", "green", "blue"];

/// Three clusters in the plane, each tagged with a mostly matching color.
fn clusters(n: usize) -> (Features, Labels) {
    let centers = [(-1.0, -1.0), (1.0, -1.0), (0.0, 1.0)];
    let noise = Array2::random((n, 2), Uniform::new(-0.6, 0.6));
    let xy = Array2::from_shape_fn((n, 2), |(i, j)| {
        let (cx, cy) = centers[i % 3];
        if j == 0 { cx } else { cy }
    }) + noise;
    let colors = (0..n)
        .map(|i| vec![Value::from(COLORS[if i % 7 == 0 { (i + 1) % 3 } else { i % 3 }])])
        .collect();
    let labels = Array2::from_shape_fn((n, 1), |(i, _)| (i % 3) as f64);
    let features = Features::from([
        ("xy".to_string(), Tensor::from(xy)),
        ("color".to_string(), Tensor::Sparse(SparseTensor::new(colors))),
    ]);
    (features, labels)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::load()?.with_save_checkpoints_steps(50);
    let model_dir = std::env::temp_dir().join("rdnn_demo");

    let columns: Vec<FeatureColumn> = vec![
        real_valued_column("xy", 2).into(),
        embedding_column(sparse_column_with_keys("color", &COLORS), 2).into(),
    ];
    let mut classifier = DnnClassifier::builder(vec![16, 8], columns)
        .n_classes(3)
        .dropout(0.1)
        .model_dir(model_dir.join("classifier"))
        .config(config.clone())
        .build()?;

    let (features, labels) = clusters(300);
    let mut train = ArrayInput::new(features.clone(), Some(labels.clone()))?
        .batch_size(32)
        .num_epochs(None)
        .shuffle(7);
    let mut history = LossHistory::default();
    classifier.fit(&mut train, Some(400), None, &mut [&mut history])?;
    history.plot("loss_history.png")?;

    let mut eval = ArrayInput::new(features.clone(), Some(labels))?;
    let results = classifier.evaluate(&mut eval, None, None, None)?;
    println!("accuracy: {:.3}", results["accuracy"]);

    let (test, _) = clusters(6);
    let classes = classifier.predict(&mut ArrayInput::new(test.clone(), None)?)?;
    let proba = classifier.predict_proba(&mut ArrayInput::new(test, None)?)?;
    println!("classes: {classes}");
    println!("probabilities:\n{proba:.3}");
    println!("{}", classifier.summary()?);

    let export = classifier.export(model_dir.join("export"), ExportOptions::default())?;
    println!("exported to {}", export.display());

    // y = x1 + 2 * x2, bucketized x1 on the side.
    let x = Array2::random((200, 2), Uniform::new(-1.0, 1.0));
    let y = (&x.column(0) + &(&x.column(1) * 2.0)).insert_axis(Axis(1));
    let source = real_valued_column("x", 2);
    let columns = vec![source.clone().into(), bucketized_column(source, vec![-0.5, 0.0, 0.5])];
    let mut regressor = DnnRegressor::builder(vec![10, 6], columns)
        .optimizer(OptimizerType::adam(0.01))
        .config(config)
        .build()?;
    let features = Features::from([("x".to_string(), Tensor::from(x))]);
    let mut train = ArrayInput::new(features.clone(), Some(y.clone()))?.num_epochs(None).shuffle(1);
    regressor.fit(&mut train, Some(500), None, &mut [])?;

    let results = regressor.evaluate(&mut ArrayInput::new(features, Some(y))?, None, None, None)?;
    println!("regression loss: {:.5}", results["loss"]);
    let prediction = regressor.predict(&mut ArrayInput::new(array![[0.2, 0.3]], None)?)?;
    println!("prediction for [0.2, 0.3] (expected 0.8): {prediction}");

    Ok(())
}
