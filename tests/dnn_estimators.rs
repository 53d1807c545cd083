use approx::assert_abs_diff_eq;
use rdnn::estimator::{ArrayInput, LossHistory, StopAtStep};
use rdnn::export::{ExportMeta, ExportMetadata, ExportOptions, ExportedModel, ServingInput, Signature};
use rdnn::features::{create_feature_spec_for_parsing, real_valued_column};
use rdnn::metrics::{mean_absolute_error, Metric, MetricKey, Metrics};
use rdnn::prelude::*;
use rdnn::utils::argmax_rows;
use rdnn::{DnnClassifier, DnnRegressor};
use std::path::PathBuf;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rdnn_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn columns() -> Vec<FeatureColumn> {
    vec![real_valued_column("x", 2).into()]
}

fn features(n: usize) -> Features {
    let x = Array2::from_shape_fn((n, 2), |(i, j)| {
        let t = i as f64 / n as f64;
        if j == 0 {
            t * 2.0 - 1.0
        } else {
            ((i * 7) % n) as f64 / n as f64 - 0.5
        }
    });
    Features::from([("x".to_string(), Tensor::from(x))])
}

fn class_labels(n: usize, n_classes: usize) -> Labels {
    Array2::from_shape_fn((n, 1), |(i, _)| ((i * n_classes) / n) as f64)
}

fn train_input(n: usize, labels: Labels) -> ArrayInput {
    ArrayInput::new(features(n), Some(labels))
        .unwrap()
        .batch_size(16)
        .num_epochs(None)
        .shuffle(5)
}

fn predict_input(n: usize) -> ArrayInput {
    ArrayInput::new(features(n), None).unwrap().batch_size(7)
}

#[test]
fn probabilities_sum_to_one_and_match_classes() {
    let mut classifier = DnnClassifier::new(vec![8, 4], columns(), 3).unwrap();
    classifier
        .fit(&mut train_input(48, class_labels(48, 3)), Some(20), None, &mut [])
        .unwrap();

    let proba = classifier.predict_proba(&mut predict_input(20)).unwrap();
    assert_eq!(proba.dim(), (20, 3));
    for row in proba.outer_iter() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
    }
    let classes = classifier.predict(&mut predict_input(20)).unwrap();
    assert_eq!(classes, argmax_rows(&proba));

    let iterated: Vec<usize> = classifier
        .predict_classes_iter(Box::new(predict_input(20)))
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(iterated, classes.to_vec());
    assert_eq!(
        classifier
            .predict_proba_iter(Box::new(predict_input(20)))
            .unwrap()
            .count(),
        20
    );
}

#[test]
fn binary_classifier_reports_two_probabilities() {
    let mut classifier = DnnClassifier::new(vec![4], columns(), 2).unwrap();
    classifier
        .fit(&mut train_input(32, class_labels(32, 2)), Some(10), None, &mut [])
        .unwrap();
    let proba = classifier.predict_proba(&mut predict_input(5)).unwrap();
    assert_eq!(proba.ncols(), 2);
    assert_eq!(classifier.predict(&mut predict_input(5)).unwrap(), argmax_rows(&proba));

    let results = classifier
        .evaluate(
            &mut ArrayInput::new(features(32), Some(class_labels(32, 2))).unwrap(),
            None,
            None,
            None,
        )
        .unwrap();
    for key in ["loss", "accuracy", "auc", "labels/actual_label_mean", "global_step"] {
        assert!(results.contains_key(key), "missing {key}");
    }
    assert_eq!(results["global_step"], 10.0);
}

#[test]
fn single_class_fails_before_training() {
    assert!(matches!(
        DnnClassifier::new(vec![4], columns(), 1),
        Err(NNError::InvalidNClasses(1))
    ));
}

#[test]
fn regressor_output_shapes() {
    let targets = |d: usize| Array2::from_shape_fn((24, d), |(i, j)| (i + j) as f64 / 24.0);

    let mut scalar = DnnRegressor::new(vec![6], columns(), 1).unwrap();
    scalar.fit(&mut train_input(24, targets(1)), Some(5), None, &mut []).unwrap();
    assert_eq!(scalar.predict(&mut predict_input(9)).unwrap().shape(), &[9]);

    let mut vector = DnnRegressor::new(vec![6], columns(), 3).unwrap();
    vector.fit(&mut train_input(24, targets(3)), Some(5), None, &mut []).unwrap();
    assert_eq!(vector.predict(&mut predict_input(9)).unwrap().shape(), &[9, 3]);
    let rows: Vec<Array1<f64>> = vector
        .predict_scores_iter(Box::new(predict_input(9)))
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert!(rows.iter().all(|r| r.len() == 3));
}

#[test]
fn dropout_is_inert_outside_training() {
    let mut classifier = DnnClassifier::builder(vec![16, 16], columns())
        .n_classes(3)
        .dropout(0.5)
        .build()
        .unwrap();
    classifier
        .fit(&mut train_input(30, class_labels(30, 3)), Some(6), None, &mut [])
        .unwrap();

    let first = classifier.predict_proba(&mut predict_input(10)).unwrap();
    let second = classifier.predict_proba(&mut predict_input(10)).unwrap();
    assert_eq!(first, second);

    let eval = || ArrayInput::new(features(30), Some(class_labels(30, 3))).unwrap();
    let a = classifier.evaluate(&mut eval(), None, None, None).unwrap();
    let b = classifier.evaluate(&mut eval(), None, None, None).unwrap();
    assert_eq!(a["loss"], b["loss"]);
}

#[test]
fn variable_names_are_deterministic() {
    let mut classifier = DnnClassifier::new(vec![5, 3], columns(), 3).unwrap();
    assert!(matches!(classifier.get_variable_names(), Err(NNError::NotTrained(_))));
    classifier
        .fit(&mut train_input(16, class_labels(16, 3)), Some(1), None, &mut [])
        .unwrap();

    let names = classifier.get_variable_names().unwrap();
    for name in [
        "dnn/hiddenlayer_0/weights",
        "dnn/hiddenlayer_0/biases",
        "dnn/hiddenlayer_1/weights",
        "dnn/hiddenlayer_1/biases",
        "dnn/logits/weights",
        "dnn/logits/biases",
        "global_step",
    ] {
        assert!(names.iter().any(|n| n == name), "missing {name}");
    }
    assert_eq!(classifier.get_variable_value("dnn/hiddenlayer_1/weights").unwrap().dim(), (5, 3));
    assert_eq!(classifier.get_variable_value("dnn/logits/biases").unwrap().dim(), (1, 3));
}

#[test]
fn optimizer_factory_trains_like_its_instance() {
    let labels = Array2::from_shape_fn((20, 1), |(i, _)| i as f64 / 20.0);
    let train = |optimizer: OptimizerSpec| {
        let mut regressor = DnnRegressor::builder(vec![4], columns())
            .optimizer(optimizer)
            .build()
            .unwrap();
        regressor
            .fit(&mut train_input(20, labels.clone()), Some(8), None, &mut [])
            .unwrap();
        regressor.get_variable_value("dnn/logits/weights").unwrap()
    };
    let from_instance = train(OptimizerType::adagrad(0.2).into());
    let from_factory = train(OptimizerSpec::factory(|| OptimizerType::adagrad(0.2)));
    assert_eq!(from_instance, from_factory);
}

#[test]
fn hooks_stop_training_and_record_losses() {
    let mut classifier = DnnClassifier::new(vec![4], columns(), 3).unwrap();
    let mut stop = StopAtStep { last_step: 4 };
    let mut history = LossHistory::default();
    classifier
        .fit(
            &mut train_input(32, class_labels(32, 3)),
            Some(50),
            None,
            &mut [&mut history, &mut stop],
        )
        .unwrap();
    assert_eq!(classifier.estimator().global_step(), 4);
    assert_eq!(history.losses.len(), 4);
}

#[test]
fn regressor_evaluates_bare_metric_functions_on_scores() {
    let labels = Array2::from_shape_fn((12, 1), |(i, _)| i as f64);
    let mut regressor = DnnRegressor::new(vec![4], columns(), 1).unwrap();
    regressor.fit(&mut train_input(12, labels.clone()), Some(3), None, &mut []).unwrap();

    let metrics = Metrics::from([(MetricKey::Name("mae".into()), Metric::Fn(mean_absolute_error))]);
    let results = regressor
        .evaluate(
            &mut ArrayInput::new(features(12), Some(labels)).unwrap(),
            None,
            Some(&metrics),
            None,
        )
        .unwrap();
    assert!(results["mae"] >= 0.0);
    assert!(results.contains_key("loss"));
}

#[test]
fn restores_from_latest_checkpoint() {
    let dir = temp_dir("restore");
    let labels = Array2::from_shape_fn((16, 1), |(i, _)| i as f64 / 16.0);
    let build = || {
        DnnRegressor::builder(vec![3], columns())
            .model_dir(&dir)
            .config(
                RunConfig::default()
                    .with_save_checkpoints_steps(2)
                    .with_keep_checkpoint_max(2)
                    .with_save_summary_steps(1),
            )
            .build()
            .unwrap()
    };

    let mut regressor = build();
    regressor.fit(&mut train_input(16, labels.clone()), Some(5), None, &mut []).unwrap();
    let weights = regressor.get_variable_value("dnn/logits/weights").unwrap();

    let restored = build();
    assert_eq!(restored.estimator().global_step(), 5);
    assert_eq!(restored.get_variable_value("dnn/logits/weights").unwrap(), weights);
    assert!(dir.join("summaries.csv").exists());

    let checkpoints = std::fs::read_to_string(dir.join("checkpoint")).unwrap();
    assert_eq!(checkpoints.lines().collect::<Vec<_>>(), vec!["model.ckpt-4.bin", "model.ckpt-5.bin"]);

    let mut restored = restored;
    restored.fit(&mut train_input(16, labels), None, Some(5), &mut []).unwrap();
    assert_eq!(restored.estimator().global_step(), 5);
}

#[test]
fn exports_with_probability_signature() {
    let dir = temp_dir("export");
    let mut classifier = DnnClassifier::new(vec![4], columns(), 3).unwrap();
    classifier
        .fit(&mut train_input(24, class_labels(24, 3)), Some(3), None, &mut [])
        .unwrap();

    let path = classifier.export(&dir, ExportOptions::default()).unwrap();
    assert_eq!(path, dir.join("00000003"));
    let meta: ExportMeta =
        serde_json::from_str(&std::fs::read_to_string(path.join("export.json")).unwrap()).unwrap();
    assert_eq!(meta.global_step, 3);
    assert_eq!(
        meta.signature,
        Signature::Classification {
            input: "examples".into(),
            classes: None,
            scores: Some(PredictionKey::Probabilities),
        }
    );
    assert_eq!(meta.input_spec, create_feature_spec_for_parsing(&columns()));
    assert!(path.join("variables.bin").exists());
}

#[test]
fn saved_model_round_trips_signature_defs() {
    let dir = temp_dir("savedmodel");
    let mut regressor = DnnRegressor::new(vec![4], columns(), 2).unwrap();
    regressor
        .fit(
            &mut train_input(16, Array2::zeros((16, 2))),
            Some(2),
            None,
            &mut [],
        )
        .unwrap();

    let serving = ServingInput::new(create_feature_spec_for_parsing(&columns()));
    let path = regressor
        .export_savedmodel(&dir, &serving, None, None, true, Some(1))
        .unwrap();
    let exported = ExportedModel::load(&path).unwrap();
    assert_eq!(exported.metadata.global_step(), 2);
    let ExportMetadata::SavedModel(meta) = &exported.metadata else {
        panic!("expected saved model metadata, got {:?}", exported.metadata);
    };
    assert!(meta.signature_defs.contains_key("serving_default"));
    assert!(meta.signature_defs.contains_key("head"));
    assert_eq!(meta.signature_defs["head"].outputs, vec![PredictionKey::Scores]);
    assert_eq!(
        exported.variables.variable_value("dnn/logits/weights").unwrap(),
        regressor.get_variable_value("dnn/logits/weights").unwrap()
    );
}

fn serialized_rows(n: usize) -> Vec<String> {
    let features = features(n);
    let Tensor::Dense(x) = &features["x"] else {
        unreachable!()
    };
    x.outer_iter()
        .map(|row| serde_json::json!({ "x": row.to_vec() }).to_string())
        .collect()
}

fn assert_same_probabilities(served: &Array2<f64>, expected: &Array2<f64>) {
    assert_eq!(served.dim(), expected.dim());
    for (s, e) in served.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*s, *e, epsilon = 1e-9);
    }
}

fn trained_classifier() -> DnnClassifier {
    let mut classifier = DnnClassifier::new(vec![6, 4], columns(), 3).unwrap();
    classifier
        .fit(&mut train_input(36, class_labels(36, 3)), Some(8), None, &mut [])
        .unwrap();
    classifier
}

#[test]
fn loaded_saved_model_predicts_like_the_classifier() {
    let dir = temp_dir("savedmodel_predict");
    let classifier = trained_classifier();
    let serving = ServingInput::new(create_feature_spec_for_parsing(&columns()));
    let path = classifier
        .export_savedmodel(&dir, &serving, None, None, false, None)
        .unwrap();
    assert!(path.join("saved_model.bin").exists());

    let exported = ExportedModel::load(&path).unwrap();
    assert!(matches!(exported.metadata, ExportMetadata::SavedModel(_)));
    let served = exported.predict(&serialized_rows(8)).unwrap();
    let expected = classifier.predict_proba(&mut predict_input(8)).unwrap();
    assert_same_probabilities(&served[&PredictionKey::Probabilities], &expected);
    assert_eq!(served[&PredictionKey::Classes].column(0).mapv(|c| c as usize), argmax_rows(&expected));
}

#[test]
fn loaded_export_predicts_like_the_classifier() {
    let dir = temp_dir("export_predict");
    let classifier = trained_classifier();
    let path = classifier.export(&dir, ExportOptions::default()).unwrap();

    let exported = ExportedModel::load(&path).unwrap();
    assert!(matches!(exported.metadata, ExportMetadata::Export(_)));
    assert_eq!(exported.metadata.global_step(), 8);
    let served = exported.predict(&serialized_rows(8)).unwrap();
    let expected = classifier.predict_proba(&mut predict_input(8)).unwrap();
    assert_same_probabilities(&served[&PredictionKey::Probabilities], &expected);
}

#[test]
fn loading_an_empty_directory_fails() {
    let dir = temp_dir("no_export");
    std::fs::create_dir_all(&dir).unwrap();
    assert!(matches!(ExportedModel::load(&dir), Err(NNError::ModelLoadError(_))));
}

#[test]
fn saved_model_refuses_assets_outside_assets_extra() {
    let dir = temp_dir("assets_escape");
    let classifier = trained_classifier();
    let source = temp_dir("assets_source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("vocab.txt"), "a\nb\n").unwrap();

    let serving = ServingInput::new(create_feature_spec_for_parsing(&columns()));
    for key in ["../vocab.txt", "/tmp/vocab.txt"] {
        let assets = std::collections::BTreeMap::from([(key.to_string(), source.join("vocab.txt"))]);
        let err = classifier
            .export_savedmodel(&dir, &serving, None, Some(&assets), true, None)
            .unwrap_err();
        assert!(matches!(err, NNError::ExportError(_)), "{key}: {err:?}");
    }
    assert!(!dir.exists());

    let assets = std::collections::BTreeMap::from([("vocab/words.txt".to_string(), source.join("vocab.txt"))]);
    let path = classifier
        .export_savedmodel(&dir, &serving, None, Some(&assets), true, None)
        .unwrap();
    assert!(path.join("assets.extra").join("vocab").join("words.txt").exists());
}

#[test]
fn empty_input_predicts_empty_arrays() {
    let empty = || ArrayInput::new(features(0), None).unwrap();

    let classifier = trained_classifier();
    assert_eq!(classifier.predict(&mut empty()).unwrap().len(), 0);
    assert_eq!(classifier.predict_proba(&mut empty()).unwrap().dim(), (0, 3));

    let targets = |d: usize| Array2::from_shape_fn((16, d), |(i, j)| (i * j) as f64 / 16.0);
    let mut scalar = DnnRegressor::new(vec![4], columns(), 1).unwrap();
    scalar.fit(&mut train_input(16, targets(1)), Some(2), None, &mut []).unwrap();
    assert_eq!(scalar.predict(&mut empty()).unwrap().shape(), &[0]);

    let mut vector = DnnRegressor::new(vec![4], columns(), 3).unwrap();
    vector.fit(&mut train_input(16, targets(3)), Some(2), None, &mut []).unwrap();
    assert_eq!(vector.predict(&mut empty()).unwrap().shape(), &[0, 3]);
}

#[test]
fn pruning_tolerates_a_missing_checkpoint() {
    let dir = temp_dir("prune_missing");
    let labels = Array2::from_shape_fn((16, 1), |(i, _)| i as f64 / 16.0);
    let mut regressor = DnnRegressor::builder(vec![3], columns())
        .model_dir(&dir)
        .config(
            RunConfig::default()
                .with_save_checkpoints_steps(1)
                .with_keep_checkpoint_max(1),
        )
        .build()
        .unwrap();
    regressor.fit(&mut train_input(16, labels.clone()), Some(1), None, &mut []).unwrap();
    std::fs::remove_file(dir.join("model.ckpt-1.bin")).unwrap();

    regressor.fit(&mut train_input(16, labels), Some(2), None, &mut []).unwrap();
    let checkpoints = std::fs::read_to_string(dir.join("checkpoint")).unwrap();
    assert_eq!(checkpoints.lines().collect::<Vec<_>>(), vec!["model.ckpt-3.bin"]);
}
