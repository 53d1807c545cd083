use crate::core::activations::sigmoid;
use crate::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    /// Labels are class indices shaped `[batch, 1]`.
    SoftmaxCrossEntropy,
    /// One logit per example, labels in `{0, 1}` shaped `[batch, 1]`.
    SigmoidCrossEntropy,
    /// Labels shaped like the logits.
    MeanSquared,
}

/// Per-example unweighted loss and its gradient with respect to the logits
/// (one row per example, not averaged over the batch).
pub fn criteria(
    logits: &Array2<f64>,
    labels: &Array2<f64>,
    loss_ty: Loss,
) -> Result<(Array1<f64>, Array2<f64>)> {
    if logits.nrows() != labels.nrows() {
        return Err(NNError::LayerShapeMismatch(format!(
            "logits have {} rows but labels have {}",
            logits.nrows(),
            labels.nrows()
        )));
    }

    match loss_ty {
        Loss::SoftmaxCrossEntropy => {
            expect_label_columns(labels, 1)?;
            let probabilities = softmax_rows(logits);
            let mut da = probabilities.clone();
            let mut losses = Array1::zeros(logits.nrows());
            for (i, &label) in labels.column(0).iter().enumerate() {
                let class = label as usize;
                if class >= logits.ncols() {
                    return Err(NNError::InvalidLabels(format!(
                        "class {} out of range for {} logits",
                        class,
                        logits.ncols()
                    )));
                }
                losses[i] = -probabilities[[i, class]].max(f64::MIN_POSITIVE).ln();
                da[[i, class]] -= 1.0;
            }
            Ok((losses, da))
        }
        Loss::SigmoidCrossEntropy => {
            expect_label_columns(labels, 1)?;
            if logits.ncols() != 1 {
                return Err(NNError::LayerShapeMismatch(format!(
                    "sigmoid cross-entropy expects 1 logit, got {}",
                    logits.ncols()
                )));
            }
            let x = logits.column(0);
            let y = labels.column(0);
            // max(x, 0) - x * y + log(1 + exp(-|x|))
            let losses = Array1::from_iter(
                x.iter()
                    .zip(y.iter())
                    .map(|(&x, &y)| x.max(0.0) - x * y + (-x.abs()).exp().ln_1p()),
            );
            let da = Array2::from_shape_fn(logits.raw_dim(), |(i, _)| sigmoid(x[i]) - y[i]);
            Ok((losses, da))
        }
        Loss::MeanSquared => {
            if logits.dim() != labels.dim() {
                return Err(NNError::LayerShapeMismatch(format!(
                    "prediction shape {:?} doesn't match target shape {:?}",
                    logits.dim(),
                    labels.dim()
                )));
            }
            let diff = logits - labels;
            let d = logits.ncols() as f64;
            let losses = diff.mapv(|a| a.powi(2)).sum_axis(Axis(1)) / d;
            let da = diff * (2.0 / d);
            Ok((losses, da))
        }
    }
}

pub fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.outer_iter_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

fn expect_label_columns(labels: &Array2<f64>, n: usize) -> Result<()> {
    if labels.ncols() != n {
        return Err(NNError::InvalidLabels(format!(
            "expected labels with {} column(s), got shape {:?}",
            n,
            labels.dim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn softmax_rows_sum_to_one() {
        let p = softmax_rows(&array![[1.0, 2.0, 3.0], [1000.0, 1000.0, -1000.0]]);
        for row in p.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(p[[1, 0]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn softmax_cross_entropy_values() {
        let logits = array![[0.0, 0.0], [2.0, 0.0]];
        let labels = array![[1.0], [0.0]];
        let (losses, da) = criteria(&logits, &labels, Loss::SoftmaxCrossEntropy).unwrap();
        assert_abs_diff_eq!(losses[0], 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(losses[1], (1.0 + (-2f64).exp()).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(da[[0, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(da[[0, 1]], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn sigmoid_cross_entropy_matches_softmax_on_two_logits() {
        let logits = array![[1.3], [-0.4]];
        let labels = array![[1.0], [0.0]];
        let (losses, da) = criteria(&logits, &labels, Loss::SigmoidCrossEntropy).unwrap();
        let two = array![[0.0, 1.3], [0.0, -0.4]];
        let (expected, _) = criteria(&two, &labels, Loss::SoftmaxCrossEntropy).unwrap();
        assert_abs_diff_eq!(losses[0], expected[0], epsilon = 1e-12);
        assert_abs_diff_eq!(losses[1], expected[1], epsilon = 1e-12);
        assert_abs_diff_eq!(da[[0, 0]], sigmoid(1.3) - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn mean_squared_averages_over_label_dimension() {
        let logits = array![[1.0, 3.0]];
        let labels = array![[0.0, 1.0]];
        let (losses, da) = criteria(&logits, &labels, Loss::MeanSquared).unwrap();
        assert_abs_diff_eq!(losses[0], 2.5, epsilon = 1e-12);
        assert_eq!(da, array![[1.0, 2.0]]);
    }

    #[test]
    fn shape_errors_are_reported() {
        let logits = array![[1.0, 3.0]];
        assert!(matches!(
            criteria(&logits, &array![[1.0]], Loss::MeanSquared),
            Err(NNError::LayerShapeMismatch(_))
        ));
        assert!(matches!(
            criteria(&logits, &array![[5.0]], Loss::SoftmaxCrossEntropy),
            Err(NNError::InvalidLabels(_))
        ));
    }
}
