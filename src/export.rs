use crate::dnn::{dnn_model_fn, DnnParams};
use crate::estimator::Estimator;
use crate::features::{parse_examples, placeholder_features, FeatureInput, ParsingSpec};
use crate::model_fn::{Mode, OutputAlternative, PredictionKey, Predictions, ProblemType};
use crate::prelude::*;
use crate::variables::VariableStore;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const EXPORT_META: &str = "export.json";
const VARIABLES_FILE: &str = "variables.bin";
const SAVED_MODEL_TEXT: &str = "saved_model.json";
const SAVED_MODEL_BINARY: &str = "saved_model.bin";
const DEFAULT_SERVING_SIGNATURE: &str = "serving_default";

/// What a serving client sends and what it gets back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Signature {
    Classification {
        input: String,
        classes: Option<PredictionKey>,
        scores: Option<PredictionKey>,
    },
    Regression {
        input: String,
        output: PredictionKey,
    },
    Generic {
        outputs: Vec<PredictionKey>,
    },
}

/// Builds the default signature from the (possibly filtered) predictions.
pub type SignatureFn = fn(&str, &Predictions) -> Result<Signature>;

fn require(predictions: &Predictions, key: PredictionKey) -> Result<PredictionKey> {
    if predictions.contains_key(&key) {
        Ok(key)
    } else {
        Err(NNError::UnknownPredictionKey(key.to_string()))
    }
}

pub fn classification_signature_fn(input: &str, predictions: &Predictions) -> Result<Signature> {
    Ok(Signature::Classification {
        input: input.to_string(),
        classes: Some(require(predictions, PredictionKey::Classes)?),
        scores: None,
    })
}

pub fn classification_signature_fn_with_prob(input: &str, predictions: &Predictions) -> Result<Signature> {
    Ok(Signature::Classification {
        input: input.to_string(),
        classes: None,
        scores: Some(require(predictions, PredictionKey::Probabilities)?),
    })
}

pub fn regression_signature_fn(input: &str, predictions: &Predictions) -> Result<Signature> {
    Ok(Signature::Regression {
        input: input.to_string(),
        output: require(predictions, PredictionKey::Scores)?,
    })
}

pub fn generic_signature_fn(_input: &str, predictions: &Predictions) -> Result<Signature> {
    Ok(Signature::Generic {
        outputs: predictions.keys().copied().collect(),
    })
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Raw features the exported model reads.
    pub input_spec: ParsingSpec,
    /// Name of the serialized-examples input; `examples` when unset.
    pub input_feature_key: Option<String>,
    pub use_deprecated_input_fn: bool,
    pub signature_fn: Option<SignatureFn>,
    /// Restricts the exported predictions to this key.
    pub prediction_key: Option<PredictionKey>,
    pub default_batch_size: usize,
    pub exports_to_keep: Option<usize>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            input_spec: ParsingSpec::new(),
            input_feature_key: None,
            use_deprecated_input_fn: true,
            signature_fn: None,
            prediction_key: None,
            default_batch_size: 1,
            exports_to_keep: Some(5),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportMeta {
    pub global_step: u64,
    pub signature: Signature,
    pub input_spec: ParsingSpec,
    pub use_deprecated_input_fn: bool,
    pub default_batch_size: usize,
    /// Model hyperparameters as JSON.
    pub params_json: String,
}

/// Serving input description for `export_savedmodel`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServingInput {
    pub input_spec: ParsingSpec,
    pub receiver_key: String,
    pub default_batch_size: usize,
}

impl ServingInput {
    pub fn new(input_spec: ParsingSpec) -> Self {
        Self {
            input_spec,
            receiver_key: "examples".to_string(),
            default_batch_size: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignatureDef {
    pub input: String,
    pub problem_type: ProblemType,
    pub outputs: Vec<PredictionKey>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SavedModelMeta {
    pub global_step: u64,
    pub signature_defs: BTreeMap<String, SignatureDef>,
    pub input_spec: ParsingSpec,
    pub params_json: String,
    /// Extra asset paths, relative to `assets.extra`.
    pub assets_extra: Vec<String>,
}

/// Description stored next to the variables, in either export layout.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportMetadata {
    Export(ExportMeta),
    SavedModel(SavedModelMeta),
}

impl ExportMetadata {
    pub fn global_step(&self) -> u64 {
        match self {
            Self::Export(meta) => meta.global_step,
            Self::SavedModel(meta) => meta.global_step,
        }
    }

    pub fn input_spec(&self) -> &ParsingSpec {
        match self {
            Self::Export(meta) => &meta.input_spec,
            Self::SavedModel(meta) => &meta.input_spec,
        }
    }

    fn params_json(&self) -> &str {
        match self {
            Self::Export(meta) => &meta.params_json,
            Self::SavedModel(meta) => &meta.params_json,
        }
    }
}

/// A DNN written by `export` or `export_savedmodel`, loaded back from disk
/// and ready to serve serialized examples.
#[derive(Debug, Clone)]
pub struct ExportedModel {
    pub metadata: ExportMetadata,
    pub params: DnnParams,
    pub variables: VariableStore,
}

impl ExportedModel {
    /// Reads `<dir>/<global_step>` from `export` or `<base>/<timestamp>` from
    /// `export_savedmodel`.
    pub fn load<Q: AsRef<Path>>(dir: Q) -> Result<Self> {
        let dir = dir.as_ref();
        let (metadata, variables) = if dir.join(EXPORT_META).exists() {
            let meta: ExportMeta = serde_json::from_str(&fs::read_to_string(dir.join(EXPORT_META))?)?;
            (ExportMetadata::Export(meta), dir.join(VARIABLES_FILE))
        } else {
            let text = dir.join(SAVED_MODEL_TEXT);
            let binary = dir.join(SAVED_MODEL_BINARY);
            let meta: SavedModelMeta = if text.exists() {
                serde_json::from_str(&fs::read_to_string(text)?)?
            } else if binary.exists() {
                bincode::deserialize(&fs::read(binary)?)?
            } else {
                return Err(NNError::ModelLoadError(format!("no exported model in {}", dir.display())));
            };
            (ExportMetadata::SavedModel(meta), dir.join("variables").join(VARIABLES_FILE))
        };
        let params: DnnParams = serde_json::from_str(metadata.params_json())?;
        let variables = VariableStore::load(variables)?;
        debug!(path = %dir.display(), global_step = variables.global_step(), "loaded exported model");
        Ok(Self {
            metadata,
            params,
            variables,
        })
    }

    /// Parses JSON examples with the exported parsing spec and runs the
    /// network in predict mode.
    pub fn predict(&self, serialized: &[String]) -> Result<Predictions> {
        let features = parse_examples(serialized, self.metadata.input_spec())?;
        let mut store = self.variables.clone();
        let ops = dnn_model_fn(
            FeatureInput::Map(features),
            None,
            Mode::Predict,
            &self.params,
            None,
            &mut store,
        )?;
        Ok(ops.predictions)
    }
}

/// `key` relative to `assets.extra`; absolute paths and `..` are refused.
fn asset_path(key: &str) -> Result<&Path> {
    let path = Path::new(key);
    if key.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(NNError::ExportError(format!(
            "assets_extra key `{key}` must be a relative path inside assets.extra"
        )));
    }
    Ok(path)
}

fn timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| NNError::ExportError(e.to_string()))
}

/// Deletes all but the newest `keep` numbered export directories under `base`.
fn garbage_collect_exports(base: &Path, keep: Option<usize>) -> Result<()> {
    let Some(keep) = keep else {
        return Ok(());
    };
    let mut versions: Vec<(u64, PathBuf)> = fs::read_dir(base)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let version = entry.file_name().to_str()?.parse::<u64>().ok()?;
            Some((version, entry.path()))
        })
        .collect();
    versions.sort();
    if versions.len() > keep {
        for (version, path) in versions.drain(..versions.len() - keep) {
            debug!(version, "removing old export");
            fs::remove_dir_all(path)?;
        }
    }
    Ok(())
}

impl<P: Serialize> Estimator<P> {
    fn placeholder_predictions(&self, input_spec: &ParsingSpec, batch: usize) -> Result<crate::model_fn::ModelFnOps> {
        let features = placeholder_features(input_spec, batch.max(1));
        self.model_fn_ops(FeatureInput::Map(features), None, Mode::Predict)
    }

    /// Writes `<export_dir>/<global_step>` with the model description and
    /// variables, keeping the newest `exports_to_keep` exports.
    pub fn export<Q: AsRef<Path>>(&self, export_dir: Q, options: &ExportOptions) -> Result<PathBuf> {
        let export_dir = export_dir.as_ref();
        let ops = self.placeholder_predictions(&options.input_spec, options.default_batch_size)?;
        let mut predictions = ops.predictions;
        if let Some(key) = options.prediction_key {
            let value = predictions
                .remove(&key)
                .ok_or_else(|| NNError::UnknownPredictionKey(key.to_string()))?;
            predictions = Predictions::from([(key, value)]);
        }
        let input = options.input_feature_key.as_deref().unwrap_or("examples");
        let signature_fn = options.signature_fn.unwrap_or(generic_signature_fn);
        let signature = signature_fn(input, &predictions)?;

        let global_step = self.global_step();
        let dir = export_dir.join(format!("{global_step:08}"));
        fs::create_dir_all(&dir)?;
        let meta = ExportMeta {
            global_step,
            signature,
            input_spec: options.input_spec.clone(),
            use_deprecated_input_fn: options.use_deprecated_input_fn,
            default_batch_size: options.default_batch_size,
            params_json: serde_json::to_string(self.params())?,
        };
        fs::write(dir.join(EXPORT_META), serde_json::to_string_pretty(&meta)?)?;
        self.store().save(dir.join(VARIABLES_FILE))?;
        info!(path = %dir.display(), "exported model");

        garbage_collect_exports(export_dir, options.exports_to_keep)?;
        Ok(dir)
    }

    /// Writes `<export_dir_base>/<timestamp>` with one signature per output
    /// alternative (plus `serving_default`), the variables and extra assets.
    pub fn export_savedmodel<Q: AsRef<Path>>(
        &self,
        export_dir_base: Q,
        serving_input: &ServingInput,
        default_output_alternative_key: Option<&str>,
        assets_extra: Option<&BTreeMap<String, PathBuf>>,
        as_text: bool,
        exports_to_keep: Option<usize>,
    ) -> Result<PathBuf> {
        let base = export_dir_base.as_ref();
        if let Some(assets_extra) = assets_extra {
            for key in assets_extra.keys() {
                asset_path(key)?;
            }
        }
        let ops = self.placeholder_predictions(&serving_input.input_spec, serving_input.default_batch_size)?;
        let alternatives = ops.output_alternatives;
        let default = default_output_alternative(&alternatives, default_output_alternative_key)?;

        let to_def = |alternative: &OutputAlternative| SignatureDef {
            input: serving_input.receiver_key.clone(),
            problem_type: alternative.problem_type,
            outputs: alternative.outputs.clone(),
        };
        let mut signature_defs: BTreeMap<String, SignatureDef> =
            alternatives.iter().map(|(key, alt)| (key.clone(), to_def(alt))).collect();
        signature_defs.insert(DEFAULT_SERVING_SIGNATURE.to_string(), to_def(default));

        fs::create_dir_all(base)?;
        let mut version = timestamp()?;
        while base.join(version.to_string()).exists() {
            version += 1;
        }
        let dir = base.join(version.to_string());
        fs::create_dir_all(dir.join("variables"))?;
        self.store().save(dir.join("variables").join(VARIABLES_FILE))?;

        let mut assets = Vec::new();
        if let Some(assets_extra) = assets_extra {
            let assets_dir = dir.join("assets.extra");
            for (dest, source) in assets_extra {
                let target = assets_dir.join(asset_path(dest)?);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(source, &target)?;
                assets.push(dest.clone());
            }
        }

        let meta = SavedModelMeta {
            global_step: self.global_step(),
            signature_defs,
            input_spec: serving_input.input_spec.clone(),
            params_json: serde_json::to_string(self.params())?,
            assets_extra: assets,
        };
        if as_text {
            fs::write(dir.join(SAVED_MODEL_TEXT), serde_json::to_string_pretty(&meta)?)?;
        } else {
            fs::write(dir.join(SAVED_MODEL_BINARY), bincode::serialize(&meta)?)?;
        }
        info!(path = %dir.display(), "exported saved model");

        garbage_collect_exports(base, exports_to_keep)?;
        Ok(dir)
    }
}

fn default_output_alternative<'a>(
    alternatives: &'a BTreeMap<String, OutputAlternative>,
    key: Option<&str>,
) -> Result<&'a OutputAlternative> {
    match key {
        Some(key) => alternatives.get(key).ok_or_else(|| {
            NNError::ExportError(format!(
                "default_output_alternative_key `{key}` not in {:?}",
                alternatives.keys().collect::<Vec<_>>()
            ))
        }),
        None => {
            let mut values = alternatives.values();
            match (values.next(), values.next()) {
                (Some(only), None) => Ok(only),
                (None, _) => Err(NNError::ExportError("model has no output alternatives".into())),
                _ => Err(NNError::ExportError(
                    "several output alternatives; a default_output_alternative_key is required".into(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternatives() -> BTreeMap<String, OutputAlternative> {
        BTreeMap::from([
            (
                "head".to_string(),
                OutputAlternative {
                    problem_type: ProblemType::Classification,
                    outputs: vec![PredictionKey::Classes],
                },
            ),
            (
                "other".to_string(),
                OutputAlternative {
                    problem_type: ProblemType::LinearRegression,
                    outputs: vec![PredictionKey::Scores],
                },
            ),
        ])
    }

    #[test]
    fn default_alternative_needs_key_when_ambiguous() {
        let alternatives = alternatives();
        assert!(matches!(
            default_output_alternative(&alternatives, None),
            Err(NNError::ExportError(_))
        ));
        assert_eq!(
            default_output_alternative(&alternatives, Some("other")).unwrap().problem_type,
            ProblemType::LinearRegression
        );
        assert!(default_output_alternative(&alternatives, Some("missing")).is_err());
    }

    #[test]
    fn signature_fns_check_their_keys() {
        let predictions = Predictions::from([(PredictionKey::Probabilities, array![[0.4, 0.6]])]);
        assert_eq!(
            classification_signature_fn_with_prob("examples", &predictions).unwrap(),
            Signature::Classification {
                input: "examples".into(),
                classes: None,
                scores: Some(PredictionKey::Probabilities),
            }
        );
        assert!(classification_signature_fn("examples", &predictions).is_err());
        assert!(regression_signature_fn("examples", &predictions).is_err());
        assert_eq!(
            generic_signature_fn("examples", &predictions).unwrap(),
            Signature::Generic {
                outputs: vec![PredictionKey::Probabilities]
            }
        );
    }

    #[test]
    fn asset_keys_stay_inside_assets_dir() {
        assert_eq!(asset_path("vocab/words.txt").unwrap(), Path::new("vocab/words.txt"));
        for key in ["/etc/passwd", "../escape.txt", "vocab/../../x", ""] {
            assert!(matches!(asset_path(key), Err(NNError::ExportError(_))), "accepted {key}");
        }
    }

    #[test]
    fn garbage_collection_keeps_newest() {
        let base = std::env::temp_dir().join(format!("rdnn_export_gc_{}", std::process::id()));
        let _ = fs::remove_dir_all(&base);
        for version in [3, 10, 7] {
            fs::create_dir_all(base.join(version.to_string())).unwrap();
        }
        fs::create_dir_all(base.join("not_a_version")).unwrap();
        garbage_collect_exports(&base, Some(2)).unwrap();
        assert!(!base.join("3").exists());
        assert!(base.join("7").exists());
        assert!(base.join("10").exists());
        assert!(base.join("not_a_version").exists());
    }
}
