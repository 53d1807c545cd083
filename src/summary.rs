use crate::prelude::*;
use csv::WriterBuilder;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum SummaryValue {
    Scalar(f64),
    /// Condensed histogram of a tensor's values.
    Histogram { min: f64, max: f64, mean: f64, count: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub tag: String,
    pub value: SummaryValue,
}

impl Summary {
    pub fn scalar(tag: impl Into<String>, value: f64) -> Self {
        Self {
            tag: tag.into(),
            value: SummaryValue::Scalar(value),
        }
    }

    pub fn histogram(tag: impl Into<String>, values: &Array2<f64>) -> Self {
        let count = values.len();
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let mean = values.mean().unwrap_or(0.0);
        Self {
            tag: tag.into(),
            value: SummaryValue::Histogram { min, max, mean, count },
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    step: u64,
    tag: &'a str,
    kind: &'a str,
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
    count: Option<usize>,
}

/// Appends summaries for one step to a CSV file, writing the header when
/// the file is new.
pub fn write_summaries<P: AsRef<Path>>(path: P, step: u64, summaries: &[Summary]) -> Result<()> {
    let path = path.as_ref();
    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut wtr = WriterBuilder::new().has_headers(is_new).from_writer(file);

    for summary in summaries {
        let record = match summary.value {
            SummaryValue::Scalar(value) => Record {
                step,
                tag: &summary.tag,
                kind: "scalar",
                value,
                min: None,
                max: None,
                count: None,
            },
            SummaryValue::Histogram { min, max, mean, count } => Record {
                step,
                tag: &summary.tag,
                kind: "histogram",
                value: mean,
                min: Some(min),
                max: Some(max),
                count: Some(count),
            },
        };
        wtr.serialize(record)?;
    }

    wtr.flush()?;
    Ok(())
}

/// Appends one row of named results, e.g. evaluation metrics.
pub fn write_results<P: AsRef<Path>>(path: P, results: &BTreeMap<String, f64>) -> Result<()> {
    let path = path.as_ref();
    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut wtr = WriterBuilder::new().from_writer(file);

    if is_new {
        wtr.write_record(results.keys())?;
    }
    let record: Vec<String> = results.values().map(|x| x.to_string()).collect();
    wtr.write_record(&record)?;

    wtr.flush()?;
    Ok(())
}
