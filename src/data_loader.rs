use ndarray::{Array2, Axis};
use polars::prelude::{CsvParseOptions, CsvReadOptions, Float32Type, IndexOrder, NullValues, SerReader};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::value::Value;

/// Fixed seed so shuffled train/test splits are reproducible across runs.
const SPLIT_SEED: u64 = 0x5eed_b005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarType {
    Ordered,
    Categorical,
}

impl VarType {
    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => match s.as_str() {
                "Numerical" | "Ordered" | "N" | "O" => Ok(Self::Ordered),
                "Categorical" | "C" => Ok(Self::Categorical),
                other => Err(DispatchError::invalid(format!("unknown variable type {other}"))),
            },
            _ => Ok(if value.to_int()? == 0 {
                Self::Ordered
            } else {
                Self::Categorical
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Responses {
    /// Class labels.
    Categorical(Vec<i32>),
    /// Regression targets.
    Ordered(Vec<f32>),
}

impl Responses {
    pub fn len(&self) -> usize {
        match self {
            Self::Categorical(v) => v.len(),
            Self::Ordered(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, i: usize) -> f32 {
        match self {
            Self::Categorical(v) => v[i] as f32,
            Self::Ordered(v) => v[i],
        }
    }

    fn into_type(self, kind: VarType) -> Self {
        match (self, kind) {
            (Self::Ordered(v), VarType::Categorical) => {
                Self::Categorical(v.into_iter().map(|x| x.round() as i32).collect())
            }
            (Self::Categorical(v), VarType::Ordered) => {
                Self::Ordered(v.into_iter().map(|x| x as f32).collect())
            }
            (same, _) => same,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    Row,
    Col,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitOptions {
    pub count: Option<usize>,
    pub ratio: Option<f64>,
    pub shuffle: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            count: None,
            ratio: None,
            shuffle: true,
        }
    }
}

impl SplitOptions {
    /// Consumes a split option if `key` names one.
    fn accept(&mut self, key: &str, value: &Value) -> Result<bool> {
        match key {
            "TrainTestSplitCount" => {
                let count = usize::try_from(value.to_int()?)
                    .map_err(|_| DispatchError::invalid("TrainTestSplitCount must be >= 0"))?;
                self.count = Some(count);
            }
            "TrainTestSplitRatio" => {
                let ratio = value.to_f64()?;
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(DispatchError::invalid("TrainTestSplitRatio must be in [0,1]"));
                }
                self.ratio = Some(ratio);
            }
            "TrainTestSplitShuffle" => self.shuffle = value.to_bool()?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Options for building a dataset from in-memory matrices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataOptions {
    pub layout: Layout,
    pub var_idx: Option<Vec<usize>>,
    pub sample_idx: Option<Vec<usize>>,
    pub sample_weights: Option<Vec<f32>>,
    /// Inputs followed (optionally) by the response.
    pub var_type: Option<Vec<VarType>>,
    pub missing_mask: Option<Array2<f32>>,
    pub split: SplitOptions,
}

impl DataOptions {
    pub fn parse(pairs: &[Value]) -> Result<Self> {
        let mut opts = Self::default();
        for (key, value) in option_pairs(pairs)? {
            if opts.split.accept(key, value)? {
                continue;
            }
            match key {
                "Layout" => {
                    opts.layout = match value.as_text()? {
                        "Row" => Layout::Row,
                        "Col" => Layout::Col,
                        other => return Err(DispatchError::invalid(format!("unknown layout {other}"))),
                    }
                }
                "VarIdx" => opts.var_idx = Some(value.to_index_vec()?),
                "SampleIdx" => opts.sample_idx = Some(value.to_index_vec()?),
                "SampleWeights" => opts.sample_weights = Some(value.to_f32_vec()?),
                "VarType" => {
                    opts.var_type = Some(match value {
                        Value::Cell(items) => items.iter().map(VarType::parse).collect::<Result<_>>()?,
                        _ => value
                            .to_int32()?
                            .iter()
                            .map(|&code| VarType::parse(&Value::from(code)))
                            .collect::<Result<_>>()?,
                    })
                }
                "MissingMask" => opts.missing_mask = Some(value.to_single()?),
                _ => return Err(DispatchError::UnknownOption(key.to_owned())),
            }
        }
        Ok(opts)
    }
}

/// Options for loading a dataset from a delimited text file.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvOptions {
    pub header_line_count: usize,
    /// Negative means "last column".
    pub response_start_idx: i64,
    /// Negative means `response_start_idx + 1`.
    pub response_end_idx: i64,
    pub var_type_spec: Option<String>,
    pub delimiter: u8,
    pub missing: String,
    pub split: SplitOptions,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            header_line_count: 1,
            response_start_idx: -1,
            response_end_idx: -1,
            var_type_spec: None,
            delimiter: b',',
            missing: "?".to_owned(),
            split: SplitOptions::default(),
        }
    }
}

impl CsvOptions {
    pub fn parse(pairs: &[Value]) -> Result<Self> {
        let mut opts = Self::default();
        for (key, value) in option_pairs(pairs)? {
            if opts.split.accept(key, value)? {
                continue;
            }
            match key {
                "HeaderLineCount" => {
                    opts.header_line_count = usize::try_from(value.to_int()?)
                        .map_err(|_| DispatchError::invalid("HeaderLineCount must be >= 0"))?
                }
                "ResponseStartIdx" => opts.response_start_idx = value.to_int()?,
                "ResponseEndIdx" => opts.response_end_idx = value.to_int()?,
                "VarTypeSpec" => opts.var_type_spec = Some(value.as_text()?.to_owned()),
                "Delimiter" => {
                    opts.delimiter = match value.as_text()?.as_bytes() {
                        [b] => *b,
                        _ => return Err(DispatchError::invalid("Delimiter must be a single character")),
                    }
                }
                "Missing" => opts.missing = value.as_text()?.to_owned(),
                _ => return Err(DispatchError::UnknownOption(key.to_owned())),
            }
        }
        Ok(opts)
    }
}

/// Splits a flat `key, value, key, value, ...` list into pairs.
pub(crate) fn option_pairs(pairs: &[Value]) -> Result<Vec<(&str, &Value)>> {
    if pairs.len() % 2 != 0 {
        return Err(DispatchError::Arity(
            "options must be given as name/value pairs".to_owned(),
        ));
    }
    pairs
        .chunks_exact(2)
        .map(|pair| Ok((pair[0].as_text()?, &pair[1])))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMatrix {
    Int32(Array2<i32>),
    Single(Array2<f32>),
}

/// Where a dataset comes from; options are already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    Matrices {
        samples: Array2<f32>,
        responses: ResponseMatrix,
        options: DataOptions,
    },
    File {
        path: String,
        options: CsvOptions,
    },
}

impl DataSource {
    /// A textual first argument names a file; otherwise the two positional
    /// arguments are the sample and response matrices.
    pub fn from_args(data: &Value, responses: &Value, options: &[Value]) -> Result<Self> {
        if let Value::Text(path) = data {
            return Ok(Self::File {
                path: path.clone(),
                options: CsvOptions::parse(options)?,
            });
        }
        let responses = if responses.is_int32() {
            ResponseMatrix::Int32(responses.to_int32()?)
        } else {
            ResponseMatrix::Single(responses.to_single()?)
        };
        Ok(Self::Matrices {
            samples: data.to_single()?,
            responses,
            options: DataOptions::parse(options)?,
        })
    }

    pub fn build(self) -> Result<TrainData> {
        match self {
            Self::Matrices {
                samples,
                responses,
                options,
            } => TrainData::from_matrices(samples, responses, options),
            Self::File { path, options } => TrainData::load_csv(&path, &options),
        }
    }
}

/// A dataset ready for training or evaluation.
///
/// Samples are stored row-major with one row per sample; missing entries are
/// NaN. Categorical inputs hold their raw integer category values.
#[derive(Debug, Clone)]
pub struct TrainData {
    samples: Array2<f32>,
    responses: Responses,
    var_idx: Vec<usize>,
    var_types: Vec<VarType>,
    sample_weights: Vec<f32>,
    sample_idx: Vec<usize>,
    train_idx: Vec<usize>,
    test_idx: Vec<usize>,
}

impl TrainData {
    pub fn from_matrices(
        samples: Array2<f32>,
        responses: ResponseMatrix,
        options: DataOptions,
    ) -> Result<Self> {
        let mut samples = match options.layout {
            Layout::Row => samples,
            Layout::Col => samples.reversed_axes(),
        };
        if let Some(mask) = &options.missing_mask {
            let mask = match options.layout {
                Layout::Row => mask.view(),
                Layout::Col => mask.t(),
            };
            if mask.dim() != samples.dim() {
                return Err(DispatchError::invalid("MissingMask must match the samples shape"));
            }
            ndarray::Zip::from(&mut samples)
                .and(mask)
                .for_each(|v, &m| {
                    if m != 0.0 {
                        *v = f32::NAN;
                    }
                });
        }

        let mut responses = match responses {
            ResponseMatrix::Int32(m) => Responses::Categorical(vector(m)?),
            ResponseMatrix::Single(m) => Responses::Ordered(vector(m)?),
        };

        let n_vars = samples.ncols();
        let mut var_types = vec![VarType::Ordered; n_vars];
        if let Some(types) = &options.var_type {
            match types.len() {
                n if n == n_vars => var_types.copy_from_slice(types),
                n if n == n_vars + 1 => {
                    var_types.copy_from_slice(&types[..n_vars]);
                    responses = responses.into_type(types[n_vars]);
                }
                n => {
                    return Err(DispatchError::invalid(format!(
                        "VarType has {n} entries, expected {n_vars} or {}",
                        n_vars + 1
                    )))
                }
            }
        }

        Self::from_parts(
            samples,
            responses,
            var_types,
            options.var_idx,
            options.sample_idx,
            options.sample_weights,
            &options.split,
        )
    }

    /// Loads a delimited text file: one sample per line, the response in the
    /// column selected by `ResponseStartIdx`.
    pub fn load_csv(path: &str, options: &CsvOptions) -> Result<Self> {
        debug!(path, ?options, "Loading dataset");
        let file = File::open(path).map_err(|e| DispatchError::io(path, e))?;

        let parse_opts = CsvParseOptions::default()
            .with_separator(options.delimiter)
            .with_null_values(Some(NullValues::AllColumnsSingle(options.missing.as_str().into())));
        let df = CsvReadOptions::default()
            .with_has_header(false)
            .with_skip_rows(options.header_line_count)
            .with_infer_schema_length(Some(100))
            .with_parse_options(parse_opts)
            .into_reader_with_file_handle(file)
            .finish()?;
        debug!("DataFrame shape: {:?}", df.shape());

        let table = df.to_ndarray::<Float32Type>(IndexOrder::C)?;
        let n_cols = table.ncols();
        if n_cols < 2 {
            return Err(DispatchError::invalid(format!(
                "{path}: need at least one input and one response column"
            )));
        }
        let start = if options.response_start_idx < 0 {
            n_cols - 1
        } else {
            options.response_start_idx as usize
        };
        let end = if options.response_end_idx < 0 {
            start + 1
        } else {
            options.response_end_idx as usize
        };
        if start >= n_cols || end != start + 1 {
            return Err(DispatchError::invalid(format!(
                "{path}: exactly one response column is supported (got {start}..{end} of {n_cols})"
            )));
        }

        let response_col = table.column(start);
        if response_col.iter().any(|v| v.is_nan()) {
            return Err(DispatchError::invalid(format!("{path}: missing response values")));
        }
        let inputs: Vec<usize> = (0..n_cols).filter(|&c| c != start).collect();
        let samples = table.select(Axis(1), &inputs);

        let column_types = match &options.var_type_spec {
            Some(spec) => parse_var_type_spec(spec, n_cols)?,
            None => {
                let mut types = vec![VarType::Ordered; n_cols];
                if response_col.iter().all(|v| v.fract() == 0.0) {
                    types[start] = VarType::Categorical;
                }
                types
            }
        };
        let var_types = inputs.iter().map(|&c| column_types[c]).collect();
        let responses =
            Responses::Ordered(response_col.to_vec()).into_type(column_types[start]);

        Self::from_parts(samples, responses, var_types, None, None, None, &options.split)
    }

    fn from_parts(
        samples: Array2<f32>,
        responses: Responses,
        var_types: Vec<VarType>,
        var_idx: Option<Vec<usize>>,
        sample_idx: Option<Vec<usize>>,
        sample_weights: Option<Vec<f32>>,
        split: &SplitOptions,
    ) -> Result<Self> {
        let (n_samples, n_vars) = samples.dim();
        if responses.len() != n_samples {
            return Err(DispatchError::invalid(format!(
                "{} responses for {n_samples} samples",
                responses.len()
            )));
        }

        let var_idx = match var_idx {
            Some(mut idx) => {
                idx.sort_unstable();
                idx.dedup();
                if idx.last().is_some_and(|&i| i >= n_vars) {
                    return Err(DispatchError::invalid("VarIdx out of range"));
                }
                idx
            }
            None => (0..n_vars).collect(),
        };
        let sample_idx = match sample_idx {
            Some(idx) if idx.iter().any(|&i| i >= n_samples) => {
                return Err(DispatchError::invalid("SampleIdx out of range"))
            }
            Some(idx) => idx,
            None => (0..n_samples).collect(),
        };
        let sample_weights = match sample_weights {
            Some(w) if w.len() != n_samples => {
                return Err(DispatchError::invalid("SampleWeights must have one entry per sample"))
            }
            Some(w) if w.iter().any(|&x| !(x >= 0.0)) => {
                return Err(DispatchError::invalid("SampleWeights must be non-negative"))
            }
            Some(w) => w,
            None => vec![1.0; n_samples],
        };

        for &v in &var_idx {
            if var_types[v] == VarType::Categorical
                && samples.column(v).iter().any(|x| !x.is_nan() && x.fract() != 0.0)
            {
                return Err(DispatchError::invalid(format!(
                    "categorical variable {v} has non-integer values"
                )));
            }
        }

        let mut data = Self {
            samples,
            responses,
            var_idx,
            var_types,
            sample_weights,
            train_idx: sample_idx.clone(),
            sample_idx,
            test_idx: Vec::new(),
        };
        if let Some(count) = split.count {
            data.set_train_test_split(count, split.shuffle)?;
        } else if let Some(ratio) = split.ratio {
            let count = (ratio * data.sample_idx.len() as f64).round() as usize;
            data.set_train_test_split(count, split.shuffle)?;
        }
        debug!(
            n_samples,
            n_vars,
            n_train = data.train_idx.len(),
            n_test = data.test_idx.len(),
            "Dataset assembled"
        );
        Ok(data)
    }

    /// The first `count` (optionally shuffled) samples train, the rest test.
    pub fn set_train_test_split(&mut self, count: usize, shuffle: bool) -> Result<()> {
        if count > self.sample_idx.len() {
            return Err(DispatchError::invalid(format!(
                "train count {count} exceeds {} samples",
                self.sample_idx.len()
            )));
        }
        let mut idx = self.sample_idx.clone();
        if shuffle {
            idx.shuffle(&mut StdRng::seed_from_u64(SPLIT_SEED));
        }
        self.test_idx = idx.split_off(count);
        self.train_idx = idx;
        Ok(())
    }

    pub fn samples(&self) -> &Array2<f32> {
        &self.samples
    }

    pub fn responses(&self) -> &Responses {
        &self.responses
    }

    /// Active input variables (column indices into `samples`).
    pub fn var_idx(&self) -> &[usize] {
        &self.var_idx
    }

    /// Type of every input column, active or not.
    pub fn var_types(&self) -> &[VarType] {
        &self.var_types
    }

    pub fn sample_weights(&self) -> &[f32] {
        &self.sample_weights
    }

    pub fn train_sample_idx(&self) -> &[usize] {
        &self.train_idx
    }

    pub fn test_sample_idx(&self) -> &[usize] {
        &self.test_idx
    }

    pub fn n_samples(&self) -> usize {
        self.samples.nrows()
    }

    pub fn n_vars(&self) -> usize {
        self.samples.ncols()
    }
}

fn vector<T: Clone>(m: Array2<T>) -> Result<Vec<T>> {
    if m.nrows() > 1 && m.ncols() > 1 {
        return Err(DispatchError::invalid(
            "responses must be a vector (multi-output responses are not supported)",
        ));
    }
    Ok(m.iter().cloned().collect())
}

/// Parses specs like `ord[0-3,5]cat[4]` over `n_cols` columns.
/// Columns not mentioned are ordered.
pub fn parse_var_type_spec(spec: &str, n_cols: usize) -> Result<Vec<VarType>> {
    let bad = |why: &str| DispatchError::invalid(format!("VarTypeSpec {spec:?}: {why}"));
    let mut types = vec![VarType::Ordered; n_cols];
    let mut rest = spec.trim();
    while !rest.is_empty() {
        let kind = if let Some(r) = rest.strip_prefix("ord") {
            rest = r;
            VarType::Ordered
        } else if let Some(r) = rest.strip_prefix("cat") {
            rest = r;
            VarType::Categorical
        } else {
            return Err(bad("expected `ord` or `cat`"));
        };
        let body = rest.strip_prefix('[').ok_or_else(|| bad("expected `[`"))?;
        let close = body.find(']').ok_or_else(|| bad("missing `]`"))?;
        for item in body[..close].split(',') {
            let item = item.trim();
            let (lo, hi) = match item.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (item, item),
            };
            let lo: usize = lo.parse().map_err(|_| bad("bad column index"))?;
            let hi: usize = hi.parse().map_err(|_| bad("bad column index"))?;
            if lo > hi || hi >= n_cols {
                return Err(bad("column range out of bounds"));
            }
            types[lo..=hi].fill(kind);
        }
        rest = body[close + 1..].trim_start();
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn test_int32_responses_are_categorical() {
        let data = TrainData::from_matrices(
            array![[1.0f32, 2.0], [3.0, 4.0]],
            ResponseMatrix::Int32(array![[0], [1]]),
            DataOptions::default(),
        )
        .unwrap();
        assert_eq!(data.responses(), &Responses::Categorical(vec![0, 1]));
        assert_eq!(data.var_idx(), &[0, 1]);
        assert_eq!(data.train_sample_idx(), &[0, 1]);
        assert!(data.test_sample_idx().is_empty());
    }

    #[test]
    fn test_col_layout_and_missing_mask() {
        let opts = DataOptions::parse(&[
            Value::from("Layout"),
            Value::from("Col"),
            Value::from("MissingMask"),
            Value::Single(array![[0.0f32, 1.0, 0.0], [0.0, 0.0, 0.0]]),
        ])
        .unwrap();
        let data = TrainData::from_matrices(
            array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]],
            ResponseMatrix::Single(array![[0.5f32, 1.5, 2.5]]),
            opts,
        )
        .unwrap();
        assert_eq!(data.n_samples(), 3);
        assert_eq!(data.n_vars(), 2);
        assert!(data.samples()[[1, 0]].is_nan());
        assert_eq!(data.samples()[[2, 1]], 6.0);
    }

    #[test]
    fn test_var_type_can_make_float_responses_categorical() {
        let opts = DataOptions::parse(&[
            Value::from("VarType"),
            Value::Cell(vec![Value::from("Numerical"), Value::from("Categorical")]),
        ])
        .unwrap();
        let data = TrainData::from_matrices(
            array![[1.0f32], [2.0]],
            ResponseMatrix::Single(array![[1.0f32], [2.0]]),
            opts,
        )
        .unwrap();
        assert_eq!(data.responses(), &Responses::Categorical(vec![1, 2]));
    }

    #[test]
    fn test_split_ratio_is_reproducible() {
        let samples = Array2::from_shape_fn((10, 1), |(i, _)| i as f32);
        let responses = ResponseMatrix::Int32(Array2::from_shape_fn((10, 1), |(i, _)| (i % 2) as i32));
        let opts = DataOptions::parse(&[Value::from("TrainTestSplitRatio"), Value::from(0.7)]).unwrap();
        let a = TrainData::from_matrices(samples.clone(), responses.clone(), opts.clone()).unwrap();
        let b = TrainData::from_matrices(samples, responses, opts).unwrap();
        assert_eq!(a.train_sample_idx().len(), 7);
        assert_eq!(a.test_sample_idx().len(), 3);
        assert_eq!(a.train_sample_idx(), b.train_sample_idx());
    }

    #[test]
    fn test_unknown_and_unpaired_options() {
        let err = DataOptions::parse(&[Value::from("Bogus"), Value::from(1)]).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownOption(ref k) if k == "Bogus"));

        let err = DataOptions::parse(&[Value::from("Layout")]).unwrap_err();
        assert!(matches!(err, DispatchError::Arity(_)));
    }

    #[test]
    fn test_var_type_spec() {
        let types = parse_var_type_spec("ord[0-2]cat[3,4]", 6).unwrap();
        assert_eq!(types[2], VarType::Ordered);
        assert_eq!(types[3], VarType::Categorical);
        assert_eq!(types[4], VarType::Categorical);
        assert_eq!(types[5], VarType::Ordered);
        assert!(parse_var_type_spec("cat[9]", 3).is_err());
        assert!(parse_var_type_spec("foo[1]", 3).is_err());
    }

    #[test]
    fn test_load_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a,b,label").unwrap();
        writeln!(file, "1.0,2.5,0").unwrap();
        writeln!(file, "?,3.5,1").unwrap();
        writeln!(file, "2.0,4.5,1").unwrap();
        file.flush().unwrap();

        let path = file.path().to_str().unwrap();
        let data = TrainData::load_csv(path, &CsvOptions::default()).unwrap();
        assert_eq!(data.n_samples(), 3);
        assert_eq!(data.n_vars(), 2);
        assert!(data.samples()[[1, 0]].is_nan());
        assert_eq!(data.responses(), &Responses::Categorical(vec![0, 1, 1]));
    }

    #[test]
    fn test_load_csv_missing_file() {
        let err = TrainData::load_csv("/nonexistent/data.csv", &CsvOptions::default()).unwrap_err();
        assert!(matches!(err, DispatchError::Io { .. }));
    }
}
