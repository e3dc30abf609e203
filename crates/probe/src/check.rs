use candle_core::{DType, Device, Tensor};
use dataset::{
    load_tokenizer, prepare_dataset, save_tokenizer, train_tokenizer, BatchConfig,
    StreamingCorpus, TextCorpus, TokenizerTrainingConfig,
};
use gradients::{
    compare_gradients, cosine_similarity, device_label, get_flattened_weight_vector,
    get_gradients, l2_norm, parse_device, tensors_equal, Batch, ForwardInput, GradientComparison,
    GradientMap, GradientModel,
};
use model::CausalLm;
use serde::Serialize;
use tokenizers::Tokenizer;

use crate::{
    config::ProbeConfig,
    logging::{Logger, LoggingSettings},
    ProbeError,
};

/// Relative tolerance for the doubled-gradient comparison.
const ACCUMULATION_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub label: String,
    pub batch_index: usize,
    pub parameters: usize,
    pub flattened_len: usize,
    pub l2_norm: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub name: String,
    pub equal: Vec<String>,
    pub different: Vec<String>,
    pub only_left: Vec<String>,
    pub only_right: Vec<String>,
    pub cosine_similarity: Option<f64>,
    pub passed: bool,
}

impl ComparisonSummary {
    fn new(
        name: &str,
        comparison: GradientComparison,
        cosine_similarity: Option<f64>,
        passed: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            equal: comparison.equal,
            different: comparison.different,
            only_left: comparison.only_left,
            only_right: comparison.only_right,
            cosine_similarity,
            passed,
        }
    }

    /// Keys that made the comparison fail.
    fn offending_keys(&self, expect_equal: bool) -> Vec<String> {
        let mismatched = if expect_equal {
            &self.different
        } else {
            &self.equal
        };
        mismatched
            .iter()
            .chain(&self.only_left)
            .chain(&self.only_right)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccumulationSummary {
    /// Largest `|accumulated - 2 * single|` over all values.
    pub max_abs_deviation: f64,
    /// Whether a fresh snapshot after the raw passes matched the baseline.
    pub reset_restores_baseline: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub device: String,
    pub vocab_size: usize,
    pub batches: usize,
    pub parameter_count: usize,
    pub frozen: Vec<String>,
    pub inputs_differ: bool,
    pub snapshots: Vec<SnapshotSummary>,
    pub comparisons: Vec<ComparisonSummary>,
    pub accumulation: Option<AccumulationSummary>,
    pub passed: bool,
}

impl CheckReport {
    /// First failed check as an error, if any.
    pub fn failure(&self) -> Option<ProbeError> {
        if !self.inputs_differ {
            return Some(ProbeError::check_failed("distinct inputs", Vec::new()));
        }
        for comparison in &self.comparisons {
            if !comparison.passed {
                let expect_equal = comparison.name == SAME_BATCH;
                return Some(ProbeError::check_failed(
                    comparison.name.clone(),
                    comparison.offending_keys(expect_equal),
                ));
            }
        }
        match &self.accumulation {
            Some(accumulation) if !accumulation.passed => {
                Some(ProbeError::check_failed("no accumulation", Vec::new()))
            }
            _ => None,
        }
    }
}

const SAME_BATCH: &str = "same_batch";
const DISTINCT_BATCHES: &str = "distinct_batches";

/// End-to-end determinism and sensitivity check over a real model and
/// corpus.
pub struct DeterminismCheck {
    config: ProbeConfig,
    device: Device,
    tokenizer: Tokenizer,
    batches: Vec<Batch>,
    model: CausalLm,
    logger: Logger,
}

impl DeterminismCheck {
    pub fn new(config: ProbeConfig) -> Result<Self, ProbeError> {
        config.validate()?;

        let device = parse_device(&config.runtime.device)
            .map_err(|err| ProbeError::initialization(err.to_string()))?;

        let corpus = StreamingCorpus::new(config.data.shards.clone())
            .map_err(|err| ProbeError::initialization(format!("invalid corpus: {err}")))?
            .with_text_field(config.data.text_field.clone());
        let tokenizer = build_tokenizer(&config, &corpus)?;

        let batch_config = BatchConfig {
            batch_size: config.data.batch_size,
            max_length: config.data.max_length,
            shuffle: config.data.shuffle,
            seed: config.runtime.seed,
            add_special_tokens: config.data.add_special_tokens,
            pad_token: config.data.pad_token.clone(),
        };
        let batches = prepare_dataset(&corpus, &tokenizer, &batch_config, &Device::Cpu)?;

        let needed = config.runtime.sample_indices.iter().max().copied().unwrap_or(0) + 1;
        if batches.len() < needed {
            return Err(ProbeError::initialization(format!(
                "runtime.sample_indices needs {needed} batches but the corpus produced {}",
                batches.len()
            )));
        }

        let mut model_config = config.model.clone();
        model_config.vocab_size = tokenizer.get_vocab_size(true);
        model_config.seed = config.runtime.seed;
        let mut model = CausalLm::new(model_config, &device).map_err(|err| {
            ProbeError::initialization(format!("failed to build model: {err}"))
        })?;

        for prefix in &config.runtime.freeze {
            if model.freeze(prefix) == 0 {
                return Err(ProbeError::initialization(format!(
                    "runtime.freeze prefix '{prefix}' matches no parameter"
                )));
            }
        }

        let logger = Logger::new(LoggingSettings::from_config(&config.logging))?;

        Ok(Self {
            config,
            device,
            tokenizer,
            batches,
            model,
            logger,
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn model(&self) -> &CausalLm {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut CausalLm {
        &mut self.model
    }

    /// Runs the check, writes the report if configured and fails with the
    /// first violated property.
    pub fn run(&mut self) -> Result<CheckReport, ProbeError> {
        let report = self.evaluate()?;
        self.logger.write_report(&report)?;
        self.logger.flush();
        match report.failure() {
            Some(err) => Err(err),
            None => {
                self.logger.log_message("all gradient checks passed");
                Ok(report)
            }
        }
    }

    /// Runs every check and returns the report without failing on violations.
    pub fn evaluate(&mut self) -> Result<CheckReport, ProbeError> {
        let [first_index, second_index] = self.config.runtime.sample_indices;
        let first = self.batches[first_index].clone();
        let second = self.batches[second_index].clone();

        let inputs_differ = !tensors_equal(first.input_ids()?, second.input_ids()?)?;
        if inputs_differ {
            self.logger
                .log_message("tokenized inputs differ between the two samples");
        } else {
            self.logger
                .log_message("tokenized inputs are identical; check the tokenization");
        }

        let mut snapshots = Vec::with_capacity(3);
        let sample_0 = self.snapshot(0, "sample_0", first_index, &first, &mut snapshots)?;
        let sample_1 = self.snapshot(1, "sample_1", second_index, &second, &mut snapshots)?;
        let sample_0_later =
            self.snapshot(2, "sample_0_later", first_index, &first, &mut snapshots)?;

        let same = compare_gradients(&sample_0, &sample_0_later)?;
        let same_passed = same.all_equal();
        let same = ComparisonSummary::new(
            SAME_BATCH,
            same,
            cosine_similarity(&sample_0, &sample_0_later)?,
            same_passed,
        );
        self.logger.log_comparison(0, &same);

        let distinct = compare_gradients(&sample_0, &sample_1)?;
        let distinct_passed = distinct.all_different();
        let distinct = ComparisonSummary::new(
            DISTINCT_BATCHES,
            distinct,
            cosine_similarity(&sample_0, &sample_1)?,
            distinct_passed,
        );
        self.logger.log_comparison(1, &distinct);

        let accumulation = if self.config.runtime.check_accumulation {
            Some(self.check_accumulation(&first, &sample_0)?)
        } else {
            None
        };

        let passed = inputs_differ
            && same_passed
            && distinct_passed
            && accumulation.as_ref().map_or(true, |acc| acc.passed);

        let mut frozen: Vec<String> = self
            .model
            .parameter_names()
            .into_iter()
            .filter(|name| self.model.is_frozen(name))
            .collect();
        frozen.sort();

        Ok(CheckReport {
            device: device_label(&self.device),
            vocab_size: self.model.config().vocab_size,
            batches: self.batches.len(),
            parameter_count: self.model.parameter_count(),
            frozen,
            inputs_differ,
            snapshots,
            comparisons: vec![same, distinct],
            accumulation,
            passed,
        })
    }

    fn snapshot(
        &mut self,
        step: usize,
        label: &str,
        batch_index: usize,
        batch: &Batch,
        summaries: &mut Vec<SnapshotSummary>,
    ) -> Result<GradientMap, ProbeError> {
        let gradients = get_gradients(&mut self.model, batch, &self.device)?;
        let flattened = get_flattened_weight_vector(&gradients)?;

        let norms = gradients
            .iter()
            .map(|(name, grad)| Ok((name.to_string(), l2_norm(grad)?)))
            .collect::<Result<Vec<_>, ProbeError>>()?;
        let summary = SnapshotSummary {
            label: label.to_string(),
            batch_index,
            parameters: gradients.len(),
            flattened_len: flattened.dims1()?,
            l2_norm: l2_norm(&flattened)?,
        };
        self.logger.log_snapshot(step, &summary, &norms);
        summaries.push(summary);
        Ok(gradients)
    }

    /// Two raw forward/backward passes without a reset must give twice the
    /// single-pass gradient, and a snapshot afterwards must match `baseline`
    /// again.
    fn check_accumulation(
        &mut self,
        batch: &Batch,
        baseline: &GradientMap,
    ) -> Result<AccumulationSummary, ProbeError> {
        let on_device = batch.to_device(&self.device)?;
        let input = ForwardInput::new(on_device.input_ids()?)
            .with_labels(on_device.labels()?)
            .with_attention_mask(on_device.attention_mask()?);

        self.model.zero_grad();
        for _ in 0..2 {
            let output = self.model.forward(&input)?;
            let loss = output
                .loss
                .ok_or_else(|| ProbeError::runtime("model returned no loss for a labelled batch"))?;
            self.model.backward(&loss)?;
        }

        let accumulated = self
            .model
            .named_gradients()
            .into_iter()
            .filter_map(|(name, grad)| grad.map(|grad| (name, grad)))
            .collect::<GradientMap>();
        self.model.zero_grad();

        let doubled = get_flattened_weight_vector(&accumulated)?.to_dtype(DType::F64)?;
        let expected = (get_flattened_weight_vector(baseline)?.to_dtype(DType::F64)? * 2.0)?;
        let max_abs_deviation = max_abs(&(doubled - &expected)?)?;
        let scale = max_abs(&expected)?.max(1.0);

        let fresh = get_gradients(&mut self.model, batch, &self.device)?;
        let reset_restores_baseline = compare_gradients(baseline, &fresh)?.all_equal();

        let passed =
            max_abs_deviation <= ACCUMULATION_TOLERANCE * scale && reset_restores_baseline;
        self.logger.log_message(&format!(
            "accumulation check: max deviation {max_abs_deviation:.3e}, reset restores baseline: {reset_restores_baseline}"
        ));

        Ok(AccumulationSummary {
            max_abs_deviation,
            reset_restores_baseline,
            passed,
        })
    }
}

fn max_abs(tensor: &Tensor) -> Result<f64, ProbeError> {
    if tensor.elem_count() == 0 {
        return Ok(0.0);
    }
    Ok(tensor.abs()?.max(0)?.to_scalar::<f64>()?)
}

fn build_tokenizer(
    config: &ProbeConfig,
    corpus: &StreamingCorpus,
) -> Result<Tokenizer, ProbeError> {
    if let Some(path) = &config.tokenizer.tokenizer_json {
        return Ok(load_tokenizer(path)?);
    }

    let vocab_size = config.tokenizer.train_vocab_size.ok_or_else(|| {
        ProbeError::initialization("tokenizer needs `tokenizer_json` or `train_vocab_size`")
    })?;
    let documents = corpus.stream()?.collect::<std::io::Result<Vec<_>>>()?;
    let training = TokenizerTrainingConfig {
        vocab_size,
        min_frequency: config.tokenizer.min_frequency,
        ..TokenizerTrainingConfig::default()
    };
    let tokenizer = train_tokenizer(&documents, &training)?;

    if let Some(path) = &config.tokenizer.save_to {
        save_tokenizer(&tokenizer, path)?;
        log::info!("saved trained tokenizer to {}", path.display());
    }
    Ok(tokenizer)
}
