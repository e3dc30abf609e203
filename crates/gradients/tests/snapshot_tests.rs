use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{loss, Embedding, Module};
use gradients::{
    compare_gradients, get_flattened_weight_vector, get_gradients, tensors_equal, Batch,
    ForwardInput, GradientError, GradientModel, ModelOutput, ATTENTION_MASK, LABELS,
};

const VOCAB: usize = 8;
const HIDDEN: usize = 4;

/// Bag-of-embeddings classifier predicting the first label of each row.
struct PooledClassifier {
    params: Vec<(String, Var)>,
    frozen: Vec<String>,
    grads: HashMap<String, Tensor>,
    loss_mode: LossMode,
}

#[derive(Clone, Copy, PartialEq)]
enum LossMode {
    Normal,
    Missing,
    Detached,
    Vector,
    Reject,
}

impl PooledClassifier {
    fn new() -> Result<Self> {
        let device = Device::Cpu;
        let embed: Vec<f32> = (0..VOCAB * HIDDEN)
            .map(|i| ((i * 7 % 11) as f32 - 5.0) / 10.0)
            .collect();
        let head: Vec<f32> = (0..HIDDEN * VOCAB)
            .map(|i| ((i * 5 % 13) as f32 - 6.0) / 10.0)
            .collect();
        let params = vec![
            (
                "embed.weight".to_string(),
                Var::from_tensor(&Tensor::from_vec(embed, (VOCAB, HIDDEN), &device)?)?,
            ),
            (
                "head.weight".to_string(),
                Var::from_tensor(&Tensor::from_vec(head, (HIDDEN, VOCAB), &device)?)?,
            ),
            (
                "head.bias".to_string(),
                Var::from_tensor(&Tensor::zeros(VOCAB, DType::F32, &device)?)?,
            ),
        ];
        Ok(Self {
            params,
            frozen: Vec::new(),
            grads: HashMap::new(),
            loss_mode: LossMode::Normal,
        })
    }

    fn with_loss_mode(mut self, mode: LossMode) -> Self {
        self.loss_mode = mode;
        self
    }

    fn freeze(&mut self, name: &str) {
        self.frozen.push(name.to_string());
    }

    fn param(&self, name: &str) -> &Var {
        &self
            .params
            .iter()
            .find(|(candidate, _)| candidate == name)
            .expect("known parameter")
            .1
    }
}

impl GradientModel for PooledClassifier {
    fn named_gradients(&self) -> Vec<(String, Option<Tensor>)> {
        self.params
            .iter()
            .map(|(name, _)| (name.clone(), self.grads.get(name).cloned()))
            .collect()
    }

    fn zero_grad(&mut self) {
        self.grads.clear();
    }

    fn forward(&self, input: &ForwardInput<'_>) -> candle_core::Result<ModelOutput> {
        if self.loss_mode == LossMode::Reject {
            return Err(candle_core::Error::Msg("forward rejected".into()));
        }
        let embedding = Embedding::new(self.param("embed.weight").as_tensor().clone(), HIDDEN);
        let hidden = embedding.forward(input.input_ids)?;
        let hidden = match input.attention_mask {
            Some(mask) => hidden.broadcast_mul(&mask.to_dtype(DType::F32)?.unsqueeze(2)?)?,
            None => hidden,
        };
        let pooled = hidden.sum(1)?;
        let logits = pooled
            .matmul(self.param("head.weight").as_tensor())?
            .broadcast_add(self.param("head.bias").as_tensor())?;

        let loss = match (self.loss_mode, input.labels) {
            (LossMode::Missing, _) | (_, None) => None,
            (LossMode::Detached, Some(_)) => Some(Tensor::new(1.5f32, logits.device())?),
            (LossMode::Vector, Some(_)) => Some(logits.sum(1)?),
            (_, Some(labels)) => {
                let targets = labels.narrow(1, 0, 1)?.squeeze(1)?.to_dtype(DType::U32)?;
                Some(loss::cross_entropy(&logits, &targets)?)
            }
        };

        Ok(ModelOutput {
            logits: logits.unsqueeze(1)?,
            loss,
            cache: None,
        })
    }

    fn backward(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let store = loss.backward()?;
        for (name, var) in &self.params {
            if self.frozen.contains(name) {
                continue;
            }
            if let Some(grad) = store.get(var.as_tensor()) {
                let merged = match self.grads.remove(name) {
                    Some(existing) => existing.add(grad)?,
                    None => grad.clone(),
                };
                self.grads.insert(name.clone(), merged);
            }
        }
        Ok(())
    }
}

fn batch(rows: &[[i64; 4]]) -> Result<Batch> {
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    let ids = Tensor::from_vec(flat, (rows.len(), 4), &Device::Cpu)?;
    let mask = Tensor::ones((rows.len(), 4), DType::U32, &Device::Cpu)?;
    Ok(Batch::from_parts(ids.clone(), ids, mask))
}

#[test]
fn same_batch_gives_identical_gradients() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    let sample = batch(&[[1, 2, 3, 4]])?;

    let first = get_gradients(&mut model, &sample, &Device::Cpu)?;
    let second = get_gradients(&mut model, &sample, &Device::Cpu)?;

    let comparison = compare_gradients(&first, &second)?;
    assert!(comparison.all_equal(), "{comparison:?}");
    assert_eq!(first.keys().collect::<Vec<_>>(), vec!["embed.weight", "head.weight", "head.bias"]);
    Ok(())
}

#[test]
fn different_batches_give_different_gradients() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    let a = get_gradients(&mut model, &batch(&[[1, 2, 3, 4]])?, "cpu")?;
    let b = get_gradients(&mut model, &batch(&[[5, 6, 7, 0]])?, "cpu")?;

    assert!(a.same_keys(&b));
    let comparison = compare_gradients(&a, &b)?;
    assert!(!comparison.different.is_empty());
    Ok(())
}

#[test]
fn repeated_calls_do_not_accumulate() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    let sample = batch(&[[1, 2, 3, 4], [3, 3, 1, 0]])?;

    let baseline = get_gradients(&mut model, &sample, &Device::Cpu)?;
    let repeated = get_gradients(&mut model, &sample, &Device::Cpu)?;
    assert!(compare_gradients(&baseline, &repeated)?.all_equal());

    // Without a reset the accumulators double.
    let output = model.forward(
        &ForwardInput::new(sample.input_ids()?)
            .with_labels(sample.labels()?)
            .with_attention_mask(sample.attention_mask()?),
    )?;
    model.backward(output.loss.as_ref().expect("loss"))?;
    let doubled = get_flattened_weight_vector(
        &model
            .named_gradients()
            .into_iter()
            .filter_map(|(name, grad)| grad.map(|grad| (name, grad)))
            .collect(),
    )?;
    let expected = (get_flattened_weight_vector(&baseline)? * 2.0)?;
    let diff = (doubled - expected)?.abs()?.max(0)?.to_scalar::<f32>()?;
    assert!(diff < 1e-5, "max diff {diff}");
    Ok(())
}

#[test]
fn snapshots_are_detached_host_copies() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    let sample = batch(&[[1, 2, 3, 4]])?;
    let snapshot = get_gradients(&mut model, &sample, &Device::Cpu)?;

    model.zero_grad();
    assert!(model.named_gradients().iter().all(|(_, grad)| grad.is_none()));

    for (_, grad) in snapshot.iter() {
        assert!(grad.device().is_cpu());
    }
    let again = get_gradients(&mut model, &sample, &Device::Cpu)?;
    for (name, grad) in snapshot.iter() {
        assert!(tensors_equal(grad, again.get(name).expect("same key"))?);
    }
    Ok(())
}

#[test]
fn frozen_parameters_are_omitted() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    model.freeze("head.bias");

    let snapshot = get_gradients(&mut model, &batch(&[[1, 2, 3, 4]])?, &Device::Cpu)?;

    assert_eq!(snapshot.len(), 2);
    assert!(!snapshot.contains_key("head.bias"));
    Ok(())
}

#[test]
fn missing_field_is_reported_by_name() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    for field in [LABELS, ATTENTION_MASK] {
        let mut sample = batch(&[[1, 2, 3, 4]])?;
        sample.remove(field);
        match get_gradients(&mut model, &sample, &Device::Cpu) {
            Err(GradientError::MissingBatchField(name)) => assert_eq!(name, field),
            other => panic!("expected missing {field}, got {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn invalid_device_is_a_device_error() -> Result<()> {
    let mut model = PooledClassifier::new()?;
    let result = get_gradients(&mut model, &batch(&[[1, 2, 3, 4]])?, "quantum:0");
    assert!(matches!(result, Err(GradientError::Device { .. })));
    Ok(())
}

#[test]
fn unusable_losses_are_invalid_model_interfaces() -> Result<()> {
    for mode in [LossMode::Missing, LossMode::Detached, LossMode::Vector] {
        let mut model = PooledClassifier::new()?.with_loss_mode(mode);
        let result = get_gradients(&mut model, &batch(&[[1, 2, 3, 4], [0, 1, 2, 3]])?, "cpu");
        assert!(
            matches!(result, Err(GradientError::InvalidModelInterface(_))),
            "unexpected result {result:?}"
        );
    }
    Ok(())
}

#[test]
fn rejected_inputs_are_invalid_model_interfaces() -> Result<()> {
    let mut model = PooledClassifier::new()?.with_loss_mode(LossMode::Reject);
    let result = get_gradients(&mut model, &batch(&[[1, 2, 3, 4]])?, "cpu");
    match result {
        Err(GradientError::InvalidModelInterface(message)) => {
            assert!(message.contains("forward rejected"), "{message}");
        }
        other => panic!("unexpected result {other:?}"),
    }
    Ok(())
}

#[test]
fn boxed_models_work_through_the_trait() -> Result<()> {
    let mut model: Box<dyn GradientModel> = Box::new(PooledClassifier::new()?);
    let snapshot = get_gradients(&mut model, &batch(&[[1, 2, 3, 4]])?, "cpu")?;
    assert_eq!(snapshot.len(), 3);
    let flat = get_flattened_weight_vector(&snapshot)?;
    assert_eq!(flat.dims1()?, VOCAB * HIDDEN + HIDDEN * VOCAB + VOCAB);
    Ok(())
}
