//! The model abstraction consumed by the snapshot routine.

use candle_core::{Result, Tensor};

/// Inputs of a single forward pass.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInput<'a> {
    pub input_ids: &'a Tensor,
    pub labels: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    /// When false the model must not produce or keep incremental decoding state.
    pub use_cache: bool,
}

impl<'a> ForwardInput<'a> {
    pub fn new(input_ids: &'a Tensor) -> Self {
        Self {
            input_ids,
            labels: None,
            attention_mask: None,
            use_cache: false,
        }
    }

    pub fn with_labels(mut self, labels: &'a Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_attention_mask(mut self, attention_mask: &'a Tensor) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// Per-layer `(keys, values)` produced when caching is requested.
pub type KeyValueCache = Vec<(Tensor, Tensor)>;

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Tensor,
    /// Scalar loss, present when labels were supplied.
    pub loss: Option<Tensor>,
    pub cache: Option<KeyValueCache>,
}

/// A differentiable model that owns its gradient accumulators.
///
/// Accumulators behave like an autograd framework's `.grad` slots: `backward`
/// adds into them and `zero_grad` clears them. The reset/forward/backward
/// sequence used by [`get_gradients`](crate::get_gradients) is not atomic, so
/// a model instance must never be shared between concurrent snapshot calls;
/// the `&mut` receivers make that a compile-time guarantee.
pub trait GradientModel {
    /// Parameters in model-defined order, paired with their current gradient.
    ///
    /// Parameters that did not receive a gradient (for example frozen ones)
    /// report `None`.
    fn named_gradients(&self) -> Vec<(String, Option<Tensor>)>;

    /// Clears all gradient accumulators.
    fn zero_grad(&mut self);

    fn forward(&self, input: &ForwardInput<'_>) -> Result<ModelOutput>;

    /// Back-propagates `loss` and adds the result into the accumulators.
    fn backward(&mut self, loss: &Tensor) -> Result<()>;
}

impl<M: GradientModel + ?Sized> GradientModel for Box<M> {
    fn named_gradients(&self) -> Vec<(String, Option<Tensor>)> {
        (**self).named_gradients()
    }

    fn zero_grad(&mut self) {
        (**self).zero_grad()
    }

    fn forward(&self, input: &ForwardInput<'_>) -> Result<ModelOutput> {
        (**self).forward(input)
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        (**self).backward(loss)
    }
}
