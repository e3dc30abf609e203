//! Gradient snapshots for determinism and sensitivity checks.
//!
//! [`get_gradients`] resets a model's gradient accumulators, runs one
//! forward and backward pass over a [`Batch`] and returns a detached,
//! host-resident [`GradientMap`] keyed by parameter name.
//! [`get_flattened_weight_vector`] concatenates such a map into a single 1-D
//! tensor, and the [`compare`] helpers report which parameters agree between
//! two snapshots.
//!
//! # Models
//!
//! Any architecture can be plugged in through [`GradientModel`]: it exposes
//! parameters as an ordered list of `(name, Option<gradient>)` pairs, a
//! gradient reset, a forward pass over `input_ids`/`labels`/`attention_mask`
//! and a backward pass that accumulates into the model's own buffers.
//!
//! # Thread Safety
//!
//! The reset-then-accumulate sequence mutates shared model state and is not
//! atomic. Snapshot calls on one model must be serialized; taking the model
//! by `&mut` enforces this.

pub mod batch;
pub mod compare;
pub mod device;
pub mod errors;
pub mod flatten;
pub mod map;
pub mod model;
pub mod snapshot;

pub use batch::{Batch, ATTENTION_MASK, IGNORE_INDEX, INPUT_IDS, LABELS, REQUIRED_FIELDS};
pub use compare::{compare_gradients, cosine_similarity, l2_norm, tensors_equal, GradientComparison};
pub use device::{device_label, parse_device, TargetDevice};
pub use errors::{GradientError, Result};
pub use flatten::get_flattened_weight_vector;
pub use map::GradientMap;
pub use model::{ForwardInput, GradientModel, KeyValueCache, ModelOutput};
pub use snapshot::get_gradients;
