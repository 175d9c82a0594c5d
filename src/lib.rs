//! Hierarchy-aware softmax layer
//!
//! Temperature-scaled softmax over flat groups, spatial positions or the
//! groups of a class tree, with the matching backward pass, on host buffers
//! or candle device tensors.

pub mod buffer;
pub mod kernels;
pub mod layer;
pub mod num_helpers;
pub mod ops;
pub mod partition;
pub mod tree;

pub use buffer::{Coherence, MirroredBuffer};
pub use kernels::StrideParams;
pub use layer::{ExecTarget, LayerState, SoftmaxConfig, SoftmaxLayer};
pub use ops::{GroupedSoftmax, scaled_softmax, scaled_softmax_backward};
pub use partition::{KernelCall, Partition, Plan};
pub use tree::SoftmaxTree;
