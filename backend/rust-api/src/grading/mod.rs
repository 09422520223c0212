//! Quiz grading: per-answer evaluation, attempt scoring and the attempt lifecycle.

pub mod evaluator;
pub mod lifecycle;
pub mod scorer;

pub use evaluator::{evaluate, Evaluation};
pub use scorer::score;
