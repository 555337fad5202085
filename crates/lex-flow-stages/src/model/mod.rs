//! Model-selection meta stages.
//!
//! No learning algorithm lives here: estimators are ordinary stages supplied
//! through an [`EstimatorFactory`], and these meta stages only wire them into
//! cross-validation and grid-search graphs.

mod cross_validation;
mod estimator;
mod grid_search;

pub use cross_validation::CrossValidationScore;
pub use estimator::{ESTIMATOR_INPUTS, EstimatorFactory};
pub use grid_search::{GridSearch, PARAMS_KEY, param_combinations};
