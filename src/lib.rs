pub mod classifier;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

pub use classifier::{ExampleClassifier, ExampleSet};
pub use codec::StoredClassifierGraph;
pub use config::Configuration;
pub use error::ClassifierError;
