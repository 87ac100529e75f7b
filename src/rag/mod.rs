pub mod context_builder;
pub mod intent;

pub use context_builder::ContextBuilder;
pub use intent::{IntentClassification, IntentClassifier, IntentType, QueryRewriting};
