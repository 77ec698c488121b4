//! Remote providers the pipeline calls between transcription and synthesis.
//!
//! [`search::SearchBackend`] and [`completion::AnswerGenerator`] are the seams;
//! the Azure/OpenAI clients here are the production implementations.

pub mod completion;
pub mod search;

pub use completion::{AnswerGenerator, ApiStyle, ChatCompletionGenerator, ProviderHealth};
pub use search::{AzureSearchBackend, IndexHealth, Retriever, SearchBackend};
