//! Provider transport implementations.

pub mod mock;
pub use mock::{MockOutcome, MockProvider, DEFAULT_MOCK_RESPONSE};

// Any vendor speaking the OpenAI chat completions protocol
pub mod openai_compatible;
pub use openai_compatible::OpenAICompatibleProvider;
