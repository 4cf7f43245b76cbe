pub mod openai_compatible;
pub mod traits;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use traits::{ConversationProvider, ProviderError, ProviderEvent};
