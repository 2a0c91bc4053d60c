pub mod openai_compatible;
pub mod sse;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use sse::SseDecoder;
