pub mod coercion;
pub mod gateway;

pub use gateway::{ChatMessage, ChatResponse, ChatRole, LlmGateway, RigGateway, RigProvider, TokenUsage};
