//! Translation between the OpenAI-style client surface and the upstream
//! chat-completions API.
//!
//! Everything in here is pure (no I/O): request normalization, model-name
//! mapping, buffered response rendering, and the streaming transcoder.

pub mod chunk;
pub mod messages;
pub mod model_name;
pub mod request;
pub mod response;
pub mod streaming;
pub mod types;
