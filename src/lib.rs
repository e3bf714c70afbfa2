pub mod bridge;
pub mod config;
pub mod error;
pub mod models;
pub mod providers;
pub mod recorder;
pub mod server;
pub mod translate;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use recorder::ExchangeRecorder;
pub use server::{build_router, AppState};
pub use upstream::UpstreamDispatcher;
