//! Model-provider adapters.

pub mod http;
pub mod mock;
pub mod retry;

pub use http::AnthropicProvider;
pub use mock::MockProvider;
pub use retry::RetryPolicy;
