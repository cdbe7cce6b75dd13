pub mod admin_api;
pub mod http_client;
pub mod http_handler;
pub mod memory_store;
pub mod redis_store;
pub mod registration;

/// Re-export commonly used types from adapters
pub use admin_api::{AdminState, admin_router};
pub use http_client::HttpClientAdapter;
pub use http_handler::{GatewayHandler, gateway_router};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
