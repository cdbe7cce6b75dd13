pub mod http_client;
pub mod store;

pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use store::{Store, StoreError, StoreResult};
