pub mod balancer;
pub mod catalog;
pub mod events;
pub mod matcher;
pub mod pool;
pub mod route;

pub use balancer::LoadBalancer;
pub use catalog::RouteCatalog;
pub use events::EventLog;
pub use pool::SandboxPool;
