pub mod client;
pub mod discovery;
pub mod instance;
pub mod pool;
pub mod registry;
pub mod service_client;
pub mod transport;

pub use client::*;
pub use discovery::*;
pub use instance::*;
pub use pool::*;
pub use registry::{InstancePool, TimeoutPolicy};
pub use service_client::*;
pub use transport::AttemptResult;
