pub mod codec;
pub mod error;
pub mod instance;
pub mod request;

pub use codec::*;
pub use error::*;
pub use instance::*;
pub use request::*;
