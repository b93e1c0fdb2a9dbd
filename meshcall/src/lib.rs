pub use meshcall_client::*;
pub use meshcall_derive::*;
pub use meshcall_protocol::*;
