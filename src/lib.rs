// A SIP user agent in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod dialog;
pub mod error;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;
pub mod useragent;
pub use transaction::EndpointBuilder;
pub use useragent::{UserAgent, UserAgentBuilder, UserAgentEvent};

pub const VERSION: &str = concat!("rsipua/", env!("CARGO_PKG_VERSION"));
