pub mod addr;
pub mod error;
pub mod stream;

pub use addr::Address;
pub use error::{Error, Result};
pub use stream::{AsyncStream, DirectionalStream, PreBufferedStream, ProxyStream};
