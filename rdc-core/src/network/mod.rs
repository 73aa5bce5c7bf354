pub mod transport;

pub use transport::{AsyncStream, Transport};
