//! Remote transports: HTTP-stream, SSE, and the selector that picks between
//! them.

pub mod http;
pub mod selector;
pub mod sse;

pub use selector::{ActiveTransport, SelectorState, TransportSelector, TransportStrategy};
