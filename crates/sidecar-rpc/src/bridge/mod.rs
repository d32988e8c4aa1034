//! Wire layer shared by host and worker.
//!
//! - **protocol**: message types (`Request`, `Response`, notifications)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
