//! # Bolt Protocol Vocabulary
//!
//! The protocol-level types the session runtime speaks: decoded request
//! messages, status codes, and the value model for parameters and response
//! metadata.
//!
//! Wire concerns (PackStream serialization, chunked framing, version
//! handshake) belong to the transport layer and never reach this crate:
//! requests arrive here already decoded, and responses leave through the
//! [`ResponseHandler`] capability.
//!
//! ## Submodules
//!
//! - [`message`] - Request message types (HELLO, RUN, PULL, etc.)
//! - [`status`] - Status codes and their classification
//! - [`value`] - Decoded parameter and metadata values
//!
//! [`ResponseHandler`]: crate::runtime::spi::ResponseHandler

pub mod message;
pub mod status;
pub mod value;

pub use message::{
    AccessMode, AuthToken, BeginMessage, HelloMessage, RequestMessage, RunMessage,
    StreamingMessage, STREAM_LIMIT_UNLIMITED,
};
pub use status::{Classification, StatusCode};
pub use value::Value;
