//! Wire protocol for tether client↔host communication.
//!
//! Messages are JSON objects, one per text frame on a persistent,
//! ordered, message-framed connection. Calls carry an `id` and expect
//! exactly one correlated response; stream-control notifications carry
//! no `id` and address a stream by its integer identifier. Binary chunk
//! payloads are base64 since the wire is text.

mod codec;
mod convert;
mod message;

pub use codec::{classify, decode_chunk, encode_call, encode_chunk, encode_stream_notification};
pub use convert::{from_wire, to_wire};
pub use message::{Incoming, ResultEnvelope, StreamControl, StreamParams, WireError, methods};
