//! Length-framed CBOR wire protocol.
//!
//! Every message on a connection is a u32 big-endian length prefix
//! followed by a CBOR body, bounded by the configured maximum message
//! size on both read and write. Clients send [`RequestFrame`]s and
//! receive [`ResponseFrame`]s; frames are matched by sequence number so
//! one connection multiplexes concurrent calls.

mod codec;
mod messages;

pub use codec::{read_frame, write_frame};
pub use messages::{
    state_from_wire, state_to_wire, ErrorKind, RequestBody, RequestFrame, ResponseBody,
    ResponseFrame, WireError,
};
