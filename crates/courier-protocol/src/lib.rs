//! # courier-protocol
//!
//! Wire protocol spoken between Courier clients and a Courier node.
//!
//! A client connects, logs in under an identity and then sends events aimed
//! at other identities. The node answers logins and pushes routed events back
//! down the same socket.
//!
//! ## Frame Types
//!
//! - `Login` / `LoginResult` - Authenticate and claim an identity
//! - `Send` - Route an event to an identity (or to everyone on the node)
//! - `Event` - An event delivered to this connection
//! - `Ack` / `Error` - Acknowledgments and errors
//! - `Ping` / `Pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{Frame, codec};
//! use serde_json::json;
//!
//! let frame = Frame::send("ojogador", "message", json!({ "text": "hi" }));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, PROTOCOL_VERSION};
