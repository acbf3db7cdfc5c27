//! # courier-protocol
//!
//! Wire protocol definitions for the Courier direct-messaging core.
//!
//! Every frame on every Courier socket is a JSON object (or, for the
//! active-user feed, a JSON array). Inbound chat frames may be batched as
//! newline-delimited JSON.
//!
//! ## Frame Families
//!
//! - `ClientMessage` - what a sender writes on its chat connection
//! - `ChatFrame` - acks, message echoes and status broadcasts on chat connections
//! - `ChatNotice` / `FollowNotice` - out-of-band notification payloads
//! - `ActiveUser` - entries of the active-user feed
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ChatEvent, ChatFrame, MessageStatus};
//!
//! let frame = ChatFrame::Event(ChatEvent::MessageId {
//!     id: 7,
//!     status: MessageStatus::Sent,
//! });
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ChatFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod status;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{
    ActiveUser, ChatEvent, ChatFrame, ChatNotice, ClientMessage, FollowNotice, MessageEnvelope,
    MessageId,
};
pub use status::MessageStatus;
