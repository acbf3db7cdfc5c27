//! # courier-core
//!
//! In-memory core of the Courier direct-messaging service.
//!
//! - **ChatHub** / **NotificationHub** - identity-keyed connection registries
//! - **ChatPresence** - who is inside which chat right now
//! - **ActiveUserDirectory** - who is online at all, with a grace window
//! - **Messenger** - the message status state machine and its fan-out
//! - **Store** - the persistence seam, with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     ┌─────────────┐     ┌────────────────┐
//! │ Connection │────▶│  Messenger  │────▶│     Store      │
//! └────────────┘     └─────────────┘     └────────────────┘
//!                      │    │    │
//!           ┌──────────┘    │    └──────────────┐
//!           ▼               ▼                   ▼
//!    ┌─────────────┐ ┌──────────────┐ ┌─────────────────────┐
//!    │   ChatHub   │ │ ChatPresence │ │ ActiveUserDirectory │
//!    └─────────────┘ └──────────────┘ └─────────────────────┘
//! ```

pub mod directory;
pub mod handle;
pub mod hub;
pub mod identity;
pub mod memory;
pub mod message;
pub mod messenger;
pub mod notify;
pub mod room;
pub mod status;
pub mod store;

pub use directory::{ActiveUserDirectory, ActiveUserEntry, PresenceEvent, DEFAULT_GRACE_PERIOD};
pub use handle::{
    CloseSignal, ConnectionHandle, ConnectionId, Outbound, SendError, DEFAULT_OUTBOUND_CAPACITY,
};
pub use hub::ChatHub;
pub use identity::{AuthError, TrustingVerifier, Verifier};
pub use memory::MemoryStore;
pub use message::{
    ChatId, ChatMembers, ChatSummary, Identity, LastMessage, Message, NewMessage,
};
pub use messenger::{ChatContext, Messenger, RelayError};
pub use notify::NotificationHub;
pub use room::ChatPresence;
pub use status::StatusError;
pub use store::{Store, StoreError};
