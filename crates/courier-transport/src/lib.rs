//! # courier-transport
//!
//! Socket abstraction for the Courier messaging core.
//!
//! Connection workers are written against the [`Connection`] trait, so the
//! same worker serves a socket upgraded by axum, a raw tungstenite stream or
//! a scripted test double.
//!
//! ```rust,ignore
//! use courier_transport::{Connection, Received};
//!
//! async fn echo(mut conn: impl Connection) {
//!     while let Ok(Some(Received::Data(frame))) = conn.recv().await {
//!         let _ = conn.send(frame).await;
//!     }
//! }
//! ```

pub mod axum_ws;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use axum_ws::AxumConnection;
pub use traits::{Connection, Received, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::TungsteniteConnection;
