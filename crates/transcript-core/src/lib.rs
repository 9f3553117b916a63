//! # Transcript Core
//!
//! Core types, traits, and errors shared by the transcript cache stack.
//!
//! The cache engine never talks to a network directly. It consumes the
//! [`MessageApi`] trait, which a real HTTP client or the in-memory
//! [`MockMessageApi`] implements.
//!
//! ## Key Types
//!
//! - [`SessionId`]: Opaque identifier of a session transcript
//! - [`Message`]: One entry of a session, addressed by its [`Ordinal`]
//! - [`SessionMeta`]: Authoritative session metadata (message count)
//! - [`FetchOptions`]: A paged-fetch request (`from`, `limit`, `direction`)

pub mod api;
pub mod error;
pub mod message;
pub mod mock_api;

// Re-export main types
pub use api::*;
pub use error::*;
pub use message::*;
pub use mock_api::*;
