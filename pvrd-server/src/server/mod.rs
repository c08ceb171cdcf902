//! Client-facing server: listener, sessions and request handling.

pub mod channels;
pub mod dispatch;
pub mod filter;
pub mod listener;
pub mod playback;
pub mod session;
pub mod status;
pub mod streaming;

pub use listener::{Server, ServerConfig};
