#![deny(unsafe_code)]

/// Line-oriented terminal front end.
pub mod app;
/// Chat session, reply lifecycle, history paging and view model.
pub mod chat;
pub mod error;
/// Paged history endpoint client.
pub mod history;
/// Layered settings and their persistence.
pub mod settings;

pub use error::{ChatError, ChatErrorKind, ChatResult};
