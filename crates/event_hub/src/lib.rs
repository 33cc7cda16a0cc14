//! Per-user fan-out of server events to every live connection of that user.
//!
//! A transport creates a [`Mailbox`] per connection, registers it with the
//! [`EventHub`], and forwards [`connection_stream`] to the wire. Application code
//! only ever calls [`EventHub::notify_user`] or [`EventHub::notify_current_user`].

mod config;
mod current_user;
mod hub;
mod mailbox;
mod stream;

pub use config::HubConfig;
pub use current_user::{current_user, scope_current_user};
pub use hub::{EventHub, HubError};
pub use mailbox::Mailbox;
pub use stream::{connection_stream, merge_halt_either};
