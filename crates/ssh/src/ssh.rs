//! SSH transport for the session engine, built on russh.
//!
//! Accepts connections, authenticates clients against the authorized keys,
//! collects per-channel requests and hands finished sessions to the
//! [`session::Dispatcher`].

mod agent;
mod control;
mod forward;
mod handler;
mod server;

pub use control::ChannelControl;
pub use handler::ConnectionHandler;
pub use server::{load_host_key, ServerOptions, SshServer};
