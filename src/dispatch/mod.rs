//! Configuration dispatch to remote proxies
//!
//! The [`Dispatcher`] fans every configuration message out to the attached
//! [`DispatchTarget`]s and replays the latest one to targets that attach
//! later. [`DispatchServer`] exposes the stream over HTTP, one target per
//! connection.

pub mod dispatcher;
pub mod message;
pub mod server;

pub use dispatcher::{channel, ChannelTarget, DispatchTarget, Dispatcher, TargetReceiver};
pub use message::{Message, MessageType};
pub use server::DispatchServer;
