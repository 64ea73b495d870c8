//! # proactor-net
//!
//! Session layer over the proactor.
//!
//! - `client` - `Client`: one TCP connection with queued sends and deferred receives
//! - `server` - `Server`: listener that keeps one Accept outstanding
//! - `echo` - `EchoServer`: echoes every chunk back, sessions in a slab

pub mod client;
pub mod echo;
pub mod server;

pub use client::{Client, DataCallback, StatusCallback};
pub use echo::{EchoObserver, EchoServer, SessionId};
pub use server::{ConnectedCallback, Server};
