//! # proactor-runtime
//!
//! The dispatcher itself: owned sockets, the readiness loop, the
//! asynchronous operation family and the Proactor that ties them together.
//!
//! ## Modules
//!
//! - `socket` - Owned IPv4 TCP descriptor with non-blocking primitives
//! - `event_queue` - Edge-triggered readiness loop (epoll / kqueue)
//! - `operation` - Accept / Connect / Read / Write operations and their state machine
//! - `proactor` - fd → operation registry and completion dispatch
//! - `config` - `ProactorConfig` with environment overrides
//!
//! ## Threading
//!
//! One dedicated loop thread waits and dispatches. Other threads register
//! and cancel operations and start/stop the loop. Completion handlers run on
//! the loop thread, except a Write that drains synchronously, which
//! completes on the thread that initiated it.

pub mod config;
pub mod event_queue;
pub mod operation;
pub mod proactor;
pub mod socket;

pub use config::ProactorConfig;
pub use event_queue::{EventQueue, Filter};
pub use operation::{AsyncOperation, CompletionHandler, OpKind, OpState};
pub use proactor::Proactor;
pub use socket::{Socket, Transfer};
