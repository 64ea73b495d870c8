//! # proactor - completion-style networking over readiness polling
//!
//! A single loop thread waits on epoll (Linux) or kqueue (macOS / BSD).
//! Callers register an operation per descriptor and are called back once it
//! has run to completion, the way an io_uring or IOCP proactor would.
//!
//! ## Quick Start
//!
//! ```ignore
//! use proactor::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let logger = StderrSink::from_env().into_logger();
//!     let proactor = Proactor::new(ProactorConfig::from_env(), logger)?;
//!     proactor.start()?;
//!
//!     let echo = EchoServer::new(&proactor);
//!     echo.start(7000)?;
//!
//!     let client = Client::new(&proactor);
//!     client.set_data_callback(|buf| println!("{}", buf.to_string_lossy()));
//!     client.set_connection_callback(move |up, err| {
//!         if !up && err.is_error() {
//!             eprintln!("{}", err);
//!         }
//!     });
//!     client.connect("127.0.0.1", 7000)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │        Client / Server / EchoServer (proactor-net)        │
//! └──────────────────────────────────────────────────────────┘
//!                              │ AsyncOperation::initiate
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │     Proactor: fd → operation registry, kind dispatch      │
//! └──────────────────────────────────────────────────────────┘
//!                              │ watch / unwatch      ▲ ready(fd, filter)
//!                              ▼                      │
//! ┌──────────────────────────────────────────────────────────┐
//! │     EventQueue: loop thread, wake pipe, epoll / kqueue    │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub use proactor_core::{
    env_get, env_get_bool, env_get_opt, env_get_str, Buffer, CaptureSink, Error, LogLevel, LogSink,
    Logger, NullSink, SetupError, StderrSink,
};
pub use proactor_core::{log_debug, log_error, log_info, log_trace, log_warn};

pub use proactor_runtime::{
    AsyncOperation, CompletionHandler, EventQueue, Filter, OpKind, OpState, Proactor,
    ProactorConfig, Socket, Transfer,
};

pub use proactor_net::{Client, EchoServer, Server, SessionId};

pub use proactor_runtime::socket::parse_host;

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        Buffer, Client, EchoServer, Error, Logger, NullSink, Proactor, ProactorConfig, Server,
        SessionId, SetupError, Socket, StderrSink,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_prelude_client_against_echo() {
        let proactor = Proactor::new(ProactorConfig::new(), NullSink::logger()).unwrap();
        proactor.start().unwrap();

        let echo = EchoServer::new(&proactor);
        echo.start_on("127.0.0.1", 0).unwrap();
        let port = echo.local_port().unwrap();

        let (status_tx, status_rx) = mpsc::channel();
        let (data_tx, data_rx) = mpsc::channel();
        let client = Client::new(&proactor);
        client.set_connection_callback(move |up, _| {
            let _ = status_tx.send(up);
        });
        client.set_data_callback(move |buf: Buffer| {
            let _ = data_tx.send(buf.into_vec());
        });
        client.connect("127.0.0.1", port).unwrap();
        assert!(status_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        client.send("facade").unwrap();
        client.receive().unwrap();
        let mut got = Vec::new();
        while got.len() < 6 {
            got.extend(data_rx.recv_timeout(Duration::from_secs(5)).unwrap());
            if got.len() < 6 {
                client.receive().unwrap();
            }
        }
        assert_eq!(got, b"facade");

        client.disconnect();
        echo.stop();
        proactor.stop();
    }
}
