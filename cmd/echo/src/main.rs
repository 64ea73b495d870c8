//! Echo driver
//!
//! Starts an EchoServer and N clients on one proactor, sends one greeting
//! per client and checks every echo comes back intact.
//!
//! Usage: `echo [port] [clients]` (port 0 picks an ephemeral port, 5 clients
//! by default).
//!
//! # Environment Variables
//!
//! - `PROACTOR_LOG_LEVEL=debug` - Log level (off, error, warn, info, debug, trace)
//! - `PROACTOR_FLUSH_EPRINT=1` - Flush every log line
//! - `PROACTOR_LOG_FILE=/tmp/echo.log` - Also append log lines to a file

use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use proactor::prelude::*;
use proactor::{log_error, log_info};

const DEFAULT_CLIENTS: usize = 5;
const WAIT: Duration = Duration::from_secs(5);

enum Event {
    Status(bool, Error),
    Data(Vec<u8>),
}

struct Session {
    index: usize,
    client: Client,
    events: Receiver<Event>,
}

// PROACTOR_LOG_LEVEL=info cargo run -p proactor-echo -- 0 5
fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let port = match args.next().map(|a| a.parse::<u16>()) {
        None => 0,
        Some(Ok(p)) => p,
        Some(Err(e)) => {
            eprintln!("invalid port: {}", e);
            return ExitCode::from(2);
        }
    };
    let clients = match args.next().map(|a| a.parse::<usize>()) {
        None => DEFAULT_CLIENTS,
        Some(Ok(n)) => n,
        Some(Err(e)) => {
            eprintln!("invalid client count: {}", e);
            return ExitCode::from(2);
        }
    };

    let logger = StderrSink::from_env().into_logger();
    match run(&logger, port, clients) {
        Ok(()) => {
            log_info!(logger, "all {} echoes verified", clients);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_error!(logger, "echo driver failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(logger: &Logger, port: u16, clients: usize) -> Result<(), Error> {
    let proactor = Proactor::new(ProactorConfig::from_env(), Arc::clone(logger))?;
    proactor.start()?;

    let echo = EchoServer::new(&proactor);
    echo.start(port)?;
    let port = echo
        .local_port()
        .ok_or_else(|| Error::other("echo server has no bound port"))?;
    log_info!(logger, "echo server on port {}", port);

    let result = drive_clients(&proactor, logger, port, clients);

    echo.stop();
    proactor.stop();
    result
}

fn drive_clients(proactor: &Arc<Proactor>, logger: &Logger, port: u16, n: usize) -> Result<(), Error> {
    let mut sessions = Vec::with_capacity(n);
    for index in 0..n {
        sessions.push(open_session(proactor, index, port)?);
    }

    for s in &sessions {
        match recv_event(&s.events)? {
            Event::Status(true, _) => log_info!(logger, "client {} connected", s.index),
            Event::Status(false, err) => {
                return Err(Error::other(format!("client {} failed to connect: {}", s.index, err)))
            }
            Event::Data(_) => return Err(Error::other("data before connect")),
        }
    }

    for s in &sessions {
        let msg = format!("Hello from client {}!", s.index);
        s.client.send(msg.as_str())?;
        s.client.receive()?;

        let mut echoed = Vec::with_capacity(msg.len());
        while echoed.len() < msg.len() {
            match recv_event(&s.events)? {
                Event::Data(bytes) => {
                    echoed.extend(bytes);
                    if echoed.len() < msg.len() {
                        s.client.receive()?;
                    }
                }
                Event::Status(_, err) => {
                    return Err(Error::other(format!("client {} lost connection: {}", s.index, err)))
                }
            }
        }
        if echoed != msg.as_bytes() {
            return Err(Error::other(format!(
                "client {} got {:?}, expected {:?}",
                s.index,
                String::from_utf8_lossy(&echoed),
                msg
            )));
        }
        log_info!(logger, "client {} echo ok", s.index);
    }

    for s in &sessions {
        s.client.disconnect();
    }
    Ok(())
}

fn open_session(proactor: &Arc<Proactor>, index: usize, port: u16) -> Result<Session, Error> {
    let (tx, events) = mpsc::channel();
    let client = Client::new(proactor);

    let status_tx = tx.clone();
    client.set_connection_callback(move |up, err| {
        let _ = status_tx.send(Event::Status(up, err.clone()));
    });
    client.set_data_callback(move |buf| {
        let _ = tx.send(Event::Data(buf.into_vec()));
    });
    client.connect("127.0.0.1", port)?;

    Ok(Session { index, client, events })
}

fn recv_event(events: &Receiver<Event>) -> Result<Event, Error> {
    events
        .recv_timeout(WAIT)
        .map_err(|_| Error::other("timed out waiting for the proactor"))
}
