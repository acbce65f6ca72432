//! Transport abstraction over the device's terminal session

pub mod ssh;

use std::time::Duration;

use thiserror::Error;

/// Fixed banner the device prints once its text-protocol shell is ready
pub const WELCOME_BANNER: &str = "Welcome to the Tesira Text Protocol Server...";

/// Connection parameters and tunables for the device session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device hostname or IP
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Device account name
    pub username: String,
    /// Device account password
    pub password: String,
    /// Time allowed for connect + handshake + banner
    pub connect_timeout: Duration,
    /// Time allowed for a synchronous command round trip
    pub command_timeout: Duration,
    /// Upper bound for a single read
    pub read_buffer_size: usize,
}

impl SessionConfig {
    /// Defaults matching the device's observed behaviour
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        SessionConfig {
            host: host.into(),
            port: 22,
            username: username.into(),
            password: password.into(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            read_buffer_size: 4096,
        }
    }
}

/// Error that can occur when talking to the device session
#[derive(Debug, Error)]
pub enum Error {
    /// No established session to read from or write to
    #[error("device session not ready")]
    NotReady,
    /// A synchronous command saw no reply in time
    #[error("command timeout: {0}")]
    Timeout(String),
    /// IO error on the underlying stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// SSH error
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    /// The transport was shut down
    #[error("transport closed")]
    Closed,
}

/// A supervised byte pipe to the device.
///
/// One consumer owns the read side at any time: discovery while the gateway
/// is brought up, the subscription read loop afterwards. [`Connection::send_wait`]
/// belongs to the discovery phase and must not be used once the read loop runs.
pub trait Connection: Send + Sync {
    /// A session is up and the welcome banner has been observed
    fn active(&self) -> bool;

    /// Bytes are buffered for reading
    fn recv_ready(&self) -> bool;

    /// Non-blocking read of whatever is buffered, up to the read buffer size
    fn recv(&self) -> Result<Vec<u8>, Error>;

    /// Write one command line; a newline is appended
    fn send(&self, line: &str) -> Result<(), Error>;

    /// Write one command line and block until the first reply buffer arrives
    fn send_wait(&self, line: &str) -> Result<Vec<u8>, Error>;

    /// Counter incremented on every successful session establishment.
    ///
    /// Lets the read loop notice a reconnect and re-issue subscriptions.
    fn generation(&self) -> u64;

    /// Idempotent teardown
    fn close(&self);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::VecDeque,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
    };

    use parking_lot::Mutex;

    use super::{Connection, Error};

    /// Scripted in-memory connection, the test double for the SSH session
    pub(crate) struct Mock {
        exchanges: Mutex<VecDeque<(String, Vec<u8>)>>,
        sent: Mutex<Vec<String>>,
        inbound: Mutex<VecDeque<u8>>,
        active: AtomicBool,
        generation: AtomicU64,
    }

    impl Mock {
        pub fn new() -> Arc<Mock> {
            Arc::new(Mock {
                exchanges: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                inbound: Mutex::new(VecDeque::new()),
                active: AtomicBool::new(true),
                generation: AtomicU64::new(1),
            })
        }

        /// Script the reply to one synchronous exchange
        pub fn expect(&self, command: &str, reply: &str) {
            self.exchanges
                .lock()
                .push_back((command.to_owned(), reply.as_bytes().to_vec()));
        }

        /// Queue inbound bytes for the read loop to drain
        pub fn push(&self, chunk: &str) {
            self.inbound.lock().extend(chunk.bytes());
        }

        /// Lines sent without waiting for a reply
        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        pub fn set_active(&self, active: bool) {
            self.active.store(active, Ordering::Relaxed);
        }

        /// Simulate a reconnect
        pub fn bump_generation(&self) {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl Connection for Mock {
        fn active(&self) -> bool {
            self.active.load(Ordering::Relaxed)
        }

        fn recv_ready(&self) -> bool {
            self.active() && !self.inbound.lock().is_empty()
        }

        fn recv(&self) -> Result<Vec<u8>, Error> {
            if !self.active() {
                return Err(Error::NotReady);
            }
            Ok(self.inbound.lock().drain(..).collect())
        }

        fn send(&self, line: &str) -> Result<(), Error> {
            if !self.active() {
                return Err(Error::NotReady);
            }
            self.sent.lock().push(line.to_owned());
            Ok(())
        }

        fn send_wait(&self, line: &str) -> Result<Vec<u8>, Error> {
            if !self.active() {
                return Err(Error::NotReady);
            }
            match self.exchanges.lock().pop_front() {
                Some((expected, reply)) if expected == line => Ok(reply),
                Some((expected, _)) => {
                    panic!("script expected {expected:?}, engine sent {line:?}")
                }
                None => Err(Error::Timeout(line.to_owned())),
            }
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::Relaxed)
        }

        fn close(&self) {
            self.set_active(false);
        }
    }
}
