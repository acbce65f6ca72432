//! SSH terminal session with background reconnect supervision

use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Connection, Error, SessionConfig, WELCOME_BANNER};

/// Supervisor poll interval while a session is up
const SUPERVISOR_TICK: Duration = Duration::from_millis(200);
/// Wait between failed connection attempts
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Poll interval while waiting for a synchronous reply
const REPLY_POLL: Duration = Duration::from_millis(100);

struct SshPassword(String);

impl ssh2::KeyboardInteractivePrompt for SshPassword {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        _prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        vec![self.0.to_owned()]
    }
}

/// An established shell; the session handle must outlive its channel
struct Shell {
    _session: ssh2::Session,
    channel: ssh2::Channel,
}

struct Inner {
    config: SessionConfig,
    shell: Mutex<Option<Shell>>,
    /// Bytes read ahead of the consumer while probing for readiness
    pending: Mutex<Vec<u8>>,
    connected: AtomicBool,
    exit: AtomicBool,
    generation: AtomicU64,
}

/// SSH transport to the device's text-protocol shell.
///
/// A supervisor thread owns the session lifecycle: it connects, waits for the
/// welcome banner, and reconnects with back-off after any loss. It never
/// consumes protocol bytes once a session is up; reading belongs to whoever
/// drives the [`Connection`] handle.
pub struct Ssh {
    inner: Arc<Inner>,
}

impl Ssh {
    /// Start the supervisor and return the connection handle
    pub fn start(config: SessionConfig) -> Ssh {
        let inner = Arc::new(Inner {
            config,
            shell: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        thread::spawn(move || supervise(weak));

        Ssh { inner }
    }
}

fn supervise(inner: Weak<Inner>) {
    debug!("transport supervisor started");
    loop {
        let Some(inner) = inner.upgrade() else { break };
        if inner.exit.load(Ordering::Relaxed) {
            break;
        }

        if !inner.connected.load(Ordering::Relaxed) {
            match inner.establish() {
                Ok(()) => continue,
                Err(e) => {
                    warn!("session establishment failed: {e}");
                    drop(inner);
                    thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
            }
        }

        // Established: only watch for loss, never read protocol bytes
        if inner.session_lost() {
            warn!("device session lost, scheduling reconnect");
            inner.connected.store(false, Ordering::Relaxed);
            continue;
        }

        drop(inner);
        thread::sleep(SUPERVISOR_TICK);
    }
    debug!("transport supervisor terminated");
}

impl Inner {
    /// Connect, authenticate, open the shell and wait for the banner
    fn establish(&self) -> Result<(), Error> {
        // Drop any lingering half-dead session first
        *self.shell.lock() = None;
        self.pending.lock().clear();

        let config = &self.config;
        info!(
            "starting SSH connection: {}:{} (as {})",
            config.host, config.port, config.username
        );

        let started = Instant::now();
        let mut shell = self.open_shell()?;
        self.await_banner(&mut shell)?;

        info!(
            "text protocol session established ({:.2}s)",
            started.elapsed().as_secs_f64()
        );
        *self.shell.lock() = Some(shell);
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn open_shell(&self) -> Result<Shell, Error> {
        let config = &self.config;
        let mut last_err = std::io::Error::other("host resolved to no addresses");
        let mut tcp = None;
        for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        let tcp = tcp.ok_or(last_err)?;

        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        // Bound the handshake and authentication round trips
        session.set_timeout(self.config.connect_timeout.as_millis() as u32);
        session.handshake()?;
        session.userauth_keyboard_interactive(
            &config.username,
            &mut SshPassword(config.password.clone()),
        )?;

        let mut channel = session.channel_session()?;
        channel.request_pty("ansi", None, None)?;
        channel.shell()?;

        // All subsequent I/O is polled
        session.set_blocking(false);
        Ok(Shell { _session: session, channel })
    }

    /// Read until the welcome banner shows up, within the connect timeout
    fn await_banner(&self, shell: &mut Shell) -> Result<(), Error> {
        let waiting = Instant::now();
        let mut greeting = String::new();
        let mut buf = vec![0u8; self.config.read_buffer_size];
        while waiting.elapsed() < self.config.connect_timeout {
            thread::sleep(Duration::from_millis(100));
            match shell.channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    greeting.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if greeting.contains(WELCOME_BANNER) {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::Timeout(
            "waiting for session establishment".to_owned(),
        ))
    }

    /// Cheap liveness probe used by the supervisor
    fn session_lost(&self) -> bool {
        match self.shell.lock().as_ref() {
            Some(shell) => shell.channel.eof(),
            None => true,
        }
    }

    fn mark_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// One non-blocking read into the pending buffer; true if bytes arrived
    fn poll_into_pending(&self) -> bool {
        let mut shell = self.shell.lock();
        let Some(shell) = shell.as_mut() else {
            return false;
        };
        let mut buf = vec![0u8; self.config.read_buffer_size];
        match shell.channel.read(&mut buf) {
            Ok(0) => {
                self.mark_lost();
                false
            }
            Ok(n) => {
                self.pending.lock().extend_from_slice(&buf[..n]);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                warn!("read error, dropping session: {e}");
                self.mark_lost();
                false
            }
        }
    }
}

impl Connection for Ssh {
    fn active(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    fn recv_ready(&self) -> bool {
        if !self.active() {
            return false;
        }
        if !self.inner.pending.lock().is_empty() {
            return true;
        }
        self.inner.poll_into_pending() || !self.inner.pending.lock().is_empty()
    }

    fn recv(&self) -> Result<Vec<u8>, Error> {
        if !self.active() {
            return Err(Error::NotReady);
        }
        self.inner.poll_into_pending();
        let mut pending = self.inner.pending.lock();
        let take = pending.len().min(self.inner.config.read_buffer_size);
        Ok(pending.drain(..take).collect())
    }

    fn send(&self, line: &str) -> Result<(), Error> {
        if !self.active() {
            return Err(Error::NotReady);
        }
        debug!("send: {line}");
        let data = format!("{line}\n");
        let deadline = Instant::now() + self.inner.config.command_timeout;

        let mut shell = self.inner.shell.lock();
        let shell = shell.as_mut().ok_or(Error::NotReady)?;
        let bytes = data.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            match shell.channel.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(line.to_owned()));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    self.inner.mark_lost();
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }

    fn send_wait(&self, line: &str) -> Result<Vec<u8>, Error> {
        self.send(line)?;
        let deadline = Instant::now() + self.inner.config.command_timeout;
        while Instant::now() < deadline {
            thread::sleep(REPLY_POLL);
            if self.recv_ready() {
                return self.recv();
            }
        }
        Err(Error::Timeout(line.to_owned()))
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.inner.exit.store(true, Ordering::Relaxed);
        self.inner.connected.store(false, Ordering::Relaxed);
        *self.inner.shell.lock() = None;
    }
}

impl Drop for Ssh {
    fn drop(&mut self) {
        self.close();
    }
}
