extern crate net2;

use std::io::{self, Read};
use std::io::ErrorKind::{Interrupted, NotConnected, NotFound, TimedOut, WouldBlock};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use net2::TcpBuilder;

use crate::error::{ClientError, Result};
use crate::protocol::{decode, Command, EndpointAddress, TcpShovable, ACK_BUFF_SIZE, RECV_CHUNK_SIZE};

/// Exactly one peer ever dials the data port.
pub const DATA_BACKLOG: i32 = 1;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The kernel hostname, advertised in the callback when no `--callback-host`
/// is given. This is not resolved further, so it may be a short name
/// rather than a fully-qualified one.
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn builder_for(addr: &SocketAddr) -> io::Result<TcpBuilder> {
    if addr.is_ipv4() { TcpBuilder::new_v4() } else { TcpBuilder::new_v6() }
}

pub fn build_send_stream(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(NotFound, format!("{} resolved to no addresses", host));
    for addr in (host, port).to_socket_addrs()? {
        let builder = builder_for(&addr)?;
        match builder.connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

pub fn build_recv_listener(port: u16) -> io::Result<TcpListener> {
    let builder = TcpBuilder::new_v4()?;
    builder.bind(("0.0.0.0", port))?;
    builder.listen(DATA_BACKLOG)
}

fn shutdown_quietly(stream: &TcpStream, what: &str) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        // the peer may already have torn the connection down
        Err(e) if e.kind() == NotConnected => {}
        Err(e) => tracing::debug!(error = %e, "shutdown of {} failed", what),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Connected,
    Negotiated,
    CallbackSent,
    Closed,
}

/// The client's end of the control connection.
///
/// Calls must follow `open`, `negotiate`, `send_callback`; anything out of
/// order fails with [`ClientError::Protocol`]. The socket is shut down in
/// both directions when the session is closed or dropped.
#[derive(Debug)]
pub struct ControlSession {
    stream: Option<TcpStream>,
    state: ControlState,
}

impl ControlSession {
    pub fn new() -> ControlSession {
        ControlSession { stream: None, state: ControlState::Idle }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn open(&mut self, host: &str, port: u16) -> Result<()> {
        self.expect_state(ControlState::Idle, "open")?;
        let stream = build_send_stream(host, port).map_err(|source| ClientError::Connection {
            host: host.to_string(),
            port,
            source,
        })?;
        tracing::info!(host, port, "control connection established");
        self.stream = Some(stream);
        self.state = ControlState::Connected;
        Ok(())
    }

    /// Sends `command` and waits for the server to echo its verb back.
    /// Any other reply closes the connection and is returned as the error text.
    pub fn negotiate(&mut self, command: &Command) -> Result<()> {
        self.expect_state(ControlState::Connected, "negotiate")?;
        let stream = self.stream_mut()?;
        command.shove(stream)?;
        tracing::debug!(%command, "command sent");

        let response = read_ack(stream)?;
        if command.is_acked_by(&response) {
            tracing::debug!(ack = %response, "command acknowledged");
            self.state = ControlState::Negotiated;
            return Ok(());
        }

        tracing::warn!(%command, reply = %response, "server rejected command");
        self.close();
        if response.is_empty() {
            return Err(ClientError::Protocol(
                "Server closed the control connection without acknowledging the command.".to_string(),
            ));
        }
        Err(ClientError::Protocol(response))
    }

    pub fn send_callback(&mut self, address: &EndpointAddress) -> Result<()> {
        self.expect_state(ControlState::Negotiated, "send_callback")?;
        address.shove(self.stream_mut()?)?;
        tracing::debug!(%address, "callback sent");
        self.state = ControlState::CallbackSent;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            shutdown_quietly(&stream, "control connection");
            tracing::debug!("control connection closed");
        }
        self.state = ControlState::Closed;
    }

    fn expect_state(&self, wanted: ControlState, op: &str) -> Result<()> {
        if self.state != wanted {
            return Err(ClientError::Protocol(format!(
                "{} is not allowed while the control session is {:?}",
                op, self.state
            )));
        }
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("control connection is not open".to_string()))
    }
}

impl Default for ControlSession {
    fn default() -> Self {
        ControlSession::new()
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_ack(stream: &mut TcpStream) -> io::Result<String> {
    let mut buf = [0u8; ACK_BUFF_SIZE];
    let n = loop {
        match stream.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// How the data channel waits for the server to dial in.
pub trait AcceptPolicy {
    fn accept(&self, listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)>;
}

/// Waits as long as it takes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingAccept;

impl AcceptPolicy for BlockingAccept {
    fn accept(&self, listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        listener.accept()
    }
}

/// Gives up with `TimedOut` once `timeout` has passed.
#[derive(Debug, Clone, Copy)]
pub struct BoundedAccept {
    pub timeout: Duration,
}

impl AcceptPolicy for BoundedAccept {
    fn accept(&self, listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + self.timeout;
        listener.set_nonblocking(true)?;
        let result = loop {
            match listener.accept() {
                Ok(pair) => break Ok(pair),
                Err(e) if e.kind() == WouldBlock => {
                    if Instant::now() >= deadline {
                        break Err(io::Error::new(
                            TimedOut,
                            format!("no data connection within {:?}", self.timeout),
                        ));
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        listener.set_nonblocking(false)?;
        let (stream, addr) = result?;
        stream.set_nonblocking(false)?;
        Ok((stream, addr))
    }
}

/// The listening side of the data connection. Accepts one peer, drains one
/// message, and closes the peer before the listener.
#[derive(Debug)]
pub struct DataChannel {
    listener: Option<TcpListener>,
    peer: Option<TcpStream>,
    accepted: bool,
    port: u16,
}

impl DataChannel {
    /// Binds all interfaces on `port`; 0 picks an ephemeral port.
    pub fn listen(port: u16) -> Result<DataChannel> {
        let listener = build_recv_listener(port)?;
        let port = listener.local_addr()?.port();
        tracing::info!(port, "listening for data connection");
        Ok(DataChannel { listener: Some(listener), peer: None, accepted: false, port })
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accept(&mut self, policy: &dyn AcceptPolicy) -> Result<SocketAddr> {
        if self.accepted {
            return Err(ClientError::Protocol("data connection was already accepted".to_string()));
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ClientError::Protocol("data channel is closed".to_string()))?;
        let (peer, addr) = policy.accept(listener)?;
        tracing::info!(%addr, "data connection accepted");
        self.accepted = true;
        self.peer = Some(peer);
        Ok(addr)
    }

    /// Announces what is arriving, then reads the whole framed payload.
    pub fn receive_all(&mut self, command: &Command, server_host: &str) -> Result<String> {
        let port = self.port;
        let peer = self
            .peer
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("no data connection to receive from".to_string()))?;
        match command {
            Command::Get { filename } => {
                println!("Receiving \"{}\" from {}:{}", filename, server_host, port)
            }
            Command::List => println!("Receiving directory structure from {}:{}", server_host, port),
        }
        let payload = decode(peer, RECV_CHUNK_SIZE)?;
        tracing::debug!(bytes = payload.len(), "payload received");
        Ok(payload)
    }

    pub fn close(&mut self) {
        if let Some(peer) = self.peer.take() {
            shutdown_quietly(&peer, "data connection");
        }
        if self.listener.take().is_some() {
            tracing::debug!(port = self.port, "data listener closed");
        }
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    fn fake_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn open_fails_with_connection_error_when_nothing_listens() {
        let (listener, port) = fake_server();
        drop(listener);
        let mut session = ControlSession::new();
        let err = session.open("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }), "{:?}", err);
        assert_eq!(session.state(), ControlState::Idle);
    }

    #[test]
    fn callback_before_ack_is_refused() {
        let (listener, port) = fake_server();
        let mut session = ControlSession::new();
        session.open("127.0.0.1", port).unwrap();
        let _server_side = listener.accept().unwrap();

        let addr = EndpointAddress::new("localhost", 5000).unwrap();
        let err = session.send_callback(&addr).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert_eq!(session.state(), ControlState::Connected);
    }

    #[test]
    fn command_is_sent_only_once() {
        let (listener, port) = fake_server();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let command = decode(&mut conn, RECV_CHUNK_SIZE).unwrap();
            conn.write_all(b"-l").unwrap();
            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).unwrap();
            (command, rest)
        });

        let mut session = ControlSession::new();
        session.open("127.0.0.1", port).unwrap();
        session.negotiate(&Command::List).unwrap();
        assert_eq!(session.state(), ControlState::Negotiated);

        let err = session.negotiate(&Command::List).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)), "{:?}", err);
        assert_eq!(session.state(), ControlState::Negotiated);
        session.close();

        let (command, rest) = server.join().unwrap();
        assert_eq!(command, "-l");
        assert!(rest.is_empty(), "second command reached the server: {:?}", rest);
    }

    #[test]
    fn local_hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }

    #[test]
    fn rejected_command_closes_session() {
        let (listener, port) = fake_server();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let command = decode(&mut conn, RECV_CHUNK_SIZE).unwrap();
            conn.write_all(b"FILE NOT FOUND").unwrap();
            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).unwrap();
            (command, rest)
        });

        let mut session = ControlSession::new();
        session.open("127.0.0.1", port).unwrap();
        let err = session
            .negotiate(&Command::Get { filename: "gone.txt".into() })
            .unwrap_err();
        assert_eq!(err.to_string(), "FILE NOT FOUND");
        assert_eq!(session.state(), ControlState::Closed);

        let (command, rest) = server.join().unwrap();
        assert_eq!(command, "-g gone.txt");
        assert!(rest.is_empty());
    }

    #[test]
    fn bounded_accept_times_out() {
        let mut channel = DataChannel::listen(0).unwrap();
        assert_ne!(channel.port(), 0);
        let policy = BoundedAccept { timeout: Duration::from_millis(50) };
        match channel.accept(&policy) {
            Err(ClientError::Io(e)) => assert_eq!(e.kind(), TimedOut),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn data_channel_accepts_only_once() {
        let mut channel = DataChannel::listen(0).unwrap();
        let port = channel.port();
        let sender = thread::spawn(move || {
            let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            conn.write_all(b"a.txt\nb.txt||").unwrap();
        });
        channel.accept(&BlockingAccept).unwrap();
        let payload = channel.receive_all(&Command::List, "server").unwrap();
        assert_eq!(payload, "a.txt\nb.txt");
        sender.join().unwrap();

        assert!(matches!(channel.accept(&BlockingAccept), Err(ClientError::Protocol(_))));
        channel.close();
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
    }
}
