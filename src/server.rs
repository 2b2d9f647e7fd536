use std::fs;
use std::io::{self, Write};
use std::io::ErrorKind::InvalidData;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use net2::TcpBuilder;

use crate::files::is_plain_name;
use crate::network::build_send_stream;
use crate::protocol::{decode, encode, Command, EndpointAddress, RECV_CHUNK_SIZE, VERB_GET, VERB_LIST};

pub const SERVER_BACKLOG: i32 = 5;

const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(10);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

pub const FILE_NOT_FOUND: &str = "FILE NOT FOUND";
pub const UNKNOWN_COMMAND: &str = "Unknown command received. Please try again.";

/// Answers list and get requests for the files in one directory.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    root: Arc<PathBuf>,
}

impl Server {
    pub fn bind(port: u16, root: impl Into<PathBuf>) -> io::Result<Server> {
        let builder = TcpBuilder::new_v4()?;
        builder.reuse_address(true)?;
        builder.bind(("0.0.0.0", port))?;
        let listener = builder.listen(SERVER_BACKLOG)?;
        Ok(Server { listener, root: Arc::new(root.into()) })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accepts control connections forever, one thread each.
    /// Failed accepts (EMFILE and the like) are retried with a growing pause.
    pub fn serve(&self) -> io::Result<()> {
        let mut failures: u32 = 0;
        loop {
            let (control, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    if failures == 1 || pause == ACCEPT_RETRY_MAX {
                        tracing::warn!(error = %e, failures, "accept failed");
                    }
                    thread::sleep(pause);
                    continue;
                }
            };
            failures = 0;
            tracing::debug!(%addr, "control connection accepted");
            let root = Arc::clone(&self.root);
            thread::spawn(move || {
                if let Err(e) = handle_connection(control, &root) {
                    tracing::warn!(%addr, error = %e, "session aborted");
                }
            });
        }
    }
}

/// Pause before retrying after `failures` accepts in a row have failed.
pub fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_RETRY_BASE.saturating_mul(1 << shift).min(ACCEPT_RETRY_MAX)
}

/// Runs the server side of one session on an accepted control connection.
pub fn handle_connection(mut control: TcpStream, root: &Path) -> io::Result<()> {
    let text = decode(&mut control, RECV_CHUNK_SIZE)?;
    match Command::parse(&text) {
        Some(Command::List) => {
            control.write_all(VERB_LIST.as_bytes())?;
            let callback = read_callback(&mut control)?;
            println!(
                "Connection from {}.\nList directory requested on port {}",
                callback.host(),
                callback.port()
            );
            let listing = directory_listing(root)?;
            println!("Sending directory contents to {}:{}.", callback.host(), callback.port());
            send_data(&callback, listing.as_bytes())?;
        }
        Some(Command::Get { filename }) => {
            let contents = match read_served_file(root, &filename) {
                Ok(contents) => contents,
                Err(e) => {
                    tracing::info!(%filename, error = %e, "requested file unavailable");
                    println!("File not found. Sending error message");
                    control.write_all(FILE_NOT_FOUND.as_bytes())?;
                    return close_control(control);
                }
            };
            control.write_all(VERB_GET.as_bytes())?;
            let callback = read_callback(&mut control)?;
            println!(
                "Connection from {}.\nFile \"{}\" requested on port {}",
                callback.host(),
                filename,
                callback.port()
            );
            println!("Sending \"{}\" to {}:{}.", filename, callback.host(), callback.port());
            send_data(&callback, &contents)?;
        }
        None => {
            tracing::debug!(command = %text, "unknown command");
            println!("Received an unknown command from the client.");
            control.write_all(UNKNOWN_COMMAND.as_bytes())?;
        }
    }
    close_control(control)
}

fn close_control(control: TcpStream) -> io::Result<()> {
    match control.shutdown(Shutdown::Both) {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
        _ => Ok(()),
    }
}

fn read_callback(control: &mut TcpStream) -> io::Result<EndpointAddress> {
    let text = decode(control, RECV_CHUNK_SIZE)?;
    EndpointAddress::parse(&text)
        .ok_or_else(|| io::Error::new(InvalidData, format!("malformed callback {:?}", text)))
}

fn send_data(callback: &EndpointAddress, payload: &[u8]) -> io::Result<()> {
    let mut data = build_send_stream(callback.host(), callback.port())?;
    data.write_all(&encode(payload))?;
    data.flush()?;
    tracing::debug!(bytes = payload.len(), to = %callback, "payload sent");
    Ok(())
}

/// Only plain names inside `root` are served.
fn read_served_file(root: &Path, filename: &str) -> io::Result<Vec<u8>> {
    if !is_plain_name(filename) {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a plain file name"));
    }
    fs::read(root.join(filename))
}

/// Entry names in `root`, sorted, one per line.
pub fn directory_listing(root: &Path) -> io::Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names.iter().map(|name| format!("{}\n", name)).collect())
}
