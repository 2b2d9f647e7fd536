use crate::error::Result;
use crate::files::PayloadSink;
use crate::network::{local_hostname, AcceptPolicy, ControlSession, DataChannel};
use crate::protocol::{Command, EndpointAddress, TransferResult};

/// Everything one session needs to know before it touches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub server_host: String,
    pub server_port: u16,
    pub command: Command,
    /// 0 binds an ephemeral port.
    pub data_port: u16,
    /// Name the server dials back to; the local hostname when unset.
    pub callback_host: Option<String>,
}

/// Runs one full exchange: negotiate over the control connection, take the
/// payload over the data connection, tear both down.
///
/// The data port is only bound after the server has acknowledged the command,
/// and the callback is only sent once it is bound.
pub fn fetch(request: &Request, policy: &dyn AcceptPolicy) -> Result<TransferResult> {
    let mut control = ControlSession::new();
    control.open(&request.server_host, request.server_port)?;
    control.negotiate(&request.command)?;

    let mut data = DataChannel::listen(request.data_port)?;
    let host = request.callback_host.clone().unwrap_or_else(local_hostname);
    control.send_callback(&EndpointAddress::new(host, data.port())?)?;

    data.accept(policy)?;
    let payload = data.receive_all(&request.command, &request.server_host)?;
    data.close();
    control.close();

    Ok(match &request.command {
        Command::List => TransferResult::Listing { text: payload },
        Command::Get { filename } => TransferResult::FileContents {
            filename: filename.clone(),
            bytes: payload,
        },
    })
}

/// Prints a listing, or saves file contents through `sink`.
pub fn materialize(result: &TransferResult, sink: &PayloadSink) -> Result<()> {
    match result {
        TransferResult::Listing { text } => sink.display(text),
        TransferResult::FileContents { filename, bytes } => sink.write(filename, bytes).map(|_| ()),
    }
}
