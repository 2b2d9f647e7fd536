extern crate getopts;

use std::time::Duration;

use getopts::Options;

use crate::error::{ClientError, Result};
use crate::protocol::Command;
use crate::session::Request;

pub const PORT_ERROR: &str = "Please provide valid port numbers and try again.";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub request: Request,
    /// Bounded wait for the server to dial back; `None` blocks forever.
    pub accept_timeout: Option<Duration>,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Run(Config),
    Help(String),
}

fn client_options() -> Options {
    let mut opts = Options::new();
    opts.optopt("l", "", "list the server's directory, receiving on DATA_PORT", "DATA_PORT");
    opts.optopt("g", "", "get FILENAME, receiving on the DATA_PORT that follows it", "FILENAME");
    opts.optopt("", "callback-host", "name the server should dial back to", "HOST");
    opts.optopt("", "accept-timeout", "give up if the server has not dialed back after SECS", "SECS");
    opts.optflag("v", "verbose", "debug logging on stderr");
    opts.optflag("h", "help", "print this help");
    opts
}

pub fn usage(program: &str) -> String {
    let brief = format!(
        "Usage: {} SERVER_HOST SERVER_PORT (-l DATA_PORT | -g FILENAME DATA_PORT) [options]",
        program
    );
    client_options().usage(&brief)
}

/// Parses a port the way both channels require: an integer in 1..=65535.
pub fn parse_port(text: &str) -> Result<u16> {
    match text.trim().parse::<i64>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
        _ => Err(ClientError::Argument(PORT_ERROR.to_string())),
    }
}

/// Like [`parse_port`], but names the offending argument.
fn parse_named_port(name: &str, text: &str) -> Result<u16> {
    parse_port(text).map_err(|_| {
        ClientError::Argument(format!(
            "{}\n  {} must be between 1 and 65535, got {:?}",
            PORT_ERROR, name, text
        ))
    })
}

/// Removes the DATA_PORT that follows `-g FILENAME` (or `-gFILENAME`) so the
/// pair may sit anywhere on the line; getopts then only sees the positionals.
fn take_get_data_port(args: &mut Vec<String>) -> Option<String> {
    let mut at = None;
    for (i, arg) in args.iter().enumerate() {
        if arg == "--" {
            break;
        }
        if arg == "-g" {
            at = Some(i + 2);
            break;
        }
        if arg.starts_with("-g") {
            at = Some(i + 1);
            break;
        }
    }
    let at = at.filter(|&i| i < args.len())?;
    let candidate = &args[at];
    if candidate.starts_with('-') && candidate.parse::<i64>().is_err() {
        return None;
    }
    Some(args.remove(at))
}

pub fn parse_args(argv: Vec<String>) -> Result<Invocation> {
    let program = argv.first().cloned().unwrap_or_else(|| "ftclient".to_string());
    let mut args: Vec<String> = argv.into_iter().skip(1).collect();
    let get_data_port = take_get_data_port(&mut args);
    let matches = client_options()
        .parse(&args)
        .map_err(|f| ClientError::Argument(format!("{}\n{}", f, usage(&program))))?;

    if matches.opt_present("h") {
        return Ok(Invocation::Help(usage(&program)));
    }

    let (command, data_port) = match (matches.opt_str("l"), matches.opt_str("g")) {
        (Some(data_port), None) => (Command::List, data_port),
        (None, Some(filename)) => {
            let data_port = get_data_port.ok_or_else(|| {
                ClientError::Argument(format!(
                    "-g needs FILENAME followed by DATA_PORT\n{}",
                    usage(&program)
                ))
            })?;
            (Command::Get { filename }, data_port)
        }
        (Some(_), Some(_)) => {
            return Err(ClientError::Argument(format!(
                "-l and -g cannot be used together\n{}",
                usage(&program)
            )))
        }
        (None, None) => {
            return Err(ClientError::Argument(format!(
                "one of -l or -g is required\n{}",
                usage(&program)
            )))
        }
    };
    let free = &matches.free;
    if free.len() != 2 {
        return Err(ClientError::Argument(format!(
            "expected SERVER_HOST and SERVER_PORT, got {:?}\n{}",
            free,
            usage(&program)
        )));
    }

    let server_host = free[0].clone();
    let server_port = parse_named_port("SERVER_PORT", &free[1])?;
    let data_port = parse_named_port("DATA_PORT", &data_port)?;

    let accept_timeout = match matches.opt_str("accept-timeout") {
        Some(secs) => match secs.parse::<f64>() {
            Ok(s) if s.is_finite() && s > 0.0 => Some(Duration::from_secs_f64(s)),
            _ => {
                return Err(ClientError::Argument(format!(
                    "--accept-timeout must be a positive number of seconds, got {}",
                    secs
                )))
            }
        },
        None => None,
    };

    Ok(Invocation::Run(Config {
        request: Request {
            server_host,
            server_port,
            command,
            data_port,
            callback_host: matches.opt_str("callback-host"),
        },
        accept_timeout,
        verbose: matches.opt_present("v"),
    }))
}
