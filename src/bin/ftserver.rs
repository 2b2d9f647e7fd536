use std::env;
use std::process::exit;

use ftclient::cmd::parse_port;
use ftclient::error::{EXIT_FAILURE, EXIT_USAGE};
use ftclient::logging::init_logging;
use ftclient::server::Server;

fn main() {
    let argv: Vec<String> = env::args().collect();
    if argv.len() != 2 {
        eprintln!("Correct command format: {} PORT", argv[0]);
        exit(EXIT_USAGE);
    }
    let port = match parse_port(&argv[1]) {
        Ok(p) => p,
        Err(e) => { eprintln!("{}", e); exit(e.exit_code()); }
    };
    init_logging(false);

    let server = match Server::bind(port, ".") {
        Ok(s) => s,
        Err(e) => { eprintln!("Cannot listen on port {}: {}", port, e); exit(EXIT_FAILURE); }
    };
    println!("Server open on {}", port);
    if let Err(e) = server.serve() {
        eprintln!("Server stopped: {}", e);
        exit(EXIT_FAILURE);
    }
}
