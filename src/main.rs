/************************************************************
 ****************Two Connection File Transfer***************
 ***********************************************************
 ****ask over the control port, get it on the data port*****
 **********************************************************/

use std::env;
use std::process::exit;

use ftclient::cmd::{parse_args, Invocation};
use ftclient::error::{ClientError, EXIT_OK};
use ftclient::files::PayloadSink;
use ftclient::logging::init_logging;
use ftclient::network::{AcceptPolicy, BlockingAccept, BoundedAccept};
use ftclient::session::{fetch, materialize};

fn main() {
    let argv: Vec<String> = env::args().collect();

    let config = match parse_args(argv) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help(usage)) => { print!("{}", usage); exit(EXIT_OK); }
        Err(e) => { println!("{}", e); exit(e.exit_code()); }
    };
    init_logging(config.verbose);

    let policy: Box<dyn AcceptPolicy> = match config.accept_timeout {
        Some(timeout) => Box::new(BoundedAccept { timeout }),
        None => Box::new(BlockingAccept),
    };

    let outcome = fetch(&config.request, policy.as_ref())
        .and_then(|result| materialize(&result, &PayloadSink::current_dir()));
    match outcome {
        Ok(()) => exit(EXIT_OK),
        Err(e @ ClientError::Protocol(_)) | Err(e @ ClientError::FileCollision(_)) => {
            println!("{}", e);
            exit(e.exit_code());
        }
        Err(e) => { eprintln!("Error: {}", e); exit(e.exit_code()); }
    }
}
