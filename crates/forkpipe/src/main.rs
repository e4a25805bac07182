use std::io::{self, Write};

use forkpipe::config::{DEFAULT_VECTOR_LEN, parse_vector_len};
use forkpipe::{ExitCode, RunConfig, Supervisor};

const USAGE: &str = "\
Usage: forkpipe [N]

Arguments:
  [N]    Length of the generated input vector, 1-9 [default: 5]

Environment:
  FORKPIPE_TRANSPORT          fifo or pipe [default: fifo]
  FORKPIPE_FIFO_DIR           Directory for fifo1/fifo2 [default: .]
  FORKPIPE_COMMAND            Command tag sent to the second child [default: multiply]
  FORKPIPE_SEED               Seed for the random input
  FORKPIPE_INPUT              Fixed comma-separated input, N values
  FORKPIPE_SUM_DELAY_MS       First child startup delay [default: 0]
  FORKPIPE_WAIT_INTERVAL_MS   Progress report interval [default: 2000]
  FORKPIPE_POLL_ATTEMPTS      Empty reads allowed while waiting for the sum [default: 400]
  FORKPIPE_POLL_BACKOFF_MS    Initial backoff between empty reads [default: 5]
  FORKPIPE_KILL_GRACE_MS      Time between SIGTERM and SIGKILL on teardown [default: 5000]
  FORKPIPE_LOG                debug, info, warn or error [default: warn]
";

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Run(usize),
    Help,
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut vector_len: Option<usize> = None;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Invocation::Help),
            flag if flag.starts_with('-') && flag.len() > 1 => return Err(format!("unknown flag: {flag}")),
            value => {
                if vector_len.is_some() {
                    return Err(format!("unexpected argument: {value}"));
                }
                vector_len = Some(parse_vector_len(value).map_err(|e| e.to_string())?);
            }
        }
    }

    Ok(Invocation::Run(vector_len.unwrap_or(DEFAULT_VECTOR_LEN)))
}

fn main() {
    forkpipe::logging::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let vector_len = match parse_args(&args) {
        Ok(Invocation::Run(n)) => n,
        Ok(Invocation::Help) => {
            let _ = io::stdout().write_all(USAGE.as_bytes());
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprint!("{USAGE}");
            ExitCode::Usage.exit();
        }
    };

    let config = match RunConfig::from_env(vector_len) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::Usage.exit();
        }
    };

    tracing::debug!(?config, "Starting supervisor");
    Supervisor::new(config).run().exit()
}
