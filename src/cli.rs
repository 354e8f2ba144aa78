use clap::{Parser, Subcommand};

/// Runtime settings come from environment variables (`ADDR`, `MAX_LIMIT`,
/// `REDIS_ENABLED`, ...); the command line only selects what to run.
#[derive(Parser, Debug)]
#[command(name = "fizzbuzz-api")]
#[command(version)]
#[command(about = "Generalized FizzBuzz HTTP API with request statistics")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Probe the local server's /healthz and exit 0 on success, 1 otherwise
    Healthcheck,
}

impl Args {
    /// The subcommand to run; `serve` when none was given.
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_to_serve() {
        let args = Args::parse_from(["fizzbuzz-api"]);
        assert!(args.command.is_none());
        assert_eq!(args.command(), Command::Serve);
    }

    #[test]
    fn test_args_parse_serve() {
        let args = Args::parse_from(["fizzbuzz-api", "serve"]);
        assert_eq!(args.command(), Command::Serve);
    }

    #[test]
    fn test_args_parse_healthcheck() {
        let args = Args::parse_from(["fizzbuzz-api", "healthcheck"]);
        assert_eq!(args.command(), Command::Healthcheck);
    }

    #[test]
    fn test_args_reject_unknown_subcommand() {
        assert!(Args::try_parse_from(["fizzbuzz-api", "migrate"]).is_err());
    }
}
