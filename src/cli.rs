//! Command-line parsing into a [`NodeConfig`].

use std::ffi::OsString;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use crate::config::{self, NodeConfig, Tuning, DEFAULT_DIRECTORY, DEFAULT_LISTEN, DEFAULT_VERBOSITY};
use crate::errors::ConfigError;

const EXAMPLES: &str = "\
By default the node listens on TCP. A listen address that begins with / or .
is taken as a Unix socket path instead, for example:

  sqlcluster -d /tmp/sqlcluster/node0 -l /tmp/node0.sock

Run a three node cluster:

  sqlcluster -d /tmp/sqlcluster/node0 &
  sqlcluster -d /tmp/sqlcluster/node1 -l 127.0.0.1:4001 -join 127.0.0.1:4000 &
  sqlcluster -d /tmp/sqlcluster/node2 -l 127.0.0.1:4002 -join 127.0.0.1:4000";

/// Command-line arguments for a cluster node.
#[derive(Parser, Debug)]
#[command(
    name = "sqlcluster",
    about = "Run a highly-available SQLite.",
    after_help = EXAMPLES
)]
struct Cli {
    /// Debug output level; 0 or less disables it.
    #[arg(
        short = 'v',
        value_name = "INT",
        default_value_t = DEFAULT_VERBOSITY,
        allow_negative_numbers = true
    )]
    verbosity: i32,

    /// Socket to listen on (Unix path or TCP host:port).
    #[arg(short = 'l', value_name = "ADDRESS", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Address of a cluster member to join.
    #[arg(long = "join", value_name = "ADDRESS")]
    join: Option<String>,

    /// Storage directory.
    #[arg(short = 'd', value_name = "PATH", default_value = DEFAULT_DIRECTORY)]
    directory: PathBuf,

    /// Optional YAML tuning file.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,
}

/// What the process was asked to do.
#[derive(Debug)]
pub enum Invocation {
    /// Run a node.
    Run(NodeConfig),
    /// Print help and exit successfully.
    Help(String),
}

/// Full usage text.
pub fn usage() -> String {
    Cli::command().render_help().to_string()
}

/// Parse process arguments (including `argv[0]`).
///
/// Flags accept one or two dashes: `-join`/`--join`, `-d`/`--d` and so on.
pub fn parse<I, T>(args: I) -> Result<Invocation, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args = args.into_iter().map(|a| normalize_flag(a.into()));

    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => return Ok(Invocation::Help(usage())),
        Err(e) => {
            let rendered = e.render().to_string();
            let message = rendered.lines().next().unwrap_or_default().to_string();
            return Err(ConfigError::Usage { message });
        }
    };

    let tuning = match &cli.config {
        Some(path) => config::load_tuning(path).map_err(|source| ConfigError::Tuning {
            path: path.clone(),
            source,
        })?,
        None => Tuning::default(),
    };

    Ok(Invocation::Run(NodeConfig {
        verbosity: cli.verbosity,
        listen: cli.listen,
        join: cli.join.unwrap_or_default(),
        directory: cli.directory,
        tuning,
    }))
}

/// Flags spelled with one letter that also accept a double dash.
const SHORT_FLAGS: [&str; 3] = ["d", "l", "v"];

fn normalize_flag(arg: OsString) -> OsString {
    let Some(s) = arg.to_str() else {
        return arg;
    };
    if s == "-join" || s.starts_with("-join=") {
        return OsString::from(format!("-{s}"));
    }
    if let Some(rest) = s.strip_prefix("--") {
        let (name, value) = rest.split_once('=').map_or((rest, None), |(n, v)| (n, Some(v)));
        if SHORT_FLAGS.contains(&name) {
            return match value {
                Some(value) => OsString::from(format!("-{name}={value}")),
                None => OsString::from(format!("-{name}")),
            };
        }
    }
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> NodeConfig {
        match parse(std::iter::once("sqlcluster").chain(args.iter().copied())).unwrap() {
            Invocation::Run(config) => config,
            Invocation::Help(_) => panic!("unexpected help"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = run(&[]);
        assert_eq!(config.verbosity, 3);
        assert_eq!(config.listen, "127.0.0.1:4000");
        assert_eq!(config.join, "");
        assert_eq!(config.directory, PathBuf::from("/tmp/sqlcluster"));
    }

    #[test]
    fn test_all_flags() {
        let config = run(&[
            "-v", "0", "-l", "127.0.0.1:4001", "--join", "127.0.0.1:4000", "-d", "/tmp/x/node1",
        ]);
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.listen, "127.0.0.1:4001");
        assert_eq!(config.join, "127.0.0.1:4000");
        assert_eq!(config.directory, PathBuf::from("/tmp/x/node1"));
    }

    #[test]
    fn test_single_dash_join() {
        assert_eq!(run(&["-join", "127.0.0.1:4000"]).join, "127.0.0.1:4000");
        assert_eq!(run(&["-join=127.0.0.1:4000"]).join, "127.0.0.1:4000");
        assert_eq!(run(&["--join=/tmp/node0.sock"]).join, "/tmp/node0.sock");
    }

    #[test]
    fn test_negative_verbosity() {
        assert_eq!(run(&["-v", "-1"]).verbosity, -1);
    }

    #[test]
    fn test_stray_positional_is_usage_error() {
        let err = parse(["sqlcluster", "-d", "/tmp/x/node0", "stray"]).unwrap_err();
        match err {
            ConfigError::Usage { message } => assert!(message.contains("stray")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_verbosity_is_usage_error() {
        assert!(matches!(
            parse(["sqlcluster", "-v", "loud"]),
            Err(ConfigError::Usage { .. })
        ));
    }

    #[test]
    fn test_double_dash_short_flags() {
        let config = run(&[
            "--v", "1", "--l=./node1.sock", "--d", "/tmp/x/node1", "-join=127.0.0.1:4000",
        ]);
        assert_eq!(config.verbosity, 1);
        assert_eq!(config.listen, "./node1.sock");
        assert_eq!(config.directory, PathBuf::from("/tmp/x/node1"));
        assert_eq!(config.join, "127.0.0.1:4000");
    }

    #[test]
    fn test_help() {
        match parse(["sqlcluster", "-h"]).unwrap() {
            Invocation::Help(text) => {
                assert!(text.contains("Usage: sqlcluster"));
                assert!(text.contains("-join 127.0.0.1:4000"));
            }
            Invocation::Run(_) => panic!("expected help"),
        }
    }

    #[test]
    fn test_missing_tuning_file() {
        let err = parse(["sqlcluster", "-c", "/nonexistent/tuning.yaml"]).unwrap_err();
        assert!(matches!(err, ConfigError::Tuning { .. }));
    }
}
