//! CLI argument definitions for wardend

use clap::Parser;
use std::path::PathBuf;

/// wardend - run the collection pipeline in privilege-separated workers
///
/// Each module runs in its own forked worker under a dedicated uid, gid and
/// SELinux label and reports back exactly one result.
#[derive(Parser, Debug)]
#[command(name = "wardend")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run with the default configuration (/etc/warden/config.toml if present)
    wardend

    # Use a specific configuration and show stage results
    wardend --config ./warden.toml -v

    # Show the registry and stage plan without forking anything
    wardend --dry-run
")]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short = 'c', value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print the module registry and stage plan, then exit
    #[arg(long)]
    pub dry_run: bool,

    /// Silent mode - suppress the banner and the run summary
    #[arg(long, short = 's')]
    pub silent: bool,
}

impl Cli {
    /// Default log level when `RUST_LOG` is unset.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["wardend"]);
        assert!(cli.config.is_none());
        assert!(!cli.dry_run);
        assert_eq!(cli.log_level(), "warn");
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["wardend", "-c", "/tmp/w.toml", "-vv", "--dry-run", "-s"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/w.toml")));
        assert_eq!(cli.log_level(), "debug");
        assert!(cli.dry_run);
        assert!(cli.silent);
    }

    #[test]
    fn test_verbosity_saturates_at_trace() {
        let cli = Cli::parse_from(["wardend", "-vvvvv"]);
        assert_eq!(cli.log_level(), "trace");
    }
}
