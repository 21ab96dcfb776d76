//! # Command-Line Interface Module
//!
//! The daemon's command line carries *observability* switches only.
//! Everything that shapes behavior (peer links, exported servers,
//! required clients, bindings, timer intervals) is a compile-time table
//! handed in by the embedding application, and the lifecycle machinery is
//! designed to converge from IDLE on restart; there is deliberately no
//! runtime or environment surface for configuration.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Default: INFO to stdout, detailed daily-rolled log file
//! rpc-proxyd
//!
//! # Debug verbosity, detailed log to stderr instead of a file
//! rpc-proxyd -v --log-file stderr
//!
//! # Silence stdout entirely (file logging still applies)
//! rpc-proxyd --quiet
//! ```

use clap::Parser;

/// Inter-node RPC proxy daemon.
///
/// Bridges local IPC services to peer systems over the configured
/// transport links, advertising remote services locally and forwarding
/// local requests remotely.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    ///
    /// Applies to both the stdout layer and the detailed log file.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Detailed log destination
    ///
    /// A file path (rolled daily with a date suffix), or the literal
    /// "stderr" to log to the terminal instead. Defaults to a daily file
    /// in the working directory.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Suppress the stdout status layer
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_counts() {
        let args = Args::parse_from(["rpc-proxyd", "-vv"]);
        assert_eq!(args.verbose, 2);
        assert!(!args.quiet);
    }

    #[test]
    fn log_file_accepts_stderr_keyword() {
        let args = Args::parse_from(["rpc-proxyd", "--log-file", "stderr", "--quiet"]);
        assert_eq!(args.log_file.as_deref(), Some("stderr"));
        assert!(args.quiet);
    }
}
