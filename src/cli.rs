use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "firstrun",
    about = "Supervised first-run initialization for portable installs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the bundle once so it unpacks its runtime, then stop it
    Init {
        /// Installation root (the directory the archive was extracted into)
        #[arg(long, default_value = ".")]
        install_path: PathBuf,

        /// Overall deadline in seconds
        #[arg(long)]
        deadline: Option<u64>,

        /// Required output silence after readiness, in seconds
        #[arg(long)]
        quiet: Option<u64>,

        /// Readiness marker (repeatable; replaces the configured set)
        #[arg(long = "marker")]
        markers: Vec<String>,

        /// Continue without asking when initialization fails
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the resolved install layout
    Paths {
        #[arg(long, default_value = ".")]
        install_path: PathBuf,

        /// Emit JSON instead of human-readable output
        #[arg(long)]
        json: bool,
    },

    /// Show project configuration
    Config {
        /// Emit JSON instead of human-readable output
        #[arg(long)]
        json: bool,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn init_parses_overrides() {
        let cli = Cli::try_parse_from([
            "firstrun",
            "-vv",
            "init",
            "--install-path",
            "/opt/comfy",
            "--deadline",
            "60",
            "--quiet",
            "3",
            "--marker",
            "READY",
            "--marker",
            "listening on",
            "--yes",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Init {
                install_path,
                deadline,
                quiet,
                markers,
                yes,
            } => {
                assert_eq!(install_path, PathBuf::from("/opt/comfy"));
                assert_eq!(deadline, Some(60));
                assert_eq!(quiet, Some(3));
                assert_eq!(markers, vec!["READY", "listening on"]);
                assert!(yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn init_defaults_to_current_directory() {
        let cli = Cli::try_parse_from(["firstrun", "init"]).unwrap();
        match cli.command {
            Command::Init {
                install_path,
                deadline,
                markers,
                yes,
                ..
            } => {
                assert_eq!(install_path, PathBuf::from("."));
                assert!(deadline.is_none());
                assert!(markers.is_empty());
                assert!(!yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn completions_reject_unknown_shell() {
        assert!(Cli::try_parse_from(["firstrun", "completions", "tcsh"]).is_err());
        assert!(Cli::try_parse_from(["firstrun", "completions", "zsh"]).is_ok());
    }
}
