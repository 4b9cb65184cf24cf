use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "assetctl",
    version,
    about = "Command line client for the asset hierarchy service",
    long_about = "Browse and edit the asset hierarchy. The session is restored from the \
                  cookie jar of this process or established with a username and password, \
                  and renewed transparently while commands run."
)]
pub struct Args {
    /// Base URL of the asset service (e.g. https://localhost:7036)
    #[arg(long, global = true, env = "ASSETCTL_BASE_URL")]
    pub base_url: Option<String>,

    /// Username to sign in with when no session exists
    #[arg(short, long, global = true, env = "ASSETCTL_USERNAME")]
    pub username: Option<String>,

    /// Password to sign in with
    #[arg(long, global = true, env = "ASSETCTL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the signed-in user and roles
    Whoami,

    /// Print the asset hierarchy
    Tree {
        /// Only show branches containing a name that matches (case-insensitive)
        #[arg(short, long)]
        filter: Option<String>,

        /// Print the raw JSON instead of a tree
        #[arg(long)]
        json: bool,
    },

    /// Add an asset under a parent
    Add {
        /// Name of the new asset
        name: String,

        /// Name of the parent asset
        #[arg(short, long)]
        parent: String,
    },

    /// Remove an asset and its subtree
    Remove {
        /// Name of the asset to remove
        name: String,
    },

    /// Keep the session alive and poll the hierarchy until interrupted
    Watch {
        /// Polling interval in seconds
        #[arg(short, long, default_value_t = 30)]
        interval: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_add() {
        let args = Args::try_parse_from([
            "assetctl",
            "--base-url",
            "https://localhost:7036",
            "add",
            "Pump 1",
            "--parent",
            "Plant",
        ])
        .unwrap();

        assert_eq!(args.base_url.as_deref(), Some("https://localhost:7036"));
        match args.command {
            Commands::Add { name, parent } => {
                assert_eq!(name, "Pump 1");
                assert_eq!(parent, "Plant");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["assetctl", "-v", "-q", "whoami"]).is_err());
    }
}
