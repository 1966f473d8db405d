use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "appreg",
    about = "Application registry and deployment archive intake",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the registry HTTP server (default).
    Run,

    /// Load the store under --data-dir and report what it holds.
    Check,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "APPREG_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "APPREG_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Host used to derive `git@<host>:<name>.git` repository URLs.
    #[arg(
        long = "git-host",
        global = true,
        env = "APPREG_GIT_HOST",
        value_name = "HOST",
        default_value = "localhost"
    )]
    pub git_host: String,

    #[arg(
        long = "max-upload-mib",
        global = true,
        env = "APPREG_MAX_UPLOAD_MIB",
        value_name = "MIB",
        default_value_t = 64,
        value_parser = clap::value_parser!(u64).range(1..=1024)
    )]
    pub max_upload_mib: u64,
}

impl Config {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mib as usize).saturating_mul(1024 * 1024)
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }
}
