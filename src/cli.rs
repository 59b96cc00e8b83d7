use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::defs::CONFIG_FILE_DEFAULT;

#[derive(Parser, Debug)]
#[command(name = "hybridmountd", version, about = "Hybrid mount boot daemon")]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    #[arg(short = 'm', long = "moduledir")]
    pub moduledir: Option<PathBuf>,
    #[arg(short = 't', long = "tempdir")]
    pub tempdir: Option<PathBuf>,
    #[arg(short = 's', long = "mountsource")]
    pub mountsource: Option<String>,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(short = 'p', long = "partitions", value_delimiter = ',')]
    pub partitions: Vec<String>,
    /// Print the mount plan and exit without touching the system
    #[arg(long = "dry-run")]
    pub dry_run: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    GenConfig {
        #[arg(short = 'o', long = "output", default_value = CONFIG_FILE_DEFAULT)]
        output: PathBuf,
    },
    /// Emit the active configuration as JSON
    ShowConfig,
    /// Persist a hex-encoded JSON configuration document
    #[command(name = "save-config")]
    SaveConfig {
        #[arg(long)]
        payload: String,
    },
    /// Output storage usage in JSON format
    Storage,
    /// List modules in JSON format
    Modules,
}
