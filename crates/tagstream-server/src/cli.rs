//! Command line interface

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "tagstream-server")]
#[command(about = "TagStream tag classification server", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tagstream.yaml")]
    pub config: String,

    /// Listen address
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen port
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Item store directory
    #[arg(short, long)]
    pub store: Option<PathBuf>,

    /// Create an empty item store at the store path before starting
    #[arg(long)]
    pub init_store: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
