use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Inference backend to load models with
    #[arg(long, global = true, env = "TILE_CASCADE_BACKEND", default_value = "rtdetr")]
    pub backend: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a module list over a single image and print the results as JSON
    Predict {
        /// Image to process
        #[arg(long)]
        image: PathBuf,

        /// JSON file holding the module list
        #[arg(long)]
        modules: PathBuf,

        /// Round to report; defaults to the latest round with results
        #[arg(long)]
        round: Option<usize>,

        /// Include the tile grid in the output
        #[arg(long)]
        tile_positions: bool,

        /// Also store the run under this directory
        #[arg(long, env = "TILE_CASCADE_OUTPUT_ROOT")]
        output_root: Option<PathBuf>,
    },

    /// Run a module list over every image below a directory
    Batch {
        /// Root directory for input images
        #[arg(long, env = "TILE_CASCADE_IMAGE_ROOT")]
        image_root: PathBuf,

        /// JSON file holding the module list
        #[arg(long)]
        modules: PathBuf,

        /// Number of worker threads
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Root directory for run artifacts
        #[arg(long, env = "TILE_CASCADE_OUTPUT_ROOT")]
        output_root: Option<PathBuf>,
    },

    /// Serve the prediction API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Port to bind to
        #[arg(long, default_value_t = 12206)]
        port: u16,

        /// Root directory for input images
        #[arg(long, env = "TILE_CASCADE_IMAGE_ROOT")]
        image_root: PathBuf,

        /// Root directory for run artifacts
        #[arg(long, env = "TILE_CASCADE_OUTPUT_ROOT")]
        output_root: PathBuf,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
