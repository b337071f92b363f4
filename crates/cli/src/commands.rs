use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "calcsql")]
#[command(about = "calcsql compiles model calculation formulas into SQL", long_about = None, version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(name = "table", about = "compile an output table calculation request")]
    Table(CalcArgs),
    #[command(name = "microdata", about = "compile a microdata calculation request")]
    Microdata(CalcArgs),
}

#[derive(Debug, Parser)]
pub struct CalcArgs {
    /// model metadata json file
    #[arg(long)]
    pub meta: PathBuf,

    /// calculation request json file
    #[arg(long)]
    pub request: PathBuf,

    /// run ids to calculate over, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub run_ids: Vec<i32>,

    /// also print the row shape as json
    #[arg(long)]
    pub shape: bool,
}
