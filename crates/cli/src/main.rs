use std::error::Error;
use std::fs;

use calcsql_lib::layout::{CalculateMicroLayout, CalculateTableLayout, CompiledCalc};
use calcsql_lib::meta::ModelMeta;
use calcsql_lib::{calculate_microdata, calculate_output_table};
use clap::Parser;

mod commands;

use commands::{CalcArgs, Cli, Commands};

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let compiled = match &cli.command {
        Commands::Table(args) => {
            let (model, layout): (ModelMeta, CalculateTableLayout) = read_inputs(args)?;
            calculate_output_table(&model, &layout, &args.run_ids)?
        }
        Commands::Microdata(args) => {
            let (model, layout): (ModelMeta, CalculateMicroLayout) = read_inputs(args)?;
            calculate_microdata(&model, &layout, &args.run_ids)?
        }
    };
    print_compiled(&compiled, cli.shape())?;
    Ok(())
}

fn read_inputs<L: serde::de::DeserializeOwned>(
    args: &CalcArgs,
) -> Result<(ModelMeta, L), Box<dyn Error>> {
    let model = serde_json::from_str(&fs::read_to_string(&args.meta)?)?;
    let layout = serde_json::from_str(&fs::read_to_string(&args.request)?)?;
    Ok((model, layout))
}

fn print_compiled(compiled: &CompiledCalc, shape: bool) -> Result<(), Box<dyn Error>> {
    println!("{}", compiled.sql);
    if shape {
        println!("{}", serde_json::to_string_pretty(&compiled.shape)?);
    }
    Ok(())
}

impl Cli {
    fn shape(&self) -> bool {
        match &self.command {
            Commands::Table(args) | Commands::Microdata(args) => args.shape,
        }
    }
}
