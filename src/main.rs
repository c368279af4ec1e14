use anyhow::{Context, Result, anyhow};
use clap::{Command, arg};
use log::info;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use exam_scheduler::config::SolverConfig;
use exam_scheduler::data::{AnalyzeInput, ScheduleInput};
use exam_scheduler::orchestrator;
use exam_scheduler::server;

fn cli() -> Command {
    let config = || {
        arg!(--config <PATH> "Solver configuration json file")
            .required(false)
            .value_parser(clap::value_parser!(PathBuf))
    };
    Command::new("exam_scheduler")
        .about("Optimizes and analyzes final exam timetables")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("serve")
                .about("Serves the optimizer over HTTP")
                .arg(
                    arg!(--bind [ADDR] "Address to listen on")
                        .default_value("127.0.0.1:8080")
                        .value_parser(clap::value_parser!(SocketAddr)),
                )
                .arg(config()),
        )
        .subcommand(
            Command::new("solve")
                .about("Optimizes the timetable described by an input file")
                .arg(arg!(<INPUT> "Schedule input json file").value_parser(clap::value_parser!(PathBuf)))
                .arg(
                    arg!(--output [OUTPUT] "Write the result to this file instead of stdout")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(config()),
        )
        .subcommand(
            Command::new("analyze")
                .about("Reports the conflicts of an existing timetable")
                .arg(arg!(<INPUT> "Schedule input json file").value_parser(clap::value_parser!(PathBuf)))
                .arg(
                    arg!(<MAPPING> "Json file mapping group names to slots")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(config()),
        )
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load_config(path: Option<&PathBuf>) -> Result<SolverConfig> {
    SolverConfig::load(path.map(PathBuf::as_path)).context("Failed to load solver configuration")
}

fn solve(input: &Path, output: Option<&PathBuf>, config: SolverConfig) -> Result<()> {
    let input: ScheduleInput = read_json(input)?;
    let result = orchestrator::optimize(&input, &config)?;
    let json = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Result written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn analyze(input: &Path, mapping: &Path) -> Result<()> {
    let input = AnalyzeInput {
        schedule: read_json(input)?,
        group_to_slot: read_json(mapping)?,
    };
    let report = orchestrator::analyze_mapping(&input)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("serve", sub_m)) => {
            let config = load_config(sub_m.get_one::<PathBuf>("config"))?;
            let addr = sub_m
                .get_one::<SocketAddr>("bind")
                .copied()
                .ok_or_else(|| anyhow!("Missing bind address"))?;
            server::run_server(addr, config).await?;
            Ok(())
        }
        Some(("solve", sub_m)) => {
            let config = load_config(sub_m.get_one::<PathBuf>("config"))?;
            let input = sub_m
                .get_one::<PathBuf>("INPUT")
                .ok_or_else(|| anyhow!("Missing INPUT"))?;
            let output = sub_m.get_one::<PathBuf>("output");
            tokio::task::spawn_blocking({
                let input = input.clone();
                let output = output.cloned();
                move || solve(&input, output.as_ref(), config)
            })
            .await?
        }
        Some(("analyze", sub_m)) => {
            // analysis has no tunables, the config is only checked
            load_config(sub_m.get_one::<PathBuf>("config"))?;
            let input = sub_m
                .get_one::<PathBuf>("INPUT")
                .ok_or_else(|| anyhow!("Missing INPUT"))?;
            let mapping = sub_m
                .get_one::<PathBuf>("MAPPING")
                .ok_or_else(|| anyhow!("Missing MAPPING"))?;
            analyze(input, mapping)
        }
        _ => Err(anyhow!("Invalid subcommand")),
    }
}
