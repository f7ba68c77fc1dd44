use std::path::PathBuf;

use clap::Parser;

use crate::sequencer::RunBudget;

#[derive(Parser, Debug)]
#[command(
    name = "ocloop",
    about = "Batch-run a prompt against fresh OpenCode sessions with a live terminal view",
    version
)]
pub struct Cli {
    /// Path to the prompt file sent to every run
    #[arg(short, long)]
    pub prompt: PathBuf,

    /// Number of runs, or "infinite" to keep starting runs until quit
    #[arg(short, long, default_value = "infinite", value_parser = parse_budget)]
    pub runs: RunBudget,

    /// Model to use, as provider/model (e.g. anthropic/claude-sonnet-4)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Agent to use (e.g. code, default)
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_budget(raw: &str) -> Result<RunBudget, String> {
    if raw.eq_ignore_ascii_case("infinite") {
        return Ok(RunBudget::Unbounded);
    }
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Ok(RunBudget::Finite(n)),
        Ok(_) => Err("run count must be positive".to_string()),
        Err(_) => Err(format!("expected a positive integer or \"infinite\", got {raw:?}")),
    }
}
