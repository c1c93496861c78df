use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wingman::Backend;

/// Streaming chat and code completion against hosted or local models
#[derive(Debug, Parser)]
#[command(name = "wingman")]
#[command(version)]
#[command(about = "Streaming chat and code completion against hosted or local models", long_about = None)]
pub struct Args {
    /// Backend: anthropic, openai, ollama or google (default: config/backend or "ollama")
    #[arg(short = 'b', long = "backend")]
    pub backend: Option<Backend>,

    /// Model name
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Config file (default: <config dir>/config.toml)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive chat on stdin; `/clear` resets history, `/quit` exits
    Repl,

    /// Complete code at a cursor position and print the suggestion
    Complete {
        /// Source file
        #[arg(long)]
        file: PathBuf,

        /// 1-based line of the cursor
        #[arg(long)]
        line: usize,

        /// 1-based column of the cursor, in characters
        #[arg(long)]
        column: usize,
    },
}
