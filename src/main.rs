//! kgraph-engine CLI entry point

use std::process::ExitCode;

use clap::Parser;

use kgraph_engine::cli::{Cli, Commands};
use kgraph_engine::commands::{
    run_purge, run_scan, run_schema, run_serve, run_sync, run_tool, run_watch, CommandContext,
};
use kgraph_engine::logging;

fn main() -> ExitCode {
    match run() {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn run() -> kgraph_engine::Result<String> {
    let cli = Cli::parse();

    // `schema` needs no workspace
    if let Commands::Schema = cli.command {
        return run_schema();
    }

    let ctx = CommandContext::from_cli(&cli)?;
    logging::init(ctx.log_level());
    tracing::debug!(
        "[CLI] root={} db={}",
        ctx.root.display(),
        ctx.db_path.display()
    );

    match &cli.command {
        Commands::Scan(args) => run_scan(&ctx, args),
        Commands::Sync(args) => run_sync(&ctx, args),
        Commands::Watch(args) => run_watch(&ctx, args),
        Commands::Serve(args) => run_serve(&ctx, args),
        Commands::Tool(args) => run_tool(&ctx, args),
        Commands::Purge(args) => run_purge(&ctx, args),
        Commands::Schema => run_schema(),
    }
}
