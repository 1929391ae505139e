use std::process::ExitCode;

use clap::{CommandFactory, Parser, error::ErrorKind};

use hyperclone::app;
use hyperclone::cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli { config, command } = cli;

    let command = match command {
        Some(cmd) => cmd,
        None => {
            let mut command = Cli::command();
            let _ = command.print_help();
            println!();
            return ExitCode::from(64);
        }
    };

    let result = match command {
        Commands::Clone(args) => app::handle_clone(args, config.as_ref()).map(|_| ()),
        Commands::Sync(args) => app::handle_sync(args, config.as_ref()).map(|_| ()),
        Commands::List(args) => app::handle_list(args, config.as_ref()).map(|_| ()),
        Commands::Status(args) => app::handle_status(args),
        Commands::Config(args) => app::handle_config(args.command, config.as_ref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            app::error::exit_code(&err)
        }
    }
}
