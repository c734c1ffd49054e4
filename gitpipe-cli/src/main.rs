//! git-pipe command-line interface.
//!
//! Two subcommands: `run` (the default) watches repositories and serves
//! their workloads; `jwt` mints signed access tokens for the router's
//! authorisation layer. A bare invocation without a subcommand is
//! treated as `run`.

mod commands;
mod error;

use std::ffi::OsString;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "git-pipe")]
#[command(version = gitpipe::VERSION)]
#[command(about = "Watch and deploy container-based applications from Git", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch repositories, deploy workloads and serve the router
    Run(commands::run::RunArgs),

    /// Generate signed HS256 access tokens
    Jwt(commands::jwt::JwtArgs),
}

/// Inserts the implicit `run` subcommand for bare invocations.
fn normalized_args() -> Vec<OsString> {
    let mut args: Vec<OsString> = std::env::args_os().collect();
    if let Some(first) = args.get(1) {
        let first = first.to_string_lossy();
        let known = matches!(
            first.as_ref(),
            "run" | "jwt" | "help" | "--help" | "-h" | "--version" | "-V"
        );
        if !known {
            args.insert(1, OsString::from("run"));
        }
    }
    args
}

fn main() {
    let cli = match Cli::try_parse_from(normalized_args()) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args),
        Commands::Jwt(args) => commands::jwt::execute(args),
    };
    if let Err(error) = result {
        error.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_subcommands_parse() {
        let cli = Cli::try_parse_from([
            "git-pipe",
            "run",
            "https://example.com/u/app.git",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Run(_)));

        let cli = Cli::try_parse_from(["git-pipe", "jwt", "-s", "secret", "client1"]).unwrap();
        assert!(matches!(cli.command, Commands::Jwt(_)));
    }

    #[test]
    fn test_run_is_required_to_have_repos() {
        assert!(Cli::try_parse_from(["git-pipe", "run"]).is_err());
    }
}
