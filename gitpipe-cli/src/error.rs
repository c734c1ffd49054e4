//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;

use gitpipe::backup::BackupError;
use gitpipe::core::environment::EnvironmentError;
use gitpipe::core::launcher::LauncherError;
use gitpipe::dns::DnsError;
use gitpipe::ingress::ServeError;
use gitpipe::remote::SourceError;

/// CLI-level failures mapped to exit code 1.
#[derive(Debug)]
pub enum CliError {
    /// Failed to build the async runtime.
    Runtime(std::io::Error),
    /// Failed to initialise logging.
    LoggingInit(String),
    /// Invalid flag combination or value.
    Config(String),
    /// The environment could not be constructed.
    Environment(EnvironmentError),
    /// The backup location is unusable.
    Backup(BackupError),
    /// A repository reference could not be parsed.
    Source(SourceError),
    /// An environment file could not be read.
    EnvFile(std::io::Error),
    /// The DNS provider could not be set up.
    Dns(DnsError),
    /// The launcher rejected a command.
    Launcher(LauncherError),
    /// The HTTP(S) front end failed.
    Serve(ServeError),
    /// Token signing failed.
    Jwt(jsonwebtoken::errors::Error),
}

impl CliError {
    /// Prints the error (plus hints for the common cases) and exits.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {self}");

        if let CliError::Environment(_) = self {
            eprintln!();
            eprintln!("Is the docker daemon running and reachable?");
            eprintln!("  1. Check: docker info");
            eprintln!("  2. The current user must be allowed to use the docker socket");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Runtime(e) => write!(f, "failed to start async runtime: {e}"),
            CliError::LoggingInit(msg) => write!(f, "failed to initialize logging: {msg}"),
            CliError::Config(msg) => write!(f, "configuration error: {msg}"),
            CliError::Environment(e) => write!(f, "create environment: {e}"),
            CliError::Backup(e) => write!(f, "setup backup: {e}"),
            CliError::Source(e) => write!(f, "load repository: {e}"),
            CliError::EnvFile(e) => write!(f, "read env file: {e}"),
            CliError::Dns(e) => write!(f, "setup DNS provider: {e}"),
            CliError::Launcher(e) => write!(f, "launch daemon: {e}"),
            CliError::Serve(e) => write!(f, "serve router: {e}"),
            CliError::Jwt(e) => write!(f, "sign token: {e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) | CliError::EnvFile(e) => Some(e),
            CliError::Environment(e) => Some(e),
            CliError::Backup(e) => Some(e),
            CliError::Source(e) => Some(e),
            CliError::Dns(e) => Some(e),
            CliError::Launcher(e) => Some(e),
            CliError::Serve(e) => Some(e),
            CliError::Jwt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EnvironmentError> for CliError {
    fn from(e: EnvironmentError) -> Self {
        Self::Environment(e)
    }
}

impl From<BackupError> for CliError {
    fn from(e: BackupError) -> Self {
        Self::Backup(e)
    }
}

impl From<SourceError> for CliError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<DnsError> for CliError {
    fn from(e: DnsError) -> Self {
        Self::Dns(e)
    }
}

impl From<LauncherError> for CliError {
    fn from(e: LauncherError) -> Self {
        Self::Launcher(e)
    }
}

impl From<ServeError> for CliError {
    fn from(e: ServeError) -> Self {
        Self::Serve(e)
    }
}

impl From<jsonwebtoken::errors::Error> for CliError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::Jwt(e)
    }
}
