//! Privilege elevation for nft
//!
//! sbsd normally runs as root (or with `CAP_NET_ADMIN`) and calls nft
//! directly. When it does not, nft is wrapped in an elevation helper.
//!
//! # Elevation Strategy
//!
//! 1. `SBS_NO_ELEVATION` set, or running as root: run nft directly
//! 2. `SBS_ELEVATION_METHOD` set: use exactly that helper (`sudo`, `run0`,
//!    `pkexec`), failing if it is not installed
//! 3. Otherwise: `run0` when available, else `sudo -n` (a daemon has no
//!    terminal to prompt on)
//!
//! # Security
//!
//! - Only nft can be elevated
//! - Arguments are passed directly, never through a shell

use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `SBS_ELEVATION_METHOD`
    #[error("Invalid SBS_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// No way to gain privileges was found
    #[error("Not running as root and neither run0 nor sudo is installed")]
    NoMethod,
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                full_path.is_file().then_some(full_path)
            })
        })
        .is_some()
}

fn wrapped(helper: &str, helper_args: &[&str], program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.args(helper_args).arg(program).args(args);
    cmd
}

/// Builds the nft command, elevated if needed.
///
/// `program` is the configured nft binary (usually `nft`).
pub fn create_elevated_nft_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    if std::env::var_os("SBS_NO_ELEVATION").is_some() || nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    if let Ok(method) = std::env::var("SBS_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            let helper_args: &[&str] = match method.as_str() {
                "sudo" => &["-n"],
                "run0" | "pkexec" => &[],
                _ => return Err(ElevationError::InvalidMethod(method)),
            };
            if !binary_exists(&method) {
                return Err(ElevationError::MethodNotAvailable(method));
            }
            return Ok(wrapped(&method, helper_args, program, args));
        }
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", &[], program, args));
    }
    if binary_exists("sudo") {
        return Ok(wrapped("sudo", &["-n"], program, args));
    }
    Err(ElevationError::NoMethod)
}
