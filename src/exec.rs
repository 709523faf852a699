//! Running short-lived helper programs.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::ExecError;

/// Returns `true` if `program` can be found on `PATH`.
pub(crate) fn tool_available(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    })
}

/// Runs `program` with `args` and returns its trimmed standard output.
///
/// The child is killed if it outlives `timeout`.
pub(crate) async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<String, ExecError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| spawn_error(program, source))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecError::Timeout {
            program: program.to_string(),
            after: timeout,
        })?
        .map_err(|source| ExecError::Io {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExecError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn spawn_error(program: &str, source: std::io::Error) -> ExecError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ExecError::NotFound {
            program: program.to_string(),
        }
    } else {
        ExecError::Io {
            program: program.to_string(),
            source,
        }
    }
}
