//! Host command invocation.
//!
//! Thin wrappers around `std::process::Command` used by the image builder,
//! network provisioner, and credential injector. Output is always captured;
//! failures carry the tool's combined stdout/stderr so the control plane can
//! report the underlying cause. The runner is stateless; callers own resource
//! scoping via the guards in their own modules.

use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::process::{Command, Stdio};

/// Run a command, returning trimmed stdout on success.
///
/// On a non-zero exit the combined stdout/stderr is attached to the error.
pub fn run<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|s| s.as_ref().to_os_string()).collect();
    tracing::debug!(program, ?args, "running command");

    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| Error::command_failed(program, e.to_string()))?;

    if !output.status.success() {
        return Err(Error::command_failed(program, combined_output(&output)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command where failure is tolerated (idempotent adds, best-effort
/// deletes). Returns whether the command succeeded; failures log at debug.
pub fn run_quiet<I, S>(program: &str, args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|s| s.as_ref().to_os_string()).collect();
    match Command::new(program).args(&args).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            tracing::debug!(
                program,
                ?args,
                output = %combined_output(&output),
                "tolerated command failure"
            );
            false
        }
        Err(e) => {
            tracing::debug!(program, ?args, error = %e, "tolerated spawn failure");
            false
        }
    }
}

/// Run `producer | consumer`, checking both exit statuses.
///
/// Used for the container export pipeline (`docker export | tar -x`).
pub fn run_piped(
    producer: &str,
    producer_args: &[&str],
    consumer: &str,
    consumer_args: &[&str],
) -> Result<()> {
    tracing::debug!(producer, consumer, "running piped command");

    let mut prod = Command::new(producer)
        .args(producer_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::command_failed(producer, e.to_string()))?;

    let prod_stdout = prod
        .stdout
        .take()
        .ok_or_else(|| Error::command_failed(producer, "no stdout pipe"))?;

    let cons = Command::new(consumer)
        .args(consumer_args)
        .stdin(Stdio::from(prod_stdout))
        .output()
        .map_err(|e| Error::command_failed(consumer, e.to_string()))?;

    let prod_result = prod
        .wait_with_output()
        .map_err(|e| Error::command_failed(producer, e.to_string()))?;

    if !prod_result.status.success() {
        return Err(Error::command_failed(
            producer,
            String::from_utf8_lossy(&prod_result.stderr).trim().to_string(),
        ));
    }
    if !cons.status.success() {
        return Err(Error::command_failed(consumer, combined_output(&cons)));
    }

    Ok(())
}

/// Merge stdout and stderr into one diagnostic string.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut combined = String::new();
    if !stdout.trim().is_empty() {
        combined.push_str(stdout.trim());
    }
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim());
    }
    if combined.is_empty() {
        combined = format!("exit status {:?}", output.status.code());
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = run("echo", &["hello"]).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_run_failure_attaches_output() {
        let err = run("ls", &["/definitely/not/a/path"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ls"), "error should name the command: {}", msg);
        assert!(msg.contains("failed"));
    }

    #[test]
    fn test_run_missing_binary() {
        let err = run("microvmd-no-such-binary", ["--version"]).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_run_quiet_tolerates_failure() {
        assert!(!run_quiet("ls", &["/definitely/not/a/path"]));
        assert!(run_quiet("true", Vec::<&str>::new()));
    }

    #[test]
    fn test_run_piped() {
        // echo | cat should pass the bytes through
        run_piped("echo", &["piped"], "cat", &[]).unwrap();
    }

    #[test]
    fn test_run_piped_consumer_failure() {
        let err = run_piped("echo", &["x"], "ls", &["/definitely/not/a/path"]).unwrap_err();
        assert!(err.to_string().contains("ls"));
    }
}
