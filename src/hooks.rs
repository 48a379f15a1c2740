use anyhow::{Context, Result};
use tracing::{debug, info};

const SSH_SCHEME: &str = "ssh:";

fn shell_words(command: &str) -> (String, Vec<String>) {
    if let Some(rest) = command.strip_prefix(SSH_SCHEME) {
        if let Some((host, remote_cmd)) = rest.split_once(':') {
            return (
                "ssh".to_string(),
                vec![host.to_string(), remote_cmd.to_string()],
            );
        }
    }
    ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
}

fn log_output(label: &str, stdout: &[u8], stderr: &[u8]) {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if !stdout.trim().is_empty() {
        debug!("{label} stdout: {}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("{label} stderr: {}", stderr.trim());
    }
}

fn command_line(command: &str, extra_args: &[&str]) -> String {
    if extra_args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", extra_args.join(" "))
    }
}

/// Runs an operator-supplied hook command through the shell, or over ssh
/// when given as `ssh:<host>:<command>`. Extra arguments are appended to
/// the command line.
///
/// # Errors
/// Returns error if the process cannot be spawned or exits non-zero.
pub async fn run(label: &str, command: &str, extra_args: &[&str]) -> Result<()> {
    let full = command_line(command, extra_args);
    let (program, args) = shell_words(&full);

    info!("Running {label}: {full}");
    let output = tokio::process::Command::new(&program)
        .args(&args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {label} command"))?;
    log_output(label, &output.stdout, &output.stderr);
    if !output.status.success() {
        anyhow::bail!("{label} command failed with status {}", output.status);
    }
    Ok(())
}

/// Synchronous variant used from cleanup paths that run outside the
/// async runtime (signal teardown, drop guards).
///
/// # Errors
/// Returns error if the process cannot be spawned or exits non-zero.
pub fn run_blocking(label: &str, command: &str, extra_args: &[&str]) -> Result<()> {
    let full = command_line(command, extra_args);
    let (program, args) = shell_words(&full);

    info!("Running {label}: {full}");
    let output = std::process::Command::new(&program)
        .args(&args)
        .output()
        .with_context(|| format!("Failed to spawn {label} command"))?;
    log_output(label, &output.stdout, &output.stderr);
    if !output.status.success() {
        anyhow::bail!("{label} command failed with status {}", output.status);
    }
    Ok(())
}
