//! Shell-test probe: the service is healthy iff the command exits 0.

use std::env;
use tokio::process::Command;

/// Outcome of one `test` command run.
#[derive(Debug)]
pub struct ShellProbe {
    pub healthy: bool,
    /// Report text: `Test cmd: <stdout>` on success, `Test cmd: <error>`
    /// otherwise.
    pub because: String,
}

/// The user's preferred shell, falling back to `sh`.
pub fn user_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "sh".to_string())
}

pub async fn run_test(test: &str) -> ShellProbe {
    let output = Command::new(user_shell()).arg("-c").arg(test).output().await;

    match output {
        Ok(output) if output.status.success() => ShellProbe {
            healthy: true,
            because: format!("Test cmd: {}", String::from_utf8_lossy(&output.stdout)),
        },
        Ok(output) => ShellProbe {
            healthy: false,
            because: format!("Test cmd: {}", exit_text(&output.status)),
        },
        Err(err) => ShellProbe {
            healthy: false,
            because: format!("Test cmd: {err}"),
        },
    }
}

fn exit_text(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match status.signal() {
                    Some(signal) => format!("signal: {signal}"),
                    None => "terminated".to_string(),
                }
            }
            #[cfg(not(unix))]
            {
                "terminated".to_string()
            }
        }
    }
}
