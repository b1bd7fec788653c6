//! Kill-by-name for hard cancellation.
//!
//! Terminates every process whose name matches one of the engine's known
//! executables (`pkill -x` on Unix, `taskkill /F /T /IM` on Windows). This
//! is best-effort: failures are logged, never returned.

use std::time::Duration;

use tokio::process::Command;

/// Upper bound on a single kill command.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Process names are passed as arguments, so restrict them to a plain
/// alphabet: alphanumeric, hyphen, underscore, dot.
fn is_safe_process_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn kill_command(name: &str) -> Command {
    if cfg!(windows) {
        let image = if name.to_ascii_lowercase().ends_with(".exe") {
            name.to_string()
        } else {
            format!("{name}.exe")
        };
        let mut cmd = Command::new("taskkill");
        cmd.args(["/F", "/T", "/IM", &image]);
        cmd
    } else {
        let mut cmd = Command::new("pkill");
        cmd.args(["-x", name]);
        cmd
    }
}

/// Terminate every process named in `names`.
pub async fn kill_processes_by_name<S: AsRef<str>>(names: &[S]) {
    for name in names {
        let name = name.as_ref();
        if !is_safe_process_name(name) {
            tracing::warn!(name, "Refusing to kill process with unsafe name");
            continue;
        }

        tracing::info!(name, "Killing engine processes by name");
        let result = tokio::time::timeout(KILL_TIMEOUT, kill_command(name).output()).await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(name, "Killed engine processes");
            }
            // pkill exits 1 when nothing matched.
            Ok(Ok(output)) => {
                tracing::debug!(
                    name,
                    exit_code = output.status.code().unwrap_or(-1),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "No processes killed",
                );
            }
            Ok(Err(e)) => tracing::warn!(name, error = %e, "Failed to run kill command"),
            Err(_) => tracing::warn!(name, "Kill command timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_process_names() {
        assert!(is_safe_process_name("python"));
        assert!(is_safe_process_name("ffmpeg"));
        assert!(is_safe_process_name("python3.11"));
        assert!(is_safe_process_name("python.exe"));
    }

    #[test]
    fn unsafe_process_names() {
        assert!(!is_safe_process_name(""));
        assert!(!is_safe_process_name("python; rm -rf /"));
        assert!(!is_safe_process_name("$(evil)"));
        assert!(!is_safe_process_name("py thon"));
        assert!(!is_safe_process_name(&"a".repeat(100)));
    }

    #[tokio::test]
    async fn unsafe_names_are_skipped_without_spawning() {
        kill_processes_by_name(&["a;b", ""]).await;
    }
}
