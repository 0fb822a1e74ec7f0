//! Failure messages for spawn results.
//!
//! The short form names the action and the outcome. The verbose form
//! adds a copy-pasteable command line that reproduces the spawn:
//!
//! ```text
//! Genrule failed: error executing command (exit 1)
//!   (cd /tmp/bitzel-sandbox/3f.../execroot && \
//!     exec env - \
//!       PATH=/bin \
//!     /bin/sh -c 'exit 1')
//! ```

use crate::types::{SpawnOutcome, SpawnRequest, SpawnResult};
use std::fmt::Write as _;
use std::path::Path;

/// Format the diagnostic for `result`.
pub fn describe(request: &SpawnRequest, result: &SpawnResult, verbose: bool) -> String {
    let mnemonic = &request.mnemonic;
    let mut message = match result.outcome {
        SpawnOutcome::Completed if result.exit_code == Some(0) => {
            return format!("{mnemonic} succeeded");
        }
        SpawnOutcome::Completed => match result.exit_code {
            Some(code) => format!("{mnemonic} failed: error executing command (exit {code})"),
            None => format!("{mnemonic} failed: error executing command"),
        },
        SpawnOutcome::TimedOut => {
            let mut message = format!("{mnemonic} failed: {}", timeout_summary(request));
            if result.forced_kill {
                message.push_str(" and was killed after ignoring termination");
            }
            message
        }
        outcome => format!("{mnemonic} failed: {outcome}"),
    };

    if let Some(detail) = result.detail.as_deref().filter(|_| result.outcome != SpawnOutcome::TimedOut) {
        let _ = write!(message, ": {detail}");
    }

    if verbose {
        let cwd = result
            .scratch_dir
            .as_ref()
            .map_or_else(|| request.exec_root.clone(), |dir| dir.join("execroot"));
        message.push('\n');
        message.push_str(&command_line(request, &cwd));
        if let Some(dir) = &result.scratch_dir {
            let _ = write!(message, "\n  sandbox: {}", dir.display());
        }
    }

    message
}

fn timeout_summary(request: &SpawnRequest) -> String {
    match request.timeout {
        Some(limit) => format!("timed out after {} seconds", limit.as_secs_f64()),
        None => "timed out".to_string(),
    }
}

/// Shell command reproducing the spawn from `cwd` with its exact environment.
pub fn command_line(request: &SpawnRequest, cwd: &Path) -> String {
    let mut line = format!("  (cd {} && \\\n    exec env - \\\n", quote(&cwd.to_string_lossy()));
    for (name, value) in &request.env {
        let _ = writeln!(line, "      {}={} \\", name, quote(value));
    }
    let argv: Vec<String> = request.command.iter().map(|arg| quote(arg)).collect();
    let _ = write!(line, "    {})", argv.join(" "));
    line
}

/// Single-quote `arg` for a POSIX shell unless it is plainly safe.
fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ',' | '+' | '@'));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn failed_request() -> SpawnRequest {
        SpawnRequest::new(["/bin/sh", "-c", "echo it's broken; exit 1"], "/ws/out")
            .with_mnemonic("Genrule")
            .with_env("PATH", "/bin:/usr/bin")
    }

    fn result(outcome: SpawnOutcome, exit_code: Option<i32>) -> SpawnResult {
        let mut result = SpawnResult::not_started(outcome, "");
        result.detail = None;
        result.exit_code = exit_code;
        result.scratch_dir = Some(PathBuf::from("/tmp/bitzel-sandbox/abc"));
        result
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("/usr/bin/gcc"), "/usr/bin/gcc");
        assert_eq!(quote("-DFOO=1"), "-DFOO=1");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_short_form() {
        let request = failed_request();
        let message = describe(&request, &result(SpawnOutcome::Completed, Some(1)), false);
        assert_eq!(message, "Genrule failed: error executing command (exit 1)");

        let ok = describe(&request, &result(SpawnOutcome::Completed, Some(0)), true);
        assert_eq!(ok, "Genrule succeeded");
    }

    #[test]
    fn test_verbose_form() {
        let request = failed_request();
        let message = describe(&request, &result(SpawnOutcome::Completed, Some(1)), true);

        assert!(message.starts_with("Genrule failed: error executing command (exit 1)\n"));
        assert!(message.contains("(cd /tmp/bitzel-sandbox/abc/execroot && \\\n"));
        assert!(message.contains("exec env - \\\n"));
        assert!(message.contains("PATH=/bin:/usr/bin \\\n"));
        assert!(message.contains(r"/bin/sh -c 'echo it'\''s broken; exit 1')"));
        assert!(message.ends_with("sandbox: /tmp/bitzel-sandbox/abc"));
    }

    #[test]
    fn test_timeout_and_detail() {
        let request = failed_request().with_timeout(Duration::from_secs(2));
        let mut timed_out = result(SpawnOutcome::TimedOut, Some(137));
        timed_out.forced_kill = true;
        timed_out.detail = Some("timed out after 2 seconds".to_string());
        assert_eq!(
            describe(&request, &timed_out, false),
            "Genrule failed: timed out after 2 seconds and was killed after ignoring termination"
        );

        let mut startup = result(SpawnOutcome::StartupFailed, None);
        startup.detail = Some("Failed to start /bin/sh: denied".to_string());
        assert_eq!(
            describe(&request, &startup, false),
            "Genrule failed: startup failed: Failed to start /bin/sh: denied"
        );
    }
}
