//! Stdio launch planning — turn a configured server `path` into a concrete
//! command line, and resolve a login-shell `PATH` so launches from GUI
//! contexts find developer-installed runtimes.

use std::collections::HashMap;

use tokio::sync::OnceCell;

/// How long to wait for the login shell to print its PATH.
const SHELL_PATH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The concrete command to spawn for a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
}

/// Build the launch plan for a configured `path`:
///
/// - `@scope/pkg` or a bare name (no `/`) runs through the package runner
///   (`npx -y <pkg> <extra>`)
/// - `*.py` runs under the system Python
/// - `*.js` / `*.ts` / `*.mjs` runs under the JS runtime (`bun run <path>`)
/// - anything else: the first whitespace token is the executable, the rest
///   are its arguments
pub fn launch_plan(path: &str, extra_args: &[String]) -> LaunchPlan {
    let trimmed = path.trim();

    let bare_package =
        !trimmed.contains('/') && !trimmed.contains(char::is_whitespace);
    if trimmed.starts_with('@') || bare_package {
        let mut args = vec!["-y".to_owned(), trimmed.to_owned()];
        args.extend(extra_args.iter().cloned());
        return LaunchPlan {
            program: "npx".into(),
            args,
        };
    }

    if trimmed.ends_with(".py") {
        let mut args = vec![trimmed.to_owned()];
        args.extend(extra_args.iter().cloned());
        return LaunchPlan {
            program: "python3".into(),
            args,
        };
    }

    if trimmed.ends_with(".js") || trimmed.ends_with(".ts") || trimmed.ends_with(".mjs") {
        let mut args = vec!["run".to_owned(), trimmed.to_owned()];
        args.extend(extra_args.iter().cloned());
        return LaunchPlan {
            program: "bun".into(),
            args,
        };
    }

    let mut tokens = trimmed.split_whitespace().map(str::to_owned);
    let program = tokens.next().unwrap_or_default();
    let mut args: Vec<String> = tokens.collect();
    args.extend(extra_args.iter().cloned());
    LaunchPlan { program, args }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Login-shell PATH
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

static LOGIN_SHELL_PATH: OnceCell<Option<String>> = OnceCell::const_new();

/// Resolve the user's login-shell PATH once per process. Returns `None` when
/// the shell cannot be queried within the timeout; callers fall back to the
/// inherited environment.
pub async fn login_shell_path() -> Option<String> {
    LOGIN_SHELL_PATH
        .get_or_init(|| async {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
            let result = tokio::time::timeout(
                SHELL_PATH_TIMEOUT,
                tokio::process::Command::new(&shell)
                    .args(["-l", "-c", "echo $PATH"])
                    .output(),
            )
            .await;

            match result {
                Ok(Ok(output)) if output.status.success() => {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                    if path.is_empty() {
                        None
                    } else {
                        tracing::debug!(shell = %shell, "resolved login-shell PATH");
                        Some(path)
                    }
                }
                Ok(Ok(output)) => {
                    tracing::warn!(shell = %shell, status = ?output.status, "login shell PATH query failed");
                    None
                }
                Ok(Err(e)) => {
                    tracing::warn!(shell = %shell, error = %e, "could not run login shell");
                    None
                }
                Err(_) => {
                    tracing::warn!(shell = %shell, "login shell PATH query timed out");
                    None
                }
            }
        })
        .await
        .clone()
}

/// Environment for a spawned server: configured variables, plus `PATH` from
/// the login shell and `HOME` so package runners behave.
pub async fn build_env(configured: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = configured.clone();
    if !env.contains_key("PATH") {
        if let Some(path) = login_shell_path().await {
            env.insert("PATH".into(), path);
        }
    }
    if !env.contains_key("HOME") {
        if let Ok(home) = std::env::var("HOME") {
            env.insert("HOME".into(), home);
        }
    }
    env
}
