//! Shell selection and the child environment for new terminals.

use std::collections::BTreeMap;

/// Variables forced on every terminal so capability and locale negotiation
/// does not depend on how the server itself was started.
pub const TERMINAL_ENV_OVERRIDES: [(&str, &str); 5] = [
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("LANG", "en_US.UTF-8"),
    ("LC_ALL", "en_US.UTF-8"),
    ("LC_CTYPE", "en_US.UTF-8"),
];

const UNIX_FALLBACK_SHELL: &str = "/bin/sh";
const WINDOWS_SHELL: &str = "powershell.exe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Pick the executable and argument vector for a terminal.
///
/// Without a command the user's interactive shell starts with no arguments.
/// With one, the platform shell runs just that command. `login_shell` is the
/// caller's `$SHELL`; it is ignored on Windows.
pub fn resolve_shell(
    platform: Platform,
    login_shell: Option<&str>,
    command: Option<&str>,
) -> ShellInvocation {
    let command = command.map(str::trim).filter(|c| !c.is_empty());
    match platform {
        Platform::Unix => {
            let program = login_shell
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(UNIX_FALLBACK_SHELL)
                .to_string();
            let args = match command {
                Some(cmd) => vec!["-c".to_string(), cmd.to_string()],
                None => Vec::new(),
            };
            ShellInvocation { program, args }
        }
        Platform::Windows => {
            let args = match command {
                Some(cmd) => vec![
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    cmd.to_string(),
                ],
                None => Vec::new(),
            };
            ShellInvocation {
                program: WINDOWS_SHELL.to_string(),
                args,
            }
        }
    }
}

/// The inherited environment with [`TERMINAL_ENV_OVERRIDES`] applied.
pub fn terminal_env<I>(inherited: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();
    for (key, value) in TERMINAL_ENV_OVERRIDES {
        env.insert(key.to_string(), value.to_string());
    }
    env
}
