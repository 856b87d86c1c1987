use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Ambient variables the wine processes are allowed to inherit. Everything
/// else is stripped so stray host configuration cannot leak into the prefix.
pub const PRESERVED_ENV: &[&str] = &[
    "PATH",
    "HOSTNAME",
    "HOME",
    "USER",
    "WINEPREFIX",
    "WINESERVER",
];

/// Build the child environment from the allow-list plus explicit overrides.
/// An override always wins over an inherited value of the same name.
pub fn filtered_env(overrides: &[(&str, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| {
            PRESERVED_ENV.contains(&name.as_str())
                && !overrides.iter().any(|(overridden, _)| overridden == name)
        })
        .collect();
    env.extend(
        overrides
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone())),
    );
    env
}

/// Build a command for a wine-related program with a clean, allow-listed
/// environment. Stdin is closed by default; callers adjust stdio as needed.
pub fn wine_command<I, S>(
    program: &str,
    args: I,
    dir: Option<&Path>,
    overrides: &[(&str, String)],
) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    cmd.envs(filtered_env(overrides));
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd
}
