//! Launch-configuration merging for the dedicated server.
//!
//! Console variables ("convars") are merged from three layers in increasing
//! precedence: built-in defaults, environment variables, and `+convar value`
//! pairs from the command line. Arguments that are not recognized convars
//! pass through to the server untouched, in their original order.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Default,
    Env,
    Arg,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Default => write!(f, "default"),
            ValueSource::Env => write!(f, "env"),
            ValueSource::Arg => write!(f, "arg"),
        }
    }
}

#[derive(Debug, Clone)]
struct ConVar {
    value: String,
    source: ValueSource,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    vars: BTreeMap<String, ConVar>,
    env_bindings: BTreeMap<String, String>,
    passthrough: Vec<String>,
}

impl LaunchConfig {
    /// Merge defaults, environment (through `lookup`), and command-line
    /// arguments, in that order.
    pub fn merge<F>(
        defaults: &[(&str, &str)],
        env_bindings: &[(&str, &str)],
        args: &[String],
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LaunchConfig::default();
        config.apply_defaults(defaults);
        config.apply_env(env_bindings, lookup);
        config.apply_args(args);
        config
    }

    pub fn set(&mut self, convar: &str, value: &str, source: ValueSource) {
        self.vars.insert(
            convar.to_string(),
            ConVar {
                value: value.to_string(),
                source,
            },
        );
    }

    pub fn apply_defaults(&mut self, defaults: &[(&str, &str)]) {
        for (convar, value) in defaults {
            self.set(convar, value, ValueSource::Default);
        }
    }

    pub fn apply_env<F>(&mut self, bindings: &[(&str, &str)], lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (convar, env_name) in bindings {
            if let Some(value) = lookup(env_name) {
                self.set(convar, &value, ValueSource::Env);
            }
            self.env_bindings
                .insert(convar.to_string(), env_name.to_string());
        }
    }

    /// Fold `+convar value` pairs into the merged convars. A `+convar`
    /// without a default is not ours to interpret and passes through along
    /// with its value; so does everything that is not a `+convar`.
    pub fn apply_args(&mut self, args: &[String]) {
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let Some(convar) = arg.strip_prefix('+') else {
                self.passthrough.push(arg.clone());
                continue;
            };
            if convar.is_empty() {
                self.passthrough.push(arg.clone());
                continue;
            }
            let Some(value) = iter.next() else {
                // Dangling +convar at the end of the line.
                self.passthrough.push(arg.clone());
                continue;
            };
            if self.vars.contains_key(convar) {
                self.set(convar, value, ValueSource::Arg);
            } else {
                self.passthrough.push(arg.clone());
                self.passthrough.push(value.clone());
            }
        }
    }

    pub fn get(&self, convar: &str) -> Option<&str> {
        self.vars.get(convar).map(|v| v.value.as_str())
    }

    /// Arguments that were not folded into convars, in original order.
    pub fn passthrough_args(&self) -> &[String] {
        &self.passthrough
    }

    /// Render all convars as `+convar value` command-line arguments:
    /// passthrough args first, then the convars named in `order`, then the
    /// rest sorted by name.
    ///
    /// Note: some convars misbehave when passed on the command line instead
    /// of via the autoexec (the master-server hostname in particular), which
    /// is why `render_autoexec` is the default launch path.
    pub fn arguments(&self, order: &[&str]) -> Vec<String> {
        let mut args = self.passthrough.clone();
        for convar in order {
            if let Some(var) = self.vars.get(*convar) {
                args.push(format!("+{convar}"));
                args.push(var.value.clone());
            }
        }
        for (convar, var) in &self.vars {
            if order.contains(&convar.as_str()) {
                continue;
            }
            args.push(format!("+{convar}"));
            args.push(var.value.clone());
        }
        args
    }

    /// Write the convars as an autoexec config, one `convar "value"` per
    /// line. The server's config parser expects CRLF line endings.
    pub fn render_autoexec<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for (convar, var) in &self.vars {
            write!(w, "{} \"{}\"\r\n", convar, var.value)?;
        }
        Ok(())
    }

    /// Human-readable dump of the merged configuration.
    pub fn display<W: Write>(&self, w: &mut W, prefix: &str) -> io::Result<()> {
        writeln!(w, "{prefix}Extra arguments:")?;
        for arg in &self.passthrough {
            writeln!(w, "{prefix}    {arg}")?;
        }
        writeln!(w, "{prefix}Config:")?;
        for (convar, var) in &self.vars {
            let env = match self.env_bindings.get(convar) {
                Some(name) => format!(" ({name})"),
                None => String::new(),
            };
            writeln!(
                w,
                "{prefix}    +{convar} {:?} (from {}){env}",
                var.value, var.source
            )?;
        }
        Ok(())
    }

    /// Validate the merged convars, returning per-convar error messages.
    /// An empty map means the configuration is usable.
    pub fn validate(&self) -> BTreeMap<String, Vec<String>> {
        let mut errs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut push = |convar: &str, msg: String| {
            errs.entry(convar.to_string()).or_default().push(msg);
        };

        if self.get("gs_server_name").is_none_or(str::is_empty) {
            push("gs_server_name", "server name is required".to_string());
        }

        for (convar, var) in &self.vars {
            let value = var.value.as_str();
            if value.contains('"') {
                push(convar, "invalid value: must not contain double quotes".to_string());
            }
            match convar.as_str() {
                "gs_server_name" | "gs_server_desc" | "gs_server_password" => {}
                "gs_masterserver_hostname" => match Url::parse(value) {
                    Err(err) => push(convar, format!("invalid url: {err}")),
                    Ok(url) => {
                        if url.scheme() != "http" && url.scheme() != "https" {
                            push(convar, "invalid url: scheme must be http or https".to_string());
                        } else if url.host_str().is_none_or(str::is_empty) {
                            push(convar, "invalid url: hostname must be set".to_string());
                        }
                    }
                },
                "gs_report_to_masterserver"
                | "gs_auth_allow_insecure"
                | "gs_return_to_lobby"
                | "everything_unlocked"
                | "net_data_block_enabled"
                | "host_skip_client_dll_crc" => {
                    if value != "0" && value != "1" {
                        push(convar, "invalid bool (0 or 1)".to_string());
                    }
                }
                "gs_player_auth_port"
                | "net_chan_limit_mode"
                | "net_chan_limit_msec_per_sec"
                | "sv_querylimit_per_sec"
                | "sv_updaterate_mp"
                | "sv_minupdaterate"
                | "sv_max_snapshots_multiplayer" => {
                    if let Err(err) = value.parse::<i64>() {
                        push(convar, format!("invalid integer: {err}"));
                    }
                }
                "base_tickinterval_mp" => {
                    if let Err(err) = value.parse::<f64>() {
                        push(convar, format!("invalid float: {err}"));
                    }
                }
                _ => {}
            }
        }

        errs
    }
}
