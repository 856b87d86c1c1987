use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use parking_lot::Mutex;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use warden_config::LaunchConfig;
use warden_overlay::{LayerPaths, Overlay};
use warden_supervisor::{Instance, InstanceError, InstanceOptions, OutputSink};

/// Built-in convar defaults, matching the runtime layer's stock autoexec.
const CONVAR_DEFAULTS: &[(&str, &str)] = &[
    ("gs_server_name", ""),
    ("gs_server_desc", ""),
    ("gs_server_password", ""),
    ("gs_report_to_masterserver", "1"),
    ("gs_auth_allow_insecure", "0"),
    ("gs_return_to_lobby", "1"),
    ("gs_player_auth_port", "8081"),
    ("gs_masterserver_hostname", "https://master.example.org"),
    ("everything_unlocked", "1"),
    ("net_chan_limit_mode", "2"),
    ("net_chan_limit_msec_per_sec", "100"),
    ("sv_querylimit_per_sec", "15"),
    ("base_tickinterval_mp", "0.016666667"),
    ("sv_updaterate_mp", "20"),
    ("sv_minupdaterate", "20"),
    ("sv_max_snapshots_multiplayer", "300"),
    ("net_data_block_enabled", "0"),
    ("host_skip_client_dll_crc", "1"),
];

/// Environment bindings for the commonly-tuned convars.
const CONVAR_ENV: &[(&str, &str)] = &[
    ("gs_server_name", "GS_SERVER_NAME"),
    ("gs_server_desc", "GS_SERVER_DESC"),
    ("gs_server_password", "GS_SERVER_PASSWORD"),
    ("gs_masterserver_hostname", "GS_MASTERSERVER_URL"),
    ("gs_report_to_masterserver", "GS_MASTERSERVER_REGISTER"),
    ("gs_auth_allow_insecure", "GS_INSECURE"),
    ("gs_player_auth_port", "GS_PORT_AUTH"),
];

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Read-only retail game installation
    #[arg(long, env = "GS_GAME_DIR", default_value = "/mnt/game")]
    game_dir: PathBuf,

    /// Dedicated-server runtime build
    #[arg(long, env = "GS_RUNTIME_DIR", default_value = "/usr/lib/gameserver")]
    runtime_dir: PathBuf,

    /// Extra mods, one directory per mod
    #[arg(long, env = "GS_MODS_DIR", default_value = "/mnt/mods")]
    mods_dir: PathBuf,

    /// Plugin DLLs
    #[arg(long, env = "GS_PLUGINS_DIR", default_value = "/mnt/plugins")]
    plugins_dir: PathBuf,

    /// Persistent save data (optional)
    #[arg(long, env = "GS_SAVE_DATA_DIR", default_value = "/mnt/save-data")]
    save_data_dir: PathBuf,

    /// Where the disposable overlay is assembled
    #[arg(long, env = "GS_STAGING_DIR", default_value = "/tmp")]
    staging_dir: PathBuf,

    /// UDP game port
    #[arg(long, env = "GS_PORT", default_value_t = 37015)]
    port: u16,

    /// Xvfb display number
    #[arg(long, env = "GS_DISPLAY", default_value_t = 57)]
    display: u32,

    /// Extra server arguments, shell-quoted
    #[arg(long, env = "GS_EXTRA_ARGUMENTS", default_value = "")]
    extra_arguments: String,

    /// Pass convars on the command line instead of writing the autoexec.
    /// Some convars (the master-server hostname among them) misbehave when
    /// passed this way.
    #[arg(long, env = "GS_NO_AUTOEXEC", default_value_t = false)]
    no_autoexec: bool,

    /// Seconds to wait for a graceful stop before force-killing
    #[arg(long, env = "GS_STOP_TIMEOUT", default_value_t = 30)]
    stop_timeout: u64,
}

pub async fn run(args: RunArgs) -> i32 {
    let hostname = hostname();
    println!(
        "Dedicated game server supervisor v{} (hostname: {hostname})",
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("Merging files...");
    let layers = LayerPaths {
        game: args.game_dir.clone(),
        runtime: args.runtime_dir.clone(),
        mods: args.mods_dir.clone(),
        plugins: args.plugins_dir.clone(),
        save_data: args.save_data_dir.clone(),
    };
    let overlay = match Overlay::build(&args.staging_dir, &layers) {
        Ok(overlay) => overlay,
        Err(err) => {
            eprintln!("Error: failed to merge game files: {err}.");
            return 1;
        }
    };

    let code = run_with_overlay(&args, &overlay, &hostname).await;

    if let Err(err) = overlay.remove() {
        tracing::warn!(error = %err, "failed to remove overlay");
    }
    code
}

async fn run_with_overlay(args: &RunArgs, overlay: &Overlay, hostname: &str) -> i32 {
    println!("Merging configuration...");
    let extra = match shell_words::split(&args.extra_arguments) {
        Ok(extra) => extra,
        Err(err) => {
            eprintln!(
                "Error: failed to split extra arguments {:?}: {err}.",
                args.extra_arguments
            );
            return 1;
        }
    };

    let mut launch_args = vec!["-port".to_string(), args.port.to_string()];
    launch_args.extend(extra);

    let config = LaunchConfig::merge(
        CONVAR_DEFAULTS,
        CONVAR_ENV,
        &launch_args,
        env_lookup(hostname),
    );

    let errors = config.validate();
    if !errors.is_empty() {
        eprintln!("Error: failed to merge config:");
        for (convar, messages) in &errors {
            let value = config.get(convar).unwrap_or_default();
            for message in messages {
                eprintln!("    {convar} ({value:?}) - {message}");
            }
        }
        return 2;
    }

    println!();
    let mut stdout = std::io::stdout();
    let _ = config.display(&mut stdout, "    ");
    println!();

    let server_args = if args.no_autoexec {
        config.arguments(&[])
    } else {
        let mut autoexec = Vec::new();
        if config.render_autoexec(&mut autoexec).is_err() {
            eprintln!("Error: failed to render autoexec.");
            return 1;
        }
        if let Err(err) = std::fs::write(overlay.autoexec_path(), &autoexec) {
            eprintln!("Error: failed to write autoexec: {err}.");
            return 1;
        }
        config.passthrough_args().to_vec()
    };

    println!("Starting server...");

    let output: OutputSink = Arc::new(Mutex::new(Box::new(std::io::stdout()) as Box<dyn Write + Send>));
    let instance = Arc::new(Instance::new(InstanceOptions {
        dir: overlay.path().to_path_buf(),
        executable: overlay.executable().to_string(),
        args: server_args,
        display: Some(args.display),
        output: Some(output),
        status_callback: Some(Box::new(|status| {
            tracing::debug!(%status, "server status");
        })),
    }));

    let stop_timeout = Duration::from_secs(args.stop_timeout);
    tokio::spawn({
        let instance = instance.clone();
        async move { forward_signals(instance, stop_timeout).await }
    });

    match instance.run(CancellationToken::new()).await {
        Err(InstanceError::Terminated) => {
            println!("Server stopped.");
            0
        }
        Err(err) => {
            eprintln!("Error: {err}.");
            1
        }
        Ok(()) => 0,
    }
}

/// First SIGINT/SIGTERM requests a graceful stop; a second one, or a stop
/// that does not finish in time, force-kills the server.
async fn forward_signals(instance: Arc<Instance>, stop_timeout: Duration) {
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        return;
    };
    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return;
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("signal received; stopping server");

    let graceful = tokio::spawn({
        let instance = instance.clone();
        async move { instance.stop(stop_timeout).await }
    });

    tokio::select! {
        result = graceful => {
            if !matches!(result, Ok(Ok(()))) {
                tracing::warn!("graceful stop failed; killing server");
                let _ = instance.close();
            }
        }
        _ = sigint.recv() => {
            tracing::warn!("second signal; killing server");
            let _ = instance.close();
        }
        _ = sigterm.recv() => {
            tracing::warn!("second signal; killing server");
            let _ = instance.close();
        }
    }
}

/// Environment lookup for the config merge. The server name and description
/// may reference the container hostname as `{{hostname}}`.
fn env_lookup(hostname: &str) -> impl Fn(&str) -> Option<String> + '_ {
    move |name| {
        let value = std::env::var(name).ok()?;
        if name == "GS_SERVER_NAME" || name == "GS_SERVER_DESC" {
            Some(value.replace("{{hostname}}", hostname))
        } else {
            Some(value)
        }
    }
}

fn hostname() -> String {
    let from_env = || std::env::var("HOSTNAME").ok().filter(|v| !v.is_empty());
    let name = match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy().into_owned();
            if name.is_empty() { from_env() } else { Some(name) }
        }
        Err(err) => {
            tracing::warn!(error = %err, "could not get container hostname");
            from_env()
        }
    };
    name.unwrap_or_else(|| "unknown".to_string())
}
