use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::InstanceError;
use crate::intercept;
use crate::pty::Pty;
use crate::status::ServerStatus;
use crate::watchdog::{Watchdog, WatchdogCondition};

const WATCHDOG_INIT_TIMEOUT: Duration = Duration::from_secs(4 * 60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const TITLE_RATE_INTERVAL: Duration = Duration::from_millis(500);
const TITLE_RATE_BURST: usize = 1;
const TITLE_FAIL_WARN_THRESHOLD: u32 = 10;

/// Xvfb has no readiness signal; a fixed delay before launching the game is
/// the established workaround.
const DISPLAY_STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Where the game's visible console output goes. Shared between the
/// interceptor task and the run loop, locked only around individual writes.
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Invoked with the updated snapshot on every successfully parsed title.
/// Never called concurrently; the run loop is the only caller. Must not
/// block for long, for the same reason.
pub type StatusCallback = Box<dyn Fn(&ServerStatus) + Send + Sync>;

pub struct InstanceOptions {
    /// Working directory of the assembled server installation.
    pub dir: PathBuf,
    /// Executable to launch, relative to `dir`.
    pub executable: String,
    /// Extra command-line arguments for the server.
    pub args: Vec<String>,
    /// Xvfb display number; no virtual display is started when None.
    pub display: Option<u32>,
    pub output: Option<OutputSink>,
    pub status_callback: Option<StatusCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running { game: Option<Pid> },
    Terminated,
}

/// One supervised run of the dedicated server under wine. Single-use:
/// `run` drives the whole lifecycle and can only be called once.
pub struct Instance {
    dir: PathBuf,
    executable: String,
    args: Vec<String>,
    display: Option<u32>,
    output: Option<OutputSink>,
    status_callback: Option<StatusCallback>,

    // Written once at run entry, read from stop/close afterwards. The lock
    // is never held across an await or a blocking call.
    state: Mutex<RunState>,
    terminate: CancellationToken,
    done: watch::Sender<bool>,
}

enum Event {
    Display(Option<std::io::Result<std::process::Output>>),
    Game(Option<std::io::Result<std::process::ExitStatus>>),
    Cancelled,
    Title(Option<String>),
    Watchdog,
}

impl Instance {
    pub fn new(options: InstanceOptions) -> Instance {
        let (done, _) = watch::channel(false);
        Instance {
            dir: options.dir,
            executable: options.executable,
            args: options.args,
            display: options.display,
            output: options.output,
            status_callback: options.status_callback,
            state: Mutex::new(RunState::Idle),
            terminate: CancellationToken::new(),
            done,
        }
    }

    /// Run the instance until it stops, returning the reason. A requested
    /// stop surfaces as `InstanceError::Terminated`; everything else is an
    /// unexpected end of the run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), InstanceError> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, RunState::Idle) {
                return Err(InstanceError::AlreadyUsed);
            }
            *state = RunState::Running { game: None };
        }

        let result = self.run_inner(&cancel).await;

        // Forced teardown runs regardless of why the loop ended; stray wine
        // processes must not outlive the run.
        self.send_terminate(true);
        *self.state.lock() = RunState::Terminated;
        let _ = self.done.send(true);
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), InstanceError> {
        let mut pty = Pty::open()?;

        // Stops the interceptor and the rate-limit task however this
        // function unwinds.
        let internal = CancellationToken::new();
        let _internal_guard = internal.clone().drop_guard();

        let (title_tx, mut title_rx) = mpsc::channel::<String>(1);
        if let Some(master) = pty.take_master() {
            let sink = self.output.clone();
            let token = internal.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(err) = intercept::read_loop(master, sink, title_tx, token) {
                    tracing::debug!(error = %err, "console interceptor stopped");
                }
            });
        }

        if self.terminate.is_cancelled() {
            return Err(InstanceError::Terminated);
        }

        // Virtual display, when configured. Output is buffered and only
        // surfaced if the display dies before the run ends.
        let (xvfb_tx, mut xvfb_rx) = mpsc::channel::<std::io::Result<std::process::Output>>(1);
        let mut keep_xvfb_tx = Some(xvfb_tx);
        let mut xvfb_guard: Option<KillGuard> = None;
        if let Some(display) = self.display
            && let Some(tx) = keep_xvfb_tx.take()
        {
            let display_name = format!(":{display}");
            self.write_output(format!("Starting Xvfb on display {display_name}...\n").as_bytes());
            tracing::info!(display = %display_name, "starting virtual display");

            // A previous unclean shutdown can leave the lock file behind.
            let _ = std::fs::remove_file(format!("/tmp/.X{display}-lock"));

            let mut cmd = tokio::process::Command::new("Xvfb");
            cmd.arg(&display_name)
                .env_clear()
                .envs(warden_wine::filtered_env(&[]))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let child = cmd.spawn().map_err(InstanceError::DisplayStart)?;
            if let Some(pid) = child.id() {
                xvfb_guard = Some(KillGuard(Pid::from_raw(pid as i32)));
            }
            tokio::spawn(async move {
                let _ = tx.send(child.wait_with_output().await).await;
            });

            tokio::time::sleep(DISPLAY_STARTUP_GRACE).await;
        }

        // The game itself, under the compatibility runtime, with the pty
        // slave as its console.
        let mut game_args: Vec<String> = Vec::with_capacity(self.args.len() + 3);
        game_args.push(self.executable.clone());
        game_args.push("-dedicated".to_string());
        game_args.push("-multiple".to_string());
        game_args.extend(self.args.iter().cloned());

        let mut overrides: Vec<(&str, String)> = vec![
            ("WINEPATH", self.dir.display().to_string()),
            (
                "WINEDEBUG",
                "fixme-secur32,fixme-bcrypt,fixme-ver,err-wldap32".to_string(),
            ),
        ];
        if let Some(display) = self.display {
            overrides.push(("DISPLAY", format!(":{display}")));
        }

        let mut cmd = warden_wine::wine_command("wine64", &game_args, Some(&self.dir), &overrides);
        cmd.stdin(pty.slave_stdio()?)
            .stdout(pty.slave_stdio()?)
            .stderr(pty.slave_stdio()?);

        let mut game = cmd.spawn().map_err(|source| InstanceError::GameStart {
            dir: self.dir.clone(),
            executable: self.executable.clone(),
            args: self.args.clone(),
            source,
        })?;

        let game_pid = game.id().map(|pid| Pid::from_raw(pid as i32));
        if let RunState::Running { game } = &mut *self.state.lock() {
            *game = game_pid;
        }
        tracing::info!(pid = ?game_pid, executable = %self.executable, "game started");

        let (game_tx, mut game_rx) = mpsc::channel::<std::io::Result<std::process::ExitStatus>>(1);
        tokio::spawn(async move {
            let _ = game_tx.send(game.wait().await).await;
        });

        let mut status = ServerStatus::default();
        let mut title_failures: u32 = 0;
        let mut titles_open = true;
        let mut rate = ratelimit(TITLE_RATE_INTERVAL, TITLE_RATE_BURST, internal.clone());
        let mut watchdog = Watchdog::new(WATCHDOG_INIT_TIMEOUT, WATCHDOG_INTERVAL);

        let result = loop {
            let event = tokio::select! {
                output = xvfb_rx.recv() => Event::Display(output),
                exit = game_rx.recv() => Event::Game(exit),
                _ = cancel.cancelled() => Event::Cancelled,
                title = title_rx.recv(), if titles_open => Event::Title(title),
                _ = watchdog.triggered() => Event::Watchdog,
            };

            match event {
                Event::Display(output) => break Err(self.display_exited(output)),

                Event::Game(exit) => {
                    break if self.terminate.is_cancelled() {
                        Err(InstanceError::Terminated)
                    } else {
                        Err(InstanceError::Exited(describe_exit(exit)))
                    };
                }

                Event::Cancelled => break Err(InstanceError::Cancelled),

                Event::Title(None) => titles_open = false,

                Event::Title(Some(title)) => {
                    // Titles arrive every game tick; a couple per second is
                    // plenty for status purposes.
                    if rate.try_recv().is_err() {
                        continue;
                    }
                    if !status.parse_title(&title) {
                        title_failures += 1;
                        if title_failures == TITLE_FAIL_WARN_THRESHOLD {
                            tracing::warn!(
                                title,
                                pattern = ServerStatus::pattern(),
                                "failed to parse status from console title; suppressing further parse warnings"
                            );
                        }
                        continue;
                    }
                    title_failures = 0;
                    if let Some(callback) = &self.status_callback {
                        callback(&status);
                    }
                    watchdog.record_update();
                }

                Event::Watchdog => match watchdog.condition() {
                    WatchdogCondition::Uninitialized { ticks, target, .. } => {
                        tracing::warn!(
                            ticks,
                            target,
                            "watchdog did not initialize; engine hangs will not be detected automatically"
                        );
                    }
                    WatchdogCondition::Timeout { since_last } => {
                        tracing::error!(?since_last, "watchdog triggered; killing server");
                        break Err(InstanceError::WatchdogTimeout { since_last });
                    }
                    WatchdogCondition::Healthy => {}
                },
            }
        };

        watchdog.stop();
        drop(xvfb_guard);
        result
    }

    /// Request a graceful shutdown and wait for the run loop to finish, up
    /// to `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), InstanceError> {
        if matches!(*self.state.lock(), RunState::Idle) {
            return Err(InstanceError::NeverStarted);
        }

        self.send_terminate(false);

        let mut done = self.done.subscribe();
        match tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(InstanceError::StopTimeout(timeout)),
        }
    }

    /// Forcefully terminate the instance without waiting. A no-op once the
    /// run has ended; safe to call repeatedly and concurrently.
    pub fn close(&self) -> Result<(), InstanceError> {
        if matches!(*self.state.lock(), RunState::Idle) {
            return Err(InstanceError::NeverStarted);
        }
        self.send_terminate(true);
        Ok(())
    }

    fn send_terminate(&self, force: bool) {
        self.terminate.cancel();

        // The run loop's own teardown already ran; nothing left to kill.
        if *self.done.borrow() {
            return;
        }

        let game = match *self.state.lock() {
            RunState::Running { game } => game,
            _ => None,
        };
        let Some(pid) = game else {
            return;
        };

        if force {
            let _ = kill(pid, Signal::SIGKILL);
            self.spawn_wine_helper("wineserver", &["--kill"]);
        } else {
            self.spawn_wine_helper("wineboot", &["--shutdown"]);
        }
    }

    fn spawn_wine_helper(&self, program: &str, args: &[&str]) {
        let mut cmd = warden_wine::wine_command(program, args, Some(&self.dir), &[]);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        if let Err(err) = cmd.spawn() {
            tracing::warn!(program, error = %err, "failed to spawn wine helper");
        }
    }

    fn display_exited(&self, output: Option<std::io::Result<std::process::Output>>) -> InstanceError {
        match output {
            Some(Ok(output)) => {
                self.write_output(&output.stdout);
                self.write_output(&output.stderr);
                InstanceError::DisplayExited(output.status.to_string())
            }
            Some(Err(err)) => InstanceError::DisplayExited(err.to_string()),
            None => InstanceError::DisplayExited("wait channel closed".to_string()),
        }
    }

    fn write_output(&self, bytes: &[u8]) {
        if let Some(sink) = &self.output {
            let _ = sink.lock().write_all(bytes);
        }
    }
}

/// SIGKILL a process when dropped. Covers every exit path of the run loop.
struct KillGuard(Pid);

impl Drop for KillGuard {
    fn drop(&mut self) {
        let _ = kill(self.0, Signal::SIGKILL);
    }
}

fn describe_exit(exit: Option<std::io::Result<std::process::ExitStatus>>) -> String {
    match exit {
        Some(Ok(status)) => status.to_string(),
        Some(Err(err)) => err.to_string(),
        None => "wait channel closed".to_string(),
    }
}

/// Token bucket for title parsing: one token per `interval`, at most `burst`
/// banked. The generator task lives until `cancel` fires.
fn ratelimit(interval: Duration, burst: usize, cancel: CancellationToken) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(burst);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // A full bucket just drops the tick.
                    let _ = tx.try_send(());
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn options() -> InstanceOptions {
        InstanceOptions {
            dir: Path::new("/nonexistent/warden-test").to_path_buf(),
            executable: "GameServer.exe".to_string(),
            args: vec!["-port".to_string(), "37015".to_string()],
            display: None,
            output: None,
            status_callback: None,
        }
    }

    #[tokio::test]
    async fn stop_and_close_before_run_report_never_started() {
        let instance = Instance::new(options());
        assert!(matches!(
            instance.stop(Duration::from_millis(10)).await,
            Err(InstanceError::NeverStarted)
        ));
        assert!(matches!(instance.close(), Err(InstanceError::NeverStarted)));
    }

    #[tokio::test]
    async fn run_with_a_missing_working_directory_fails_to_start() {
        let instance = Instance::new(options());
        let err = instance.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::GameStart { .. }));
    }

    #[tokio::test]
    async fn run_cannot_be_reused() {
        let instance = Instance::new(options());
        let first = instance.run(CancellationToken::new()).await;
        assert!(first.is_err());

        let second = instance.run(CancellationToken::new()).await;
        assert!(matches!(second, Err(InstanceError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_after_termination() {
        let instance = Instance::new(options());
        let _ = instance.run(CancellationToken::new()).await;

        assert!(instance.close().is_ok());
        assert!(instance.close().is_ok());

        // A graceful stop on a terminated instance returns immediately.
        instance.stop(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ratelimit_banks_at_most_burst_tokens() {
        let cancel = CancellationToken::new();
        let mut rate = ratelimit(Duration::from_millis(500), 1, cancel.clone());

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert!(rate.try_recv().is_ok());
        assert!(rate.try_recv().is_err());
        cancel.cancel();
    }
}
