use std::process::Stdio;
use std::time::Duration;

use crate::command::wine_command;
use crate::error::WineError;

struct RegValue {
    hive: &'static str,
    key: &'static str,
    name: &'static str,
    kind: &'static str,
    data: &'static str,
}

/// Registry state required before the dedicated server can run headless:
/// a win10 version report, no audio or input drivers, no crash dialog, and
/// the dedicated d3d11 stub taking precedence over the built-in one.
const PREFIX_REGISTRY: &[RegValue] = &[
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine",
        name: "Version",
        kind: "REG_SZ",
        data: "win10",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\Drivers",
        name: "Audio",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\WineDbg",
        name: "ShowCrashDialog",
        kind: "REG_DWORD",
        data: "0",
    },
    RegValue {
        hive: "HKLM",
        key: r"System\CurrentControlSet\Services\WineBus",
        name: "DisableHidraw",
        kind: "REG_DWORD",
        data: "1",
    },
    RegValue {
        hive: "HKLM",
        key: r"System\CurrentControlSet\Services\WineBus",
        name: "DisableInput",
        kind: "REG_DWORD",
        data: "1",
    },
    RegValue {
        hive: "HKLM",
        key: r"System\CurrentControlSet\Services\WineBus",
        name: "Enable SDL",
        kind: "REG_DWORD",
        data: "0",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "d3d11",
        kind: "REG_SZ",
        data: "native",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "mscoree",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "mshtml",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "wined3d",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "winevulkan",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "d3d9",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "d3d10",
        kind: "REG_SZ",
        data: "",
    },
    RegValue {
        hive: "HKCU",
        key: r"Software\Wine\DllOverrides",
        name: "d3d12",
        kind: "REG_SZ",
        data: "",
    },
];

/// One-time initialization of the wine prefix at `$WINEPREFIX`.
///
/// Runs `wineboot --init`, applies the registry defaults, and waits for the
/// wineserver to settle so later launches start from a clean slate.
pub async fn init_prefix() -> Result<(), WineError> {
    tracing::info!("initializing wine prefix");

    let status = wine_command(
        "wineboot",
        ["--init"],
        None,
        &[
            ("WINEDLLOVERRIDES", "mscoree,mshtml=".to_string()),
            ("WINEARCH", "win64".to_string()),
        ],
    )
    .stdout(Stdio::inherit())
    .stderr(Stdio::inherit())
    .status()
    .await?;
    if !status.success() {
        return Err(WineError::Boot(format!("wineboot exited with {status}")));
    }

    for reg in PREFIX_REGISTRY {
        let path = format!("{}\\{}", reg.hive, reg.key);
        tracing::info!(key = %path, name = reg.name, kind = reg.kind, data = reg.data, "applying registry default");

        let status = wine_command(
            "wine64",
            [
                "reg",
                "add",
                path.as_str(),
                "/v",
                reg.name,
                "/t",
                reg.kind,
                "/d",
                reg.data,
            ],
            None,
            &[("WINEDEBUG", "-all".to_string())],
        )
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await?;
        if !status.success() {
            return Err(WineError::Registry {
                key: format!("{path}\\{}", reg.name),
                reason: format!("wine64 reg exited with {status}"),
            });
        }
    }

    wait_for_exit(Duration::from_secs(30)).await?;
    tracing::info!("wine prefix initialized");
    Ok(())
}

/// Wait for all wine processes in the prefix to exit (`wineserver -w`),
/// killing them if they do not finish within the timeout.
pub async fn wait_for_exit(timeout: Duration) -> Result<(), WineError> {
    tracing::debug!(?timeout, "waiting for wine processes to exit");

    let mut child = wine_command(
        "wineserver",
        ["-w"],
        None,
        &[("WINEDEBUG", "-all".to_string())],
    )
    .spawn()?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            status?;
            Ok(())
        }
        Err(_) => {
            tracing::warn!(?timeout, "wine did not exit in time; killing");
            let _ = child.kill().await;
            kill_all(Duration::from_secs(1)).await;
            Err(WineError::WaitTimeout(timeout))
        }
    }
}

/// Forcibly terminate every wine process in the prefix (`wineserver -k`).
/// Failure to kill is logged, not propagated; there is nothing the caller
/// can do about a wedged wineserver beyond tearing down the container.
pub async fn kill_all(timeout: Duration) {
    tracing::debug!(?timeout, "killing wine processes");

    let child = wine_command(
        "wineserver",
        ["-k"],
        None,
        &[("WINEDEBUG", "-all".to_string())],
    )
    .spawn();

    match child {
        Ok(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to kill wine processes"),
            Err(_) => {
                tracing::warn!(?timeout, "wineserver -k did not finish in time");
                let _ = child.kill().await;
            }
        },
        Err(err) => tracing::warn!(error = %err, "failed to spawn wineserver -k"),
    }
}
