use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "reminder_notifier", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17700
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    core_url: String,

    /// Poll interval (milliseconds). Keep it below the core's alert repeat (2400ms)
    /// or repeats will be merged into one beep.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Show a desktop notification when a new reminder fires.
    ///
    /// Disable via `--notify=false`.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    notify: bool,

    /// Beep on every alert signal until the reminder is stopped in the UI.
    ///
    /// Disable via `--beep=false`.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    beep: bool,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
struct AlertEntry {
    subject: String,
    day: String,
    start: String,
    end: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
struct AlertDetail {
    kind: String,
    entry: AlertEntry,
    fired_at: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
struct ActiveAlert {
    sequence: u64,
    signals: u64,
    title: String,
    body: String,
    alert: AlertDetail,
}

impl ActiveAlert {
    fn is_start(&self) -> bool {
        self.alert.kind == "start"
    }

    fn fired_hhmm(&self) -> String {
        chrono::NaiveDateTime::parse_from_str(&self.alert.fired_at, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|_| "??:??".to_string())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Notify,
    Beep { start: bool },
    Cleared,
}

/// What was rendered last: (alert sequence, signals seen).
#[derive(Default, Debug)]
struct Seen(Option<(u64, u64)>);

impl Seen {
    /// Compares the core's current alert with what was already rendered.
    fn update(&mut self, current: Option<&ActiveAlert>) -> Vec<Action> {
        let mut actions = Vec::new();
        match (self.0, current) {
            (None, None) => {}
            (Some(_), None) => {
                actions.push(Action::Cleared);
                self.0 = None;
            }
            (prev, Some(cur)) => {
                let is_new = prev.map(|(seq, _)| seq) != Some(cur.sequence);
                let seen_signals = match prev {
                    Some((seq, n)) if seq == cur.sequence => n,
                    _ => 0,
                };
                if is_new {
                    actions.push(Action::Notify);
                }
                if cur.signals > seen_signals {
                    actions.push(Action::Beep {
                        start: cur.is_start(),
                    });
                }
                self.0 = Some((cur.sequence, cur.signals));
            }
        }
        actions
    }
}

async fn get_alert(client: &reqwest::Client, url: &str) -> anyhow::Result<Option<ActiveAlert>> {
    #[derive(Deserialize)]
    struct OkResponse<T> {
        ok: bool,
        data: Option<T>,
    }

    let res = client.get(url).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http_{}", res.status().as_u16());
    }
    let body: OkResponse<ActiveAlert> = res.json().await?;
    if !body.ok {
        anyhow::bail!("not_ok");
    }
    Ok(body.data)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tokio::time::{sleep, Duration};
    use tracing::{error, info};

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reminder_notifier=info".into()),
        )
        .init();

    let args = Args::parse();

    // Two notifiers would double every toast and beep.
    #[cfg(windows)]
    let _mutex = match ensure_single_instance_mutex() {
        Ok(g) => g,
        Err(e) => {
            info!("reminder_notifier already running; exit ({e})");
            return Ok(());
        }
    };

    let client = reqwest::Client::new();
    let endpoint = format!("{}/reminders/alert", args.core_url.trim_end_matches('/'));
    info!("Reminder notifier started. Polling {endpoint}");

    let mut seen = Seen::default();
    let mut failing = false;
    loop {
        match get_alert(&client, &endpoint).await {
            Ok(current) => {
                if failing {
                    info!("core reachable again");
                    failing = false;
                }
                for action in seen.update(current.as_ref()) {
                    match (action, current.as_ref()) {
                        (Action::Notify, Some(alert)) => {
                            info!("{} ({}): {}", alert.title, alert.fired_hhmm(), alert.body);
                            if args.notify {
                                show_notification(alert);
                            }
                        }
                        (Action::Beep { start }, _) => {
                            if args.beep {
                                beep(start);
                            }
                        }
                        (Action::Cleared, _) => info!("reminder stopped"),
                        _ => {}
                    }
                }
            }
            Err(e) => {
                // Log once per outage; the core may simply not be started yet.
                if !failing {
                    error!("poll failed: {e}");
                    failing = true;
                }
            }
        }

        sleep(Duration::from_millis(args.poll_ms.max(50))).await;
    }
}

#[cfg(windows)]
fn show_notification(alert: &ActiveAlert) {
    use win_toast_notify::{Duration, Scenario, WinToastNotify};

    let detail = format!(
        "{} {} - {}",
        alert.alert.entry.day, alert.alert.entry.start, alert.alert.entry.end
    );
    let _ = WinToastNotify::new()
        .set_duration(Duration::Long)
        .set_scenario(Scenario::Reminder)
        .set_title(alert.title.as_str())
        .set_messages(vec![alert.body.as_str(), detail.as_str()])
        .show();
}

#[cfg(not(windows))]
fn show_notification(alert: &ActiveAlert) {
    eprintln!("[{}] {}", alert.title, alert.body);
}

#[cfg(windows)]
fn beep(start: bool) {
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        MessageBeep, MB_ICONASTERISK, MB_ICONEXCLAMATION,
    };

    unsafe {
        MessageBeep(if start { MB_ICONASTERISK } else { MB_ICONEXCLAMATION });
    }
}

#[cfg(not(windows))]
fn beep(start: bool) {
    use std::io::Write;

    // Terminal bell; twice for an end reminder so the two are distinguishable.
    let bell: &[u8] = if start { b"\x07" } else { b"\x07\x07" };
    let mut err = std::io::stderr();
    let _ = err.write_all(bell);
    let _ = err.flush();
}

#[cfg(windows)]
struct MutexGuard(windows_sys::Win32::Foundation::HANDLE);

#[cfg(windows)]
impl Drop for MutexGuard {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.0);
        }
    }
}

#[cfg(windows)]
fn ensure_single_instance_mutex() -> anyhow::Result<MutexGuard> {
    use std::ffi::c_void;
    use std::iter;
    use windows_sys::Win32::Foundation::{GetLastError, BOOL, ERROR_ALREADY_EXISTS, HANDLE};

    #[link(name = "kernel32")]
    extern "system" {
        fn CreateMutexW(
            lp_mutex_attributes: *const c_void,
            b_initial_owner: BOOL,
            lp_name: *const u16,
        ) -> HANDLE;
    }

    let name: Vec<u16> = "Local\\StudyTimetable.reminder_notifier"
        .encode_utf16()
        .chain(iter::once(0))
        .collect();

    unsafe {
        let h = CreateMutexW(std::ptr::null(), 0, name.as_ptr());
        if h.is_null() {
            anyhow::bail!("CreateMutexW_failed");
        }
        let err = GetLastError();
        if err == ERROR_ALREADY_EXISTS {
            windows_sys::Win32::Foundation::CloseHandle(h);
            anyhow::bail!("already_exists");
        }
        Ok(MutexGuard(h))
    }
}
