use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{HwAccel, Settings};
use crate::template::Template;

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("frame regex"));
static FPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"fps=\s*([\d\.]+)").expect("fps regex"));
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bitrate=\s*([\d\.]+)kbits/s").expect("bitrate regex"));
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"size=\s*(\d+)kB").expect("size regex"));

/// How often the watcher polls the child for exit.
const REAP_INTERVAL: Duration = Duration::from_millis(100);
/// Kill escalation: polls per signal phase, and the pause between polls.
const KILL_POLLS: u32 = 5;
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which encoder binary to run and with which acceleration flags.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    pub bin: String,
    pub hw_accel: HwAccel,
}

impl From<&Settings> for EncoderSpec {
    fn from(settings: &Settings) -> Self {
        Self { bin: settings.ffmpeg_bin.clone(), hw_accel: settings.hw_accel }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Self-describing progress snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub input_url: String,
    pub output_url: String,
    pub template_name: String,
    pub app: String,
    pub stream: String,
    pub state: SessionState,
    pub error_msg: String,
    /// ms since epoch, set when the session enters Running.
    pub start_time: u64,
    pub frames_out: u64,
    pub bytes_out: u64,
    pub fps: f32,
    /// kbps
    pub bitrate: f32,
}

pub type ResultCallback = Box<dyn Fn(&SessionInfo, bool, &str) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&SessionInfo) + Send + Sync>;

/// One encoder subprocess producing one output variant.
///
/// `start` spawns the process and a watcher task; the watcher parses stderr
/// progress lines and invokes the result callback exactly once when the
/// process reaches a terminal state. `stop` requests termination (SIGTERM,
/// escalating to SIGKILL) and waits for the watcher to finish.
pub struct Session {
    session_id: String,
    template: Option<Template>,
    template_name: String,
    encoder: EncoderSpec,
    info: Mutex<SessionInfo>,
    cancel: CancellationToken,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    progress_cb: Mutex<Option<ProgressCallback>>,
}

impl Session {
    pub fn new(
        input_url: &str,
        output_url: &str,
        template_name: &str,
        template: Option<Template>,
        app: &str,
        stream: &str,
        encoder: EncoderSpec,
    ) -> Arc<Self> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let info = SessionInfo {
            session_id: session_id.clone(),
            input_url: input_url.to_string(),
            output_url: output_url.to_string(),
            template_name: template_name.to_string(),
            app: app.to_string(),
            stream: stream.to_string(),
            state: SessionState::Idle,
            error_msg: String::new(),
            start_time: 0,
            frames_out: 0,
            bytes_out: 0,
            fps: 0.0,
            bitrate: 0.0,
        };
        Arc::new(Self {
            session_id,
            template,
            template_name: template_name.to_string(),
            encoder,
            info: Mutex::new(info),
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
            progress_cb: Mutex::new(None),
        })
    }

    pub fn info(&self) -> SessionInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        self.info.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn set_progress_callback(&self, cb: ProgressCallback) {
        *self.progress_cb.lock().unwrap() = Some(cb);
    }

    /// Spawns the encoder. On success the session is Running and the watcher
    /// owns the process; `on_result` fires once at the terminal state.
    pub fn start(self: &Arc<Self>, on_result: ResultCallback) -> anyhow::Result<()> {
        if self.state() != SessionState::Idle {
            let info = self.info();
            on_result(&info, false, "session already started");
            anyhow::bail!("session {} already started", self.session_id);
        }

        let Some(template) = self.template.clone() else {
            let msg = format!("template not found: {}", self.template_name);
            let info = self.info();
            on_result(&info, false, &msg);
            anyhow::bail!(msg);
        };

        self.set_state(SessionState::Starting);

        let (input_url, output_url) = {
            let info = self.info.lock().unwrap();
            (info.input_url.clone(), info.output_url.clone())
        };

        let mut cmd = Command::new(&self.encoder.bin);
        for arg in self.encoder.hw_accel.args().split_whitespace() {
            cmd.arg(arg);
        }
        cmd.arg("-i").arg(&input_url);
        cmd.args(template.render());
        cmd.arg("-f").arg("flv").arg(&output_url).arg("-y");
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        log::info!(
            "starting transcode session {}: {} -> {} ({})",
            self.session_id,
            input_url,
            output_url,
            self.template_name
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to spawn encoder: {}", e);
                self.set_error(&msg);
                let info = self.info();
                on_result(&info, false, &msg);
                anyhow::bail!(msg);
            }
        };

        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                let msg = "encoder stderr pipe missing".to_string();
                self.set_error(&msg);
                let info = self.info();
                on_result(&info, false, &msg);
                anyhow::bail!(msg);
            }
        };

        {
            let mut info = self.info.lock().unwrap();
            info.state = SessionState::Running;
            info.start_time = now_ms();
        }

        let handle = tokio::spawn(Arc::clone(self).watch(child, stderr, on_result));
        *self.watcher.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Requests termination and waits for the watcher to finish. Safe to call
    /// repeatedly and from any state.
    pub async fn stop(&self) {
        match self.state() {
            SessionState::Idle | SessionState::Stopped => return,
            _ => {}
        }

        log::info!("stopping transcode session {}", self.session_id);
        self.set_state(SessionState::Stopping);
        self.cancel.cancel();

        let handle = self.watcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.set_state(SessionState::Stopped);
    }

    async fn watch(self: Arc<Self>, mut child: Child, stderr: ChildStderr, on_result: ResultCallback) {
        let mut lines = BufReader::new(stderr).lines();
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        let mut stderr_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    terminate(&mut child).await;
                    return;
                }
                line = lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => self.parse_progress_line(&line),
                        // EOF and read errors both end the stderr stream; the
                        // reap poll below owns the rest of the lifecycle.
                        Ok(None) | Err(_) => stderr_open = false,
                    }
                }
                _ = reap.tick() => {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            if stderr_open {
                                self.drain_stderr(&mut lines).await;
                            }
                            if status.success() {
                                self.set_state(SessionState::Stopped);
                                log::info!("encoder exited normally: {}", self.session_id);
                                let info = self.info();
                                on_result(&info, true, "");
                            } else {
                                let code = status
                                    .code()
                                    .map(|c| c.to_string())
                                    .unwrap_or_else(|| "killed by signal".to_string());
                                let msg = format!("encoder exited with status: {}", code);
                                self.set_error(&msg);
                                let info = self.info();
                                on_result(&info, false, &msg);
                            }
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("waitpid failed for session {}: {}", self.session_id, e),
                    }
                }
            }
        }
    }

    /// After exit, consume stderr lines already buffered so progress
    /// callbacks precede the terminal callback.
    async fn drain_stderr(&self, lines: &mut Lines<BufReader<ChildStderr>>) {
        loop {
            match tokio::time::timeout(Duration::from_millis(20), lines.next_line()).await {
                Ok(Ok(Some(line))) => self.parse_progress_line(&line),
                _ => return,
            }
        }
    }

    /// Applies the encoder progress regexes to one stderr line. Any subset
    /// may match; unrecognized lines are tolerated. The progress callback
    /// receives a full snapshot, taken under the info mutex and invoked
    /// outside it.
    pub(crate) fn parse_progress_line(&self, line: &str) {
        log::debug!("encoder[{}]: {}", self.session_id, line);

        let mut updated = false;
        let snapshot = {
            let mut info = self.info.lock().unwrap();
            if let Some(caps) = FRAME_RE.captures(line) {
                if let Ok(v) = caps[1].parse() {
                    info.frames_out = v;
                    updated = true;
                }
            }
            if let Some(caps) = FPS_RE.captures(line) {
                if let Ok(v) = caps[1].parse() {
                    info.fps = v;
                    updated = true;
                }
            }
            if let Some(caps) = BITRATE_RE.captures(line) {
                if let Ok(v) = caps[1].parse() {
                    info.bitrate = v;
                    updated = true;
                }
            }
            if let Some(caps) = SIZE_RE.captures(line) {
                if let Ok(v) = caps[1].parse::<u64>() {
                    info.bytes_out = v * 1024;
                    updated = true;
                }
            }
            info.clone()
        };

        if updated {
            let cb = self.progress_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(&snapshot);
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        self.info.lock().unwrap().state = state;
    }

    fn set_error(&self, msg: &str) {
        let mut info = self.info.lock().unwrap();
        info.state = SessionState::Error;
        info.error_msg = msg.to_string();
        log::error!("transcode session {} error: {}", self.session_id, msg);
    }
}

/// SIGTERM, poll for exit, escalate to SIGKILL, poll again. Each phase is
/// bounded at roughly a second so shutdown never hangs on a stuck child.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else { return };

    signal(pid, libc::SIGTERM);
    for _ in 0..KILL_POLLS {
        if matches!(child.try_wait(), Ok(Some(_))) {
            log::info!("encoder terminated gracefully (pid {})", pid);
            return;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }

    log::warn!("encoder ignored SIGTERM, sending SIGKILL (pid {})", pid);
    signal(pid, libc::SIGKILL);
    for _ in 0..KILL_POLLS {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }
    log::error!("encoder survived SIGKILL (pid {})", pid);
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
