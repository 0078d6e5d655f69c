use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{MediaBus, SourceEvent};
use crate::config::{ConfigStore, TranscodeConfig};
use crate::session::{now_ms, EncoderSpec, Session, SessionInfo, SessionState};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const RTMP_BASE: &str = "rtmp://127.0.0.1:1935";

/// Supervisor lifecycle notifications. One `Start`, then zero or more
/// session results, then at most one `Stop` per task.
#[derive(Debug, Clone)]
pub enum TranscodeEvent {
    Start { app: String, stream: String },
    Stop { app: String, stream: String },
    SessionSuccess { app: String, stream: String, template: String },
    SessionError { app: String, stream: String, template: String, error: String },
}

pub type EventCallback = Arc<dyn Fn(&TranscodeEvent) + Send + Sync>;

/// Query snapshot of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub app: String,
    pub stream: String,
    pub input_url: String,
    pub templates: Vec<String>,
    /// ms since epoch.
    pub create_time: u64,
    pub auto_started: bool,
    pub total_sessions: usize,
    pub running_sessions: usize,
    pub error_sessions: usize,
}

/// Supervisor-level unit of transcoding for one source stream.
struct Task {
    task_id: String,
    app: String,
    stream: String,
    input_url: String,
    templates: Vec<String>,
    sessions: Vec<Arc<Session>>,
    create_time: u64,
    auto_started: bool,
    total_sessions: usize,
    running_sessions: usize,
    error_sessions: usize,
}

impl Task {
    fn snapshot(&self) -> TaskInfo {
        TaskInfo {
            task_id: self.task_id.clone(),
            app: self.app.clone(),
            stream: self.stream.clone(),
            input_url: self.input_url.clone(),
            templates: self.templates.clone(),
            create_time: self.create_time,
            auto_started: self.auto_started,
            total_sessions: self.total_sessions,
            running_sessions: self.running_sessions,
            error_sessions: self.error_sessions,
        }
    }
}

#[derive(Default)]
struct TaskRegistry {
    tasks: HashMap<String, Task>,
    /// `app/stream` -> task id. Every live task appears here exactly once.
    by_stream: HashMap<String, String>,
}

/// Owns all transcode tasks: admission control, dedup by `(app, stream)`,
/// periodic sweep of finished tasks, and media-source driven start/stop.
///
/// One mutex guards the registry and the secondary index; event and session
/// callbacks are never invoked while it is held.
pub struct Supervisor {
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    config: Mutex<TranscodeConfig>,
    registry: Mutex<TaskRegistry>,
    event_cb: Mutex<Option<EventCallback>>,
    total_tasks: AtomicU64,
    running_tasks: AtomicI64,
    total_sessions: AtomicU64,
    running_sessions: AtomicI64,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            config: Mutex::new(TranscodeConfig::default()),
            registry: Mutex::new(TaskRegistry::default()),
            event_cb: Mutex::new(None),
            total_tasks: AtomicU64::new(0),
            running_tasks: AtomicI64::new(0),
            total_sessions: AtomicU64::new(0),
            running_sessions: AtomicI64::new(0),
        })
    }

    /// Loads config, subscribes to the media bus and spawns the sweep worker.
    /// Returns false when transcoding is disabled or the config is invalid;
    /// calling it again while running returns true.
    pub fn start(self: &Arc<Self>, store: &ConfigStore, bus: &MediaBus) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return true;
        }

        let config = match TranscodeConfig::load(store) {
            Ok(config) => config,
            Err(e) => {
                log::error!("failed to load transcode config: {:#}", e);
                return false;
            }
        };
        if !config.settings.enable {
            log::info!("transcode is disabled");
            return false;
        }
        *self.config.lock().unwrap() = config;

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();
        self.running.store(true, Ordering::SeqCst);

        self.spawn_bus_listener(bus.subscribe(), cancel.clone());
        self.spawn_sweep_worker(cancel);

        log::info!("transcode supervisor started");
        true
    }

    /// Stops every task, then lets the workers die on the cancelled token.
    /// The worker handles are dropped rather than awaited so shutdown time
    /// stays bounded. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        log::info!("stopping transcode supervisor...");
        self.cancel.lock().unwrap().cancel();

        let task_ids: Vec<String> = self.registry.lock().unwrap().tasks.keys().cloned().collect();
        log::info!("stopping {} transcode tasks...", task_ids.len());
        for task_id in task_ids {
            self.stop_task(&task_id).await;
        }

        log::info!("transcode supervisor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Atomically swaps in a freshly parsed config (settings, templates,
    /// rules). Running tasks keep the templates they started with.
    pub fn reload_config(&self, store: &ConfigStore) -> anyhow::Result<()> {
        self.config.lock().unwrap().reload(store)
    }

    pub fn set_event_callback(&self, cb: EventCallback) {
        *self.event_cb.lock().unwrap() = Some(cb);
    }

    /// Starts a task for `(app, stream)`. With an empty template list the
    /// rule matcher decides; rejects when no templates resolve, admission
    /// fails, a task already exists, or no session could be spawned.
    /// Returns the new task id.
    pub fn start_transcode(
        self: &Arc<Self>,
        app: &str,
        stream: &str,
        templates: &[String],
        input_url: Option<&str>,
    ) -> anyhow::Result<String> {
        if !self.running.load(Ordering::SeqCst) {
            anyhow::bail!("transcode supervisor not running");
        }

        let (use_templates, resolved, encoder, max_concurrent) = {
            let config = self.config.lock().unwrap();
            let use_templates: Vec<String> = if templates.is_empty() {
                config.rules.matched_templates(app, stream, &config.templates)
            } else {
                templates.to_vec()
            };
            let resolved: Vec<_> = use_templates.iter().map(|name| config.templates.get(name).cloned()).collect();
            (
                use_templates,
                resolved,
                EncoderSpec::from(&config.settings),
                config.settings.max_concurrent,
            )
        };

        if use_templates.is_empty() {
            anyhow::bail!("no transcode templates found for {}/{}", app, stream);
        }

        // Admission is checked by intent, before any session exists.
        if self.running_sessions.load(Ordering::SeqCst) >= max_concurrent as i64 {
            anyhow::bail!("reached max concurrent transcode limit ({})", max_concurrent);
        }

        if self.has_task(app, stream) {
            anyhow::bail!("transcode task already exists: {}/{}", app, stream);
        }

        let task_id = generate_task_id(app, stream);
        let input_url = input_url.map(str::to_string).unwrap_or_else(|| build_input_url(app, stream));

        log::info!(
            "starting transcode task: {} ({}/{}), templates: {}, input: {}",
            task_id,
            app,
            stream,
            use_templates.len(),
            input_url
        );

        let mut sessions: Vec<Arc<Session>> = Vec::new();
        for (name, template) in use_templates.iter().zip(resolved) {
            let output_url = build_output_url(app, stream, name);
            let session = Session::new(&input_url, &output_url, name, template, app, stream, encoder.clone());

            {
                let task_id = task_id.clone();
                let name = name.clone();
                session.set_progress_callback(Arc::new(move |info| {
                    log::debug!(
                        "transcode progress: {} template {}: frames={} fps={} bitrate={}",
                        task_id,
                        name,
                        info.frames_out,
                        info.fps,
                        info.bitrate
                    );
                }));
            }

            let weak = Arc::downgrade(self);
            let result_task_id = task_id.clone();
            let result_template = name.clone();
            let started = session.start(Box::new(move |_info, success, error| {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_session_result(&result_task_id, &result_template, success, error);
                }
            }));

            match started {
                Ok(()) => sessions.push(session),
                Err(e) => log::warn!("failed to start transcode session for template {}: {:#}", name, e),
            }
        }

        if sessions.is_empty() {
            anyhow::bail!("failed to start any transcode sessions for {}", task_id);
        }

        let started_count = sessions.len();
        let task = Task {
            task_id: task_id.clone(),
            app: app.to_string(),
            stream: stream.to_string(),
            input_url,
            templates: use_templates,
            sessions,
            create_time: now_ms(),
            auto_started: templates.is_empty(),
            total_sessions: started_count,
            running_sessions: started_count,
            error_sessions: 0,
        };

        {
            let mut registry = self.registry.lock().unwrap();
            let key = stream_key(app, stream);
            if registry.by_stream.contains_key(&key) {
                // Lost a race with a concurrent start; roll the sessions back.
                for session in &task.sessions {
                    let session = Arc::clone(session);
                    tokio::spawn(async move { session.stop().await });
                }
                drop(registry);
                anyhow::bail!("transcode task already exists: {}/{}", app, stream);
            }
            registry.by_stream.insert(key, task_id.clone());
            registry.tasks.insert(task_id.clone(), task);
        }

        self.total_tasks.fetch_add(1, Ordering::SeqCst);
        self.running_tasks.fetch_add(1, Ordering::SeqCst);
        self.total_sessions.fetch_add(started_count as u64, Ordering::SeqCst);
        self.running_sessions.fetch_add(started_count as i64, Ordering::SeqCst);

        self.emit(TranscodeEvent::Start { app: app.to_string(), stream: stream.to_string() });
        Ok(task_id)
    }

    pub async fn stop_transcode(&self, app: &str, stream: &str) -> bool {
        let task_id = self.registry.lock().unwrap().by_stream.get(&stream_key(app, stream)).cloned();
        match task_id {
            Some(task_id) => self.stop_task(&task_id).await,
            None => false,
        }
    }

    pub async fn stop_transcode_by_id(&self, task_id: &str) -> bool {
        self.stop_task(task_id).await
    }

    /// The single owning stop path: removes the task from both indexes under
    /// one lock acquisition, then stops sessions and fires the event.
    async fn stop_task(&self, task_id: &str) -> bool {
        let task = {
            let mut registry = self.registry.lock().unwrap();
            let Some(task) = registry.tasks.remove(task_id) else {
                return false;
            };
            registry.by_stream.remove(&stream_key(&task.app, &task.stream));
            task
        };

        log::info!("stopping transcode task: {}", task_id);
        self.running_sessions.fetch_sub(task.running_sessions as i64, Ordering::SeqCst);
        self.running_tasks.fetch_sub(1, Ordering::SeqCst);

        for session in &task.sessions {
            session.stop().await;
        }

        self.emit(TranscodeEvent::Stop { app: task.app.clone(), stream: task.stream.clone() });
        true
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.registry.lock().unwrap().tasks.values().map(Task::snapshot).collect()
    }

    pub fn task(&self, app: &str, stream: &str) -> Option<TaskInfo> {
        let registry = self.registry.lock().unwrap();
        let task_id = registry.by_stream.get(&stream_key(app, stream))?;
        registry.tasks.get(task_id).map(Task::snapshot)
    }

    pub fn task_by_id(&self, task_id: &str) -> Option<TaskInfo> {
        self.registry.lock().unwrap().tasks.get(task_id).map(Task::snapshot)
    }

    pub fn has_task(&self, app: &str, stream: &str) -> bool {
        self.registry.lock().unwrap().by_stream.contains_key(&stream_key(app, stream))
    }

    pub fn running_task_count(&self) -> i64 {
        self.running_tasks.load(Ordering::SeqCst)
    }

    pub fn total_task_count(&self) -> u64 {
        self.total_tasks.load(Ordering::SeqCst)
    }

    pub fn running_session_count(&self) -> i64 {
        self.running_sessions.load(Ordering::SeqCst)
    }

    pub fn total_session_count(&self) -> u64 {
        self.total_sessions.load(Ordering::SeqCst)
    }

    pub fn template_names(&self) -> Vec<String> {
        self.config.lock().unwrap().templates.names()
    }

    /// Snapshots of every session currently in the Running state.
    pub fn running_sessions_info(&self) -> Vec<SessionInfo> {
        let registry = self.registry.lock().unwrap();
        registry
            .tasks
            .values()
            .flat_map(|task| task.sessions.iter())
            .filter(|session| session.is_running())
            .map(|session| session.info())
            .collect()
    }

    fn spawn_bus_listener(self: &Arc<Self>, mut rx: broadcast::Receiver<SourceEvent>, cancel: CancellationToken) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let Some(supervisor) = weak.upgrade() else { break };
                            supervisor.handle_source_event(event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("media bus listener lagged, dropped {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            log::info!("media bus listener finished");
        });
    }

    fn spawn_sweep_worker(self: &Arc<Self>, cancel: CancellationToken) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                let Some(supervisor) = weak.upgrade() else { break };
                supervisor.cleanup_finished_tasks();
            }
            log::info!("transcode sweep worker finished");
        });
    }

    /// Recomputes per-task session statistics and removes tasks with no
    /// running session left.
    pub(crate) fn cleanup_finished_tasks(&self) {
        let mut finished = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            let TaskRegistry { tasks, by_stream } = &mut *registry;
            for (task_id, task) in tasks.iter_mut() {
                let mut running = 0usize;
                let mut error = 0usize;
                for session in &task.sessions {
                    match session.state() {
                        SessionState::Running => running += 1,
                        SessionState::Error => error += 1,
                        _ => {}
                    }
                }
                let old_running = task.running_sessions as i64;
                task.running_sessions = running;
                task.error_sessions = error;
                self.running_sessions.fetch_add(running as i64 - old_running, Ordering::SeqCst);

                if running == 0 {
                    finished.push(task_id.clone());
                }
            }
            for task_id in &finished {
                if let Some(task) = tasks.remove(task_id) {
                    by_stream.remove(&stream_key(&task.app, &task.stream));
                    self.running_tasks.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        for task_id in finished {
            log::info!("cleaned up finished transcode task: {}", task_id);
        }
    }

    async fn handle_source_event(self: &Arc<Self>, event: SourceEvent) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        match event {
            SourceEvent::Changed { app, stream, registered: true } => {
                if self.has_task(&app, &stream) {
                    return;
                }
                let matched = {
                    let config = self.config.lock().unwrap();
                    config.rules.matched_templates(&app, &stream, &config.templates)
                };
                if matched.is_empty() {
                    return;
                }
                log::info!("auto starting transcode for: {}/{}", app, stream);
                if let Err(e) = self.start_transcode(&app, &stream, &[], None) {
                    log::warn!("auto start failed for {}/{}: {:#}", app, stream, e);
                }
            }
            SourceEvent::Changed { app, stream, registered: false } => {
                // The input is gone; a still-running encoder would only error.
                if self.has_task(&app, &stream) {
                    log::info!("media source unregistered, stopping transcode: {}/{}", app, stream);
                    self.stop_transcode(&app, &stream).await;
                }
            }
            SourceEvent::NoReaders { app, stream } => {
                if self.has_task(&app, &stream) {
                    log::debug!("media source has no readers, keeping transcode running: {}/{}", app, stream);
                }
            }
        }
    }

    fn on_session_result(&self, task_id: &str, template: &str, success: bool, error: &str) {
        let identity = {
            let registry = self.registry.lock().unwrap();
            registry.tasks.get(task_id).map(|task| (task.app.clone(), task.stream.clone()))
        };
        let Some((app, stream)) = identity else {
            return;
        };

        if success {
            log::info!("transcode session completed: {}, template: {}", task_id, template);
            self.emit(TranscodeEvent::SessionSuccess { app, stream, template: template.to_string() });
        } else {
            log::warn!("transcode session failed: {}, template: {}, error: {}", task_id, template, error);
            self.emit(TranscodeEvent::SessionError {
                app,
                stream,
                template: template.to_string(),
                error: error.to_string(),
            });
        }
    }

    fn emit(&self, event: TranscodeEvent) {
        let cb = self.event_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(&event);
        }
    }
}

fn stream_key(app: &str, stream: &str) -> String {
    format!("{}/{}", app, stream)
}

fn generate_task_id(app: &str, stream: &str) -> String {
    let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    format!("{}_{}_{}", app, stream, suffix)
}

fn build_input_url(app: &str, stream: &str) -> String {
    format!("{}/{}/{}", RTMP_BASE, app, stream)
}

fn build_output_url(app: &str, stream: &str, template_name: &str) -> String {
    format!("{}/{}/{}_{}", RTMP_BASE, app, stream, template_name)
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod supervisor_test;
