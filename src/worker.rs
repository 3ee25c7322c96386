//! Per-agent worker task
//!
//! Each tracked agent gets one task that owns its tailer, state machine,
//! timers and deferred events. Change notifications, the fallback poll,
//! timer expiry and registry commands are all handled inside one
//! `select!` loop, so nothing about an agent is ever mutated concurrently.

use crate::activity::{ActivityMachine, ActivitySettings, Effect};
use crate::agent::ActiveTool;
use crate::config::Config;
use crate::event::{ActivityEvent, AgentId, AgentStatus, EventStream};
use crate::record::{self, ParseError};
use crate::tailer::{AttachFrom, LogTailer, TailError};
use crate::timers::{DeferredEvents, TimerCoordinator};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Lines and reads the worker gave up on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipStats {
    pub malformed: u64,
    pub unsupported: u64,
    pub io_errors: u64,
    pub truncations: u64,
}

impl SkipStats {
    fn record_parse_error(&mut self, err: &ParseError) {
        match err {
            ParseError::Malformed(_) => self.malformed += 1,
            ParseError::UnsupportedType => self.unsupported += 1,
        }
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub log_path: PathBuf,
    pub offset: u64,
    /// The transcript does not exist yet.
    pub awaiting_file: bool,
    pub status: AgentStatus,
    pub permission_notified: bool,
    pub turn_had_tools: bool,
    pub tools: BTreeMap<String, ActiveTool>,
    pub subagent_tools: BTreeMap<String, BTreeMap<String, ActiveTool>>,
    pub skips: SkipStats,
}

#[derive(Debug)]
pub(crate) enum Command {
    /// Follow a different transcript from its start, with a full reset.
    Reassign(PathBuf),
    Snapshot(oneshot::Sender<AgentSnapshot>),
    /// Re-publish open tools and waiting status.
    ReplayState,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Polling for the transcript to be created.
    Awaiting,
    /// Change notifications plus fallback poll.
    Tailing,
}

/// Owner-side handle to a running worker. Dropping it stops the worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) async fn spawn(
        id: AgentId,
        path: PathBuf,
        from: AttachFrom,
        config: Arc<Config>,
        events: EventStream,
    ) -> Self {
        let tailer = LogTailer::attach(path, from).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = AgentWorker::new(id, tailer, config, events);
        let task = tokio::spawn(worker.run(rx));
        Self { commands: tx, task }
    }

    /// Returns `false` when the worker has already exited.
    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub(crate) async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            debug!(error = %e, "agent worker ended abnormally");
        }
    }
}

/// Watch the transcript's directory and wake the worker for changes to its file.
fn watch_parent(path: &Path, changed: Arc<Notify>) -> Option<RecommendedWatcher> {
    let dir = path.parent()?;
    let file_name = path.file_name()?.to_os_string();

    let watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
        match res {
            Ok(event) => {
                // Backends may drop paths; treat that as "maybe ours".
                if event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    changed.notify_one();
                }
            }
            Err(err) => {
                debug!(error = %err, "transcript watcher error");
                changed.notify_one();
            }
        }
    });

    let mut watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to initialize transcript watcher; polling only");
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        debug!(path = %dir.display(), error = %e, "failed to watch transcript dir; polling only");
        return None;
    }
    Some(watcher)
}

fn poll_interval(period: Duration, first_tick_now: bool) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let start = if first_tick_now {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

struct AgentWorker {
    machine: ActivityMachine,
    tailer: LogTailer,
    timers: TimerCoordinator,
    deferred: DeferredEvents,
    skips: SkipStats,
    events: EventStream,
    config: Arc<Config>,
    mode: Mode,
    poll_tick: Interval,
    changed: Arc<Notify>,
    watcher: Option<RecommendedWatcher>,
    debounce_until: Option<Instant>,
}

impl AgentWorker {
    fn new(id: AgentId, tailer: LogTailer, config: Arc<Config>, events: EventStream) -> Self {
        let settings = ActivitySettings::from(config.as_ref());
        let poll_tick = poll_interval(config.await_file_poll(), true);
        Self {
            machine: ActivityMachine::new(id, settings),
            tailer,
            timers: TimerCoordinator::new(),
            deferred: DeferredEvents::new(),
            skips: SkipStats::default(),
            events,
            config,
            mode: Mode::Awaiting,
            poll_tick,
            changed: Arc::new(Notify::new()),
            watcher: None,
            debounce_until: None,
        }
    }

    fn id(&self) -> AgentId {
        self.machine.agent().id
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!(agent_id = %self.id(), path = %self.tailer.path().display(), "agent worker started");
        if self.follow_current().await {
            self.poll().await;
        }

        loop {
            let deadline = self.next_deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                command = commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.fire_due().await;
                }
                _ = self.changed.notified(), if self.mode == Mode::Tailing => {
                    if self.debounce_until.is_none() {
                        self.debounce_until = Some(Instant::now() + self.config.change_debounce());
                    }
                }
                _ = self.poll_tick.tick() => {
                    match self.mode {
                        Mode::Awaiting => {
                            if self.tailer.exists().await {
                                info!(agent_id = %self.id(), path = %self.tailer.path().display(), "transcript appeared");
                                self.enter_tailing();
                                self.poll().await;
                            }
                        }
                        Mode::Tailing => self.poll().await,
                    }
                }
            }
        }

        self.watcher = None;
        self.timers.cancel_all();
        debug!(agent_id = %self.id(), "agent worker stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.timers.next_deadline(),
            self.deferred.next_deadline(),
            self.debounce_until,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Pick the mode for the current path. Returns `true` when tailing.
    async fn follow_current(&mut self) -> bool {
        if self.tailer.exists().await {
            self.enter_tailing();
            true
        } else {
            debug!(agent_id = %self.id(), path = %self.tailer.path().display(), "awaiting transcript");
            self.mode = Mode::Awaiting;
            self.poll_tick = poll_interval(self.config.await_file_poll(), true);
            false
        }
    }

    fn enter_tailing(&mut self) {
        self.mode = Mode::Tailing;
        self.watcher = watch_parent(self.tailer.path(), Arc::clone(&self.changed));
        self.poll_tick = poll_interval(self.config.file_poll(), false);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reassign(path) => self.reassign(path).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::ReplayState => {
                for event in self.machine.current_state_events() {
                    self.events.send(event);
                }
            }
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }

    async fn reassign(&mut self, path: PathBuf) {
        info!(agent_id = %self.id(), path = %path.display(), "reassigning transcript");
        self.reset_to(path).await;
        if self.follow_current().await {
            self.poll().await;
        }
    }

    /// Forget all activity and point the tailer at the start of `path`.
    async fn reset_to(&mut self, path: PathBuf) {
        // Drop the old subscription before anything touches the new path.
        self.watcher = None;
        self.debounce_until = None;
        self.timers.cancel_all();
        let effects = self.machine.reset();
        self.apply_effects(effects);
        self.tailer = LogTailer::attach(path, AttachFrom::Start).await;
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();

        for event in self.deferred.take_due(now) {
            self.events.send(event);
        }

        for kind in self.timers.take_due(now) {
            trace!(agent_id = %self.id(), ?kind, "timer fired");
            let effects = self.machine.timer_fired(kind);
            self.apply_effects(effects);
        }

        if self.debounce_until.is_some_and(|d| d <= now) {
            self.debounce_until = None;
            self.poll().await;
        }
    }

    async fn poll(&mut self) {
        loop {
            match self.tailer.poll().await {
                Ok(lines) => {
                    self.process_lines(&lines);
                    return;
                }
                Err(TailError::Truncated { offset, len }) => {
                    warn!(
                        agent_id = %self.id(),
                        path = %self.tailer.path().display(),
                        offset,
                        len,
                        "transcript shrank; restarting from the beginning"
                    );
                    self.skips.truncations += 1;
                    let path = self.tailer.path().to_path_buf();
                    self.reset_to(path).await;
                    if !self.follow_current().await {
                        return;
                    }
                }
                Err(TailError::Io(e)) => {
                    debug!(agent_id = %self.id(), path = %self.tailer.path().display(), error = %e, "transcript read failed");
                    self.skips.io_errors += 1;
                    return;
                }
            }
        }
    }

    fn process_lines(&mut self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let effects = self.machine.lines_arrived();
        self.apply_effects(effects);

        for line in lines {
            match record::parse(line) {
                Ok(record) => {
                    let effects = self.machine.apply(&record);
                    self.apply_effects(effects);
                }
                Err(e) => {
                    // Avoid logging the line itself (may contain user content).
                    trace!(agent_id = %self.id(), error = %e, "skipping transcript line");
                    self.skips.record_parse_error(&e);
                }
            }
        }
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.events.send(event),
                Effect::EmitAfter(delay, event) => self.deferred.push(delay, event),
                Effect::StartTimer(kind, delay) => self.timers.start(kind, delay),
                Effect::CancelTimer(kind) => self.timers.cancel(kind),
            }
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        let agent = self.machine.agent();
        AgentSnapshot {
            id: agent.id,
            log_path: self.tailer.path().to_path_buf(),
            offset: self.tailer.offset(),
            awaiting_file: self.mode == Mode::Awaiting,
            status: agent.status,
            permission_notified: agent.permission_notified,
            turn_had_tools: agent.turn_had_tools,
            tools: agent
                .tools()
                .map(|(id, tool)| (id.to_string(), tool.clone()))
                .collect(),
            subagent_tools: agent
                .subagent_parents()
                .map(|parent| {
                    let nested = agent
                        .subagent_tools(parent)
                        .map(|(id, tool)| (id.to_string(), tool.clone()))
                        .collect();
                    (parent.to_string(), nested)
                })
                .collect(),
            skips: self.skips,
        }
    }
}

/// Push a whole transcript through a fresh state machine without a clock.
///
/// Immediate and delayed events are returned in the order they were produced;
/// timers are never fired.
pub fn replay_transcript(
    id: AgentId,
    settings: ActivitySettings,
    text: &str,
) -> (Vec<ActivityEvent>, SkipStats) {
    let mut machine = ActivityMachine::new(id, settings);
    let mut skips = SkipStats::default();
    let mut events = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut effects = machine.lines_arrived();
        match record::parse(line) {
            Ok(record) => effects.extend(machine.apply(&record)),
            Err(e) => skips.record_parse_error(&e),
        }
        events.extend(effects.into_iter().filter_map(|effect| match effect {
            Effect::Emit(event) | Effect::EmitAfter(_, event) => Some(event),
            Effect::StartTimer(..) | Effect::CancelTimer(_) => None,
        }));
    }

    (events, skips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRx;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn fast_config() -> Arc<Config> {
        Arc::new(Config {
            await_file_poll_ms: 20,
            file_poll_ms: 40,
            change_debounce_ms: 5,
            tool_done_delay_ms: 10,
            permission_delay_ms: 150,
            text_idle_delay_ms: 100,
            ..Config::default()
        })
    }

    fn append(path: &Path, value: serde_json::Value) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(f, "{value}").unwrap();
    }

    async fn next_event(rx: &mut EventRx) -> ActivityEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn snapshot(handle: &WorkerHandle) -> AgentSnapshot {
        let (tx, rx) = oneshot::channel();
        assert!(handle.send(Command::Snapshot(tx)));
        rx.await.unwrap()
    }

    // ==================== SkipStats / replay ====================

    #[test]
    fn replay_counts_skips_and_keeps_order() {
        let text = [
            json!({"type": "user", "message": {"content": "go"}}).to_string(),
            "{not json".to_string(),
            json!({"type": "summary", "summary": "x"}).to_string(),
            json!({"type": "assistant", "message": {"content": [
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
            ]}})
            .to_string(),
            json!({"type": "user", "message": {"content": [{"type": "tool_result", "tool_use_id": "t1"}]}})
                .to_string(),
        ]
        .join("\n");

        let (events, skips) = replay_transcript(AgentId(1), ActivitySettings::default(), &text);
        assert_eq!(skips.malformed, 1);
        assert_eq!(skips.unsupported, 1);
        assert!(matches!(events[0], ActivityEvent::AgentToolsClear { .. }));
        assert!(matches!(
            events.last(),
            Some(ActivityEvent::AgentToolDone { tool_id, .. }) if tool_id == "t1"
        ));
    }

    // ==================== worker loop ====================

    #[tokio::test]
    async fn worker_tails_and_defers_tool_done() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, "").unwrap();

        let events = EventStream::new(64);
        let mut rx = events.subscribe();
        let handle =
            WorkerHandle::spawn(AgentId(1), path.clone(), AttachFrom::End, fast_config(), events)
                .await;

        append(
            &path,
            json!({"type": "assistant", "message": {"content": [
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "/x/y.rs"}}
            ]}}),
        );
        assert!(matches!(next_event(&mut rx).await, ActivityEvent::AgentStatus { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            ActivityEvent::AgentToolStart {
                agent_id: AgentId(1),
                tool_id: "t1".into(),
                status: "Reading y.rs".into(),
            }
        );

        append(
            &path,
            json!({"type": "user", "message": {"content": [{"type": "tool_result", "tool_use_id": "t1"}]}}),
        );
        assert_eq!(
            next_event(&mut rx).await,
            ActivityEvent::AgentToolDone {
                agent_id: AgentId(1),
                tool_id: "t1".into(),
            }
        );

        let snap = snapshot(&handle).await;
        assert!(snap.tools.is_empty());
        assert_eq!(snap.offset, std::fs::metadata(&path).unwrap().len());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn change_notification_delivers_without_fallback_poll() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, "").unwrap();

        // Fallback poll far beyond the test timeout: only the watcher can wake us.
        let config = Arc::new(Config {
            file_poll_ms: 600_000,
            change_debounce_ms: 5,
            ..Config::default()
        });
        let events = EventStream::new(64);
        let mut rx = events.subscribe();
        let handle =
            WorkerHandle::spawn(AgentId(5), path.clone(), AttachFrom::End, config, events).await;
        // Round-trip so the watcher is installed before the write.
        assert!(!snapshot(&handle).await.awaiting_file);

        append(&path, json!({"type": "user", "message": {"content": "hello"}}));
        assert_eq!(
            next_event(&mut rx).await,
            ActivityEvent::AgentToolsClear {
                agent_id: AgentId(5),
            }
        );
        assert_eq!(
            snapshot(&handle).await.offset,
            std::fs::metadata(&path).unwrap().len()
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn worker_awaits_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.jsonl");

        let events = EventStream::new(64);
        let mut rx = events.subscribe();
        let handle =
            WorkerHandle::spawn(AgentId(2), path.clone(), AttachFrom::End, fast_config(), events)
                .await;
        assert!(snapshot(&handle).await.awaiting_file);

        append(&path, json!({"type": "system", "subtype": "turn_duration"}));
        assert_eq!(
            next_event(&mut rx).await,
            ActivityEvent::AgentStatus {
                agent_id: AgentId(2),
                status: AgentStatus::Waiting,
            }
        );
        assert!(!snapshot(&handle).await.awaiting_file);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn worker_counts_skipped_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, "").unwrap();

        let events = EventStream::new(64);
        let mut rx = events.subscribe();
        let handle =
            WorkerHandle::spawn(AgentId(3), path.clone(), AttachFrom::End, fast_config(), events)
                .await;

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "{{broken").unwrap();
            writeln!(f, "{}", json!({"type": "file-history-snapshot"})).unwrap();
            writeln!(f, "{}", json!({"type": "system", "subtype": "turn_duration"})).unwrap();
        }
        next_event(&mut rx).await;

        let snap = snapshot(&handle).await;
        assert_eq!(snap.skips.malformed, 1);
        assert_eq!(snap.skips.unsupported, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn truncated_transcript_is_reread_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        let filler = json!({"type": "system", "subtype": "compact_boundary", "pad": "x".repeat(200)});
        append(&path, filler);

        let events = EventStream::new(64);
        let mut rx = events.subscribe();
        let handle =
            WorkerHandle::spawn(AgentId(4), path.clone(), AttachFrom::End, fast_config(), events)
                .await;

        std::fs::write(
            &path,
            format!("{}\n", json!({"type": "system", "subtype": "turn_duration"})),
        )
        .unwrap();

        // Reset first, then the re-read turn end.
        assert!(matches!(next_event(&mut rx).await, ActivityEvent::AgentToolsClear { .. }));
        loop {
            if let ActivityEvent::AgentStatus {
                status: AgentStatus::Waiting,
                ..
            } = next_event(&mut rx).await
            {
                break;
            }
        }
        let snap = snapshot(&handle).await;
        assert_eq!(snap.skips.truncations, 1);
        assert_eq!(snap.offset, std::fs::metadata(&path).unwrap().len());
        handle.shutdown().await;
    }
}
