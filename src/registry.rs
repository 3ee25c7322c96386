//! Agent registry - owns every agent worker and the shared discovery state

use crate::config::{self, Config, PersistedAgent, State};
use crate::event::{AgentId, EventRx, EventStream};
use crate::scanner::{KnownFiles, ProjectScanner};
use crate::tailer::AttachFrom;
use crate::worker::{AgentSnapshot, Command, WorkerHandle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),
    #[error("worker for agent {0} has stopped")]
    WorkerGone(AgentId),
}

#[derive(Debug)]
struct AgentEntry {
    handle: WorkerHandle,
    log_path: PathBuf,
    project_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct Inner {
    config: Arc<Config>,
    events: EventStream,
    // std Mutex: never held across an await.
    agents: Mutex<HashMap<AgentId, AgentEntry>>,
    next_id: AtomicU32,
    focused: Mutex<Option<AgentId>>,
    known: KnownFiles,
    scans: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    state_path: Option<PathBuf>,
}

/// Cheap-to-clone handle to the set of tracked agents.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    inner: Arc<Inner>,
}

impl AgentRegistry {
    /// Create an empty registry. With `state_path`, every membership change is
    /// written there.
    pub fn new(config: Config, state_path: Option<PathBuf>) -> Self {
        let events = EventStream::new(config.event_buffer);
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                events,
                agents: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                focused: Mutex::new(None),
                known: KnownFiles::new(),
                scans: Mutex::new(HashMap::new()),
                state_path,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> EventRx {
        self.inner.events.subscribe()
    }

    pub fn known_files(&self) -> &KnownFiles {
        &self.inner.known
    }

    /// Start tracking a transcript and focus the new agent.
    ///
    /// The file may not exist yet; the agent then waits for it and reads it
    /// from the start once it appears.
    pub async fn add_agent(
        &self,
        log_path: PathBuf,
        project_dir: Option<PathBuf>,
        from: AttachFrom,
    ) -> AgentId {
        let id = AgentId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.spawn_agent(id, log_path, project_dir.clone(), from)
            .await;
        self.set_focus(Some(id));
        self.persist();

        if let Some(dir) = project_dir {
            self.ensure_project_scan(&dir).await;
        }
        id
    }

    async fn spawn_agent(
        &self,
        id: AgentId,
        log_path: PathBuf,
        project_dir: Option<PathBuf>,
        from: AttachFrom,
    ) {
        self.inner.known.insert(log_path.clone());
        let handle = WorkerHandle::spawn(
            id,
            log_path.clone(),
            from,
            Arc::clone(&self.inner.config),
            self.inner.events.clone(),
        )
        .await;
        info!(agent_id = %id, path = %log_path.display(), "agent added");

        let previous = self.inner.agents.lock().ok().and_then(|mut agents| {
            agents.insert(
                id,
                AgentEntry {
                    handle,
                    log_path,
                    project_dir,
                },
            )
        });
        if let Some(previous) = previous {
            previous.handle.shutdown().await;
        }
    }

    /// Stop tracking an agent, cancelling its timers and watchers.
    pub async fn remove_agent(&self, id: AgentId) -> Result<(), RegistryError> {
        let entry = self
            .inner
            .agents
            .lock()
            .ok()
            .and_then(|mut agents| agents.remove(&id))
            .ok_or(RegistryError::UnknownAgent(id))?;

        if let Ok(mut focused) = self.inner.focused.lock()
            && *focused == Some(id)
        {
            *focused = None;
        }
        self.persist();
        entry.handle.shutdown().await;
        info!(agent_id = %id, "agent removed");
        Ok(())
    }

    /// Point an agent at a new transcript, read from its start with a full state reset.
    pub fn reassign(&self, id: AgentId, log_path: PathBuf) -> Result<(), RegistryError> {
        self.inner.known.insert(log_path.clone());
        {
            let mut agents = self
                .inner
                .agents
                .lock()
                .map_err(|_| RegistryError::WorkerGone(id))?;
            let entry = agents.get_mut(&id).ok_or(RegistryError::UnknownAgent(id))?;
            if !entry.handle.send(Command::Reassign(log_path.clone())) {
                return Err(RegistryError::WorkerGone(id));
            }
            entry.log_path = log_path;
        }
        self.persist();
        Ok(())
    }

    /// Designate the agent that receives newly discovered transcripts.
    pub fn set_focused(&self, id: Option<AgentId>) -> Result<(), RegistryError> {
        if let Some(id) = id
            && !self.contains(id)
        {
            return Err(RegistryError::UnknownAgent(id));
        }
        self.set_focus(id);
        Ok(())
    }

    fn set_focus(&self, id: Option<AgentId>) {
        if let Ok(mut focused) = self.inner.focused.lock() {
            *focused = id;
        }
    }

    pub fn focused(&self) -> Option<AgentId> {
        self.inner.focused.lock().ok().and_then(|f| *f)
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.inner
            .agents
            .lock()
            .map(|agents| agents.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .inner
            .agents
            .lock()
            .map(|agents| agents.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.agents.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn send(&self, id: AgentId, command: Command) -> Result<(), RegistryError> {
        let agents = self
            .inner
            .agents
            .lock()
            .map_err(|_| RegistryError::WorkerGone(id))?;
        let entry = agents.get(&id).ok_or(RegistryError::UnknownAgent(id))?;
        if entry.handle.send(command) {
            Ok(())
        } else {
            Err(RegistryError::WorkerGone(id))
        }
    }

    pub async fn snapshot(&self, id: AgentId) -> Result<AgentSnapshot, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(id, Command::Snapshot(tx))?;
        rx.await.map_err(|_| RegistryError::WorkerGone(id))
    }

    /// Re-publish one agent's open tools and waiting status.
    pub fn replay_state(&self, id: AgentId) -> Result<(), RegistryError> {
        self.send(id, Command::ReplayState)
    }

    /// [`Self::replay_state`] for every agent, in id order.
    pub fn replay_all(&self) {
        for id in self.agent_ids() {
            if let Err(e) = self.replay_state(id) {
                debug!(agent_id = %id, error = %e, "state replay skipped");
            }
        }
    }

    /// Start scanning `dir` for new transcripts, once per directory.
    ///
    /// Files present when this returns are only recorded as known. A file
    /// that appears later is handed to the focused agent, if any.
    pub async fn ensure_project_scan(&self, dir: &Path) {
        if self.scanning(dir) {
            return;
        }

        // Seeded before returning: anything created after this call is new.
        let scanner = ProjectScanner::new(dir, self.inner.known.clone());
        let seeded = scanner.seed().await;

        let Ok(mut scans) = self.inner.scans.lock() else {
            return;
        };
        if scans.contains_key(dir) {
            return;
        }
        let period = self.inner.config.project_scan().max(std::time::Duration::from_millis(1));
        let registry = Arc::downgrade(&self.inner);
        info!(dir = %dir.display(), seeded, "watching project directory");
        let task = tokio::spawn(run_project_scan(scanner, period, registry));
        scans.insert(dir.to_path_buf(), task);
    }

    fn scanning(&self, dir: &Path) -> bool {
        self.inner
            .scans
            .lock()
            .map(|scans| scans.contains_key(dir))
            .unwrap_or(true)
    }

    /// Tracked agents and known transcripts, ready to save.
    pub fn persisted(&self) -> State {
        let mut agents: Vec<PersistedAgent> = self
            .inner
            .agents
            .lock()
            .map(|agents| {
                agents
                    .iter()
                    .map(|(id, entry)| PersistedAgent {
                        id: *id,
                        log_path: entry.log_path.clone(),
                        project_dir: entry.project_dir.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        agents.sort_by_key(|a| a.id);
        State {
            known_files: self.inner.known.to_vec(),
            agents,
        }
    }

    /// Write [`Self::persisted`] to the state file, if one was configured.
    pub fn save_state(&self) -> Result<(), std::io::Error> {
        match &self.inner.state_path {
            Some(path) => config::save_state_to(&self.persisted(), path),
            None => Ok(()),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to persist agent state");
        }
    }

    /// Re-adopt agents from a previous run, keeping their ids.
    ///
    /// Existing transcripts are tailed from their end; missing ones are awaited.
    pub async fn restore(&self, state: State) -> Vec<AgentId> {
        for path in state.known_files {
            self.inner.known.insert(path);
        }

        let mut restored = Vec::with_capacity(state.agents.len());
        let mut project_dir = None;
        for agent in state.agents {
            if self.contains(agent.id) {
                warn!(agent_id = %agent.id, "agent already tracked; skipping restore");
                continue;
            }
            self.spawn_agent(
                agent.id,
                agent.log_path,
                agent.project_dir.clone(),
                AttachFrom::End,
            )
            .await;
            self.inner
                .next_id
                .fetch_max(agent.id.0.saturating_add(1), Ordering::SeqCst);
            if agent.project_dir.is_some() {
                project_dir = agent.project_dir;
            }
            restored.push(agent.id);
        }

        if !restored.is_empty() {
            info!(
                count = restored.len(),
                known_files = self.inner.known.len(),
                "agents restored"
            );
            self.persist();
        }
        if let Some(dir) = project_dir {
            self.ensure_project_scan(&dir).await;
        }
        restored
    }

    /// Stop every scan and worker.
    pub async fn shutdown(&self) {
        if let Ok(mut scans) = self.inner.scans.lock() {
            for (_, task) in scans.drain() {
                task.abort();
            }
        }
        let entries: Vec<AgentEntry> = self
            .inner
            .agents
            .lock()
            .map(|mut agents| agents.drain().map(|(_, e)| e).collect())
            .unwrap_or_default();
        for entry in entries {
            entry.handle.shutdown().await;
        }
        debug!("registry shut down");
    }
}

async fn run_project_scan(
    scanner: ProjectScanner,
    period: std::time::Duration,
    registry: Weak<Inner>,
) {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let fresh = scanner.scan().await;
        let Some(inner) = registry.upgrade() else {
            break;
        };
        let agents = AgentRegistry { inner };

        for path in fresh {
            match agents.focused() {
                Some(id) => {
                    info!(agent_id = %id, path = %path.display(), "new transcript; reassigning focused agent");
                    if let Err(e) = agents.reassign(id, path) {
                        warn!(agent_id = %id, error = %e, "reassignment failed");
                    }
                }
                None => debug!(path = %path.display(), "new transcript with no focused agent"),
            }
        }
    }
    debug!(dir = %scanner.dir().display(), "project scan stopped");
}
