//! Activity state machine
//!
//! Consumes decoded records in file order and turns them into [`Effect`]s:
//! events to publish now, events to publish after a delay, and timer
//! start/cancel requests. The machine never touches a clock or a channel,
//! which keeps every transition testable without a runtime.
//!
//! # Transitions
//!
//! | Input | Result |
//! |---|---|
//! | new lines read | cancel idle + permission timers, clear a raised permission notice |
//! | assistant `tool_use` | open tools, status `active`, arm permission timer for non-exempt tools |
//! | assistant text only (no tools this turn) | arm idle timer |
//! | user `tool_result` | close tools (and delegation subtrees), deferred "tool done" |
//! | user prompt | new turn: clear every tool, status `active` |
//! | system `turn_duration` | clear stale tools, status `waiting` |
//! | progress (shell/MCP step) | re-arm permission timer |
//! | progress (subagent message) | open/close nested tools |
//! | idle timer | status `waiting` |
//! | permission timer | raise permission notice if a non-exempt tool is still open |

use crate::agent::Agent;
use crate::config::Config;
use crate::event::{ActivityEvent, AgentId, AgentStatus};
use crate::record::{NestedMessage, ProgressRecord, Record};
use crate::timers::TimerKind;
use crate::tool_status::{DELEGATION_TOOL, DisplayLimits, format_tool_status};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, trace};

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(ActivityEvent),
    EmitAfter(Duration, ActivityEvent),
    StartTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
}

/// Delays and tool classification used by the machine
#[derive(Debug, Clone)]
pub struct ActivitySettings {
    pub idle_delay: Duration,
    pub permission_delay: Duration,
    pub tool_done_delay: Duration,
    pub permission_exempt: HashSet<String>,
    pub limits: DisplayLimits,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ActivitySettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_delay: config.text_idle_delay(),
            permission_delay: config.permission_delay(),
            tool_done_delay: config.tool_done_delay(),
            permission_exempt: config.permission_exempt_tools.iter().cloned().collect(),
            limits: config.display_limits(),
        }
    }
}

/// State machine for one agent
#[derive(Debug)]
pub struct ActivityMachine {
    agent: Agent,
    settings: ActivitySettings,
}

impl ActivityMachine {
    pub fn new(id: AgentId, settings: ActivitySettings) -> Self {
        Self {
            agent: Agent::new(id),
            settings,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    fn id(&self) -> AgentId {
        self.agent.id
    }

    fn is_exempt(&self, tool_name: &str) -> bool {
        self.settings.permission_exempt.contains(tool_name)
    }

    /// A read produced at least one non-blank line.
    ///
    /// Runs before the batch's records are applied.
    pub fn lines_arrived(&mut self) -> Vec<Effect> {
        let mut effects = vec![
            Effect::CancelTimer(TimerKind::Idle),
            Effect::CancelTimer(TimerKind::Permission),
        ];
        if self.agent.permission_notified {
            self.agent.permission_notified = false;
            if self.agent.status == AgentStatus::PermissionPending {
                self.agent.status = AgentStatus::Active;
            }
            effects.push(Effect::Emit(ActivityEvent::AgentPermissionClear {
                agent_id: self.id(),
            }));
        }
        effects
    }

    /// Apply one record.
    pub fn apply(&mut self, record: &Record) -> Vec<Effect> {
        let mut effects = Vec::new();
        match record {
            Record::Assistant(a) => {
                if a.message.has_tool_use() {
                    self.open_top_level_tools(a.message.tool_uses(), &mut effects);
                } else if a.message.has_text() && !self.agent.turn_had_tools {
                    effects.push(Effect::StartTimer(
                        TimerKind::Idle,
                        self.settings.idle_delay,
                    ));
                }
            }
            Record::User(u) => {
                let content = &u.message.content;
                let results = content.tool_results();
                if !results.is_empty() {
                    self.complete_tools(&results, &mut effects);
                } else if content.is_new_prompt() {
                    self.start_new_turn(&mut effects);
                }
            }
            Record::System(s) => {
                if s.ends_turn() {
                    self.end_turn(&mut effects);
                }
            }
            Record::Progress(p) => self.apply_progress(p, &mut effects),
        }
        effects
    }

    /// Handle an expired timer. The coordinator has already removed it.
    pub fn timer_fired(&mut self, kind: TimerKind) -> Vec<Effect> {
        match kind {
            TimerKind::Idle => {
                debug!(agent_id = %self.id(), "idle timer fired");
                self.agent.status = AgentStatus::Waiting;
                vec![self.status_event()]
            }
            TimerKind::Permission => self.check_permission(),
        }
    }

    /// Forget everything, as if a new human turn had just begun.
    ///
    /// Used when the agent is pointed at a different transcript.
    pub fn reset(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.start_new_turn(&mut effects);
        effects
    }

    /// Events describing the current state, for a newly attached consumer.
    pub fn current_state_events(&self) -> Vec<ActivityEvent> {
        let mut events: Vec<ActivityEvent> = self
            .agent
            .tools()
            .map(|(tool_id, tool)| ActivityEvent::AgentToolStart {
                agent_id: self.id(),
                tool_id: tool_id.to_string(),
                status: tool.status.clone(),
            })
            .collect();
        if self.agent.status == AgentStatus::Waiting {
            events.push(ActivityEvent::AgentStatus {
                agent_id: self.id(),
                status: AgentStatus::Waiting,
            });
        }
        events
    }

    fn status_event(&self) -> Effect {
        Effect::Emit(ActivityEvent::AgentStatus {
            agent_id: self.id(),
            status: self.agent.status,
        })
    }

    fn open_top_level_tools<'a>(
        &mut self,
        tool_uses: impl Iterator<Item = (&'a str, &'a str, &'a serde_json::Value)>,
        effects: &mut Vec<Effect>,
    ) {
        effects.push(Effect::CancelTimer(TimerKind::Idle));
        self.agent.status = AgentStatus::Active;
        self.agent.turn_had_tools = true;
        effects.push(self.status_event());

        let mut has_non_exempt = false;
        for (tool_id, name, input) in tool_uses {
            let status = format_tool_status(name, input, &self.settings.limits);
            trace!(agent_id = %self.id(), %tool_id, %name, "tool start");
            self.agent.open_tool(tool_id, name, status.clone());
            if !self.is_exempt(name) {
                has_non_exempt = true;
            }
            effects.push(Effect::Emit(ActivityEvent::AgentToolStart {
                agent_id: self.id(),
                tool_id: tool_id.to_string(),
                status,
            }));
        }
        if has_non_exempt {
            effects.push(Effect::StartTimer(
                TimerKind::Permission,
                self.settings.permission_delay,
            ));
        }
    }

    fn complete_tools(&mut self, tool_ids: &[&str], effects: &mut Vec<Effect>) {
        for &tool_id in tool_ids {
            if self.agent.tool_name(tool_id) == Some(DELEGATION_TOOL) {
                effects.push(Effect::Emit(ActivityEvent::SubagentClear {
                    agent_id: self.id(),
                    parent_tool_id: tool_id.to_string(),
                }));
            }
            trace!(agent_id = %self.id(), %tool_id, "tool done");
            self.agent.close_tool(tool_id);
            effects.push(Effect::EmitAfter(
                self.settings.tool_done_delay,
                ActivityEvent::AgentToolDone {
                    agent_id: self.id(),
                    tool_id: tool_id.to_string(),
                },
            ));
        }
        if !self.agent.has_tools() {
            self.agent.turn_had_tools = false;
        }
    }

    fn clear_activity(&mut self, effects: &mut Vec<Effect>) {
        self.agent.clear_tools();
        self.agent.status = AgentStatus::Active;
        self.agent.permission_notified = false;
        effects.push(Effect::CancelTimer(TimerKind::Permission));
        effects.push(Effect::Emit(ActivityEvent::AgentToolsClear {
            agent_id: self.id(),
        }));
        effects.push(self.status_event());
    }

    fn start_new_turn(&mut self, effects: &mut Vec<Effect>) {
        debug!(agent_id = %self.id(), "new turn");
        effects.push(Effect::CancelTimer(TimerKind::Idle));
        self.clear_activity(effects);
        self.agent.turn_had_tools = false;
    }

    fn end_turn(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelTimer(TimerKind::Idle));
        effects.push(Effect::CancelTimer(TimerKind::Permission));
        if self.agent.has_tools() {
            // The writer never leaves a tool open across a turn boundary.
            debug!(agent_id = %self.id(), "clearing tools left open at turn end");
            self.agent.clear_tools();
            effects.push(Effect::Emit(ActivityEvent::AgentToolsClear {
                agent_id: self.id(),
            }));
        }
        self.agent.status = AgentStatus::Waiting;
        self.agent.permission_notified = false;
        self.agent.turn_had_tools = false;
        effects.push(self.status_event());
    }

    fn apply_progress(&mut self, progress: &ProgressRecord, effects: &mut Vec<Effect>) {
        let parent_id = progress.parent_tool_use_id.as_str();

        if progress.data.is_execution_step() {
            if self.agent.is_tool_active(parent_id) {
                effects.push(Effect::StartTimer(
                    TimerKind::Permission,
                    self.settings.permission_delay,
                ));
            }
            return;
        }

        if self.agent.tool_name(parent_id) != Some(DELEGATION_TOOL) {
            return;
        }

        match &progress.data.message {
            Some(NestedMessage::Assistant { message }) => {
                let mut has_non_exempt = false;
                for (tool_id, name, input) in message.tool_uses() {
                    let status = format_tool_status(name, input, &self.settings.limits);
                    self.agent
                        .open_subagent_tool(parent_id, tool_id, name, status.clone());
                    if !self.is_exempt(name) {
                        has_non_exempt = true;
                    }
                    effects.push(Effect::Emit(ActivityEvent::SubagentToolStart {
                        agent_id: self.id(),
                        parent_tool_id: parent_id.to_string(),
                        tool_id: tool_id.to_string(),
                        status,
                    }));
                }
                if has_non_exempt {
                    effects.push(Effect::StartTimer(
                        TimerKind::Permission,
                        self.settings.permission_delay,
                    ));
                }
            }
            Some(NestedMessage::User { message }) => {
                for tool_id in message.content.tool_results() {
                    self.agent.close_subagent_tool(parent_id, tool_id);
                    effects.push(Effect::EmitAfter(
                        self.settings.tool_done_delay,
                        ActivityEvent::SubagentToolDone {
                            agent_id: self.id(),
                            parent_tool_id: parent_id.to_string(),
                            tool_id: tool_id.to_string(),
                        },
                    ));
                }
                if !self
                    .agent
                    .stuck_subagent_parents(&self.settings.permission_exempt)
                    .is_empty()
                {
                    effects.push(Effect::StartTimer(
                        TimerKind::Permission,
                        self.settings.permission_delay,
                    ));
                }
            }
            Some(NestedMessage::Other) | None => {}
        }
    }

    fn check_permission(&mut self) -> Vec<Effect> {
        let exempt = &self.settings.permission_exempt;
        let top_level = self.agent.has_non_exempt_tool(exempt);
        let stuck_parents = self.agent.stuck_subagent_parents(exempt);

        if !top_level && stuck_parents.is_empty() {
            trace!(agent_id = %self.id(), "permission timer fired on stale state");
            return Vec::new();
        }

        debug!(agent_id = %self.id(), "permission pending");
        self.agent.permission_notified = true;
        self.agent.status = AgentStatus::PermissionPending;
        let mut effects = vec![Effect::Emit(ActivityEvent::AgentPermission {
            agent_id: self.id(),
        })];
        effects.extend(stuck_parents.into_iter().map(|parent_tool_id| {
            Effect::Emit(ActivityEvent::SubagentPermission {
                agent_id: self.id(),
                parent_tool_id,
            })
        }));
        effects
    }
}
