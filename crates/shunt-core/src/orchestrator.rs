//! Execution orchestrator.
//!
//! Drives one logical request end to end: pick the current provider, spawn
//! its CLI under the supervisor, classify the stream, watch every event for
//! the provider's quota signature, and retry against the next provider when
//! one is drained. A request is attempted at most once per configured
//! provider; when the whole rotation is exhausted the notifier is told and
//! the error surfaces to the caller.

use std::sync::Arc;

use anyhow::bail;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shunt_agents::{client_for, AgentClient, ClientContext, PreparedRun, ProviderRotation};
use shunt_runtime::spawn_supervised;
use shunt_types::{AgentEvent, EventKind, ExecRequest, ProviderSelection, RunOutcome};

use crate::activity::ActivityCoordinator;
use crate::history::{HistoryStore, StoredMessage};
use crate::notify::Notifier;

/// Prefixed onto the first prompt of a new chat session.
pub const NEW_SESSION_PREAMBLE: &str =
    "(Read CORE.md file first unless this request is simple and requires no context at all ->) ";

type ClientFactory = dyn Fn(&ProviderSelection, ClientContext) -> Box<dyn AgentClient> + Send + Sync;

enum Attempt {
    Completed(RunOutcome),
    Cancelled(RunOutcome),
    QuotaExhausted,
}

pub struct Orchestrator {
    rotation: Arc<ProviderRotation>,
    ctx: ClientContext,
    history: HistoryStore,
    activity: Arc<ActivityCoordinator>,
    notifier: Arc<dyn Notifier>,
    clients: Box<ClientFactory>,
}

impl Orchestrator {
    pub fn new(
        rotation: Arc<ProviderRotation>,
        ctx: ClientContext,
        history: HistoryStore,
        activity: Arc<ActivityCoordinator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            rotation,
            ctx,
            history,
            activity,
            notifier,
            clients: Box::new(|selection, ctx| client_for(selection, ctx)),
        }
    }

    /// Replace how provider clients are built. Used by tests to substitute
    /// scripted CLIs for the real binaries.
    pub fn with_client_factory(
        mut self,
        factory: impl Fn(&ProviderSelection, ClientContext) -> Box<dyn AgentClient>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.clients = Box::new(factory);
        self
    }

    /// A user-facing turn: flags on-demand activity, prefixes the first
    /// prompt of a new session, and persists both sides to chat history.
    pub async fn run_chat(
        &self,
        message: &str,
        resume_session_id: Option<String>,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<AgentEvent>>,
    ) -> anyhow::Result<RunOutcome> {
        self.activity.start_on_demand().await;
        let result = self
            .run_chat_inner(message, resume_session_id, cancel, sink)
            .await;
        // Cooldown bookkeeping runs no matter how the turn ended.
        self.activity.end_on_demand().await;
        result
    }

    async fn run_chat_inner(
        &self,
        message: &str,
        resume_session_id: Option<String>,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<AgentEvent>>,
    ) -> anyhow::Result<RunOutcome> {
        let prompt = match &resume_session_id {
            Some(_) => message.to_string(),
            None => format!("{NEW_SESSION_PREAMBLE}{message}"),
        };
        let mut req = ExecRequest::new(prompt, self.ctx.agent_home.clone())
            .with_mutating_actions(true)
            .with_skip_repo_check(true);
        if let Some(session_id) = resume_session_id {
            req = req.with_resume(session_id);
        }

        let outcome = self.execute(&req, cancel, sink).await?;
        if let Some(session_id) = &outcome.session_id {
            self.persist_turn(session_id, message, &outcome);
        }
        Ok(outcome)
    }

    /// A detached run for scheduled jobs: no activity flags, no history,
    /// just the retry loop and the JSON-able outcome.
    pub async fn run_detached(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let req = ExecRequest::new(
            format!("[CRONJOB] {prompt}"),
            self.ctx.agent_home.clone(),
        )
        .with_mutating_actions(true)
        .with_skip_repo_check(true);
        self.execute(&req, cancel, None).await
    }

    /// Run `req` against the rotation, retrying past drained providers.
    pub async fn execute(
        &self,
        req: &ExecRequest,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<AgentEvent>>,
    ) -> anyhow::Result<RunOutcome> {
        let max_attempts = self.rotation.len();
        for attempt in 1..=max_attempts {
            let selection = self.rotation.current();
            info!("executing with {selection} (attempt {attempt}/{max_attempts})");
            let client = (self.clients)(&selection, self.ctx.clone());
            let mut prepared = client.prepare(req)?;
            // A resumed conversation keeps its id even when the transcript
            // never repeats it.
            if prepared.session_id.is_none() {
                prepared.session_id = req.resume_session_id.clone();
            }
            match self.run_once(prepared, cancel, sink).await? {
                Attempt::Completed(outcome) | Attempt::Cancelled(outcome) => return Ok(outcome),
                Attempt::QuotaExhausted => {
                    if attempt < max_attempts {
                        warn!("{selection} quota exhausted, retrying with next provider");
                    }
                }
            }
        }
        self.notifier.run_failed(&req.prompt).await;
        bail!("all {max_attempts} providers exhausted");
    }

    async fn run_once(
        &self,
        prepared: PreparedRun,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<AgentEvent>>,
    ) -> anyhow::Result<Attempt> {
        let PreparedRun {
            spawn,
            preamble,
            mut classifier,
            session_id,
        } = prepared;

        let mut run = RunState {
            outcome: RunOutcome {
                session_id,
                ..RunOutcome::default()
            },
            sink,
        };

        let mut exhausted = false;
        for line in &preamble {
            for event in classifier.feed(line) {
                exhausted |= self.rotation.inspect(&event);
                run.deliver(event).await;
            }
        }
        if exhausted {
            return Ok(Attempt::QuotaExhausted);
        }

        let child_cancel = cancel.child_token();
        let mut rx = spawn_supervised(spawn, child_cancel.clone())?;

        let mut cancelled = false;
        'stream: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    child_cancel.cancel();
                    cancelled = true;
                    break 'stream;
                }
                line = rx.recv() => {
                    let Some(line) = line else { break 'stream };
                    for event in classifier.feed(&line) {
                        if self.rotation.inspect(&event) {
                            exhausted = true;
                        }
                        run.deliver(event).await;
                        if exhausted {
                            child_cancel.cancel();
                            break 'stream;
                        }
                    }
                }
            }
        }

        if exhausted {
            return Ok(Attempt::QuotaExhausted);
        }

        if cancelled {
            run.deliver(AgentEvent::new(EventKind::Error, "stopped by user\n"))
                .await;
        }
        for event in classifier.finish() {
            run.deliver(event).await;
        }

        let mut outcome = run.outcome;
        outcome.success = !cancelled;
        Ok(if cancelled {
            Attempt::Cancelled(outcome)
        } else {
            Attempt::Completed(outcome)
        })
    }

    /// History writes are best-effort; a failed write never fails the turn.
    fn persist_turn(&self, session_id: &str, user_message: &str, outcome: &RunOutcome) {
        let user = StoredMessage::user(user_message, chrono::Local::now());
        if let Err(err) = self.history.save_message(session_id, &user) {
            warn!("failed to persist user message for {session_id}: {err}");
        }
        let content = if outcome.agent_content.is_empty() {
            "Complete".to_string()
        } else {
            outcome.agent_content.clone()
        };
        let assistant =
            StoredMessage::assistant(content, outcome.events.clone(), outcome.meta.clone());
        if let Err(err) = self.history.save_message(session_id, &assistant) {
            warn!("failed to persist assistant message for {session_id}: {err}");
        }
    }
}

/// Accumulates one attempt's outcome while forwarding events to the sink.
struct RunState<'a> {
    outcome: RunOutcome,
    sink: Option<&'a mpsc::Sender<AgentEvent>>,
}

impl RunState<'_> {
    async fn deliver(&mut self, event: AgentEvent) {
        match event.kind {
            EventKind::Meta => {
                if let Ok(meta) = serde_json::from_str::<Value>(&event.data) {
                    if let Some(session_id) = meta.get("session_id").and_then(Value::as_str) {
                        self.outcome.session_id = Some(session_id.to_string());
                    }
                    self.outcome.meta = Some(meta);
                }
            }
            EventKind::Agent => self.outcome.agent_content.push_str(&event.data),
            _ => {}
        }
        if let Some(sink) = self.sink {
            // A gone consumer must not stop the run; history still wants
            // the full event list.
            let _ = sink.send(event.clone()).await;
        }
        self.outcome.events.push(event);
    }
}
