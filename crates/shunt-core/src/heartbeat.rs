//! Background heartbeat cycles.
//!
//! A cycle sends the fixed journal prompt through the orchestrator in a
//! fresh session, records the resulting session id, and stores both sides
//! in the heartbeat history tree. Cycles are fired by the activity
//! coordinator's idle trigger and by the one-shot startup timer.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shunt_types::ExecRequest;

use crate::activity::{ActivityCoordinator, IdleTrigger};
use crate::history::{HistoryStore, StoredMessage};
use crate::orchestrator::Orchestrator;

pub const HEARTBEAT_PROMPT: &str = "[HEARTBEAT] Work on the tasks in `JOURNAL.md`.";

pub struct HeartbeatRunner {
    orchestrator: Arc<Orchestrator>,
    history: HistoryStore,
    activity: Arc<ActivityCoordinator>,
    agent_home: PathBuf,
}

impl HeartbeatRunner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        history: HistoryStore,
        activity: Arc<ActivityCoordinator>,
        agent_home: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            history,
            activity,
            agent_home,
        })
    }

    /// Adapt this runner into the coordinator's idle trigger shape.
    pub fn as_trigger(self: &Arc<Self>) -> IdleTrigger {
        let runner = Arc::clone(self);
        Arc::new(move || {
            let runner = Arc::clone(&runner);
            Box::pin(async move { runner.run_cycle().await })
        })
    }

    /// One full cycle. Never propagates errors; the heartbeat flag is
    /// always released into its cooldown.
    pub async fn run_cycle(&self) {
        info!("starting heartbeat cycle");
        self.activity.start_heartbeat().await;
        if let Err(err) = self.run_cycle_inner().await {
            warn!("heartbeat cycle failed: {err:#}");
        }
        self.activity.end_heartbeat().await;
    }

    async fn run_cycle_inner(&self) -> anyhow::Result<()> {
        let started_at = Local::now();
        let req = ExecRequest::new(HEARTBEAT_PROMPT, self.agent_home.clone())
            .with_mutating_actions(true)
            .with_skip_repo_check(true);
        let cancel = CancellationToken::new();
        let outcome = self.orchestrator.execute(&req, &cancel, None).await?;

        let Some(session_id) = &outcome.session_id else {
            warn!("heartbeat cycle produced no session id, skipping history");
            return Ok(());
        };
        self.activity
            .set_heartbeat_session_id(session_id.clone())
            .await;

        self.history
            .save_message(session_id, &StoredMessage::user(HEARTBEAT_PROMPT, started_at))?;
        let content = if outcome.agent_content.is_empty() {
            "Complete".to_string()
        } else {
            outcome.agent_content.clone()
        };
        self.history.save_message(
            session_id,
            &StoredMessage::assistant(content, outcome.events.clone(), outcome.meta.clone()),
        )?;
        info!("heartbeat cycle stored under session {session_id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::tempdir;

    use shunt_agents::{
        AgentClient, Classifier, ClientContext, PreparedRun, ProviderRotation, QuotaSignature,
    };
    use shunt_runtime::SpawnSpec;
    use shunt_types::{AgentEvent, EventKind, ProviderKind, RawLine};

    use crate::notify::NullNotifier;

    struct EchoClassifier;

    impl Classifier for EchoClassifier {
        fn feed(&mut self, line: &RawLine) -> Vec<AgentEvent> {
            let text = line.text.trim_end();
            if text.is_empty() {
                return Vec::new();
            }
            if let Some(meta) = text.strip_prefix("META ") {
                return vec![AgentEvent::new(EventKind::Meta, meta)];
            }
            vec![AgentEvent::new(EventKind::Agent, format!("{text}\n"))]
        }

        fn finish(&mut self) -> Vec<AgentEvent> {
            vec![AgentEvent::new(EventKind::Done, "")]
        }
    }

    struct EchoClient;

    impl AgentClient for EchoClient {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Codex
        }

        fn prepare(&self, req: &ExecRequest) -> anyhow::Result<PreparedRun> {
            let mut spawn = SpawnSpec::new("/bin/sh", req.working_dir.clone());
            spawn.args = vec![
                "-c".to_string(),
                r#"echo 'META {"session_id":"hb-7"}'; echo 'journal updated'"#.to_string(),
            ];
            Ok(PreparedRun {
                spawn,
                preamble: Vec::new(),
                classifier: Box::new(EchoClassifier),
                session_id: None,
            })
        }
    }

    #[tokio::test]
    async fn cycle_records_session_and_history_and_starts_cooldown() {
        let dir = tempdir().unwrap();
        let rotation = std::sync::Arc::new(
            ProviderRotation::from_order("codex", QuotaSignature::defaults()).unwrap(),
        );
        let ctx = ClientContext {
            storage_path: dir.path().join("storage"),
            agent_home: dir.path().to_path_buf(),
            template_dir: None,
            env: Vec::new(),
        };
        let activity =
            ActivityCoordinator::new(Duration::from_secs(600), Duration::from_secs(600));
        let orchestrator = Arc::new(
            Orchestrator::new(
                rotation,
                ctx,
                HistoryStore::new(dir.path().join("history")),
                Arc::clone(&activity),
                Arc::new(NullNotifier),
            )
            .with_client_factory(|_, _| Box::new(EchoClient)),
        );
        let heartbeat_history = HistoryStore::new(dir.path().join("heartbeat"));
        let runner = HeartbeatRunner::new(
            orchestrator,
            heartbeat_history.clone(),
            Arc::clone(&activity),
            dir.path().to_path_buf(),
        );

        runner.run_cycle().await;

        let status = activity.status().await;
        assert_eq!(status.heartbeat_session_id.as_deref(), Some("hb-7"));
        // Cooldown running: the flag is still raised.
        assert!(status.heartbeat);

        let convo = heartbeat_history.load("hb-7").unwrap().unwrap();
        assert_eq!(convo.messages.len(), 2);
        assert_eq!(convo.messages[0].content, HEARTBEAT_PROMPT);
        assert_eq!(convo.messages[1].content, "journal updated\n");
    }
}
