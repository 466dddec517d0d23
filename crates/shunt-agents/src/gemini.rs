//! Gemini CLI client and its stream-json transcript classifier.
//!
//! Gemini is stateless across invocations, so the core mints the session id,
//! replays the session's `.jsonl` log through the child's stdin, and injects
//! a synthetic `init` line ahead of the stream so the minted id wins over
//! whatever the CLI reports.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shunt_runtime::SpawnSpec;
use shunt_types::{AgentEvent, EventKind, ExecRequest, ProviderKind, RawLine, StreamSource};

use crate::{AgentClient, ClientContext, Classifier, PreparedRun};

const SETTINGS_TEMPLATE: &str = "settings.base.json";

pub struct GeminiClient {
    binary: String,
    profile: String,
    ctx: ClientContext,
}

impl GeminiClient {
    pub fn new(profile: String, ctx: ClientContext) -> Self {
        Self {
            binary: "gemini".to_string(),
            profile,
            ctx,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn sessions_dir(&self) -> PathBuf {
        self.ctx.storage_path.join("gemini_sessions")
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.jsonl"))
    }

    /// Mint a new session id and touch its replay log.
    fn create_session(&self) -> anyhow::Result<String> {
        let session_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.sessions_dir()).context("create gemini sessions dir")?;
        File::create(self.session_path(&session_id)).context("create session log")?;
        info!("created gemini session {session_id}");
        Ok(session_id)
    }

    fn materialize_settings(&self, working_dir: &Path) -> anyhow::Result<()> {
        let Some(template_dir) = &self.ctx.template_dir else {
            return Ok(());
        };
        let template_path = template_dir.join(SETTINGS_TEMPLATE);
        let template = match fs::read_to_string(&template_path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    "gemini settings template not readable at {}: {err}",
                    template_path.display()
                );
                return Ok(());
            }
        };
        let rendered = template.replace("{root}", &self.ctx.storage_path.to_string_lossy());
        let gemini_dir = working_dir.join(".gemini");
        fs::create_dir_all(&gemini_dir).context("create .gemini dir")?;
        fs::write(gemini_dir.join("settings.json"), rendered).context("write gemini settings")?;
        Ok(())
    }
}

impl AgentClient for GeminiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn prepare(&self, req: &ExecRequest) -> anyhow::Result<PreparedRun> {
        self.materialize_settings(&req.working_dir)?;

        let session_id = match &req.resume_session_id {
            Some(id) => id.clone(),
            None => self.create_session()?,
        };
        let session_path = self.session_path(&session_id);

        append_log_line(
            &session_path,
            &json!({
                "type": "message",
                "role": "user",
                "content": req.prompt,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )?;
        let history = fs::read_to_string(&session_path).unwrap_or_default();

        let mut args = vec![
            "--prompt".to_string(),
            req.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if req.allow_mutating_actions {
            args.push("--yolo".to_string());
        }
        if let Some(model) = &req.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        let config_dir = self
            .ctx
            .storage_path
            .join("gemini_homes")
            .join(&self.profile);
        fs::create_dir_all(&config_dir).context("create gemini home")?;

        let mut spawn = SpawnSpec::new(self.binary.clone(), req.working_dir.clone());
        spawn.args = args;
        spawn.env.push(("TERM".to_string(), "dumb".to_string()));
        spawn.env.push((
            "GEMINI_CONFIG_DIR".to_string(),
            config_dir.to_string_lossy().into_owned(),
        ));
        spawn.env.push((
            "AGENT_HOME_PATH".to_string(),
            self.ctx.agent_home.to_string_lossy().into_owned(),
        ));
        spawn.env.extend(self.ctx.env.iter().cloned());
        spawn.stdin_payload = Some(history.into_bytes());

        let synthetic_init = json!({"type": "init", "session_id": session_id}).to_string() + "\n";

        Ok(PreparedRun {
            spawn,
            preamble: vec![RawLine::stdout(synthetic_init)],
            classifier: Box::new(StreamJsonTranscript::new(session_path)),
            session_id: Some(session_id),
        })
    }
}

fn append_log_line(path: &Path, event: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open session log {}", path.display()))?;
    writeln!(file, "{event}").context("append session log")?;
    Ok(())
}

/// Classifier for the `--output-format stream-json` transcript. Also owns
/// the side effect of persisting each parsed event to the session log, in
/// classification order, so the next invocation can replay it.
pub struct StreamJsonTranscript {
    session_log: PathBuf,
    meta: Map<String, Value>,
    meta_emitted: bool,
    /// The first `init` line is the synthetic one the core injected; it is
    /// authoritative for the session id and never logged.
    synthetic_pending: bool,
}

impl StreamJsonTranscript {
    pub fn new(session_log: PathBuf) -> Self {
        Self {
            session_log,
            meta: Map::new(),
            meta_emitted: false,
            synthetic_pending: true,
        }
    }

    fn classify_value(&mut self, event: &Value, events: &mut Vec<AgentEvent>) {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("unknown");
        match kind {
            "init" => {
                if !self.meta_emitted {
                    self.meta.insert(
                        "session_id".to_string(),
                        Value::String(str_field(event, "session_id")),
                    );
                    self.meta.insert(
                        "model".to_string(),
                        Value::String(str_field(event, "model")),
                    );
                    events.push(AgentEvent::new(
                        EventKind::Meta,
                        Value::Object(self.meta.clone()).to_string(),
                    ));
                    self.meta_emitted = true;
                } else {
                    // The CLI's own init may only refresh the model field.
                    let model = str_field(event, "model");
                    if !model.is_empty() {
                        self.meta.insert("model".to_string(), Value::String(model));
                    }
                }
            }
            "message" => {
                let role = event.get("role").and_then(Value::as_str).unwrap_or("");
                let content = str_field(event, "content");
                match role {
                    "user" => {
                        events.push(AgentEvent::new(EventKind::Title, "User"));
                        events.push(AgentEvent::new(EventKind::User, format!("{content}\n")));
                    }
                    "assistant" => {
                        let is_delta = event
                            .get("delta")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if is_delta {
                            // No title on deltas so incremental rendering
                            // can append in place.
                            events.push(AgentEvent::new(EventKind::Stdout, content));
                        } else {
                            events.push(AgentEvent::new(EventKind::Title, "Stdout"));
                            events
                                .push(AgentEvent::new(EventKind::Stdout, format!("{content}\n")));
                        }
                    }
                    _ => {}
                }
            }
            "tool_use" => {
                let tool_name = event
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let parameters = event.get("parameters").cloned().unwrap_or(json!({}));
                events.push(AgentEvent::new(EventKind::Title, "Run"));
                events.push(AgentEvent::new(
                    EventKind::Exec,
                    format!("{tool_name}: {parameters}\n"),
                ));
            }
            "tool_result" => {
                let status = event.get("status").and_then(Value::as_str).unwrap_or("");
                let output = str_field(event, "output");
                if status == "success" {
                    events.push(AgentEvent::new(EventKind::ExecOutput, format!("{output}\n")));
                } else {
                    events.push(AgentEvent::new(EventKind::ExecError, format!("{output}\n")));
                }
            }
            "error" => {
                let message = event
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| event.to_string());
                events.push(AgentEvent::new(EventKind::Error, format!("{message}\n")));
            }
            "result" => {
                // Only the token statistic surfaces; the raw status string
                // stays out of the user-visible stream.
                let total_tokens = event
                    .get("stats")
                    .and_then(|s| s.get("total_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                if total_tokens > 0 {
                    events.push(AgentEvent::new(
                        EventKind::TokensUsed,
                        total_tokens.to_string(),
                    ));
                }
            }
            _ => {
                events.push(AgentEvent::new(EventKind::Raw, format!("{event}\n")));
            }
        }
    }
}

impl Classifier for StreamJsonTranscript {
    fn feed(&mut self, line: &RawLine) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let trimmed = line.text.trim();
        if trimmed.is_empty() {
            return events;
        }
        if line.source == StreamSource::Stderr {
            events.push(AgentEvent::new(EventKind::Stderr, line.text.clone()));
            return events;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(event) => {
                let is_synthetic = self.synthetic_pending;
                self.synthetic_pending = false;
                if !is_synthetic {
                    if let Err(err) = append_log_line(&self.session_log, &event) {
                        debug!("session log append failed: {err}");
                    }
                }
                self.classify_value(&event, &mut events);
            }
            // Non-JSON stdout is a defensive fallback, passed through raw.
            Err(_) => events.push(AgentEvent::new(EventKind::Stdout, line.text.clone())),
        }
        events
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        vec![AgentEvent::new(EventKind::Done, "")]
    }
}

fn str_field(event: &Value, key: &str) -> String {
    event
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn transcript(dir: &Path) -> StreamJsonTranscript {
        StreamJsonTranscript::new(dir.join("session.jsonl"))
    }

    fn classify(parser: &mut StreamJsonTranscript, lines: &[RawLine]) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for line in lines {
            events.extend(parser.feed(line));
        }
        events
    }

    #[test]
    fn synthetic_init_is_authoritative_for_session_id() {
        let dir = tempdir().unwrap();
        let mut parser = transcript(dir.path());
        let events = classify(
            &mut parser,
            &[
                RawLine::stdout("{\"type\":\"init\",\"session_id\":\"ours\"}\n"),
                RawLine::stdout("{\"type\":\"init\",\"session_id\":\"theirs\",\"model\":\"g-2.5\"}\n"),
            ],
        );
        let metas: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Meta).collect();
        assert_eq!(metas.len(), 1);
        let meta: Value = serde_json::from_str(&metas[0].data).unwrap();
        assert_eq!(meta["session_id"], "ours");
        // The CLI init updated the retained model but emitted nothing.
        assert_eq!(parser.meta["model"], "g-2.5");
    }

    #[test]
    fn tool_result_error_maps_to_exec_error() {
        let dir = tempdir().unwrap();
        let mut parser = transcript(dir.path());
        let events = classify(
            &mut parser,
            &[RawLine::stdout(
                "{\"type\":\"tool_result\",\"status\":\"error\",\"output\":\"boom\"}\n",
            )],
        );
        assert_eq!(events, vec![AgentEvent::new(EventKind::ExecError, "boom\n")]);
    }

    #[test]
    fn assistant_delta_streams_without_title() {
        let dir = tempdir().unwrap();
        let mut parser = transcript(dir.path());
        let events = classify(
            &mut parser,
            &[
                RawLine::stdout(
                    "{\"type\":\"message\",\"role\":\"assistant\",\"content\":\"Hel\",\"delta\":true}\n",
                ),
                RawLine::stdout(
                    "{\"type\":\"message\",\"role\":\"assistant\",\"content\":\"Full\"}\n",
                ),
            ],
        );
        assert_eq!(events[0], AgentEvent::new(EventKind::Stdout, "Hel"));
        assert_eq!(events[1], AgentEvent::new(EventKind::Title, "Stdout"));
        assert_eq!(events[2], AgentEvent::new(EventKind::Stdout, "Full\n"));
    }

    #[test]
    fn result_event_surfaces_only_token_count() {
        let dir = tempdir().unwrap();
        let mut parser = transcript(dir.path());
        let events = classify(
            &mut parser,
            &[RawLine::stdout(
                "{\"type\":\"result\",\"status\":\"success\",\"stats\":{\"total_tokens\":987}}\n",
            )],
        );
        assert_eq!(events, vec![AgentEvent::new(EventKind::TokensUsed, "987")]);
    }

    #[test]
    fn stderr_and_non_json_stdout_pass_through() {
        let dir = tempdir().unwrap();
        let mut parser = transcript(dir.path());
        let events = classify(
            &mut parser,
            &[
                RawLine::stderr("warning: slow\n"),
                RawLine::stdout("plain text\n"),
            ],
        );
        assert_eq!(events[0], AgentEvent::new(EventKind::Stderr, "warning: slow\n"));
        assert_eq!(events[1], AgentEvent::new(EventKind::Stdout, "plain text\n"));
    }

    #[test]
    fn unknown_event_types_emit_raw() {
        let dir = tempdir().unwrap();
        let mut parser = transcript(dir.path());
        // First line is treated as the synthetic init slot, so prime it.
        parser.feed(&RawLine::stdout("{\"type\":\"init\",\"session_id\":\"s\"}\n"));
        let events = parser.feed(&RawLine::stdout("{\"type\":\"mystery\",\"x\":1}\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Raw);
        assert!(events[0].data.contains("mystery"));
    }

    #[test]
    fn parsed_events_are_persisted_in_order_except_the_synthetic_init() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("session.jsonl");
        let mut parser = StreamJsonTranscript::new(log.clone());
        classify(
            &mut parser,
            &[
                RawLine::stdout("{\"type\":\"init\",\"session_id\":\"ours\"}\n"),
                RawLine::stdout("{\"type\":\"message\",\"role\":\"assistant\",\"content\":\"a\"}\n"),
                RawLine::stdout("{\"type\":\"result\",\"status\":\"success\"}\n"),
            ],
        );
        let persisted = fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = persisted.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"role\":\"assistant\""));
        assert!(lines[1].contains("\"type\":\"result\""));
    }

    #[test]
    fn prepare_seeds_session_log_and_stdin_history() {
        let dir = tempdir().unwrap();
        let ctx = ClientContext {
            storage_path: dir.path().to_path_buf(),
            agent_home: dir.path().join("agent"),
            template_dir: None,
            env: Vec::new(),
        };
        let client = GeminiClient::new("main".to_string(), ctx);
        let req = shunt_types::ExecRequest::new("ask me", dir.path())
            .with_mutating_actions(true)
            .with_model("gemini-2.5-pro");
        let prepared = client.prepare(&req).unwrap();

        let session_id = prepared.session_id.clone().unwrap();
        assert_eq!(prepared.preamble.len(), 1);
        assert!(prepared.preamble[0].text.contains(&session_id));

        assert!(prepared.spawn.args.contains(&"--yolo".to_string()));
        assert!(prepared.spawn.args.contains(&"gemini-2.5-pro".to_string()));

        // The user message is already in the log and in the stdin payload.
        let history = String::from_utf8(prepared.spawn.stdin_payload.unwrap()).unwrap();
        assert!(history.contains("\"content\":\"ask me\""));
        let log = fs::read_to_string(
            dir.path()
                .join("gemini_sessions")
                .join(format!("{session_id}.jsonl")),
        )
        .unwrap();
        assert!(log.contains("\"role\":\"user\""));
    }

    #[test]
    fn prepare_resumes_an_existing_session_without_minting() {
        let dir = tempdir().unwrap();
        let ctx = ClientContext {
            storage_path: dir.path().to_path_buf(),
            agent_home: dir.path().join("agent"),
            template_dir: None,
            env: Vec::new(),
        };
        let client = GeminiClient::new("main".to_string(), ctx);
        let req = shunt_types::ExecRequest::new("again", dir.path()).with_resume("fixed-id");
        let prepared = client.prepare(&req).unwrap();
        assert_eq!(prepared.session_id.as_deref(), Some("fixed-id"));
        assert!(dir
            .path()
            .join("gemini_sessions")
            .join("fixed-id.jsonl")
            .exists());
    }
}
