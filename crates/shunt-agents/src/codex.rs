//! Codex CLI client and its tagged-text transcript classifier.
//!
//! Codex writes its transcript to stderr as blocks introduced by one-word
//! marker lines (`user`, `thinking`, `exec`, an agent name, ...) plus a
//! metadata block fenced by `---` lines. Whatever the agent's own program
//! prints lands on the pty stdout and is passed through as `stdout` events.

use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use shunt_runtime::SpawnSpec;
use shunt_types::{AgentEvent, EventKind, ExecRequest, ProviderKind, RawLine, StreamSource};

use crate::{AgentClient, ClientContext, Classifier, PreparedRun};

const CONFIG_TEMPLATE: &str = "config.base.toml";

/// Marker lines that introduce the agent's conversational reply.
const AGENT_MARKERS: [&str; 2] = ["kori", "codex"];

pub struct CodexClient {
    binary: String,
    profile: String,
    ctx: ClientContext,
}

impl CodexClient {
    pub fn new(profile: String, ctx: ClientContext) -> Self {
        Self {
            binary: "codex".to_string(),
            profile,
            ctx,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Render `config.base.toml` into `{working_dir}/.codex/config.toml`,
    /// substituting `{root}`. A missing template is only worth a warning.
    fn materialize_config(&self, working_dir: &Path) -> anyhow::Result<()> {
        let Some(template_dir) = &self.ctx.template_dir else {
            return Ok(());
        };
        let template_path = template_dir.join(CONFIG_TEMPLATE);
        let template = match fs::read_to_string(&template_path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("codex config template not readable at {}: {err}", template_path.display());
                return Ok(());
            }
        };
        let rendered = template.replace("{root}", &self.ctx.storage_path.to_string_lossy());
        let codex_dir = working_dir.join(".codex");
        fs::create_dir_all(&codex_dir).context("create .codex dir")?;
        let config_path = codex_dir.join("config.toml");
        fs::write(&config_path, rendered).context("write codex config")?;
        info!("codex config written to {}", config_path.display());
        Ok(())
    }
}

impl AgentClient for CodexClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    fn prepare(&self, req: &ExecRequest) -> anyhow::Result<PreparedRun> {
        self.materialize_config(&req.working_dir)?;

        let mut args = vec!["exec".to_string()];
        if req.skip_repo_check {
            args.push("--skip-git-repo-check".to_string());
        }
        if req.allow_mutating_actions {
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        }
        if let Some(session_id) = &req.resume_session_id {
            args.push("resume".to_string());
            args.push(session_id.clone());
        }
        args.push(req.prompt.clone());

        let codex_home = self
            .ctx
            .storage_path
            .join("codex_homes")
            .join(&self.profile);
        fs::create_dir_all(&codex_home).context("create codex home")?;

        let mut spawn = SpawnSpec::new(self.binary.clone(), req.working_dir.clone());
        spawn.args = args;
        spawn.env.push(("TERM".to_string(), "dumb".to_string()));
        spawn.env.push((
            "CODEX_HOME".to_string(),
            codex_home.to_string_lossy().into_owned(),
        ));
        spawn.env.push((
            "AGENT_HOME_PATH".to_string(),
            self.ctx.agent_home.to_string_lossy().into_owned(),
        ));
        spawn.env.extend(self.ctx.env.iter().cloned());

        Ok(PreparedRun {
            spawn,
            preamble: Vec::new(),
            classifier: Box::new(TaggedTranscript::new()),
            // Codex mints its own session ids; ours comes back in the meta
            // block, never the other way around.
            session_id: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveTag {
    Stdout,
    User,
    Thinking,
    Exec,
    Agent,
    FileUpdate,
    TokensUsed,
    Meta,
}

/// State machine over the tagged-text transcript.
pub struct TaggedTranscript {
    active: Option<ActiveTag>,
    meta_done: bool,
    meta: Map<String, Value>,
    exec_done: Regex,
}

impl TaggedTranscript {
    pub fn new() -> Self {
        Self {
            active: None,
            meta_done: false,
            meta: Map::new(),
            exec_done: Regex::new(r"^(.*) succeeded in ([0-9.,]+ms)(:)?(\s)*$")
                .expect("static regex"),
        }
    }

    fn marker_for(trimmed: &str) -> Option<(ActiveTag, Option<&'static str>)> {
        match trimmed {
            "user" => Some((ActiveTag::User, Some("User"))),
            "thinking" => Some((ActiveTag::Thinking, Some("Thinking"))),
            "exec" => Some((ActiveTag::Exec, Some("Run"))),
            "file update:" => Some((ActiveTag::FileUpdate, Some("File Update"))),
            "tokens used" => Some((ActiveTag::TokensUsed, None)),
            other if AGENT_MARKERS.contains(&other) => Some((ActiveTag::Agent, Some("Agent"))),
            _ => None,
        }
    }

    fn is_meta_fence(trimmed: &str) -> bool {
        trimmed.len() >= 3 && trimmed.bytes().all(|b| b == b'-')
    }
}

impl Default for TaggedTranscript {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for TaggedTranscript {
    fn feed(&mut self, line: &RawLine) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let trimmed = line.text.trim();

        // Program output on the pty is passed through untouched, with one
        // title on the first transition into the stream.
        if line.source == StreamSource::Stdout {
            if self.active != Some(ActiveTag::Stdout) {
                self.active = Some(ActiveTag::Stdout);
                events.push(AgentEvent::new(EventKind::Title, "Stdout"));
            }
            events.push(AgentEvent::new(EventKind::Stdout, line.text.clone()));
            return events;
        }

        if let Some((tag, title)) = Self::marker_for(trimmed) {
            self.active = Some(tag);
            if let Some(title) = title {
                events.push(AgentEvent::new(EventKind::Title, title));
            }
            return events;
        }

        if !self.meta_done && Self::is_meta_fence(trimmed) {
            if self.active != Some(ActiveTag::Meta) {
                self.active = Some(ActiveTag::Meta);
            } else {
                // Closing fence: the whole map is emitted once, and metadata
                // parsing never re-enters.
                self.active = None;
                self.meta_done = true;
                events.push(AgentEvent::new(
                    EventKind::Meta,
                    Value::Object(self.meta.clone()).to_string(),
                ));
            }
            return events;
        }

        match self.active {
            Some(ActiveTag::Meta) => {
                if let Some(colon) = line.text.find(':') {
                    let key = line.text[..colon].trim().replace(' ', "_");
                    let value = line.text[colon + 1..].trim().to_string();
                    self.meta.insert(key, Value::String(value));
                }
            }
            Some(ActiveTag::Exec) => {
                if let Some(caps) = self.exec_done.captures(line.text.trim_end_matches('\n')) {
                    events.push(AgentEvent::new(
                        EventKind::Exec,
                        format!("{}\n", &caps[1]),
                    ));
                    events.push(AgentEvent::new(EventKind::ExecTime, caps[2].to_string()));
                } else {
                    events.push(AgentEvent::new(EventKind::ExecOutput, line.text.clone()));
                }
            }
            Some(ActiveTag::TokensUsed) => {
                events.push(AgentEvent::new(
                    EventKind::TokensUsed,
                    trimmed.replace(',', ""),
                ));
            }
            Some(ActiveTag::User) => {
                events.push(AgentEvent::new(EventKind::User, line.text.clone()));
            }
            Some(ActiveTag::Thinking) => {
                events.push(AgentEvent::new(EventKind::Thinking, line.text.clone()));
            }
            Some(ActiveTag::Agent) => {
                events.push(AgentEvent::new(EventKind::Agent, line.text.clone()));
            }
            Some(ActiveTag::FileUpdate) => {
                events.push(AgentEvent::new(EventKind::FileUpdate, line.text.clone()));
            }
            Some(ActiveTag::Stdout) | None => {}
        }
        events
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        vec![AgentEvent::new(EventKind::Done, "")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(lines: &[RawLine]) -> Vec<AgentEvent> {
        let mut parser = TaggedTranscript::new();
        let mut events = Vec::new();
        for line in lines {
            events.extend(parser.feed(line));
        }
        events.extend(parser.finish());
        events
    }

    fn ev(kind: EventKind, data: &str) -> AgentEvent {
        AgentEvent::new(kind, data)
    }

    #[test]
    fn classifies_user_meta_and_agent_sections() {
        let events = classify(&[
            RawLine::stderr("user\n"),
            RawLine::stderr("Hello\n"),
            RawLine::stderr("---\n"),
            RawLine::stderr("session_id: abc\n"),
            RawLine::stderr("model: x\n"),
            RawLine::stderr("---\n"),
            RawLine::stderr("kori\n"),
            RawLine::stderr("Hi there\n"),
        ]);

        assert_eq!(events[0], ev(EventKind::Title, "User"));
        assert_eq!(events[1], ev(EventKind::User, "Hello\n"));
        assert_eq!(events[2].kind, EventKind::Meta);
        let meta: Value = serde_json::from_str(&events[2].data).unwrap();
        assert_eq!(meta["session_id"], "abc");
        assert_eq!(meta["model"], "x");
        assert_eq!(events[3], ev(EventKind::Title, "Agent"));
        assert_eq!(events[4], ev(EventKind::Agent, "Hi there\n"));
        assert_eq!(events[5], ev(EventKind::Done, ""));
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn terminal_event_is_always_a_single_empty_done() {
        let events = classify(&[RawLine::stderr("garbage without marker\n")]);
        assert_eq!(events.last().unwrap(), &ev(EventKind::Done, ""));
        assert_eq!(
            events.iter().filter(|e| e.kind == EventKind::Done).count(),
            1
        );
    }

    #[test]
    fn meta_block_is_emitted_exactly_once_and_never_reenters() {
        let events = classify(&[
            RawLine::stderr("---\n"),
            RawLine::stderr("session_id: first\n"),
            RawLine::stderr("----\n"),
            RawLine::stderr("---\n"),
            RawLine::stderr("session_id: second\n"),
            RawLine::stderr("---\n"),
        ]);
        let metas: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Meta).collect();
        assert_eq!(metas.len(), 1);
        let meta: Value = serde_json::from_str(&metas[0].data).unwrap();
        assert_eq!(meta["session_id"], "first");
    }

    #[test]
    fn meta_keys_replace_spaces_with_underscores() {
        let events = classify(&[
            RawLine::stderr("---\n"),
            RawLine::stderr("tokens used: 42\n"),
            RawLine::stderr("---\n"),
        ]);
        let meta_event = events.iter().find(|e| e.kind == EventKind::Meta).unwrap();
        let meta: Value = serde_json::from_str(&meta_event.data).unwrap();
        assert_eq!(meta["tokens_used"], "42");
    }

    #[test]
    fn exec_completion_lines_split_into_exec_and_exec_time() {
        let events = classify(&[
            RawLine::stderr("exec\n"),
            RawLine::stderr("ls -la succeeded in 123ms\n"),
            RawLine::stderr("drwxr-xr-x .\n"),
        ]);
        assert_eq!(events[0], ev(EventKind::Title, "Run"));
        assert_eq!(events[1], ev(EventKind::Exec, "ls -la\n"));
        assert_eq!(events[2], ev(EventKind::ExecTime, "123ms"));
        assert_eq!(events[3], ev(EventKind::ExecOutput, "drwxr-xr-x .\n"));
    }

    #[test]
    fn stdout_stream_gets_one_title_then_passthrough() {
        let events = classify(&[
            RawLine::stdout("first\n"),
            RawLine::stdout("second\n"),
        ]);
        assert_eq!(events[0], ev(EventKind::Title, "Stdout"));
        assert_eq!(events[1], ev(EventKind::Stdout, "first\n"));
        assert_eq!(events[2], ev(EventKind::Stdout, "second\n"));
    }

    #[test]
    fn stdout_payload_concatenation_reconstructs_the_stream() {
        let input = ["alpha\n", "beta\n", "gamma\n"];
        let lines: Vec<RawLine> = input.iter().map(|l| RawLine::stdout(*l)).collect();
        let events = classify(&lines);
        let rebuilt: String = events
            .iter()
            .filter(|e| e.kind == EventKind::Stdout)
            .map(|e| e.data.as_str())
            .collect();
        assert_eq!(rebuilt, input.concat());
    }

    #[test]
    fn tokens_used_strips_thousands_separators() {
        let events = classify(&[
            RawLine::stderr("tokens used\n"),
            RawLine::stderr("12,345\n"),
        ]);
        assert_eq!(events[0], ev(EventKind::TokensUsed, "12345"));
    }

    #[test]
    fn codex_marker_also_introduces_agent_section() {
        let events = classify(&[
            RawLine::stderr("codex\n"),
            RawLine::stderr("reply\n"),
        ]);
        assert_eq!(events[0], ev(EventKind::Title, "Agent"));
        assert_eq!(events[1], ev(EventKind::Agent, "reply\n"));
    }

    #[test]
    fn prepare_builds_resume_argv_and_profile_home() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ClientContext {
            storage_path: dir.path().to_path_buf(),
            agent_home: dir.path().join("agent"),
            template_dir: None,
            env: vec![("API_TOKEN".to_string(), "secret".to_string())],
        };
        let client = CodexClient::new("work".to_string(), ctx);
        let req = shunt_types::ExecRequest::new("do it", dir.path())
            .with_resume("sess-9")
            .with_mutating_actions(true)
            .with_skip_repo_check(true);
        let prepared = client.prepare(&req).unwrap();

        assert_eq!(
            prepared.spawn.args,
            vec![
                "exec",
                "--skip-git-repo-check",
                "--dangerously-bypass-approvals-and-sandbox",
                "resume",
                "sess-9",
                "do it",
            ]
        );
        let home = prepared
            .spawn
            .env
            .iter()
            .find(|(k, _)| k == "CODEX_HOME")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(home.ends_with("codex_homes/work"));
        assert!(prepared
            .spawn
            .env
            .iter()
            .any(|(k, v)| k == "API_TOKEN" && v == "secret"));
        assert!(prepared.session_id.is_none());
    }

    #[test]
    fn materialize_config_renders_root_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("config.base.toml"), "path = \"{root}/bin\"\n").unwrap();

        let ctx = ClientContext {
            storage_path: dir.path().join("storage"),
            agent_home: dir.path().join("agent"),
            template_dir: Some(templates),
            env: Vec::new(),
        };
        let client = CodexClient::new("main".to_string(), ctx);
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        client.materialize_config(&work).unwrap();

        let rendered = fs::read_to_string(work.join(".codex/config.toml")).unwrap();
        assert!(rendered.contains("/storage/bin"));
        assert!(!rendered.contains("{root}"));
    }
}
