//! Deterministic classification of proposed commands.
//!
//! Commands are split into shell segments (`&&`, `||`, `;`, `|`) and each
//! segment is matched against data-driven pattern lists. The strictest segment
//! wins. Commands run on a segment's behalf (`find -exec`, `xargs`, `sh -c`)
//! are classified too. Anything the lists do not recognise falls back to
//! `rules.unknown`, which must not be `local-read`.

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::core::types::Classification;

/// Pattern lists driving the classifier (stored in `config.toml`).
///
/// Patterns are case-insensitive regexes matched against a segment's words
/// joined by single spaces, after leading `sudo`/`env`/`VAR=value` prefixes
/// have been removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierRules {
    /// Denylist of remote-mutating commands.
    pub remote_write: Vec<String>,
    /// Remote queries that never mutate remote state.
    pub read_only_remote: Vec<String>,
    pub local_write: Vec<String>,
    pub local_read: Vec<String>,
    /// Category for commands matching none of the lists.
    pub unknown: Classification,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            remote_write: to_strings(DEFAULT_REMOTE_WRITE),
            read_only_remote: to_strings(DEFAULT_READ_ONLY_REMOTE),
            local_write: to_strings(DEFAULT_LOCAL_WRITE),
            local_read: to_strings(DEFAULT_LOCAL_READ),
            unknown: Classification::RemoteWrite,
        }
    }
}

const DEFAULT_REMOTE_WRITE: &[&str] = &[
    r"^git(\s+-C\s+\S+)?\s+push\b",
    r"^git\s+(send-email|svn\s+dcommit)\b",
    r"^gh\s+pr\s+(create|merge|close|reopen|edit|comment|review|ready)\b",
    r"^gh\s+issue\s+(create|close|reopen|edit|comment|delete|transfer)\b",
    r"^gh\s+release\s+(create|delete|edit|upload)\b",
    r"^gh\s+repo\s+(create|delete|edit|fork|rename|archive)\b",
    r"^gh\s+workflow\s+(run|enable|disable)\b",
    r"^gh\s+(secret|variable)\s+(set|delete)\b",
    r"^terraform(\s+-chdir=\S+)?\s+(apply|destroy|import|state\s+(rm|mv|push))\b",
    r"^kubectl\s+(apply|create|delete|patch|replace|scale|edit|label|annotate|set|rollout\s+(restart|undo))\b",
    r"^helm\s+(install|upgrade|uninstall|rollback|delete)\b",
    r"^(cargo|npm|yarn|pnpm)\s+publish\b",
    r"^docker\s+push\b",
    r"^(alembic\s+(upgrade|downgrade)|flyway\s+migrate|liquibase\s+update|prisma\s+migrate\s+deploy|goose\s+(up|down))\b",
    r"^(sqlx|diesel)\s+migrat\w*\s+(run|revert)\b",
    r"^(rails|rake|bin/rails)\s+db:(migrate|rollback)\b",
    r"^python3?\s+manage\.py\s+migrate\b",
];

const DEFAULT_READ_ONLY_REMOTE: &[&str] = &[
    r"^gh\s+(pr|issue|release|run|repo|workflow)\s+(view|list|status|diff|checks|watch)\b",
    r"^gh\s+(search|browse)\b",
    r"^gh\s+auth\s+status\b",
    r"^git\s+ls-remote\b",
    r"^kubectl\s+(get|describe|logs|top|explain|diff)\b",
    r"^helm\s+(list|status|get|history|template|diff)\b",
    r"^terraform(\s+-chdir=\S+)?\s+(plan|show|output|validate)\b",
];

const DEFAULT_LOCAL_WRITE: &[&str] = &[
    r"^git\s+(add|commit|checkout|switch|merge|rebase|reset|stash|tag|cherry-pick|revert|restore|rm|mv|init|clone|fetch|pull|am|apply|clean|worktree|config|notes|gc)\b",
    r"^git\s+branch\s+([^-\s]|(\S+\s+)*(-[a-z]*[dmcfu][a-z]*|--(delete|move|copy|force|set-upstream-to|unset-upstream|edit-description|track|no-track))\b)",
    r"^git\s+remote\s+(add|remove|rm|rename|set-url)\b",
    r"^(rm|mv|cp|mkdir|rmdir|touch|chmod|chown|ln|tee|truncate|patch|install|unzip|tar)\b",
    r"^sed\s+(-\w*i|--in-place)",
    r"^find\b.*\s-(delete|exec|execdir|ok|okdir)\b",
    r"^cargo\s+(fmt|fix|add|remove|update|build|install|new|init|clean)\b",
    r"^(npm|pnpm)\s+(install|ci|update|uninstall|add|remove|i)\b",
    r"^yarn(\s+(add|install|remove|upgrade))?$",
    r"^(pip3?|uv\s+pip)\s+(install|uninstall)\b",
    r"^poetry\s+(add|remove|install|update|lock)\b",
    r"^go\s+(mod|get|fmt|generate|build|install)\b",
    r"^(gofmt\s+-w|black|isort|prettier\s+--write|ruff\s+format)\b",
    r"^ruff\s+check\b.*--fix\b",
    r"^terraform(\s+-chdir=\S+)?\s+(init|fmt)\b",
    r"^(write|edit|create|delete|rename|modify|update)\s+(the\s+)?(file|files|directory|changes?)\b",
];

const DEFAULT_LOCAL_READ: &[&str] = &[
    r"^git\s+(status|log|diff|show|blame|branch|rev-parse|ls-files|describe|shortlog|reflog|grep|remote)\b",
    r"^(ls|cat|head|tail|less|more|grep|rg|find|fd|wc|pwd|echo|printf|which|whoami|tree|stat|file|du|df|env|printenv|diff|sort|uniq|jq|date|true|xargs)\b",
    r"^cargo\s+(test|check|clippy|doc|tree|metadata|nextest)\b",
    r"^go\s+(test|vet|list)\b",
    r"^(pytest|mypy|tflint|shellcheck|hadolint)\b",
    r"^python3?\s+-m\s+(pytest|unittest|mypy)\b",
    r"^(npm|yarn|pnpm)\s+(test|run\s+(test|lint|typecheck))\b",
    r"^ruff\s+check\b",
    r"^golangci-lint\s+run\b",
    r"^terraform(\s+-chdir=\S+)?\s+fmt\s+-check\b",
    r"^(run\s+)?((unit|integration|e2e|all)\s+)?tests?\b",
    r"^(read|view|inspect|search|list)\s",
];

fn to_strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

/// Compiled classifier.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    remote_write: RegexSet,
    read_only_remote: RegexSet,
    local_write: RegexSet,
    local_read: RegexSet,
    unknown: Classification,
}

impl CommandClassifier {
    /// Compile `rules`. Fails on an invalid regex or a fail-open fallback.
    pub fn new(rules: &ClassifierRules) -> Result<Self, String> {
        if rules.unknown == Classification::LocalRead {
            return Err("classifier.unknown must not be local-read".to_string());
        }
        Ok(Self {
            remote_write: compile(&rules.remote_write, "remote_write")?,
            read_only_remote: compile(&rules.read_only_remote, "read_only_remote")?,
            local_write: compile(&rules.local_write, "local_write")?,
            local_read: compile(&rules.local_read, "local_read")?,
            unknown: rules.unknown,
        })
    }

    /// Classify a command string. Pure and deterministic.
    pub fn classify(&self, command: &str) -> Classification {
        let segments = split_segments(command);
        segments
            .iter()
            .map(|segment| self.classify_segment(segment))
            .max()
            .unwrap_or(self.unknown)
    }

    fn classify_segment(&self, segment: &Segment) -> Classification {
        if segment.ambiguous {
            return self.unknown;
        }
        if segment.writes_file && strip_prefixes(&segment.words).is_empty() {
            return Classification::LocalWrite;
        }
        self.classify_words(&segment.words).max(file_floor(segment))
    }

    fn classify_words(&self, words: &[String]) -> Classification {
        let words = strip_prefixes(words);
        if words.is_empty() {
            return self.unknown;
        }
        if let Some(inner) = shell_inline_script(words) {
            return self.classify(inner);
        }

        let text = words.join(" ");
        let base = if let Some(class) = classify_gh_api(words) {
            class
        } else if self.remote_write.is_match(&text) {
            Classification::RemoteWrite
        } else if self.read_only_remote.is_match(&text) {
            Classification::LocalRead
        } else if self.local_write.is_match(&text) {
            Classification::LocalWrite
        } else if self.local_read.is_match(&text) {
            Classification::LocalRead
        } else {
            self.unknown
        };
        nested_commands(words)
            .into_iter()
            .map(|nested| self.classify_words(nested))
            .fold(base, |strictest, class| strictest.max(class))
    }
}

/// True when `command` is one plain command: no separators or pipes, no
/// substitutions, and nothing it runs on its behalf.
pub fn is_single_command(command: &str) -> bool {
    match split_segments(command).as_slice() {
        [segment] => {
            let words = strip_prefixes(&segment.words);
            !segment.ambiguous
                && shell_inline_script(words).is_none()
                && nested_commands(words).is_empty()
        }
        _ => false,
    }
}

impl Default for CommandClassifier {
    fn default() -> Self {
        Self::new(&ClassifierRules::default()).expect("default classifier rules should compile")
    }
}

fn compile(patterns: &[String], list: &str) -> Result<RegexSet, String> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|err| format!("classifier.{list}: {err}"))
}

fn file_floor(segment: &Segment) -> Classification {
    if segment.writes_file {
        Classification::LocalWrite
    } else {
        Classification::LocalRead
    }
}

/// `gh api` defaults to GET, but switches to POST once a body field is given.
fn classify_gh_api(words: &[String]) -> Option<Classification> {
    if words.len() < 2 || words[0] != "gh" || words[1] != "api" {
        return None;
    }
    let mut method: Option<String> = None;
    let mut has_body = false;
    let mut iter = words[2..].iter();
    while let Some(word) = iter.next() {
        match word.as_str() {
            "-X" | "--method" => method = iter.next().cloned(),
            "-f" | "-F" | "--field" | "--raw-field" | "--input" => has_body = true,
            other => {
                if let Some(m) = other.strip_prefix("--method=") {
                    method = Some(m.to_string());
                } else if let Some(m) = other.strip_prefix("-X").filter(|m| !m.is_empty()) {
                    method = Some(m.to_string());
                } else if other.starts_with("--field=")
                    || other.starts_with("--raw-field=")
                    || other.starts_with("--input=")
                {
                    has_body = true;
                }
            }
        }
    }
    let method = method.map(|m| m.to_ascii_uppercase());
    let mutating = match method.as_deref() {
        Some("GET") | Some("HEAD") => false,
        Some(_) => true,
        None => has_body,
    };
    Some(if mutating {
        Classification::RemoteWrite
    } else {
        Classification::LocalRead
    })
}

/// `sh -c "<script>"` style wrappers: classify the script instead.
fn shell_inline_script(words: &[String]) -> Option<&str> {
    let shell = words.first()?.rsplit('/').next()?;
    if !matches!(shell, "sh" | "bash" | "zsh" | "dash") {
        return None;
    }
    if words.get(1).map(String::as_str) != Some("-c") {
        return None;
    }
    words.get(2).map(String::as_str)
}

/// Commands a segment runs on its behalf: each `find -exec ... ;` body and
/// the command handed to `xargs`.
fn nested_commands(words: &[String]) -> Vec<&[String]> {
    let Some(program) = words.first().and_then(|word| word.rsplit('/').next()) else {
        return Vec::new();
    };
    match program {
        "find" => {
            let mut nested = Vec::new();
            let mut rest = &words[1..];
            while let Some(start) = rest
                .iter()
                .position(|word| matches!(word.as_str(), "-exec" | "-execdir" | "-ok" | "-okdir"))
            {
                let body = &rest[start + 1..];
                let end = body
                    .iter()
                    .position(|word| word == ";" || word == "+")
                    .unwrap_or(body.len());
                nested.push(&body[..end]);
                rest = &body[end..];
            }
            nested
        }
        "xargs" => xargs_command(&words[1..]).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// `xargs` without a command runs `echo`.
fn xargs_command(args: &[String]) -> Option<&[String]> {
    let mut index = 0;
    while let Some(arg) = args.get(index) {
        if !arg.starts_with('-') {
            break;
        }
        let takes_value = matches!(
            arg.as_str(),
            "-I" | "-L" | "-n" | "-P" | "-s" | "-d" | "-E" | "-a"
        );
        index += if takes_value { 2 } else { 1 };
    }
    args.get(index..).filter(|command| !command.is_empty())
}

fn strip_prefixes(words: &[String]) -> &[String] {
    let mut start = 0;
    while let Some(word) = words.get(start) {
        let is_assignment = word
            .split_once('=')
            .is_some_and(|(name, _)| !name.is_empty() && name.chars().all(is_env_char));
        if is_assignment || matches!(word.as_str(), "sudo" | "env" | "command" | "time" | "nohup")
        {
            start += 1;
        } else {
            break;
        }
    }
    &words[start..]
}

fn is_env_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// One shell segment of a compound command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Segment {
    words: Vec<String>,
    /// Output is redirected into a file.
    writes_file: bool,
    /// Unterminated quote, command or process substitution.
    ambiguous: bool,
}

#[derive(Default)]
struct Splitter {
    segments: Vec<Segment>,
    current: Segment,
    word: String,
    has_word: bool,
    redirect_pending: bool,
}

impl Splitter {
    fn push_char(&mut self, c: char) {
        self.word.push(c);
        self.has_word = true;
    }

    fn finish_word(&mut self) {
        if !self.has_word {
            return;
        }
        let word = std::mem::take(&mut self.word);
        self.has_word = false;
        if self.redirect_pending {
            self.redirect_pending = false;
            if word != "/dev/null" {
                self.current.writes_file = true;
            }
        } else {
            self.current.words.push(word);
        }
    }

    fn finish_segment(&mut self) {
        self.finish_word();
        if self.redirect_pending {
            self.redirect_pending = false;
            self.current.writes_file = true;
        }
        let segment = std::mem::take(&mut self.current);
        if !segment.words.is_empty() || segment.writes_file || segment.ambiguous {
            self.segments.push(segment);
        }
    }
}

fn split_segments(input: &str) -> Vec<Segment> {
    let mut s = Splitter::default();
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            } else if q == '"' && c == '\\' {
                if let Some(next) = chars.next() {
                    s.push_char(next);
                }
            } else {
                if q == '"' && (c == '`' || (c == '$' && chars.peek() == Some(&'('))) {
                    s.current.ambiguous = true;
                }
                s.push_char(c);
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                s.has_word = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    s.push_char(next);
                }
            }
            ';' | '\n' => s.finish_segment(),
            // process substitution runs a command we cannot see here
            '<' | '>' if chars.peek() == Some(&'(') => {
                s.current.ambiguous = true;
                s.push_char(c);
            }
            '&' => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                s.finish_segment();
            }
            '|' => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                s.finish_segment();
            }
            '>' => {
                if s.has_word && s.word.chars().all(|d| d.is_ascii_digit()) {
                    s.word.clear();
                    s.has_word = false;
                } else {
                    s.finish_word();
                }
                if chars.peek() == Some(&'>') {
                    chars.next();
                }
                if chars.peek() == Some(&'&') {
                    // fd duplication (`2>&1`), not a file
                    chars.next();
                    while chars.peek().is_some_and(|d| d.is_ascii_digit() || *d == '-') {
                        chars.next();
                    }
                    continue;
                }
                s.redirect_pending = true;
            }
            '<' => s.finish_word(),
            '`' => {
                s.current.ambiguous = true;
                s.push_char(c);
            }
            '$' if chars.peek() == Some(&'(') => {
                s.current.ambiguous = true;
                s.push_char(c);
            }
            c if c.is_whitespace() => s.finish_word(),
            c => s.push_char(c),
        }
    }
    if quote.is_some() {
        s.current.ambiguous = true;
    }
    s.finish_segment();
    s.segments
}
