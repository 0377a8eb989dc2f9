//! Shell-style glob matching for selecting repository files.
//!
//! Globs compile to anchored, case-insensitive regular expressions:
//!
//! - `*` matches any run of characters except `/`
//! - `**` matches across `/`; `**/` also matches zero directories
//! - `?` matches one character except `/`
//! - `[abc]`, `[a-z]`, `[!a-z]` / `[^a-z]` are character classes
//! - `\x` matches `x` literally
//!
//! A pattern without `/` is matched against the last path component, so
//! `config.json` selects `config.json` at any depth. Patterns containing `/`
//! are matched against the whole path.

use crate::error::{FetchError, Result};
use crate::model_library::types::RemoteFile;
use regex::{Regex, RegexBuilder};

/// Weight formats fetched by default.
const DEFAULT_WEIGHT_PATTERNS: &[&str] = &[
    "*.safetensors",
    "*.gguf",
    "*.bin",
    "*.npz",
    "*.zip",
    "*.mlmodelc/**",
];

/// Config and tokenizer files inference engines expect next to the weights.
const DEFAULT_AUXILIARY_PATTERNS: &[&str] = &[
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "generation_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
    "preprocessor_config.json",
    "chat_template.jinja",
    "model.safetensors.index.json",
];

/// Hidden files and editor/transfer leftovers.
const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[".*", "**/.*", "*.part", "*.tmp", "*~"];

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
    match_basename: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let source = translate(pattern);
        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| FetchError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            match_basename: !pattern.contains('/'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        let normalized = normalized.trim_start_matches("./");
        let candidate = if self.match_basename {
            normalized.rsplit('/').next().unwrap_or(normalized)
        } else {
            normalized
        };
        self.regex.is_match(candidate)
    }
}

/// One-shot match. Invalid patterns match nothing.
pub fn matches(pattern: &str, path: &str) -> bool {
    Glob::new(pattern).map(|g| g.is_match(path)).unwrap_or(false)
}

/// Translate a glob into an anchored regex source string.
fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("^(?:");

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                let start = i;
                while i + 1 < chars.len() && chars[i + 1] == '*' {
                    i += 1;
                }
                if i > start {
                    let at_component_start = start == 0 || chars[start - 1] == '/';
                    if at_component_start && chars.get(i + 1) == Some(&'/') {
                        out.push_str("(?:.*/)?");
                        i += 1;
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => match parse_class(&chars, i) {
                Some((class, end)) => {
                    out.push_str(&class);
                    i = end;
                }
                None => out.push_str(r"\["),
            },
            '\\' => {
                if let Some(&next) = chars.get(i + 1) {
                    out.push_str(&regex::escape(&next.to_string()));
                    i += 1;
                } else {
                    out.push_str(r"\\");
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    out.push_str(")$");
    out
}

/// Parse a bracket class starting at `chars[open]`.
///
/// Returns the regex class and the index of the closing `]`, or `None` when
/// the bracket is never closed (the `[` is then literal).
fn parse_class(chars: &[char], open: usize) -> Option<(String, usize)> {
    let mut i = open + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let body_start = i;
    // A `]` directly after the opening (or negation) is a literal member.
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    while i < chars.len() && chars[i] != ']' {
        if chars[i] == '\\' {
            i += 1;
        }
        i += 1;
    }
    if i >= chars.len() {
        return None;
    }
    let body = &chars[body_start..i];

    let mut class = String::from(if negated { "[^/" } else { "[" });
    let mut j = 0;
    while j < body.len() {
        let c = body[j];
        if c == '\\' && j + 1 < body.len() {
            class.push_str(&regex::escape(&body[j + 1].to_string()));
            j += 2;
            continue;
        }
        if c == '-' && j > 0 && j + 1 < body.len() {
            class.push('-');
        } else {
            class.push_str(&regex::escape(&c.to_string()));
        }
        j += 1;
    }
    class.push(']');

    Some((class, i))
}

/// Allow/exclude pattern lists deciding which remote files are fetched.
///
/// A file is selected iff it matches at least one allow pattern and no exclude
/// pattern. An empty allow list allows every file.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    allow: Vec<Glob>,
    exclude: Vec<Glob>,
}

impl FileFilter {
    pub fn new<A, E>(allow: A, exclude: E) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            allow: compile_all(allow)?,
            exclude: compile_all(exclude)?,
        })
    }

    /// Build from comma-separated pattern lists, e.g. `"*.safetensors,*.json"`.
    pub fn parse(allow: &str, exclude: &str) -> Result<Self> {
        Self::new(split_patterns(allow), split_patterns(exclude))
    }

    /// Select everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Weights plus the config/tokenizer files needed to run them, skipping
    /// hidden and temporary files.
    pub fn model_defaults() -> Self {
        let allow = DEFAULT_WEIGHT_PATTERNS
            .iter()
            .chain(DEFAULT_AUXILIARY_PATTERNS.iter());
        Self::new(allow, DEFAULT_EXCLUDE_PATTERNS).expect("default patterns are valid")
    }

    pub fn is_selected(&self, path: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|g| g.is_match(path));
        allowed && !self.exclude.iter().any(|g| g.is_match(path))
    }

    /// Filter a repository listing, preserving its order.
    pub fn select(&self, files: &[RemoteFile]) -> Vec<RemoteFile> {
        files
            .iter()
            .filter(|f| self.is_selected(&f.path))
            .cloned()
            .collect()
    }

    pub fn allow_patterns(&self) -> impl Iterator<Item = &str> {
        self.allow.iter().map(Glob::as_str)
    }

    pub fn exclude_patterns(&self) -> impl Iterator<Item = &str> {
        self.exclude.iter().map(Glob::as_str)
    }
}

fn compile_all<I>(patterns: I) -> Result<Vec<Glob>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns.into_iter().map(|p| Glob::new(p.as_ref())).collect()
}

fn split_patterns(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}
