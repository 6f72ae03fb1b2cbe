//! Compiled user input (spec §3 `Command`, §4.1 "Compilation").

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lexer::lex;
use crate::pattern::{Pattern, PatternItem};
use crate::registry::Registry;

/// Rewrites a `StringArg`/`ListArg` value that looks like a URL-like form
/// into a concrete local path (spec §4.1: `file:` local fetch, `http(s)://`
/// cached download, `tar:` one-time extraction). The file distribution
/// layer supplies the real implementation (`crate::preprocess`); tests and
/// call sites that don't need it can use [`NoopPreprocessor`]. Async since
/// a real rewrite means a mesh fetch or an HTTP download.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    async fn preprocess(&self, value: &str) -> Result<String>;
}

pub struct NoopPreprocessor;

#[async_trait]
impl Preprocessor for NoopPreprocessor {
    async fn preprocess(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

fn is_url_like(value: &str) -> bool {
    value.starts_with("file:") || value.starts_with("http://") || value.starts_with("https://") || value.starts_with("tar:")
}

/// Compiled user input (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub original: String,
    pub string_args: HashMap<String, String>,
    pub bool_args: HashMap<String, bool>,
    pub list_args: HashMap<String, Vec<String>>,
    pub subcommand: Option<Box<Command>>,
    pub record: bool,
    pub preprocess: bool,
    /// Which peer issued this command; empty means local (spec §3 invariant:
    /// a command with a non-empty `source` must not fan out again).
    pub source: String,
    pub nop: bool,
}

impl Command {
    pub fn is_broadcastable(&self) -> bool {
        self.source.is_empty()
    }
}

/// Compile one line of user input against `registry`. `preprocess` controls
/// whether `StringArg`/`ListArg` values are run through `preprocessor`
/// (spec §4.1: "compilation is optionally preceded by preprocessing").
pub async fn compile(registry: &Registry, input: &str, preprocess: bool, preprocessor: &dyn Preprocessor) -> Result<Command> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Ok(Command { original: input.to_string(), nop: true, record: true, preprocess, ..Default::default() });
    }

    let matched = registry.resolve(&tokens)?;
    let mut cmd = Box::pin(compile_against_pattern(registry, &matched.pattern, &tokens, preprocess, preprocessor)).await?;
    cmd.original = input.to_string();
    cmd.record = true;
    cmd.preprocess = preprocess;
    Ok(cmd)
}

async fn compile_against_pattern(
    registry: &Registry,
    pattern: &Pattern,
    tokens: &[String],
    preprocess: bool,
    preprocessor: &dyn Preprocessor,
) -> Result<Command> {
    let mut cmd = Command { preprocess, ..Default::default() };
    let mut idx = 0usize;

    for item in &pattern.items {
        match item {
            PatternItem::Literal(text) => {
                let word_count = text.split_whitespace().count();
                idx += word_count;
            }
            PatternItem::StringArg { key, optional } => {
                if idx < tokens.len() {
                    cmd.string_args.insert(key.clone(), tokens[idx].clone());
                    idx += 1;
                } else if !optional {
                    return Err(Error::Grammar(format!("missing required argument: {key}")));
                }
            }
            PatternItem::Choice { options, optional } => {
                if idx < tokens.len() {
                    let tok = &tokens[idx];
                    if options.iter().any(|o| o == tok) {
                        cmd.bool_args.insert(tok.clone(), true);
                        idx += 1;
                    } else if !optional {
                        return Err(Error::Grammar(format!("expected one of {options:?}, got {tok}")));
                    }
                } else if !optional {
                    return Err(Error::Grammar(format!("missing required choice: {options:?}")));
                }
            }
            PatternItem::ListArg { key, .. } => {
                cmd.list_args.insert(key.clone(), tokens[idx..].to_vec());
                idx = tokens.len();
            }
            PatternItem::Subcommand => {
                let rest = tokens[idx..].join(" ");
                if rest.is_empty() {
                    return Err(Error::Grammar("missing subcommand".to_string()));
                }
                let sub = Box::pin(compile(registry, &rest, preprocess, preprocessor)).await?;
                cmd.subcommand = Some(Box::new(sub));
                idx = tokens.len();
            }
        }
    }

    if preprocess {
        let keys: Vec<String> = cmd.string_args.keys().cloned().collect();
        for key in keys {
            let value = cmd.string_args.get(&key).unwrap().clone();
            if is_url_like(&value) {
                let rewritten = preprocessor.preprocess(&value).await?;
                cmd.string_args.insert(key, rewritten);
            }
        }
        let keys: Vec<String> = cmd.list_args.keys().cloned().collect();
        for key in keys {
            let values = cmd.list_args.get(&key).unwrap().clone();
            let mut rewritten = Vec::with_capacity(values.len());
            for value in values {
                if is_url_like(&value) {
                    rewritten.push(preprocessor.preprocess(&value).await?);
                } else {
                    rewritten.push(value);
                }
            }
            cmd.list_args.insert(key, rewritten);
        }
    }

    Ok(cmd)
}
