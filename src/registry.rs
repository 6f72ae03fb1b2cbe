//! Trie-based handler registry (spec §4.1, Component B).
//!
//! Each registered pattern walks a trie keyed by `(item type, item value)`.
//! A handler pointer is stored at the node where its pattern terminates,
//! and additionally at the node just before an optional trailing item (so
//! that input omitting the optional item still finds the handler).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::pattern::{Pattern, PatternItem};

/// A trie edge key. Literal edges are keyed by their exact text; string,
/// list and subcommand edges are keyed only by their shape (any input
/// token matches); choice edges are keyed by each individual option so
/// that a literal input token can select among them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EdgeKey {
    Literal(String),
    String,
    Choice(String),
    List,
    Subcommand,
}

#[derive(Default)]
struct Node {
    children: HashMap<EdgeKey, Node>,
    /// Handlers whose pattern terminates exactly at this node.
    handlers: Vec<usize>,
}

/// A registered handler: its source pattern plus an opaque id used by the
/// caller (typically an index into a side table of actual command
/// callbacks, kept out of this crate's pattern-matching concern).
pub struct Registration {
    pub pattern: Pattern,
    pub id: usize,
}

/// The result of compiling one input against the registry.
pub struct Match {
    pub id: usize,
    pub pattern: Pattern,
}

#[derive(Default)]
pub struct Registry {
    root: Node,
    registrations: Vec<Pattern>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern, returning the id to associate with its handler.
    pub fn register(&mut self, pattern: Pattern) -> usize {
        let id = self.registrations.len();
        insert(&mut self.root, &pattern.items, id);
        self.registrations.push(pattern);
        id
    }

    pub fn pattern_for(&self, id: usize) -> &Pattern {
        &self.registrations[id]
    }

    /// Every pattern registered so far, for completion and `help` listings.
    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.registrations.iter()
    }

    /// Walk the trie against lexed input tokens, applying spec §4.1's
    /// ambiguity resolution: an exact match at the end of input wins
    /// outright; otherwise if exactly one candidate remains reachable, it
    /// wins; otherwise the command is ambiguous.
    pub fn resolve(&self, tokens: &[String]) -> Result<Match> {
        let candidates = walk(&self.root, tokens);

        if candidates.is_empty() {
            return Err(Error::NoMatch);
        }

        let exact: Vec<&usize> = candidates.iter().filter(|c| c.consumed_all).map(|c| &c.id).collect();
        if exact.len() == 1 {
            let id = *exact[0];
            return Ok(Match { id, pattern: self.registrations[id].clone() });
        }
        if exact.len() > 1 {
            return Err(Error::Ambiguous(exact.len()));
        }

        if candidates.len() == 1 {
            let id = candidates[0].id;
            return Ok(Match { id, pattern: self.registrations[id].clone() });
        }

        Err(Error::Ambiguous(candidates.len()))
    }
}

fn insert(node: &mut Node, items: &[PatternItem], id: usize) {
    match items.first() {
        None => node.handlers.push(id),
        Some(item) => {
            let optional = item.is_optional();
            if optional {
                // Reachable by skipping this (and any further) item(s).
                node.handlers.push(id);
            }
            match item {
                PatternItem::Literal(text) => {
                    // `Pattern::parse` merges a run of consecutive literal
                    // words into one item (e.g. "vm info"); the trie still
                    // walks one input token at a time, so split the run
                    // back into a chain of single-word edges here.
                    let mut cur = node;
                    for word in text.split_whitespace() {
                        cur = cur.children.entry(EdgeKey::Literal(word.to_string())).or_default();
                    }
                    insert(cur, &items[1..], id);
                }
                PatternItem::StringArg { .. } => {
                    let child = node.children.entry(EdgeKey::String).or_default();
                    insert(child, &items[1..], id);
                }
                PatternItem::Choice { options, .. } => {
                    for opt in options {
                        let child = node.children.entry(EdgeKey::Choice(opt.clone())).or_default();
                        insert(child, &items[1..], id);
                    }
                }
                PatternItem::ListArg { .. } => {
                    let child = node.children.entry(EdgeKey::List).or_default();
                    // A list consumes every remaining token; the handler is
                    // reachable at this one child regardless of how many
                    // tokens are actually supplied.
                    child.handlers.push(id);
                }
                PatternItem::Subcommand => {
                    let child = node.children.entry(EdgeKey::Subcommand).or_default();
                    child.handlers.push(id);
                }
            }
        }
    }
}

struct Candidate {
    id: usize,
    consumed_all: bool,
}

fn walk(root: &Node, tokens: &[String]) -> Vec<Candidate> {
    let mut out = Vec::new();
    walk_node(root, tokens, &mut out);
    out
}

fn walk_node(node: &Node, tokens: &[String], out: &mut Vec<Candidate>) {
    if tokens.is_empty() {
        for &id in &node.handlers {
            out.push(Candidate { id, consumed_all: true });
        }
        return;
    }

    let tok = &tokens[0];
    let rest = &tokens[1..];

    if let Some(child) = node.children.get(&EdgeKey::Literal(tok.clone())) {
        walk_node(child, rest, out);
    }
    if let Some(child) = node.children.get(&EdgeKey::String) {
        walk_node(child, rest, out);
    }
    if let Some(child) = node.children.get(&EdgeKey::Choice(tok.clone())) {
        walk_node(child, rest, out);
    }
    if let Some(child) = node.children.get(&EdgeKey::List) {
        for &id in &child.handlers {
            out.push(Candidate { id, consumed_all: true });
        }
    }
    if let Some(child) = node.children.get(&EdgeKey::Subcommand) {
        for &id in &child.handlers {
            out.push(Candidate { id, consumed_all: true });
        }
    }

    // Reaching a handler stored as "reachable before the optional tail"
    // with tokens still left over is not a match unless it's via a list or
    // subcommand above; plain optional items need all tokens consumed.
    let _ = node.handlers.len();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(patterns: &[&str]) -> Registry {
        let mut r = Registry::new();
        for p in patterns {
            r.register(Pattern::parse(p).unwrap());
        }
        r
    }

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn exact_literal_match() {
        let r = reg(&["vm info"]);
        let m = r.resolve(&toks("vm info")).unwrap();
        assert_eq!(m.id, 0);
    }

    #[test]
    fn no_match_on_unknown_command() {
        let r = reg(&["vm info"]);
        assert!(matches!(r.resolve(&toks("vm bogus")), Err(Error::NoMatch)));
    }

    #[test]
    fn string_arg_consumes_any_token() {
        let r = reg(&["vm launch <name>"]);
        let m = r.resolve(&toks("vm launch foo")).unwrap();
        assert_eq!(m.id, 0);
    }

    #[test]
    fn ambiguous_when_two_patterns_both_match_fully() {
        let r = reg(&["vm info", "vm <name>"]);
        // "vm info" matches the literal pattern exactly, and also matches
        // <name>="info" fully -- both consume all input.
        let err = r.resolve(&toks("vm info")).unwrap_err();
        assert!(matches!(err, Error::Ambiguous(2)));
    }

    #[test]
    fn single_candidate_prefix_wins_without_full_literal_match() {
        let r = reg(&["vm launch <vmType> <name>"]);
        let m = r.resolve(&toks("vm launch kvm box1")).unwrap();
        assert_eq!(m.id, 0);
    }

    #[test]
    fn optional_trailing_item_may_be_omitted() {
        let r = reg(&["vm save [name]"]);
        let m = r.resolve(&toks("vm save")).unwrap();
        assert_eq!(m.id, 0);
    }

    #[test]
    fn list_item_matches_regardless_of_remaining_token_count() {
        let r = reg(&["vm flush <names>..."]);
        assert!(r.resolve(&toks("vm flush a b c")).is_ok());
        assert!(r.resolve(&toks("vm flush a")).is_ok());
    }

    #[test]
    fn choice_option_selects_that_branch() {
        let r = reg(&["vm launch <kvm,container> <name>"]);
        let m = r.resolve(&toks("vm launch container box1")).unwrap();
        assert_eq!(m.id, 0);
        assert!(r.resolve(&toks("vm launch bogus box1")).is_err());
    }

    #[test]
    fn pattern_for_returns_original_pattern() {
        let r = reg(&["vm info"]);
        assert_eq!(r.pattern_for(0).render(), "vm info");
    }

    #[test]
    fn multi_word_literal_prefix_is_reachable_token_by_token() {
        let r = reg(&["vm config memory <mb>"]);
        let m = r.resolve(&toks("vm config memory 512")).unwrap();
        assert_eq!(m.id, 0);
        assert!(r.resolve(&toks("vm config")).is_err());
    }
}
