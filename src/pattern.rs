//! Pattern grammar for handler registration (spec §4.1).
//!
//! ```text
//! item   := literal | "<" key ">" | "<" key ">..."
//!         | "[" key "]" | "[" key "]..."
//!         | "<" c1 "," c2 ("," cN)* ">"
//!         | "[" c1 "," c2 ("," cN)* "]"
//!         | "(" subcmd ")"
//! literal := unquoted-text (may include spaces as part of the literal if
//!            followed by a key marker)
//! ```

use crate::error::{Error, Result};

/// A single position in a pattern (spec §3 data model: `PatternItem`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternItem {
    Literal(String),
    StringArg { key: String, optional: bool },
    Choice { options: Vec<String>, optional: bool },
    ListArg { key: String, optional: bool },
    Subcommand,
}

impl PatternItem {
    pub fn is_optional(&self) -> bool {
        match self {
            PatternItem::StringArg { optional, .. }
            | PatternItem::Choice { optional, .. }
            | PatternItem::ListArg { optional, .. } => *optional,
            PatternItem::Literal(_) | PatternItem::Subcommand => false,
        }
    }

    /// Render this item back to its textual form (used by the round-trip
    /// property in spec §8 and by `longHelp`/`shortHelp` rendering).
    pub fn render(&self) -> String {
        match self {
            PatternItem::Literal(text) => text.clone(),
            PatternItem::StringArg { key, optional } => {
                if *optional { format!("[{key}]") } else { format!("<{key}>") }
            }
            PatternItem::Choice { options, optional } => {
                let joined = options.join(",");
                if *optional { format!("[{joined}]") } else { format!("<{joined}>") }
            }
            PatternItem::ListArg { key, optional } => {
                if *optional { format!("[{key}]...") } else { format!("<{key}>...") }
            }
            PatternItem::Subcommand => "(subcmd)".to_string(),
        }
    }
}

/// A compiled, validated pattern: an ordered list of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub items: Vec<PatternItem>,
}

impl Pattern {
    /// Parse and validate a pattern specification string, enforcing every
    /// registration-time constraint in spec §4.1.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.contains('"') || spec.contains('\'') {
            return Err(Error::Grammar("quotes inside patterns are rejected".to_string()));
        }

        let raw_tokens = tokenize_pattern(spec)?;
        let mut items = Vec::new();
        let mut literal_run: Vec<String> = Vec::new();

        let flush_literal = |run: &mut Vec<String>, items: &mut Vec<PatternItem>| {
            if !run.is_empty() {
                items.push(PatternItem::Literal(run.join(" ")));
                run.clear();
            }
        };

        for tok in raw_tokens {
            if let Some(item) = parse_marker(&tok)? {
                flush_literal(&mut literal_run, &mut items);
                items.push(item);
            } else {
                literal_run.push(tok);
            }
        }
        flush_literal(&mut literal_run, &mut items);

        if items.is_empty() {
            return Err(Error::Grammar("pattern must not be empty".to_string()));
        }

        validate(&items)?;
        Ok(Pattern { items })
    }

    pub fn render(&self) -> String {
        self.items.iter().map(PatternItem::render).collect::<Vec<_>>().join(" ")
    }

    /// The literal items at the very start of the pattern, used to group
    /// handlers sharing a prefix (spec §3: "Handlers are keyed by their
    /// shared literal prefix for grouping").
    pub fn shared_literal_prefix(&self) -> Option<&str> {
        match self.items.first() {
            Some(PatternItem::Literal(text)) => Some(text.as_str()),
            _ => None,
        }
    }
}

fn validate(items: &[PatternItem]) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        let is_last = i + 1 == items.len();
        if matches!(item, PatternItem::ListArg { .. } | PatternItem::Subcommand) && !is_last {
            return Err(Error::Grammar(
                "list and subcommand items may appear only as the last item".to_string(),
            ));
        }
    }

    let optional_positions: Vec<usize> =
        items.iter().enumerate().filter(|(_, it)| it.is_optional()).map(|(i, _)| i).collect();

    if optional_positions.len() > 1 {
        return Err(Error::Grammar("at most one optional position per pattern".to_string()));
    }

    if let Some(&pos) = optional_positions.first() {
        let is_last = pos + 1 == items.len();
        let is_choice = matches!(items[pos], PatternItem::Choice { .. });
        if !is_last && !is_choice {
            return Err(Error::Grammar(
                "the optional position must be last unless it is a choice".to_string(),
            ));
        }
    }

    for item in items {
        if let PatternItem::Choice { options, .. } = item {
            if options.len() < 2 {
                return Err(Error::Grammar("a choice needs at least two options".to_string()));
            }
            for opt in options {
                if opt.is_empty() || opt.chars().any(char::is_whitespace) {
                    return Err(Error::Grammar("choice options must not contain whitespace".to_string()));
                }
            }
        }
    }

    Ok(())
}

/// Split pattern text on whitespace, except inside a `(...)` subcommand
/// group, which may itself contain arbitrary nested pattern text.
fn tokenize_pattern(spec: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = spec.chars().peekable();
    let mut current = String::new();

    while let Some(c) = chars.next() {
        if c == '(' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            let mut depth = 1;
            let mut group = String::from("(");
            for c2 in chars.by_ref() {
                group.push(c2);
                match c2 {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            if depth != 0 {
                return Err(Error::Grammar("unterminated subcommand group".to_string()));
            }
            tokens.push(group);
        } else if c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_marker(tok: &str) -> Result<Option<PatternItem>> {
    if let Some(inner) = tok.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        if inner.is_empty() {
            return Err(Error::Grammar("empty subcommand group".to_string()));
        }
        return Ok(Some(PatternItem::Subcommand));
    }

    if let Some(rest) = tok.strip_prefix('<') {
        let (inner, trailing_list) = if let Some(stripped) = rest.strip_suffix(">...") {
            (stripped, true)
        } else if let Some(stripped) = rest.strip_suffix('>') {
            (stripped, false)
        } else {
            return Err(Error::Grammar(format!("malformed item: {tok}")));
        };
        return Ok(Some(make_item(inner, false, trailing_list)?));
    }

    if let Some(rest) = tok.strip_prefix('[') {
        let (inner, trailing_list) = if let Some(stripped) = rest.strip_suffix("]...") {
            (stripped, true)
        } else if let Some(stripped) = rest.strip_suffix(']') {
            (stripped, false)
        } else {
            return Err(Error::Grammar(format!("malformed item: {tok}")));
        };
        return Ok(Some(make_item(inner, true, trailing_list)?));
    }

    Ok(None)
}

fn make_item(inner: &str, optional: bool, is_list: bool) -> Result<PatternItem> {
    if inner.is_empty() {
        return Err(Error::Grammar("empty key/choice group".to_string()));
    }
    if inner.contains(',') {
        if is_list {
            return Err(Error::Grammar("a choice cannot also be a list".to_string()));
        }
        let options: Vec<String> = inner.split(',').map(str::to_string).collect();
        return Ok(PatternItem::Choice { options, optional });
    }
    if is_list {
        Ok(PatternItem::ListArg { key: inner.to_string(), optional })
    } else {
        Ok(PatternItem::StringArg { key: inner.to_string(), optional })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_literal_sequence() {
        let p = Pattern::parse("vm info").unwrap();
        assert_eq!(p.items, vec![PatternItem::Literal("vm info".to_string())]);
    }

    #[test]
    fn merges_literal_run_before_a_key() {
        let p = Pattern::parse("vm config tag <key> <value>").unwrap();
        assert_eq!(
            p.items,
            vec![
                PatternItem::Literal("vm config tag".to_string()),
                PatternItem::StringArg { key: "key".to_string(), optional: false },
                PatternItem::StringArg { key: "value".to_string(), optional: false },
            ]
        );
    }

    #[test]
    fn optional_string_must_be_last() {
        let p = Pattern::parse("vm launch [vmType] name").unwrap_err();
        assert!(matches!(p, Error::Grammar(_)));
    }

    #[test]
    fn optional_choice_need_not_be_last() {
        let p = Pattern::parse("vm launch [kvm,container] <name>").unwrap();
        assert!(matches!(p.items[0], PatternItem::Choice { optional: true, .. }));
    }

    #[test]
    fn list_must_be_last() {
        let err = Pattern::parse("vm flush <names>... extra").unwrap_err();
        assert!(matches!(err, Error::Grammar(_)));
    }

    #[test]
    fn subcommand_must_be_last() {
        let err = Pattern::parse("vm (subcmd) extra").unwrap_err();
        assert!(matches!(err, Error::Grammar(_)));
    }

    #[test]
    fn at_most_one_optional_position() {
        let err = Pattern::parse("vm config [a] [b]").unwrap_err();
        assert!(matches!(err, Error::Grammar(_)));
    }

    #[test]
    fn choice_options_reject_whitespace() {
        // Can't express embedded whitespace via the parser itself (options
        // split on commas), but an empty option between commas is rejected.
        let err = Pattern::parse("vm config <a,,b>").unwrap_err();
        assert!(matches!(err, Error::Grammar(_)));
    }

    #[test]
    fn quotes_in_pattern_rejected() {
        assert!(Pattern::parse(r#"vm config "tag""#).is_err());
    }

    #[test]
    fn render_round_trips() {
        let specs = [
            "vm info",
            "vm config tag <key> <value>",
            "vm launch <vmType,container> <name>...",
            "namespace <name> (subcmd)",
        ];
        for s in specs {
            let p = Pattern::parse(s).unwrap();
            let p2 = Pattern::parse(&p.render()).unwrap();
            assert_eq!(p, p2, "round trip failed for {s}");
        }
    }

    #[test]
    fn shared_prefix_is_first_literal() {
        let p = Pattern::parse("vm info").unwrap();
        assert_eq!(p.shared_literal_prefix(), Some("vm info"));
    }
}
