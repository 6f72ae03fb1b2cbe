//! Input lexer for the command grammar (spec §4.1).
//!
//! Splits one line of user input into whitespace-separated elements,
//! honouring single/double quoted groups and a fixed escape set. `#`
//! begins a comment that runs to end of line. An empty quoted group
//! (`""` or `''`) produces an empty element, distinguishable from no
//! element at all (an unquoted run of whitespace produces nothing).

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Lex one line of input into elements. Returns `Ok(vec![])` for empty
/// input, pure comments, or whitespace-only lines (spec §8 boundary
/// behaviour).
pub fn lex(input: &str) -> Result<Vec<String>> {
    let mut elements = Vec::new();
    // `None` = no element started since the last separator; `Some` = an
    // element (possibly empty, from a quoted group) is in progress.
    let mut current: Option<String> = None;
    let mut quote = Quote::None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Quote::None => match c {
                '#' => break,
                c if c.is_whitespace() => {
                    if let Some(tok) = current.take() {
                        elements.push(tok);
                    }
                }
                '\'' => {
                    quote = Quote::Single;
                    current.get_or_insert_with(String::new);
                }
                '"' => {
                    quote = Quote::Double;
                    current.get_or_insert_with(String::new);
                }
                '\\' => {
                    let escaped = read_escape(&mut chars)?;
                    current.get_or_insert_with(String::new).push(escaped);
                }
                c => current.get_or_insert_with(String::new).push(c),
            },
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                '\\' => {
                    let escaped = read_escape(&mut chars)?;
                    current.get_or_insert_with(String::new).push(escaped);
                }
                c => current.get_or_insert_with(String::new).push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => {
                    let escaped = read_escape(&mut chars)?;
                    current.get_or_insert_with(String::new).push(escaped);
                }
                c => current.get_or_insert_with(String::new).push(c),
            },
        }
    }

    if quote != Quote::None {
        return Err(Error::Grammar("unterminated quote".to_string()));
    }

    if let Some(tok) = current.take() {
        elements.push(tok);
    }

    Ok(elements)
}

fn read_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<char> {
    match chars.next() {
        Some('n') => Ok('\n'),
        Some('t') => Ok('\t'),
        Some('r') => Ok('\r'),
        Some('"') => Ok('"'),
        Some('\'') => Ok('\''),
        Some('\\') => Ok('\\'),
        Some(other) => Ok(other),
        None => Err(Error::Grammar("trailing escape".to_string())),
    }
}
