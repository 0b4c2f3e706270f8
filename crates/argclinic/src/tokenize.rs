//! Shell-style splitting for directive lines.
//!
//! Directive arguments follow shell quoting rules: whitespace separates
//! tokens, single quotes protect everything, double quotes allow backslash
//! escapes. This is the full grammar directives need; anything fancier is a
//! syntax error in the block anyway.

use crate::errors::{ClinicResult, fail};

/// Splits a directive line into tokens.
///
/// # Errors
/// Returns an error on an unterminated quote.
pub fn split(line: &str) -> ClinicResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => fail!("Unterminated single quote: {line:?}"),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => fail!("Unterminated double quote: {line:?}"),
                        },
                        Some(c) => current.push(c),
                        None => fail!("Unterminated double quote: {line:?}"),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => fail!("Trailing backslash: {line:?}"),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn splits_on_whitespace() {
        let tokens = split("destination header new file").unwrap();
        assert_eq!(tokens, vec!["destination", "header", "new", "file"]);
    }

    #[test]
    fn quotes_protect_spaces() {
        let tokens = split(r#"@text_signature "($self, /)""#).unwrap();
        assert_eq!(tokens, vec!["@text_signature", "($self, /)"]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(split("printout 'oops").is_err());
    }
}
