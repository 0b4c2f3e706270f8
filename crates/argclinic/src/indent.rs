//! Indentation bookkeeping for the directive DSL.
//!
//! The DSL is indentation-sensitive with exactly four meaningful depths
//! (directive, function header, parameter, per-parameter docstring); the
//! stack itself is agnostic and just tracks margins.

use crate::errors::{ClinicResult, fail};

#[derive(Debug, Default)]
pub struct IndentStack {
    indents: Vec<usize>,
    margin: Option<String>,
}

impl IndentStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the width of the line's leading margin in spaces.
    ///
    /// An empty line measures as the current indent, since it carries no
    /// information of its own. Tab characters are illegal in the DSL.
    pub fn measure(&self, line: &str) -> ClinicResult<usize> {
        if line.contains('\t') {
            fail!("Tab characters are illegal in the Argument Clinic DSL.");
        }
        let stripped = line.trim_start();
        if stripped.is_empty() {
            let Some(&current) = self.indents.last() else {
                fail!("IndentStack expected indents, but none are defined.");
            };
            return Ok(current);
        }
        Ok(line.len() - stripped.len())
    }

    /// Infers the new margin from this line.
    ///
    /// Returns 1 if the line indented (or established the first margin),
    /// 0 if the margin is unchanged, and -N if the line dedented N levels.
    /// Dedenting to a width that was never pushed is an error.
    pub fn infer(&mut self, line: &str) -> ClinicResult<i32> {
        let indent = self.measure(line)?;
        let margin = " ".repeat(indent);
        let Some(&current) = self.indents.last() else {
            self.indents.push(indent);
            self.margin = Some(margin);
            return Ok(1);
        };
        if indent == current {
            return Ok(0);
        }
        if indent > current {
            self.indents.push(indent);
            self.margin = Some(margin);
            return Ok(1);
        }
        if !self.indents.contains(&indent) {
            fail!("Illegal outdent.");
        }
        let mut outdent_count = 0;
        while self.indents.last() != Some(&indent) {
            self.indents.pop();
            outdent_count -= 1;
        }
        self.margin = Some(margin);
        Ok(outdent_count)
    }

    /// Returns how many margins are currently defined.
    pub fn depth(&self) -> usize {
        self.indents.len()
    }

    pub fn margin_width(&self) -> usize {
        self.margin.as_ref().map_or(0, String::len)
    }

    /// Strips the current margin from a line.
    pub fn dedent<'a>(&self, line: &'a str) -> ClinicResult<&'a str> {
        let Some(margin) = &self.margin else {
            fail!("Cannot dedent; no margin has been inferred yet.");
        };
        if !line.starts_with(margin.as_str()) {
            fail!("Cannot dedent; line does not start with the previous margin.");
        }
        Ok(&line[margin.len()..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_counts_leading_spaces() {
        let stack = IndentStack::new();
        assert_eq!(stack.measure("    four").unwrap(), 4);
        assert_eq!(stack.measure("none").unwrap(), 0);
    }

    #[test]
    fn measure_rejects_tabs() {
        let stack = IndentStack::new();
        assert!(stack.measure("\tindented").is_err());
    }

    #[test]
    fn infer_tracks_push_and_pop() {
        let mut stack = IndentStack::new();
        assert_eq!(stack.infer("top").unwrap(), 1);
        assert_eq!(stack.infer("    deeper").unwrap(), 1);
        assert_eq!(stack.infer("        deepest").unwrap(), 1);
        assert_eq!(stack.infer("        same").unwrap(), 0);
        assert_eq!(stack.infer("top again").unwrap(), -2);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn infer_rejects_unmatched_outdent() {
        let mut stack = IndentStack::new();
        stack.infer("top").unwrap();
        stack.infer("    deeper").unwrap();
        assert!(stack.infer("  between").is_err());
    }

    #[test]
    fn dedent_strips_margin() {
        let mut stack = IndentStack::new();
        stack.infer("    line").unwrap();
        assert_eq!(stack.dedent("    line").unwrap(), "line");
        assert!(stack.dedent("  short").is_err());
    }
}
