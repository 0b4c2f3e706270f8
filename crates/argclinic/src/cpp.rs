//! Minimal C preprocessor conditional tracking.
//!
//! The generator needs to know which `#if` conditions enclose a block so it
//! can wrap the emitted method-def fragments in the same guards. This
//! monitor watches every host line go by and keeps a stack of the active
//! conditions; it does not attempt to understand the expressions.

#[derive(Debug, Clone, Default)]
pub struct CppMonitor {
    stack: Vec<String>,
    continuation: Option<String>,
}

impl CppMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one host-file line to the monitor.
    pub fn writeline(&mut self, line: &str) {
        let line = line.trim_end_matches('\n');
        let joined = match self.continuation.take() {
            Some(mut prefix) => {
                prefix.push(' ');
                prefix.push_str(line.trim());
                prefix
            }
            None => line.to_owned(),
        };
        if let Some(without_backslash) = joined.strip_suffix('\\') {
            self.continuation = Some(without_backslash.trim_end().to_owned());
            return;
        }

        let trimmed = joined.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            return;
        };
        let directive = directive.trim_start();
        let (keyword, rest) = match directive.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (directive, ""),
        };
        let rest = strip_comment(rest);
        match keyword {
            "if" => self.stack.push(rest),
            "ifdef" => self.stack.push(format!("defined({rest})")),
            "ifndef" => self.stack.push(format!("!defined({rest})")),
            "elif" => {
                self.stack.pop();
                self.stack.push(rest);
            }
            "else" => {
                if let Some(top) = self.stack.pop() {
                    self.stack.push(negate(&top));
                }
            }
            "endif" => {
                self.stack.pop();
            }
            _ => {}
        }
    }

    /// The conjunction of all active conditions, or `""` at the top level.
    #[must_use]
    pub fn condition(&self) -> String {
        self.stack
            .iter()
            .map(|c| {
                if c.contains("&&") || c.contains("||") {
                    format!("({c})")
                } else {
                    c.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

fn strip_comment(text: &str) -> String {
    let text = text.split("/*").next().unwrap_or(text);
    let text = text.split("//").next().unwrap_or(text);
    text.trim().to_owned()
}

fn negate(condition: &str) -> String {
    if let Some(symbol) = condition.strip_prefix("!defined(") {
        format!("defined({symbol}")
    } else if let Some(rest) = condition.strip_prefix("defined(") {
        format!("!defined({rest}")
    } else {
        format!("!({condition})")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tracks_nested_conditions() {
        let mut cpp = CppMonitor::new();
        cpp.writeline("#ifdef HAVE_FOO");
        cpp.writeline("#if BAR > 1");
        assert_eq!(cpp.condition(), "defined(HAVE_FOO) && BAR > 1");
        cpp.writeline("#endif");
        assert_eq!(cpp.condition(), "defined(HAVE_FOO)");
        cpp.writeline("#endif");
        assert_eq!(cpp.condition(), "");
    }

    #[test]
    fn else_negates_the_innermost_condition() {
        let mut cpp = CppMonitor::new();
        cpp.writeline("#ifndef MS_WINDOWS");
        cpp.writeline("#else");
        assert_eq!(cpp.condition(), "defined(MS_WINDOWS)");
    }

    #[test]
    fn continuation_lines_are_joined() {
        let mut cpp = CppMonitor::new();
        cpp.writeline("#if defined(A) && \\");
        cpp.writeline("    defined(B)");
        assert_eq!(cpp.condition(), "(defined(A) && defined(B))");
    }
}
