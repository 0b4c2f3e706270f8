//! The block I/O engine: splitting a host file into prose and directive
//! blocks, and writing the rewritten blocks back out.
//!
//! A directive block looks like:
//!
//! ```c
//! /*[clinic input]
//! ...directive text...
//! [clinic start generated code]*/
//! ...generated output...
//! /*[clinic end generated code: output=0123456789abcdef input=fedcba9876543210]*/
//! ```
//!
//! The checksum line records truncated hashes of both regions so manual
//! edits to generated code are detected on the next run.

use sha2::{Digest, Sha256};

use crate::errors::{ClinicResult, fail};
use crate::cpp::CppMonitor;
use crate::language::Language;
use crate::model::{FunctionId, Include};
use crate::tokenize;

/// First `length` hex digits of a stable content hash.
#[must_use]
pub fn compute_checksum(text: &str, length: usize) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = String::with_capacity(length);
    for byte in digest {
        if hex.len() >= length {
            break;
        }
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(length);
    hex
}

/// A segment of the host file: either prose (`dsl_name` is `None`) or a
/// directive block with its generated output.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub input: String,
    pub output: String,
    pub dsl_name: Option<String>,
    /// Functions declared by this block, for the renderer.
    pub signatures: Vec<FunctionId>,
}

impl Block {
    #[must_use]
    pub fn prose(text: String) -> Self {
        Self {
            input: text,
            ..Self::default()
        }
    }
}

/// Splits host text into a stream of [`Block`]s, verifying checksums.
pub struct BlockParser<'a> {
    /// Remaining lines (each keeps its trailing newline), in reverse order.
    stack: Vec<&'a str>,
    language: Language,
    verify: bool,
    pub line_number: usize,
    pub block_start_line_number: usize,
    pending_dsl: Option<String>,
    first_block: bool,
}

impl<'a> BlockParser<'a> {
    pub fn new(input: &'a str, language: Language, verify: bool) -> Self {
        let mut stack: Vec<&'a str> = input.split_inclusive('\n').collect();
        stack.reverse();
        Self {
            stack,
            language,
            verify,
            line_number: 0,
            block_start_line_number: 0,
            pending_dsl: None,
            first_block: true,
        }
    }

    /// Returns true if the text contains any start marker at all, allowing
    /// callers to skip files without directive blocks.
    #[must_use]
    pub fn contains_start_marker(language: &Language, text: &str) -> bool {
        let (before, after) = Language::split_marker(language.start_line);
        text.lines()
            .any(|line| parse_marker(line.trim(), before, after).is_some())
    }

    fn pop_line(&mut self, cpp: Option<&mut CppMonitor>) -> Option<&'a str> {
        let line = self.stack.pop()?;
        self.line_number += 1;
        if let Some(cpp) = cpp {
            cpp.writeline(line);
        }
        Some(line)
    }

    fn is_start_line(&self, line: &str) -> Option<String> {
        let (before, after) = Language::split_marker(self.language.start_line);
        parse_marker(line.trim(), before, after).map(str::to_owned)
    }

    /// Produces the next block, or `None` at end of input.
    pub fn next_block(&mut self, cpp: &mut CppMonitor) -> ClinicResult<Option<Block>> {
        loop {
            if self.stack.is_empty() && self.pending_dsl.is_none() {
                return Ok(None);
            }
            if let Some(dsl_name) = self.pending_dsl.take() {
                self.first_block = false;
                return self.parse_clinic_block(&dsl_name, cpp).map(Some);
            }
            let block = self.parse_verbatim_block(cpp);
            // a file that opens with a marker has no leading prose block
            if self.first_block && block.input.is_empty() {
                self.first_block = false;
                continue;
            }
            self.first_block = false;
            return Ok(Some(block));
        }
    }

    fn parse_verbatim_block(&mut self, cpp: &mut CppMonitor) -> Block {
        let mut text = String::new();
        self.block_start_line_number = self.line_number;
        while let Some(line) = self.pop_line(Some(cpp)) {
            if let Some(dsl_name) = self.is_start_line(line) {
                self.pending_dsl = Some(dsl_name);
                break;
            }
            text.push_str(line);
        }
        Block::prose(text)
    }

    fn parse_clinic_block(&mut self, dsl_name: &str, cpp: &mut CppMonitor) -> ClinicResult<Block> {
        let mut input = String::new();
        self.block_start_line_number = self.line_number + 1;
        let stop_line = self.language.stop_marker(dsl_name);

        while let Some(line) = self.pop_line(Some(cpp)) {
            let trimmed = line.trim_end_matches('\n');
            if let Some(remainder) = trimmed.strip_prefix(stop_line.as_str()) {
                if !remainder.trim().is_empty() {
                    fail!("Garbage after stop line: {remainder:?}");
                }
                break;
            }
            input.push_str(line);
        }

        // scan forward for the checksum line; anything before it is the
        // previously generated output
        let with_dsl = crate::templates::fill(self.language.checksum_line, &[("dsl_name", dsl_name)]);
        let (checksum_prefix, checksum_suffix) = with_dsl
            .split_once("{arguments}")
            .expect("checksum template carries an {arguments} hole");

        let mut output = String::new();
        let mut arguments: Option<String> = None;
        let mut consumed: Vec<&'a str> = Vec::new();
        while let Some(line) = self.pop_line(None) {
            let trimmed = line.trim();
            if let Some(args) = parse_checksum_line(trimmed, checksum_prefix, checksum_suffix) {
                arguments = Some(args.to_owned());
                break;
            }
            consumed.push(line);
            output.push_str(line);
            if self.is_start_line(line).is_some() {
                break;
            }
        }

        if let Some(arguments) = arguments {
            let mut recorded_output = None;
            let mut recorded_input = None;
            let mut recorded_checksum = None;
            for field in tokenize::split(&arguments)? {
                let Some((name, value)) = field.split_once('=') else {
                    fail!("Mangled Argument Clinic marker line: {arguments:?}");
                };
                match name.trim() {
                    "output" => recorded_output = Some(value.trim().to_owned()),
                    "input" => recorded_input = Some(value.trim().to_owned()),
                    "checksum" => recorded_checksum = Some(value.trim().to_owned()),
                    _ => {}
                }
            }
            if self.verify {
                let checksum = if recorded_input.is_some() {
                    recorded_output
                } else {
                    recorded_checksum
                };
                let Some(checksum) = checksum else {
                    fail!("Mangled Argument Clinic marker line: {arguments:?}");
                };
                let computed = compute_checksum(&output, checksum.len());
                if checksum != computed {
                    fail!(
                        "Checksum mismatch! Expected {checksum:?}, computed {computed:?}. \
                         Suggested fix: remove all generated code including the end line, \
                         or use the '-f' option."
                    );
                }
            }
        } else {
            // no checksum line: the scanned lines were not output, put them
            // back for the next verbatim block
            self.line_number -= consumed.len();
            for line in consumed.into_iter().rev() {
                self.stack.push(line);
            }
            output.clear();
        }

        Ok(Block {
            input,
            output,
            dsl_name: Some(dsl_name.to_owned()),
            signatures: Vec::new(),
        })
    }
}

fn parse_marker<'l>(line: &'l str, before: &str, after: &str) -> Option<&'l str> {
    let rest = line.strip_prefix(before)?;
    let name = rest.strip_suffix(after)?;
    if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Some(name)
    } else {
        None
    }
}

fn parse_checksum_line<'l>(line: &'l str, prefix: &str, suffix: &str) -> Option<&'l str> {
    line.strip_prefix(prefix)?.strip_suffix(suffix)
}

/// Serializes blocks back into host text, with fresh checksums.
#[derive(Debug)]
pub struct BlockPrinter {
    language: Language,
    out: String,
}

/// Column where the `// reason` comment of an include line starts.
const INCLUDE_COMMENT_COLUMN: usize = 35;

impl BlockPrinter {
    #[must_use]
    pub fn new(language: Language) -> Self {
        Self {
            language,
            out: String::new(),
        }
    }

    pub fn write(&mut self, text: &str) {
        self.out.push_str(text);
    }

    #[must_use]
    pub fn finish(self) -> String {
        self.out
    }

    pub fn print_block(&mut self, block: &Block, core_includes: bool, includes: &[Include]) {
        let Some(dsl_name) = &block.dsl_name else {
            self.out.push_str(&block.input);
            return;
        };

        self.out.push_str(&self.language.start_marker(dsl_name));
        self.out.push('\n');

        let body_prefix = self.language.body_prefix;
        if body_prefix.is_empty() {
            self.out.push_str(&block.input);
        } else {
            for line in block.input.split_inclusive('\n') {
                self.out.push_str(body_prefix);
                self.out.push_str(line);
            }
        }

        self.out.push_str(&self.language.stop_marker(dsl_name));
        self.out.push('\n');

        let mut output = String::new();
        if core_includes && !includes.is_empty() {
            output.push('\n');
            let mut sorted: Vec<&Include> = includes.iter().collect();
            sorted.sort_by_key(|include| include.sort_key());

            let mut current_condition: Option<&str> = None;
            for include in sorted {
                let condition = include.condition.as_deref();
                if condition != current_condition {
                    if current_condition.is_some() {
                        output.push_str("#endif\n");
                    }
                    current_condition = condition;
                    if let Some(condition) = condition {
                        output.push_str(condition);
                        output.push('\n');
                    }
                }
                let mut line = if current_condition.is_some() {
                    format!("#  include \"{}\"", include.filename)
                } else {
                    format!("#include \"{}\"", include.filename)
                };
                if include.reason.is_empty() {
                    line.push('\n');
                } else {
                    while line.len() < INCLUDE_COMMENT_COLUMN - 1 {
                        line.push(' ');
                    }
                    line.push_str(&format!(" // {}\n", include.reason));
                }
                output.push_str(&line);
            }
            if current_condition.is_some() {
                output.push_str("#endif\n");
            }
        }

        output.push_str(&block.output);
        if !output.is_empty() {
            if !output.ends_with('\n') {
                output.push('\n');
            }
            self.out.push_str(&output);
        }

        let arguments = format!(
            "output={} input={}",
            compute_checksum(&output, 16),
            compute_checksum(&block.input, 16),
        );
        self.out
            .push_str(&self.language.checksum_marker(dsl_name, &arguments));
        self.out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_all(text: &str, verify: bool) -> ClinicResult<Vec<Block>> {
        let mut parser = BlockParser::new(text, Language::c(), verify);
        let mut cpp = CppMonitor::new();
        let mut blocks = Vec::new();
        while let Some(block) = parser.next_block(&mut cpp)? {
            blocks.push(block);
        }
        Ok(blocks)
    }

    #[test]
    fn checksums_are_sixteen_hex_digits_and_stable() {
        let a = compute_checksum("hello", 16);
        let b = compute_checksum("hello", 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, compute_checksum("hello!", 16));
    }

    #[test]
    fn prose_only_file_is_one_block() {
        let blocks = parse_all("int main(void) {\n    return 0;\n}\n", true).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].dsl_name.is_none());
        assert!(blocks[0].input.starts_with("int main"));
    }

    #[test]
    fn fresh_block_without_output_parses() {
        let text = "\
before\n\
/*[clinic input]\n\
mod.f\n\
[clinic start generated code]*/\n\
after\n";
        let blocks = parse_all(text, true).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].dsl_name.as_deref(), Some("clinic"));
        assert_eq!(blocks[1].input, "mod.f\n");
        assert_eq!(blocks[1].output, "");
        assert_eq!(blocks[2].input, "after\n");
        assert_eq!(blocks[0].input, "before\n");
    }

    #[test]
    fn output_is_captured_up_to_the_checksum_line() {
        let output = "generated\n";
        let input = "mod.f\n";
        let text = format!(
            "/*[clinic input]\n{input}[clinic start generated code]*/\n{output}\
             /*[clinic end generated code: output={} input={}]*/\n",
            compute_checksum(output, 16),
            compute_checksum(input, 16),
        );
        let blocks = parse_all(&text, true).unwrap();
        assert_eq!(blocks.len(), 1, "no leading prose block for a file opening with a marker");
        assert_eq!(blocks[0].output, output);
    }

    #[test]
    fn corrupted_output_fails_verification() {
        let output = "generated\n";
        let input = "mod.f\n";
        let text = format!(
            "/*[clinic input]\n{input}[clinic start generated code]*/\ntampered\n\
             /*[clinic end generated code: output={} input={}]*/\n",
            compute_checksum(output, 16),
            compute_checksum(input, 16),
        );
        let error = parse_all(&text, true).unwrap_err();
        assert!(error.message.contains("Checksum mismatch"), "{error}");
        // without verification the same text parses
        assert!(parse_all(&text, false).is_ok());
    }

    #[test]
    fn printed_blocks_reparse_identically() {
        let block = Block {
            input: "mod.f\n".to_owned(),
            output: "generated line\n".to_owned(),
            dsl_name: Some("clinic".to_owned()),
            signatures: Vec::new(),
        };
        let mut printer = BlockPrinter::new(Language::c());
        printer.print_block(&block, false, &[]);
        let text = printer.finish();
        let blocks = parse_all(&text, true).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].input, block.input);
        assert_eq!(blocks[0].output, block.output);
    }
}
