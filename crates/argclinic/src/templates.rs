//! The template engine and the closed set of calling-convention snippets.
//!
//! Templates are parsed once into literal chunks and named holes. There are
//! two substitution passes:
//!
//! * [`linear_format`] replaces holes that occupy a whole line, preserving
//!   the hole line's indentation across a multi-line value (and dropping the
//!   line when the value is empty);
//! * [`Template::fill`] replaces scalar `{name}` holes in place, in a single
//!   left-to-right pass. Unknown holes and stray braces are left untouched,
//!   so literal C braces never need escaping.

use crate::errors::{ClinicResult, fail};

/// Marks the end of the machine-readable signature inside a docstring.
pub const SIG_END_MARKER: &str = "--";

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Hole(String),
}

/// A parsed template: literal chunks interleaved with named holes.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

fn scan_hole(src: &str) -> Option<&str> {
    // A hole is '{' + identifier + '}'; anything else is literal text.
    let inner = src.strip_prefix('{')?;
    let end = inner.find('}')?;
    let name = &inner[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    if (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some(name)
    } else {
        None
    }
}

impl Template {
    #[must_use]
    pub fn parse(src: &str) -> Self {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = src;
        while let Some(at) = rest.find('{') {
            let (before, from_brace) = rest.split_at(at);
            literal.push_str(before);
            if let Some(name) = scan_hole(from_brace) {
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Hole(name.to_owned()));
                rest = &from_brace[name.len() + 2..];
            } else {
                literal.push('{');
                rest = &from_brace[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Self { parts }
    }

    /// Fills holes via the resolver; unresolved holes are emitted verbatim.
    pub fn fill(&self, resolve: impl Fn(&str) -> Option<String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Hole(name) => match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                },
            }
        }
        out
    }
}

/// One-shot scalar substitution of the given keys.
#[must_use]
pub fn fill(src: &str, substitutions: &[(&str, &str)]) -> String {
    Template::parse(src).fill(|name| {
        substitutions
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| (*value).to_owned())
    })
}

/// Replaces holes that occupy an entire line, preserving the line's
/// indentation across multi-line values.
///
/// A hole whose value is empty removes its line. A matched hole with text
/// before or after it on the same line is an error; unmatched holes pass
/// through untouched.
pub fn linear_format(text: &str, substitutions: &[(&str, &str)]) -> ClinicResult<String> {
    let lookup = |name: &str| {
        substitutions
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    };

    let mut lines: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let Some(brace) = line.find('{') else {
            lines.push(line.to_owned());
            continue;
        };
        let (indent, from_brace) = line.split_at(brace);
        let Some(name) = scan_hole(from_brace) else {
            lines.push(line.to_owned());
            continue;
        };
        let Some(value) = lookup(name) else {
            lines.push(line.to_owned());
            continue;
        };
        let trailing = &from_brace[name.len() + 2..];
        if !trailing.is_empty() {
            fail!("Text found after {{{name}}} block marker. You can't have both a block and text.");
        }
        if !indent.trim().is_empty() {
            fail!(
                "Non-whitespace characters found before {{{name}}} block marker. You can't have both a block and text."
            );
        }
        if value.is_empty() {
            continue;
        }
        for value_line in value.split('\n') {
            let stripped = value_line.trim_end();
            if stripped.is_empty() {
                lines.push(String::new());
            } else {
                lines.push(format!("{indent}{stripped}"));
            }
        }
    }
    Ok(lines.join("\n"))
}

/// Indents every non-empty line of a snippet by `width` spaces.
#[must_use]
pub fn indent_snippet(snippet: &str, width: usize) -> String {
    let margin = " ".repeat(width);
    snippet
        .split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{margin}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prepends `prefix` to every line (but not to a trailing empty line).
#[must_use]
pub fn indent_all_lines(s: &str, prefix: &str) -> String {
    let mut out = String::new();
    let mut rest = s;
    while let Some(end) = rest.find('\n') {
        out.push_str(prefix);
        out.push_str(&rest[..=end]);
        rest = &rest[end + 1..];
    }
    if !rest.is_empty() {
        out.push_str(prefix);
        out.push_str(rest);
    }
    out
}

/// Appends `suffix` to every line (but not to a trailing empty line).
#[must_use]
pub fn suffix_all_lines(s: &str, suffix: &str) -> String {
    let mut out = String::new();
    let mut rest = s;
    while let Some(end) = rest.find('\n') {
        out.push_str(&rest[..end]);
        out.push_str(suffix);
        out.push('\n');
        rest = &rest[end + 1..];
    }
    if !rest.is_empty() {
        out.push_str(rest);
        out.push_str(suffix);
    }
    out
}

/// Reflows long function declarations at column 78, breaking between
/// parameters and aligning continuation lines under the opening paren.
#[must_use]
pub fn wrap_declarations(text: &str) -> String {
    const LENGTH: usize = 78;
    let mut lines = Vec::new();
    for line in text.split('\n') {
        let Some((before, after_l)) = line.split_once('(') else {
            lines.push(line.to_owned());
            continue;
        };
        let Some((in_paren, after_r)) = after_l.split_once(')') else {
            lines.push(line.to_owned());
            continue;
        };
        if !in_paren.contains(',') || line.len() <= LENGTH {
            lines.push(line.to_owned());
            continue;
        }
        let mut parameters: Vec<String> = in_paren
            .split(',')
            .map(|p| format!("{}, ", p.trim()))
            .collect();
        let mut prefix = format!("{before}(");
        let spaces = " ".repeat(prefix.len().min(LENGTH));
        while !parameters.is_empty() {
            let mut out_line = prefix.clone();
            let mut first = true;
            while let Some(parameter) = parameters.first() {
                if !first && out_line.len() + parameter.len() > LENGTH {
                    break;
                }
                out_line.push_str(parameter);
                parameters.remove(0);
                first = false;
            }
            if parameters.is_empty() {
                out_line = out_line.trim_end_matches(", ").to_owned();
                out_line.push(')');
                out_line.push_str(after_r);
            }
            lines.push(out_line.trim_end().to_owned());
            prefix.clone_from(&spaces);
        }
    }
    lines.join("\n")
}

// --- the closed set of calling-convention templates -----------------------

pub const PARSER_PROTOTYPE_KEYWORD: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, PyObject *args, PyObject *kwargs)";

pub const PARSER_PROTOTYPE_KEYWORD_INIT: &str = r"static int
{c_basename}({self_type}{self_name}, PyObject *args, PyObject *kwargs)";

pub const PARSER_PROTOTYPE_VARARGS: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, PyObject *args)";

pub const PARSER_PROTOTYPE_FASTCALL: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, PyObject *const *args, Py_ssize_t nargs)";

pub const PARSER_PROTOTYPE_FASTCALL_KEYWORDS: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, PyObject *const *args, Py_ssize_t nargs, PyObject *kwnames)";

pub const PARSER_PROTOTYPE_DEF_CLASS: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, PyTypeObject *{defining_class_name}, PyObject *const *args, Py_ssize_t nargs, PyObject *kwnames)";

pub const PARSER_PROTOTYPE_NOARGS: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, PyObject *Py_UNUSED(ignored))";

pub const PARSER_PROTOTYPE_GETTER: &str = r"static PyObject *
{c_basename}({self_type}{self_name}, void *Py_UNUSED(context))";

pub const PARSER_PROTOTYPE_SETTER: &str = r"static int
{c_basename}({self_type}{self_name}, PyObject *value, void *Py_UNUSED(context))";

pub const METH_O_PROTOTYPE: &str = r"static PyObject *
{c_basename}({impl_parameters})";

pub const DOCSTRING_PROTOTYPE_VAR: &str = r"PyDoc_VAR({c_basename}__doc__);";

pub const DOCSTRING_PROTOTYPE_STRVAR: &str = r"PyDoc_STRVAR({c_basename}__doc__,
{docstring});";

pub const GETSET_DOCSTRING_PROTOTYPE_STRVAR: &str = r"PyDoc_STRVAR({getset_basename}__doc__,
{docstring});
#define {getset_basename}_HAS_DOCSTR";

pub const IMPL_DEFINITION_PROTOTYPE: &str = r"static {impl_return_type}
{c_basename}_impl({impl_parameters})";

pub const METHODDEF_PROTOTYPE_DEFINE: &str = "#define {methoddef_name}    \\\n    {\"{name}\", {methoddef_cast}{c_basename}{methoddef_cast_end}, {methoddef_flags}, {c_basename}__doc__},";

pub const GETTERDEF_PROTOTYPE_DEFINE: &str = r#"#if defined({getset_basename}_HAS_DOCSTR)
#  define {getset_basename}_DOCSTR {getset_basename}__doc__
#else
#  define {getset_basename}_DOCSTR NULL
#endif
#if defined({getset_name}_GETSETDEF)
#  undef {getset_name}_GETSETDEF
#  define {getset_name}_GETSETDEF {"{name}", (getter){getset_basename}_get, (setter){getset_basename}_set, {getset_basename}_DOCSTR},
#else
#  define {getset_name}_GETSETDEF {"{name}", (getter){getset_basename}_get, NULL, {getset_basename}_DOCSTR},
#endif"#;

pub const SETTERDEF_PROTOTYPE_DEFINE: &str = r#"#if defined({getset_basename}_HAS_DOCSTR)
#  define {getset_basename}_DOCSTR {getset_basename}__doc__
#else
#  define {getset_basename}_DOCSTR NULL
#endif
#if defined({getset_name}_GETSETDEF)
#  undef {getset_name}_GETSETDEF
#  define {getset_name}_GETSETDEF {"{name}", (getter){getset_basename}_get, (setter){getset_basename}_set, {getset_basename}_DOCSTR},
#else
#  define {getset_name}_GETSETDEF {"{name}", NULL, (setter){getset_basename}_set, NULL},
#endif"#;

pub const METHODDEF_PROTOTYPE_IFNDEF: &str = r"#ifndef {methoddef_name}
    #define {methoddef_name}
#endif /* !defined({methoddef_name}) */";

/// The body shared by every generated parser function; the holes are filled
/// by `linear_format` passes and the final scalar pass.
pub const PARSER_BODY_PREAMBLE: &str = r"{
    {return_value_declaration}
    {parser_declarations}
    {declarations}
    {initializers}
";

pub const PARSER_BODY_FINALE: &str = r"    {modifications}
    {lock}
    {return_value} = {c_basename}_impl({impl_arguments});
    {unlock}
    {return_conversion}
    {post_parsing}

{exit_label}
    {cleanup}
    return return_value;
}";

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fill_replaces_known_holes_only() {
        let out = fill("{a} and {b} and {c}", &[("a", "1"), ("b", "2")]);
        assert_eq!(out, "1 and 2 and {c}");
    }

    #[test]
    fn fill_leaves_c_braces_alone() {
        let out = fill("if (x) { goto exit; }", &[("x", "nope")]);
        assert_eq!(out, "if (x) { goto exit; }");
    }

    #[test]
    fn fill_does_not_rescan_substituted_values() {
        let out = fill("{a}", &[("a", "{b}"), ("b", "2")]);
        assert_eq!(out, "{b}");
    }

    #[test]
    fn linear_format_preserves_hole_indentation() {
        let out = linear_format("head\n    {body}\ntail", &[("body", "one\ntwo")]).unwrap();
        assert_eq!(out, "head\n    one\n    two\ntail");
    }

    #[test]
    fn linear_format_drops_lines_with_empty_values() {
        let out = linear_format("head\n    {body}\ntail", &[("body", "")]).unwrap();
        assert_eq!(out, "head\ntail");
    }

    #[test]
    fn linear_format_rejects_text_around_a_matched_hole() {
        assert!(linear_format("x {body} y", &[("body", "v")]).is_err());
    }

    #[test]
    fn wrap_declarations_breaks_at_commas() {
        let decl = "static PyObject *\nexample_impl(PyObject *module, PyObject *aaaaaaaaaaaaaaaaaaaa, PyObject *bbbbbbbbbbbbbbbbbbbb, PyObject *cccccccccccccccccccc);";
        let wrapped = wrap_declarations(decl);
        for line in wrapped.split('\n') {
            assert!(line.len() <= 90, "line too long: {line:?}");
        }
        assert!(wrapped.contains("example_impl(PyObject *module,"));
    }

    #[test]
    fn suffix_and_prefix_skip_the_trailing_empty_line() {
        assert_eq!(indent_all_lines("a\nb\n", "# "), "# a\n# b\n");
        assert_eq!(suffix_all_lines("a\nb\n", " */"), "a */\nb */\n");
    }
}
