//! The argument-parsing code generator.
//!
//! Given a finished [`Function`], the generator classifies its parameter
//! shape, picks one calling-convention template from the closed set, and
//! stitches the parser body together from converter fragments. The result is
//! a set of named fragments (method-def macro, docstring, parser definition,
//! impl prototype, ...) routed to the active destinations.

use crate::clinic::Clinic;
use crate::converters::{ConverterKind, RenderData, render_parameter};
use crate::destinations::Fragment;
use crate::errors::{ClinicResult, fail};
use crate::expr::c_str_repr;
use crate::model::{Function, FunctionKind, Parameter, VersionTuple};
use crate::templates::{
    self, DOCSTRING_PROTOTYPE_STRVAR, DOCSTRING_PROTOTYPE_VAR, GETSET_DOCSTRING_PROTOTYPE_STRVAR,
    GETTERDEF_PROTOTYPE_DEFINE, IMPL_DEFINITION_PROTOTYPE, METH_O_PROTOTYPE,
    METHODDEF_PROTOTYPE_DEFINE, METHODDEF_PROTOTYPE_IFNDEF, PARSER_BODY_FINALE,
    PARSER_BODY_PREAMBLE, PARSER_PROTOTYPE_DEF_CLASS, PARSER_PROTOTYPE_FASTCALL,
    PARSER_PROTOTYPE_FASTCALL_KEYWORDS, PARSER_PROTOTYPE_GETTER, PARSER_PROTOTYPE_KEYWORD,
    PARSER_PROTOTYPE_KEYWORD_INIT, PARSER_PROTOTYPE_NOARGS, PARSER_PROTOTYPE_SETTER,
    PARSER_PROTOTYPE_VARARGS, SETTERDEF_PROTOTYPE_DEFINE, Template, fill, indent_snippet,
    linear_format, wrap_declarations,
};

const NO_VARARG: &str = "PY_SSIZE_T_MAX";

/// Enumerates the argument tuples accepted by a grouped signature.
///
/// Every prefix of the reversed left group list is concatenated with the
/// required run and every prefix of the right group list. The result is
/// ordered by ascending arity, left-preferring combinations first within an
/// arity; callers that emit one switch arm per arity keep the first
/// combination of each length.
pub fn permute_optional_groups<T: Clone>(
    left: &[Vec<T>],
    required: &[T],
    right: &[Vec<T>],
) -> ClinicResult<Vec<Vec<T>>> {
    if required.is_empty() && !left.is_empty() {
        fail!("required is empty but left is not");
    }

    // prefixes of the reversed left list: (), (Lk), (Lk-1 + Lk), ...
    let mut left_prefixes: Vec<Vec<T>> = vec![Vec::new()];
    let mut accumulator: Vec<T> = Vec::new();
    for group in left.iter().rev() {
        let mut expanded = group.clone();
        expanded.extend(accumulator.iter().cloned());
        accumulator = expanded;
        left_prefixes.push(accumulator.clone());
    }

    let mut right_prefixes: Vec<Vec<T>> = vec![Vec::new()];
    let mut accumulator: Vec<T> = Vec::new();
    for group in right {
        accumulator.extend(group.iter().cloned());
        right_prefixes.push(accumulator.clone());
    }

    let mut combined: Vec<(usize, Vec<T>)> = Vec::new();
    for (right_len, r) in right_prefixes.iter().enumerate() {
        for l in &left_prefixes {
            let mut tuple = l.clone();
            tuple.extend(required.iter().cloned());
            tuple.extend(r.iter().cloned());
            combined.push((right_len, tuple));
        }
    }
    combined.sort_by_key(|(right_len, tuple)| (tuple.len(), *right_len));
    Ok(combined.into_iter().map(|(_, tuple)| tuple).collect())
}

#[must_use]
pub fn group_to_variable_name(group: i32) -> String {
    let adjective = if group < 0 { "left_" } else { "right_" };
    format!("group_{adjective}{}", group.abs())
}

/// Converts a docstring into the lines of a C string literal.
#[must_use]
pub fn docstring_for_c_string(docstring: &str) -> String {
    fn escape(line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        for c in line.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                c => out.push(c),
            }
        }
        out
    }

    let lines: Vec<&str> = docstring.split('\n').collect();
    let mut out: Vec<String> = lines
        .iter()
        .map(|line| format!("\"{}\\n\"", escape(line)))
        .collect();
    if lines.last() == Some(&templates::SIG_END_MARKER) {
        // a signature-only docstring still needs the blank line the
        // __text_signature__ getter expects
        out.push("\"\\n\"".to_owned());
    } else if let (Some(last_line), Some(slot)) = (lines.last(), out.last_mut()) {
        *slot = format!("\"{}\"", escape(last_line));
    }
    out.join("\n")
}

/// Wraps a message into a multi-line C string literal, continuation lines
/// indented under the call site.
fn wrapped_c_string_literal(message: &str, width: usize, subsequent_indent: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in message.split(' ') {
        let candidate_len = current.len() + word.len() + usize::from(!current.is_empty());
        if !current.is_empty() && candidate_len > width {
            current.push(' ');
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    let indent = " ".repeat(subsequent_indent);
    lines
        .iter()
        .map(|line| c_str_repr(line))
        .collect::<Vec<_>>()
        .join(&format!("\n{indent}"))
}

/// `'a', 'b' and 'c'` list formatting for warnings.
fn pprint_words(items: &[String]) -> String {
    match items.len() {
        0 => String::new(),
        1 => items[0].clone(),
        2 => format!("{} and {}", items[0], items[1]),
        _ => format!(
            "{} and {}",
            items[..items.len() - 1].join(", "),
            items[items.len() - 1]
        ),
    }
}

/// How the receiver binds at the parser and impl levels.
struct SelfInfo {
    name: String,
    parser_type: String,
    impl_type: String,
}

fn self_info(f: &Function) -> SelfInfo {
    let (default_type, default_name) = crate::converters::correct_name_for_self(f.kind, f.cls.is_some());
    let receiver = f
        .parameters
        .values()
        .next()
        .expect("functions always carry a receiver parameter");
    let impl_type = match &receiver.converter.kind {
        ConverterKind::SelfSlot { type_override } => type_override
            .clone()
            .unwrap_or_else(|| default_type.to_owned()),
        _ => default_type.to_owned(),
    };
    let parser_type = match f.kind {
        FunctionKind::MethodInit
        | FunctionKind::MethodNew
        | FunctionKind::StaticMethod
        | FunctionKind::ClassMethod => default_type.to_owned(),
        _ => impl_type.clone(),
    };
    let name = if receiver.converter.c_name.is_empty() {
        default_name.to_owned()
    } else {
        receiver.converter.c_name.clone()
    };
    SelfInfo {
        name,
        parser_type,
        impl_type,
    }
}

fn simple_declaration(c_type: &str, name: &str) -> String {
    if c_type.ends_with('*') {
        format!("{c_type}{name}")
    } else {
        format!("{c_type} {name}")
    }
}

/// Assembles prototype + preamble + fields + finale into a parser body,
/// remembering the fields for the constructor rewrap.
#[derive(Default)]
struct BodyBuilder {
    last_fields: Vec<String>,
}

impl BodyBuilder {
    fn build(&mut self, prototype: &str, fields: &[String], declarations: &str) -> ClinicResult<String> {
        self.last_fields = fields.to_vec();
        let mut parts: Vec<String> = vec![prototype.to_owned(), PARSER_BODY_PREAMBLE.to_owned()];
        parts.extend(fields.iter().cloned());
        parts.push(PARSER_BODY_FINALE.to_owned());
        linear_format(&parts.join("\n"), &[("parser_declarations", declarations)])
    }
}

fn argname(fmt: &str, i: usize) -> String {
    fmt.replace("%d", &i.to_string())
}

/// Generates the static `_PyArg_Parser` declaration with its keyword tuple.
///
/// For core builds the kwtuple is statically initialized; otherwise it is
/// created at runtime. The `{keywords_c}`/`{keywords_py}`/`{name}` holes are
/// filled by the final template pass.
fn declare_parser(
    parameters: &[Parameter],
    hasformat: bool,
    limited_capi: bool,
    clinic: &mut Clinic<'_>,
) -> String {
    let member = if hasformat {
        ".format = \"{format_units}:{name}\","
    } else {
        ".fname = \"{name}\","
    };
    let num_keywords = parameters
        .iter()
        .filter(|p| !p.is_positional_only() && !p.is_vararg())
        .count();

    let mut declarations = if limited_capi {
        "#define KWTUPLE NULL\n".to_owned()
    } else if num_keywords == 0 {
        "#if defined(Py_BUILD_CORE) && !defined(Py_BUILD_CORE_MODULE)\n\
         #  define KWTUPLE (PyObject *)&_Py_SINGLETON(tuple_empty)\n\
         #else\n\
         #  define KWTUPLE NULL\n\
         #endif\n"
            .to_owned()
    } else {
        let condition = "#if defined(Py_BUILD_CORE) && !defined(Py_BUILD_CORE_MODULE)";
        clinic.add_include("pycore_gc.h", "PyGC_Head", Some(condition.to_owned()));
        clinic.add_include("pycore_runtime.h", "_Py_ID()", Some(condition.to_owned()));
        format!(
            "#if defined(Py_BUILD_CORE) && !defined(Py_BUILD_CORE_MODULE)\n\
             \n\
             #define NUM_KEYWORDS {num_keywords}\n\
             static struct {{\n    \
                 PyGC_Head _this_is_not_used;\n    \
                 PyObject_VAR_HEAD\n    \
                 PyObject *ob_item[NUM_KEYWORDS];\n\
             }} _kwtuple = {{\n    \
                 .ob_base = PyVarObject_HEAD_INIT(&PyTuple_Type, NUM_KEYWORDS)\n    \
                 .ob_item = {{ {{keywords_py}} }},\n\
             }};\n\
             #undef NUM_KEYWORDS\n\
             #define KWTUPLE (&_kwtuple.ob_base.ob_base)\n\
             \n\
             #else  // !Py_BUILD_CORE\n\
             #  define KWTUPLE NULL\n\
             #endif  // !Py_BUILD_CORE\n"
        )
    };

    declarations.push_str(&format!(
        "static const char * const _keywords[] = {{{{keywords_c}} NULL}};\n\
         static _PyArg_Parser _parser = {{\n    \
             .keywords = _keywords,\n    \
             {member}\n    \
             .kwtuple = KWTUPLE,\n\
         }};\n\
         #undef KWTUPLE"
    ));
    declarations
}

fn compiler_deprecated_warning(f: &Function, parameters: &[Parameter]) -> Option<String> {
    let mut minversion: Option<VersionTuple> = None;
    for p in parameters {
        for version in [p.deprecated_positional, p.deprecated_keyword]
            .into_iter()
            .flatten()
        {
            if minversion.is_none_or(|min| min > version) {
                minversion = Some(version);
            }
        }
    }
    let (major, minor) = minversion?;
    let message = c_str_repr(&format!("Update the clinic input of '{}'.", f.full_name));
    Some(format!(
        "// Emit compiler warnings when we get to Python {major}.{minor}.\n\
         #if PY_VERSION_HEX >= 0x{major:02x}{minor:02x}00C0\n\
         #  error {message}\n\
         #elif PY_VERSION_HEX >= 0x{major:02x}{minor:02x}00A0\n\
         #  ifdef _MSC_VER\n\
         #    pragma message ({message})\n\
         #  else\n\
         #    warning {message}\n\
         #  endif\n\
         #endif"
    ))
}

fn deprecation_warning_block(condition: &str, errcheck: &str, message: &str) -> String {
    format!(
        "if ({condition}) {{{errcheck}\n    \
             if (PyErr_WarnEx(PyExc_DeprecationWarning,\n            \
                     {message}, 1))\n    \
             {{\n        \
                 goto exit;\n    \
             }}\n\
         }}"
    )
}

fn deprecate_positional_use(f: &mut Function, params: &[(usize, Parameter)]) -> String {
    let first_pos = params.first().map_or(0, |(i, _)| *i);
    let last_pos = params.last().map_or(0, |(i, _)| *i);

    let (condition, amount, plural) = if params.len() == 1 {
        (
            format!("nargs == {}", first_pos + 1),
            if first_pos > 0 {
                format!("{} ", first_pos + 1)
            } else {
                String::new()
            },
            "s",
        )
    } else {
        (
            format!("nargs > {first_pos} && nargs <= {}", last_pos + 1),
            if first_pos > 0 {
                format!("more than {first_pos} ")
            } else {
                String::new()
            },
            if first_pos == 1 { "" } else { "s" },
        )
    };
    let mut message = format!(
        "Passing {amount}positional argument{plural} to {}() is deprecated.",
        f.fulldisplayname()
    );

    // group runs of parameters sharing a deprecation version
    let mut index = 0;
    while index < params.len() {
        let version = params[index].1.deprecated_positional;
        let mut names = Vec::new();
        while index < params.len() && params[index].1.deprecated_positional == version {
            names.push(format!("'{}'", params[index].1.name));
            index += 1;
        }
        let (major, minor) = version.expect("grouped parameters carry a version");
        let pstr = pprint_words(&names);
        if names.len() == 1 {
            message.push_str(&format!(
                " Parameter {pstr} will become a keyword-only parameter in Python {major}.{minor}."
            ));
        } else {
            message.push_str(&format!(
                " Parameters {pstr} will become keyword-only parameters in Python {major}.{minor}."
            ));
        }
    }

    f.docstring.push_str(&format!("\n\nNote: {message}\n"));
    let literal = wrapped_c_string_literal(&message, 64, 20);
    indent_snippet(&deprecation_warning_block(&condition, "", &literal), 4)
}

fn deprecate_keyword_use(
    f: &mut Function,
    params: &[(usize, Parameter)],
    argname_fmt: Option<&str>,
    fastcall: bool,
    limited_capi: bool,
    clinic: &mut Clinic<'_>,
) -> String {
    let last_param = &params.last().expect("at least one deprecated keyword").1;

    let mut containscheck = "";
    let mut conditions: Vec<String> = Vec::new();
    for (i, p) in params {
        if p.is_optional() {
            if let Some(fmt) = argname_fmt {
                conditions.push(format!("nargs < {} && {}", i + 1, argname(fmt, *i)));
            } else if fastcall {
                conditions.push(format!(
                    "nargs < {} && PySequence_Contains(kwnames, &_Py_ID({}))",
                    i + 1,
                    p.name
                ));
                containscheck = "PySequence_Contains";
                clinic.add_include("pycore_runtime.h", "_Py_ID()", None);
            } else {
                conditions.push(format!(
                    "nargs < {} && PyDict_Contains(kwargs, &_Py_ID({}))",
                    i + 1,
                    p.name
                ));
                containscheck = "PyDict_Contains";
                clinic.add_include("pycore_runtime.h", "_Py_ID()", None);
            }
        } else {
            conditions = vec![format!("nargs < {}", i + 1)];
        }
    }
    let mut condition = conditions.join(") || (");
    if conditions.len() > 1 {
        condition = format!("(({condition}))");
    }
    if last_param.is_optional() {
        condition = match (fastcall, limited_capi) {
            (true, true) => format!("kwnames && PyTuple_Size(kwnames) && {condition}"),
            (true, false) => format!("kwnames && PyTuple_GET_SIZE(kwnames) && {condition}"),
            (false, true) => format!("kwargs && PyDict_Size(kwargs) && {condition}"),
            (false, false) => format!("kwargs && PyDict_GET_SIZE(kwargs) && {condition}"),
        };
    }

    let names: Vec<String> = params.iter().map(|(_, p)| format!("'{}'", p.name)).collect();
    let plural = if params.len() == 1 { "" } else { "s" };
    let mut message = format!(
        "Passing keyword argument{plural} {} to {}() is deprecated.",
        pprint_words(&names),
        f.fulldisplayname()
    );

    let mut index = 0;
    while index < params.len() {
        let version = params[index].1.deprecated_keyword;
        let mut group_names = Vec::new();
        while index < params.len() && params[index].1.deprecated_keyword == version {
            group_names.push(format!("'{}'", params[index].1.name));
            index += 1;
        }
        let (major, minor) = version.expect("grouped parameters carry a version");
        let plural = if group_names.len() == 1 { "" } else { "s" };
        message.push_str(&format!(
            " Parameter{plural} {} will become positional-only in Python {major}.{minor}.",
            pprint_words(&group_names)
        ));
    }

    let errcheck = if containscheck.is_empty() {
        String::new()
    } else {
        format!(
            "\n    if (PyErr_Occurred()) {{ // {containscheck}() above can fail\n        goto exit;\n    }}"
        )
    };
    if argname_fmt.is_some() {
        f.docstring.push_str(&format!("\n\nNote: {message}\n"));
    }
    let literal = wrapped_c_string_literal(&message, 64, 20);
    indent_snippet(&deprecation_warning_block(&condition, &errcheck, &literal), 4)
}

fn render_option_group_parsing(
    f: &Function,
    parameters: &[Parameter],
    limited_capi: bool,
) -> ClinicResult<String> {
    let mut left: Vec<Vec<&Parameter>> = Vec::new();
    let mut right: Vec<Vec<&Parameter>> = Vec::new();
    let mut required: Vec<&Parameter> = Vec::new();
    let mut last_group: Option<i32> = None;

    for p in parameters {
        let group_id = p.group;
        if last_group != Some(group_id) {
            last_group = Some(group_id);
            if group_id < 0 {
                left.push(Vec::new());
            } else if group_id > 0 {
                right.push(Vec::new());
            }
        }
        if group_id < 0 {
            left.last_mut().expect("group pushed above").push(p);
        } else if group_id == 0 {
            required.push(p);
        } else {
            right.last_mut().expect("group pushed above").push(p);
        }
    }

    let nargs = if limited_capi {
        "PyTuple_Size(args)"
    } else {
        "PyTuple_GET_SIZE(args)"
    };
    let mut out = format!("switch ({nargs}) {{\n");
    let mut count_min = usize::MAX;
    let mut count_max = 0;
    let mut seen_counts: Vec<usize> = Vec::new();
    for subset in permute_optional_groups(&left, &required, &right)? {
        let count = subset.len();
        if seen_counts.contains(&count) {
            continue;
        }
        seen_counts.push(count);
        count_min = count_min.min(count);
        count_max = count_max.max(count);

        if count == 0 {
            out.push_str("    case 0:\n        break;\n");
            continue;
        }

        let format_units: String = subset.iter().map(|p| p.converter.format_unit()).collect();
        let parse_arguments: Vec<String> = subset
            .iter()
            .map(|p| format!("&{}", p.converter.parser_name()))
            .collect();
        let mut group_ids: Vec<i32> = subset.iter().map(|p| p.group).filter(|&g| g != 0).collect();
        group_ids.dedup();
        let group_booleans: Vec<String> = group_ids
            .iter()
            .map(|&g| format!("{} = 1;", group_to_variable_name(g)))
            .collect();

        let arm = r#"    case {count}:
        if (!PyArg_ParseTuple(args, "{format_units}:{name}", {parse_arguments})) {
            goto exit;
        }
        {group_booleans}
        break;
"#;
        let arm = linear_format(arm, &[("group_booleans", &group_booleans.join("\n"))])?;
        let arm = fill(
            &arm,
            &[
                ("count", count.to_string().as_str()),
                ("name", f.displayname()),
                ("format_units", &format_units),
                ("parse_arguments", &parse_arguments.join(", ")),
            ],
        );
        out.push_str(&arm);
        if !arm.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str("    default:\n");
    out.push_str(&format!(
        "        PyErr_SetString(PyExc_TypeError, \"{} requires {count_min} to {count_max} arguments\");\n",
        f.full_name
    ));
    out.push_str("        goto exit;\n");
    out.push('}');
    Ok(out)
}

/// The ten fragment templates chosen for one function, before hole filling.
struct Templates {
    docstring_prototype: String,
    docstring_definition: String,
    impl_prototype: String,
    methoddef_define: String,
    parser_prototype: String,
    parser_definition: String,
    impl_definition: String,
    cpp_if: String,
    cpp_endif: String,
    methoddef_ifndef: String,
}

impl Templates {
    fn get(&self, fragment: Fragment) -> &str {
        match fragment {
            Fragment::CppIf => &self.cpp_if,
            Fragment::DocstringPrototype => &self.docstring_prototype,
            Fragment::DocstringDefinition => &self.docstring_definition,
            Fragment::MethoddefDefine => &self.methoddef_define,
            Fragment::ImplPrototype => &self.impl_prototype,
            Fragment::ParserPrototype => &self.parser_prototype,
            Fragment::ParserDefinition => &self.parser_definition,
            Fragment::CppEndif => &self.cpp_endif,
            Fragment::MethoddefIfndef => &self.methoddef_ifndef,
            Fragment::ImplDefinition => &self.impl_definition,
        }
    }
}

struct Shape {
    pos_only: usize,
    min_pos: usize,
    max_pos: usize,
    min_kw_only: usize,
    pseudo_args: usize,
    vararg: Option<usize>,
}

fn classify(parameters: &[Parameter]) -> Shape {
    let mut shape = Shape {
        pos_only: 0,
        min_pos: 0,
        max_pos: 0,
        min_kw_only: 0,
        pseudo_args: 0,
        vararg: None,
    };
    for (index, p) in parameters.iter().enumerate() {
        let i = index + 1;
        if p.is_keyword_only() {
            if !p.is_optional() {
                shape.min_kw_only = i - shape.max_pos;
            }
        } else if p.is_vararg() {
            shape.pseudo_args += 1;
            shape.vararg = Some(i - 1);
        } else {
            if shape.vararg.is_none() {
                shape.max_pos = i;
            }
            if p.is_positional_only() {
                shape.pos_only = i;
            }
            if !p.is_optional() {
                shape.min_pos = i;
            }
        }
    }
    shape
}

/// Everything a branch hands to [`finish_templates`].
struct BranchResult {
    flags: String,
    parser_prototype: String,
    parser_definition: String,
    impl_prototype: Option<String>,
    declarations: String,
    body_fields: Vec<String>,
}

fn output_templates(clinic: &mut Clinic<'_>, f: &mut Function) -> ClinicResult<Templates> {
    let all: Vec<Parameter> = f.parameters.values().cloned().collect();
    assert!(!all.is_empty(), "functions always carry a receiver parameter");
    let mut parameters: Vec<Parameter> = all[1..].to_vec();
    let mut requires_defining_class = false;
    if parameters
        .first()
        .is_some_and(|p| p.converter.is_defining_class())
    {
        requires_defining_class = true;
        parameters.remove(0);
    }

    if f.critical_section {
        clinic.add_include("pycore_critical_section.h", "Py_BEGIN_CRITICAL_SECTION()", None);
    }
    let has_option_groups = parameters.first().is_some_and(|p| p.group != 0)
        || parameters.last().is_some_and(|p| p.group != 0);
    let simple_return = f.return_converter.c_type() == "PyObject *" && !f.critical_section;
    let new_or_init = f.kind.new_or_init();

    let Shape {
        pos_only,
        min_pos,
        max_pos,
        min_kw_only,
        pseudo_args,
        vararg,
    } = classify(&parameters);

    let meth_o = parameters.len() == 1
        && parameters[0].is_positional_only()
        && !parameters[0].is_optional()
        && !requires_defining_class
        && !new_or_init;

    let mut return_value_declaration = "PyObject *return_value = NULL;".to_owned();
    let mut methoddef_define = METHODDEF_PROTOTYPE_DEFINE.to_owned();
    let docstring_prototype: String;
    let docstring_definition: String;
    if new_or_init && f.docstring.is_empty() {
        docstring_prototype = String::new();
        docstring_definition = String::new();
    } else if f.kind == FunctionKind::Getter {
        methoddef_define = GETTERDEF_PROTOTYPE_DEFINE.to_owned();
        docstring_prototype = String::new();
        docstring_definition = if f.docstring.is_empty() {
            String::new()
        } else {
            GETSET_DOCSTRING_PROTOTYPE_STRVAR.to_owned()
        };
    } else if f.kind == FunctionKind::Setter {
        if !f.docstring.is_empty() {
            fail!("docstrings are only supported for @getter, not @setter");
        }
        return_value_declaration = "int {return_value};".to_owned();
        methoddef_define = SETTERDEF_PROTOTYPE_DEFINE.to_owned();
        docstring_prototype = String::new();
        docstring_definition = String::new();
    } else {
        docstring_prototype = DOCSTRING_PROTOTYPE_VAR.to_owned();
        docstring_definition = DOCSTRING_PROTOTYPE_STRVAR.to_owned();
    }
    let mut impl_definition = IMPL_DEFINITION_PROTOTYPE.to_owned();

    let mut fastcall = !new_or_init;
    let mut limited_capi = clinic.limited_capi;
    if limited_capi
        && (pseudo_args > 0
            || (parameters.iter().any(Parameter::is_optional)
                && parameters
                    .iter()
                    .any(|p| p.is_keyword_only() && !p.is_optional()))
            || parameters.iter().any(|p| p.converter.broken_limited_capi()))
    {
        log::warn!("Function {} cannot use limited C API", f.full_name);
        limited_capi = false;
    }

    let mut body = BodyBuilder::default();

    let branch: BranchResult = if parameters.is_empty() {
        let flags: String;
        let parser_prototype: String;
        let parser_code: Vec<String>;
        match f.kind {
            FunctionKind::Getter => {
                flags = String::new();
                parser_prototype = PARSER_PROTOTYPE_GETTER.to_owned();
                parser_code = Vec::new();
            }
            FunctionKind::Setter => {
                flags = String::new();
                parser_prototype = PARSER_PROTOTYPE_SETTER.to_owned();
                parser_code = Vec::new();
            }
            _ if !requires_defining_class => {
                flags = "METH_NOARGS".to_owned();
                parser_prototype = PARSER_PROTOTYPE_NOARGS.to_owned();
                parser_code = Vec::new();
            }
            _ => {
                flags = "METH_METHOD|METH_FASTCALL|METH_KEYWORDS".to_owned();
                parser_prototype = PARSER_PROTOTYPE_DEF_CLASS.to_owned();
                let return_error = if simple_return { "return NULL;" } else { "goto exit;" };
                parser_code = vec![indent_snippet(
                    &format!(
                        "if (nargs || (kwnames && PyTuple_GET_SIZE(kwnames))) {{\n    \
                             PyErr_SetString(PyExc_TypeError, \"{{name}}() takes no arguments\");\n    \
                             {return_error}\n\
                         }}"
                    ),
                    4,
                )];
            }
        }

        let parser_definition = if simple_return && !matches!(f.kind, FunctionKind::Setter) {
            let mut lines = vec![parser_prototype.clone(), "{".to_owned()];
            lines.extend(parser_code.iter().cloned());
            lines.push("    return {c_basename}_impl({impl_arguments});".to_owned());
            lines.push("}".to_owned());
            lines.join("\n")
        } else {
            body.build(&parser_prototype, &parser_code, "")?
        };
        BranchResult {
            flags,
            parser_prototype,
            parser_definition,
            impl_prototype: None,
            declarations: String::new(),
            body_fields: body.last_fields.clone(),
        }
    } else if meth_o {
        let flags = "METH_O".to_owned();

        let is_plain_object = matches!(
            &parameters[0].converter.kind,
            ConverterKind::Object {
                type_name: None,
                subclass_of: None,
            }
        );
        if is_plain_object && parameters[0].converter.format_unit() == "O" {
            if simple_return {
                // maps perfectly to METH_O: skip the parser function and
                // register the impl directly
                impl_definition = METH_O_PROTOTYPE.to_owned();
                BranchResult {
                    flags,
                    parser_prototype: String::new(),
                    parser_definition: String::new(),
                    impl_prototype: Some(String::new()),
                    declarations: String::new(),
                    body_fields: Vec::new(),
                }
            } else {
                // borrow impl_parameters for the parser prototype
                let parser_prototype = METH_O_PROTOTYPE.to_owned();
                let parser_definition = body.build(&parser_prototype, &[], "")?;
                BranchResult {
                    flags,
                    parser_prototype,
                    parser_definition,
                    impl_prototype: None,
                    declarations: String::new(),
                    body_fields: body.last_fields.clone(),
                }
            }
        } else {
            let mut argname_var = "arg".to_owned();
            if parameters[0].name == argname_var {
                argname_var.push('_');
            }
            let parser_prototype = format!(
                "static PyObject *\n{{c_basename}}({{self_type}}{{self_name}}, PyObject *{argname_var})"
            );
            let displayname = parameters[0].display_name(1);
            let parsearg = parameters[0]
                .converter
                .parse_arg(&argname_var, &displayname, limited_capi)
                .unwrap_or_else(|| {
                    format!(
                        "if (!PyArg_Parse({argname_var}, \"{{format_units}}:{{name}}\", {{parse_arguments}})) {{\n    \
                             goto exit;\n\
                         }}"
                    )
                });
            let parser_definition =
                body.build(&parser_prototype, &[indent_snippet(&parsearg, 4)], "")?;
            BranchResult {
                flags,
                parser_prototype,
                parser_definition,
                impl_prototype: None,
                declarations: String::new(),
                body_fields: body.last_fields.clone(),
            }
        }
    } else if has_option_groups {
        // positional parameters with option groups: a switch over the tuple
        // arity with one legacy parse call per arm
        let flags = "METH_VARARGS".to_owned();
        let parser_prototype = PARSER_PROTOTYPE_VARARGS.to_owned();
        let parser_definition = body.build(
            &parser_prototype,
            &["    {option_group_parsing}".to_owned()],
            "",
        )?;
        BranchResult {
            flags,
            parser_prototype,
            parser_definition,
            impl_prototype: None,
            declarations: String::new(),
            body_fields: body.last_fields.clone(),
        }
    } else if !requires_defining_class && pos_only == parameters.len() - pseudo_args {
        // all positional-only: one bounds check plus inline conversions
        let nargs_expr: String;
        let argname_fmt: &str;
        if fastcall {
            nargs_expr = "nargs".to_owned();
            argname_fmt = "args[%d]";
        } else if limited_capi {
            nargs_expr = "PyTuple_Size(args)".to_owned();
            argname_fmt = "PyTuple_GetItem(args, %d)";
        } else {
            nargs_expr = "PyTuple_GET_SIZE(args)".to_owned();
            argname_fmt = "PyTuple_GET_ITEM(args, %d)";
        }

        let left_args = format!("{nargs_expr} - {max_pos}");
        let max_args: String = if vararg.is_some() {
            NO_VARARG.to_owned()
        } else {
            max_pos.to_string()
        };
        let mut nargs_name = nargs_expr;

        let mut code: Vec<String> = Vec::new();
        if limited_capi {
            if nargs_name != "nargs" {
                code.push(indent_snippet(&format!("Py_ssize_t nargs = {nargs_name};"), 4));
                nargs_name = "nargs".to_owned();
            }
            if min_pos.to_string() == max_args {
                let plural = if min_pos == 1 { "" } else { "s" };
                code.push(indent_snippet(
                    &format!(
                        "if ({nargs_name} != {min_pos}) {{\n    \
                             PyErr_Format(PyExc_TypeError, \"{{name}} expected {min_pos} argument{plural}, got %zd\", {nargs_name});\n    \
                             goto exit;\n\
                         }}"
                    ),
                    4,
                ));
            } else {
                if min_pos > 0 {
                    let plural = if min_pos == 1 { "" } else { "s" };
                    code.push(indent_snippet(
                        &format!(
                            "if ({nargs_name} < {min_pos}) {{\n    \
                                 PyErr_Format(PyExc_TypeError, \"{{name}} expected at least {min_pos} argument{plural}, got %zd\", {nargs_name});\n    \
                                 goto exit;\n\
                             }}"
                        ),
                        4,
                    ));
                }
                if max_args != NO_VARARG {
                    let max_num: usize = max_args.parse().expect("max_args is numeric here");
                    let plural = if max_num == 1 { "" } else { "s" };
                    code.push(indent_snippet(
                        &format!(
                            "if ({nargs_name} > {max_args}) {{\n    \
                                 PyErr_Format(PyExc_TypeError, \"{{name}} expected at most {max_args} argument{plural}, got %zd\", {nargs_name});\n    \
                                 goto exit;\n\
                             }}"
                        ),
                        4,
                    ));
                }
            }
        } else {
            clinic.add_include("pycore_modsupport.h", "_PyArg_CheckPositional()", None);
            code.push(indent_snippet(
                &format!(
                    "if (!_PyArg_CheckPositional(\"{{name}}\", {nargs_name}, {min_pos}, {max_args})) {{\n    \
                         goto exit;\n\
                     }}"
                ),
                4,
            ));
        }

        let mut inline_possible = true;
        let mut has_optional = false;
        for (i, p) in parameters.iter().enumerate() {
            if p.is_vararg() {
                let parser_name = p.converter.parser_name();
                if fastcall {
                    code.push(indent_snippet(
                        &format!(
                            "{parser_name} = PyTuple_New({left_args});\n\
                             if (!{parser_name}) {{\n    \
                                 goto exit;\n\
                             }}\n\
                             for (Py_ssize_t i = 0; i < {left_args}; ++i) {{\n    \
                                 PyTuple_SET_ITEM({parser_name}, i, Py_NewRef(args[{max_pos} + i]));\n\
                             }}"
                        ),
                        4,
                    ));
                } else {
                    code.push(indent_snippet(
                        &format!("{parser_name} = PyTuple_GetSlice(args, {max_pos}, -1);"),
                        4,
                    ));
                }
                continue;
            }

            let displayname = p.display_name(i + 1);
            let arg = argname(argname_fmt, i);
            let Some(parsearg) = p.converter.parse_arg(&arg, &displayname, limited_capi) else {
                inline_possible = false;
                break;
            };
            if has_optional || p.is_optional() {
                has_optional = true;
                code.push(indent_snippet(
                    &format!("if ({nargs_name} < {}) {{\n    goto skip_optional;\n}}", i + 1),
                    4,
                ));
            }
            code.push(indent_snippet(&parsearg, 4));
        }

        let (flags, parser_prototype, parser_code) = if inline_possible {
            if has_optional {
                code.push("skip_optional:".to_owned());
            }
            let flags = if fastcall { "METH_FASTCALL" } else { "METH_VARARGS" };
            let prototype = if fastcall {
                PARSER_PROTOTYPE_FASTCALL
            } else {
                PARSER_PROTOTYPE_VARARGS
            };
            (flags.to_owned(), prototype.to_owned(), code)
        } else {
            // a converter only supports legacy parsing: one format call
            if limited_capi {
                fastcall = false;
            }
            if fastcall {
                clinic.add_include("pycore_modsupport.h", "_PyArg_ParseStack()", None);
                let code = vec![indent_snippet(
                    "if (!_PyArg_ParseStack(args, nargs, \"{format_units}:{name}\",\n    {parse_arguments})) {\n    goto exit;\n}",
                    4,
                )];
                ("METH_FASTCALL".to_owned(), PARSER_PROTOTYPE_FASTCALL.to_owned(), code)
            } else {
                let code = vec![indent_snippet(
                    "if (!PyArg_ParseTuple(args, \"{format_units}:{name}\",\n    {parse_arguments})) {\n    goto exit;\n}",
                    4,
                )];
                ("METH_VARARGS".to_owned(), PARSER_PROTOTYPE_VARARGS.to_owned(), code)
            }
        };
        let parser_definition = body.build(&parser_prototype, &parser_code, "")?;
        BranchResult {
            flags,
            parser_prototype,
            parser_definition,
            impl_prototype: None,
            declarations: String::new(),
            body_fields: body.last_fields.clone(),
        }
    } else {
        // the general case: keyword parsing through the argument unpacker
        let mut deprecated_positionals: Vec<(usize, Parameter)> = Vec::new();
        let mut deprecated_keywords: Vec<(usize, Parameter)> = Vec::new();
        for (i, p) in parameters.iter().enumerate() {
            if p.deprecated_positional.is_some() {
                deprecated_positionals.push((i, p.clone()));
            }
            if p.deprecated_keyword.is_some() {
                deprecated_keywords.push((i, p.clone()));
            }
        }

        let converters_len = parameters.len();
        let has_optional_kw =
            pos_only.max(min_pos) + min_kw_only < converters_len - usize::from(vararg.is_some());

        let mut declarations = String::new();
        let mut argname_fmt = "";
        let mut parser_code: Option<Vec<String>> = None;
        if limited_capi {
            fastcall = false;
        } else {
            let (unpacker, extra_args, nargs_expr) = if let Some(vararg_pos) = vararg {
                clinic.add_include("pycore_modsupport.h", "_PyArg_UnpackKeywordsWithVararg()", None);
                (
                    "_PyArg_UnpackKeywordsWithVararg",
                    format!("{min_pos}, {max_pos}, {min_kw_only}, {vararg_pos}"),
                    if max_pos > 0 {
                        format!("Py_MIN(nargs, {max_pos})")
                    } else {
                        "0".to_owned()
                    },
                )
            } else {
                clinic.add_include("pycore_modsupport.h", "_PyArg_UnpackKeywords()", None);
                (
                    "_PyArg_UnpackKeywords",
                    format!("{min_pos}, {max_pos}, {min_kw_only}"),
                    "nargs".to_owned(),
                )
            };

            if fastcall {
                argname_fmt = "args[%d]";
                declarations = declare_parser(&parameters, false, clinic.limited_capi, clinic);
                declarations.push_str(&format!("\nPyObject *argsbuf[{converters_len}];"));
                if has_optional_kw {
                    declarations.push_str(&format!(
                        "\nPy_ssize_t noptargs = {nargs_expr} + (kwnames ? PyTuple_GET_SIZE(kwnames) : 0) - {};",
                        min_pos + min_kw_only
                    ));
                }
                parser_code = Some(vec![indent_snippet(
                    &format!(
                        "args = {unpacker}(args, nargs, NULL, kwnames, &_parser, {extra_args}, argsbuf);\n\
                         if (!args) {{\n    \
                             goto exit;\n\
                         }}"
                    ),
                    4,
                )]);
            } else {
                argname_fmt = "fastargs[%d]";
                declarations = declare_parser(&parameters, false, clinic.limited_capi, clinic);
                declarations.push_str(&format!("\nPyObject *argsbuf[{converters_len}];"));
                declarations.push_str("\nPyObject * const *fastargs;");
                declarations.push_str("\nPy_ssize_t nargs = PyTuple_GET_SIZE(args);");
                if has_optional_kw {
                    declarations.push_str(&format!(
                        "\nPy_ssize_t noptargs = {nargs_expr} + (kwargs ? PyDict_GET_SIZE(kwargs) : 0) - {};",
                        min_pos + min_kw_only
                    ));
                }
                parser_code = Some(vec![indent_snippet(
                    &format!(
                        "fastargs = {unpacker}(_PyTuple_CAST(args)->ob_item, nargs, kwargs, NULL, &_parser, {extra_args}, argsbuf);\n\
                         if (!fastargs) {{\n    \
                             goto exit;\n\
                         }}"
                    ),
                    4,
                )]);
            }
        }

        let mut flags = if fastcall {
            "METH_FASTCALL|METH_KEYWORDS".to_owned()
        } else {
            "METH_VARARGS|METH_KEYWORDS".to_owned()
        };
        let mut parser_prototype = if fastcall {
            PARSER_PROTOTYPE_FASTCALL_KEYWORDS.to_owned()
        } else {
            PARSER_PROTOTYPE_KEYWORD.to_owned()
        };
        if requires_defining_class {
            flags = format!("METH_METHOD|{flags}");
            parser_prototype = PARSER_PROTOTYPE_DEF_CLASS.to_owned();
        }

        if let Some(mut code) = parser_code.take() {
            if !deprecated_keywords.is_empty() {
                let warning = deprecate_keyword_use(
                    f,
                    &deprecated_keywords,
                    Some(argname_fmt),
                    fastcall,
                    limited_capi,
                    clinic,
                );
                code.push(warning);
            }

            let mut inline_possible = true;
            let mut add_label: Option<&str> = None;
            for (i, p) in parameters.iter().enumerate() {
                if p.converter.is_defining_class() {
                    fail!("defining_class should be the first parameter (after self)");
                }
                let displayname = p.display_name(i + 1);
                let Some(parsearg) =
                    p.converter
                        .parse_arg(&argname(argname_fmt, i), &displayname, limited_capi)
                else {
                    inline_possible = false;
                    break;
                };
                if let Some(label) = add_label
                    && (i == pos_only || i == max_pos)
                {
                    code.push(format!("{label}:"));
                    add_label = None;
                }
                if !p.is_optional() {
                    code.push(indent_snippet(&parsearg, 4));
                } else if i < pos_only {
                    add_label = Some("skip_optional_posonly");
                    code.push(indent_snippet(
                        &format!("if (nargs < {}) {{\n    goto skip_optional_posonly;\n}}", i + 1),
                        4,
                    ));
                    if has_optional_kw {
                        code.push(indent_snippet("noptargs--;", 4));
                    }
                    code.push(indent_snippet(&parsearg, 4));
                } else {
                    let (label, first_opt) = if i < max_pos {
                        ("skip_optional_pos", pos_only.max(min_pos))
                    } else {
                        let mut first = max_pos + min_kw_only;
                        if vararg.is_some() {
                            first += 1;
                        }
                        ("skip_optional_kwonly", first)
                    };
                    if i == first_opt {
                        add_label = Some(label);
                        code.push(indent_snippet(
                            &format!("if (!noptargs) {{\n    goto {label};\n}}"),
                            4,
                        ));
                    }
                    if i + 1 == parameters.len() {
                        code.push(indent_snippet(&parsearg, 4));
                    } else {
                        add_label = Some(label);
                        code.push(indent_snippet(
                            &format!("if ({}) {{", argname(argname_fmt, i)),
                            4,
                        ));
                        code.push(indent_snippet(&parsearg, 8));
                        code.push(indent_snippet(
                            &format!("    if (!--noptargs) {{\n        goto {label};\n    }}\n}}"),
                            4,
                        ));
                    }
                }
            }
            if inline_possible {
                if let Some(label) = add_label {
                    code.push(format!("{label}:"));
                }
                parser_code = Some(code);
            }
        }

        let parser_code = match parser_code {
            Some(code) => code,
            None => {
                // fall back to one keyword format call
                declarations = declare_parser(&parameters, true, limited_capi, clinic);
                let mut code = if limited_capi {
                    assert!(!fastcall, "the limited API never fastcalls");
                    log::warn!(
                        "Function {} uses PyArg_ParseTupleAndKeywords under the limited C API",
                        f.full_name
                    );
                    flags = if requires_defining_class {
                        "METH_METHOD|METH_VARARGS|METH_KEYWORDS".to_owned()
                    } else {
                        "METH_VARARGS|METH_KEYWORDS".to_owned()
                    };
                    parser_prototype = PARSER_PROTOTYPE_KEYWORD.to_owned();
                    declarations = "static char *_keywords[] = {{keywords_c} NULL};".to_owned();
                    if !deprecated_positionals.is_empty() || !deprecated_keywords.is_empty() {
                        declarations.push_str("\nPy_ssize_t nargs = PyTuple_Size(args);");
                    }
                    vec![indent_snippet(
                        "if (!PyArg_ParseTupleAndKeywords(args, kwargs, \"{format_units}:{name}\", _keywords,\n    {parse_arguments}))\n    goto exit;",
                        4,
                    )]
                } else if fastcall {
                    clinic.add_include("pycore_modsupport.h", "_PyArg_ParseStackAndKeywords()", None);
                    vec![indent_snippet(
                        "if (!_PyArg_ParseStackAndKeywords(args, nargs, kwnames, &_parser{parse_arguments_comma}\n    {parse_arguments})) {\n    goto exit;\n}",
                        4,
                    )]
                } else {
                    clinic.add_include(
                        "pycore_modsupport.h",
                        "_PyArg_ParseTupleAndKeywordsFast()",
                        None,
                    );
                    if !deprecated_positionals.is_empty() || !deprecated_keywords.is_empty() {
                        declarations.push_str("\nPy_ssize_t nargs = PyTuple_GET_SIZE(args);");
                    }
                    vec![indent_snippet(
                        "if (!_PyArg_ParseTupleAndKeywordsFast(args, kwargs, &_parser,\n    {parse_arguments})) {\n    goto exit;\n}",
                        4,
                    )]
                };
                if !deprecated_keywords.is_empty() {
                    let warning =
                        deprecate_keyword_use(f, &deprecated_keywords, None, fastcall, limited_capi, clinic);
                    code.push(warning);
                }
                code
            }
        };

        let parser_code = if deprecated_positionals.is_empty() {
            parser_code
        } else {
            // the warning runs before any argument parsing
            let warning = deprecate_positional_use(f, &deprecated_positionals);
            let mut with_warning = vec![warning];
            with_warning.extend(parser_code);
            with_warning
        };

        let parser_definition = body.build(&parser_prototype, &parser_code, &declarations)?;
        BranchResult {
            flags,
            parser_prototype,
            parser_definition,
            impl_prototype: None,
            declarations,
            body_fields: body.last_fields.clone(),
        }
    };

    // propagate converter include requests
    for p in &parameters {
        for include in p.converter.includes() {
            clinic.add_include(&include.filename, &include.reason, include.condition);
        }
    }

    let BranchResult {
        mut flags,
        mut parser_prototype,
        mut parser_definition,
        impl_prototype,
        declarations,
        body_fields,
    } = branch;

    if new_or_init {
        methoddef_define = String::new();

        if f.kind == FunctionKind::MethodNew {
            parser_prototype = PARSER_PROTOTYPE_KEYWORD.to_owned();
        } else {
            return_value_declaration = "int return_value = -1;".to_owned();
            parser_prototype = PARSER_PROTOTYPE_KEYWORD_INIT.to_owned();
        }

        let mut fields = body_fields;
        let parses_positional = !flags.contains("METH_NOARGS");
        let parses_keywords = flags.contains("METH_KEYWORDS");
        assert!(
            !parses_keywords || parses_positional,
            "keyword parsing implies positional parsing"
        );
        if requires_defining_class {
            fail!("Slot methods cannot access their defining class.");
        }

        let mut ctor_declarations = declarations;
        if !parses_keywords {
            ctor_declarations = "{base_type_ptr}".to_owned();
            clinic.add_include("pycore_modsupport.h", "_PyArg_NoKeywords()", None);
            fields.insert(
                0,
                indent_snippet(
                    "if ({self_type_check}!_PyArg_NoKeywords(\"{name}\", kwargs)) {\n    goto exit;\n}",
                    4,
                ),
            );
            if !parses_positional {
                clinic.add_include("pycore_modsupport.h", "_PyArg_NoPositional()", None);
                fields.insert(
                    0,
                    indent_snippet(
                        "if ({self_type_check}!_PyArg_NoPositional(\"{name}\", args)) {\n    goto exit;\n}",
                        4,
                    ),
                );
            }
        }

        parser_definition = body.build(&parser_prototype, &fields, &ctor_declarations)?;
    }

    let mut methoddef_cast_end = "";
    let methoddef_cast = if matches!(flags.as_str(), "METH_NOARGS" | "METH_O" | "METH_VARARGS") {
        "(PyCFunction)"
    } else if f.kind == FunctionKind::Getter {
        ""
    } else if limited_capi {
        "(PyCFunction)(void(*)(void))"
    } else {
        methoddef_cast_end = ")";
        "_PyCFunction_CAST("
    };

    if let Some(kind_flags) = f.methoddef_flags()
        && !kind_flags.is_empty()
    {
        flags.push('|');
        flags.push_str(&kind_flags);
    }

    methoddef_define = fill(
        &methoddef_define,
        &[
            ("methoddef_flags", flags.as_str()),
            ("methoddef_cast", methoddef_cast),
            ("methoddef_cast_end", methoddef_cast_end),
        ],
    );

    let mut methoddef_ifndef = String::new();
    let conditional = clinic.cpp.condition();
    let (cpp_if, cpp_endif) = if conditional.is_empty() {
        (String::new(), String::new())
    } else {
        if !methoddef_define.is_empty() && !clinic.ifndef_symbols.contains(&f.full_name) {
            clinic.ifndef_symbols.insert(f.full_name.clone());
            methoddef_ifndef = METHODDEF_PROTOTYPE_IFNDEF.to_owned();
        }
        (
            format!("#if {conditional}"),
            format!("#endif /* {conditional} */"),
        )
    };

    if !parser_prototype.is_empty() {
        parser_prototype.push(';');
    }

    let mut impl_prototype = impl_prototype.unwrap_or_else(|| impl_definition.clone());
    if !impl_prototype.is_empty() {
        impl_prototype.push(';');
    }

    parser_definition = fill(
        &parser_definition,
        &[("return_value_declaration", return_value_declaration.as_str())],
    );

    if let Some(warning) = compiler_deprecated_warning(f, &parameters) {
        parser_definition = format!("{warning}\n\n{parser_definition}");
    }

    let pad = |value: String| {
        if value.is_empty() {
            value
        } else {
            format!("\n{value}\n")
        }
    };

    Ok(Templates {
        docstring_prototype: pad(docstring_prototype),
        docstring_definition: pad(docstring_definition),
        impl_prototype: pad(impl_prototype),
        methoddef_define: pad(methoddef_define),
        parser_prototype: pad(parser_prototype),
        parser_definition: pad(parser_definition),
        impl_definition: pad(impl_definition),
        cpp_if: pad(cpp_if),
        cpp_endif: pad(cpp_endif),
        methoddef_ifndef: pad(methoddef_ifndef),
    })
}

/// Renders one function into the routed destination buffers and returns the
/// text destined for the block itself.
pub(crate) fn render_function(clinic: &mut Clinic<'_>, f: &mut Function) -> ClinicResult<String> {
    let mut data = RenderData::new();
    let templates_set = output_templates(clinic, f)?;

    let all_params: Vec<Parameter> = f.parameters.values().cloned().collect();
    let info = self_info(f);

    if f.critical_section {
        let (lock, unlock) = match f.target_critical_section.len() {
            0 => (
                "Py_BEGIN_CRITICAL_SECTION({self_name});",
                "Py_END_CRITICAL_SECTION();",
            ),
            1 => (
                "Py_BEGIN_CRITICAL_SECTION({target_critical_section});",
                "Py_END_CRITICAL_SECTION();",
            ),
            _ => (
                "Py_BEGIN_CRITICAL_SECTION2({target_critical_section});",
                "Py_END_CRITICAL_SECTION2();",
            ),
        };
        data.lock.push(lock.to_owned());
        data.unlock.push(unlock.to_owned());
    }

    let selfless = &all_params[1..];
    let positional = selfless.last().is_some_and(Parameter::is_positional_only);
    let mut has_option_groups = false;
    let mut last_group = 0;

    for p in &all_params {
        if p.is_vararg() {
            data.cleanup
                .push(format!("Py_XDECREF({});", p.converter.parser_name()));
        }

        let group = p.group;
        if last_group != group {
            last_group = group;
            if group != 0 {
                let group_name = group_to_variable_name(group);
                data.impl_arguments.push(group_name.clone());
                data.declarations.push(format!("int {group_name} = 0;"));
                data.impl_parameters.push(format!("int {group_name}"));
                has_option_groups = true;
            }
        }

        if p.converter.is_self() {
            if f.kind != FunctionKind::StaticMethod {
                data.impl_parameters
                    .push(simple_declaration(&info.impl_type, &info.name));
                if info.impl_type == info.parser_type {
                    data.impl_arguments.push(info.name.clone());
                } else {
                    data.impl_arguments
                        .push(format!("({}){}", info.impl_type.trim_end(), info.name));
                }
            }
        } else if p.converter.is_defining_class() {
            data.impl_parameters
                .push(format!("PyTypeObject *{}", p.converter.parser_name()));
            data.impl_arguments.push(p.converter.parser_name());
        } else {
            render_parameter(p, &mut data);
        }
    }

    if has_option_groups && !positional {
        fail!(
            "You cannot use optional groups ('[' and ']') unless all parameters are positional-only ('/')."
        );
    }

    // METH_O with a custom return converter borrows impl_parameters for the
    // parser, so the lone parameter must not also be declared as a local
    if templates_set.methoddef_define.contains("METH_O")
        && templates_set.parser_prototype.contains("{impl_parameters}")
        && !data.declarations.is_empty()
    {
        data.declarations.remove(0);
    }

    let mut template_dict: Vec<(String, String)> = Vec::new();

    template_dict.push(("full_name".to_owned(), f.full_name.clone()));
    template_dict.push(("name".to_owned(), f.displayname().to_owned()));
    if matches!(f.kind, FunctionKind::Getter | FunctionKind::Setter) {
        template_dict.push(("getset_name".to_owned(), f.c_basename.to_uppercase()));
        template_dict.push(("getset_basename".to_owned(), f.c_basename.clone()));
        if f.kind == FunctionKind::Getter {
            template_dict.push(("c_basename".to_owned(), format!("{}_get", f.c_basename)));
        } else {
            template_dict.push(("c_basename".to_owned(), format!("{}_set", f.c_basename)));
            // the implicit setter value parameter
            data.impl_parameters.push("PyObject *value".to_owned());
            data.impl_arguments.push("value".to_owned());
        }
    } else {
        template_dict.push((
            "methoddef_name".to_owned(),
            format!("{}_METHODDEF", f.c_basename.to_uppercase()),
        ));
        template_dict.push(("c_basename".to_owned(), f.c_basename.clone()));
    }

    template_dict.push(("docstring".to_owned(), docstring_for_c_string(&f.docstring)));
    template_dict.push(("self_name".to_owned(), info.name.clone()));
    template_dict.push(("self_type".to_owned(), info.parser_type.clone()));
    template_dict.push((
        "target_critical_section".to_owned(),
        f.target_critical_section.join(", "),
    ));

    let mut self_type_check = String::new();
    let mut base_type_ptr = String::new();
    if f.kind.new_or_init()
        && let Some(cls_id) = f.cls
    {
        let cls = clinic.class(cls_id);
        if !cls.typedef.is_empty() {
            let slot = if f.kind == FunctionKind::MethodNew { "tp_new" } else { "tp_init" };
            let name = &info.name;
            self_type_check =
                format!("({name} == base_tp || {name}->{slot} == base_tp->{slot}) &&\n        ");
            base_type_ptr = format!("PyTypeObject *base_tp = {};", cls.type_object);
        }
    }
    template_dict.push(("self_type_check".to_owned(), self_type_check));
    template_dict.push(("base_type_ptr".to_owned(), base_type_ptr));

    let defining_class_name = all_params
        .iter()
        .find(|p| p.converter.is_defining_class())
        .map_or_else(|| "cls".to_owned(), |p| p.converter.parser_name());
    template_dict.push(("defining_class_name".to_owned(), defining_class_name));

    if !matches!(f.kind, FunctionKind::Setter | FunctionKind::MethodInit) {
        f.return_converter.render(&mut data);
    }
    template_dict.push((
        "impl_return_type".to_owned(),
        f.return_converter.c_type().to_owned(),
    ));

    template_dict.push(("declarations".to_owned(), data.declarations.join("\n")));
    template_dict.push(("initializers".to_owned(), data.initializers.join("\n\n")));
    template_dict.push(("modifications".to_owned(), data.modifications.join("\n\n")));
    template_dict.push((
        "keywords_c".to_owned(),
        data.keywords
            .iter()
            .map(|k| format!("\"{k}\","))
            .collect::<Vec<_>>()
            .join(" "),
    ));
    template_dict.push((
        "keywords_py".to_owned(),
        data.keywords
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| format!("&_Py_ID({k}),"))
            .collect::<Vec<_>>()
            .join(" "),
    ));
    template_dict.push(("format_units".to_owned(), data.format_units.concat()));
    template_dict.push(("parse_arguments".to_owned(), data.parse_arguments.join(", ")));
    template_dict.push((
        "parse_arguments_comma".to_owned(),
        if data.parse_arguments.is_empty() {
            String::new()
        } else {
            ",".to_owned()
        },
    ));
    template_dict.push(("impl_parameters".to_owned(), data.impl_parameters.join(", ")));
    template_dict.push(("impl_arguments".to_owned(), data.impl_arguments.join(", ")));
    template_dict.push((
        "return_conversion".to_owned(),
        data.return_conversion.concat().trim_end().to_owned(),
    ));
    template_dict.push((
        "post_parsing".to_owned(),
        data.post_parsing.concat().trim_end().to_owned(),
    ));
    template_dict.push(("cleanup".to_owned(), data.cleanup.concat()));
    template_dict.push(("return_value".to_owned(), data.return_value.clone()));
    template_dict.push(("lock".to_owned(), data.lock.join("\n")));
    template_dict.push(("unlock".to_owned(), data.unlock.join("\n")));

    let option_group_parsing = if has_option_groups {
        Some(render_option_group_parsing(f, selfless, clinic.limited_capi)?)
    } else {
        None
    };

    let lookup = |dict: &[(String, String)], key: &str| -> String {
        dict.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    for fragment in Fragment::ALL {
        let mut text = templates_set.get(fragment).to_owned();
        if let Some(switch) = &option_group_parsing {
            text = linear_format(&text, &[("option_group_parsing", switch)])?;
        }
        let declarations = lookup(&template_dict, "declarations");
        let return_conversion = lookup(&template_dict, "return_conversion");
        let initializers = lookup(&template_dict, "initializers");
        let modifications = lookup(&template_dict, "modifications");
        let post_parsing = lookup(&template_dict, "post_parsing");
        let cleanup = lookup(&template_dict, "cleanup");
        let lock = lookup(&template_dict, "lock");
        let unlock = lookup(&template_dict, "unlock");
        text = linear_format(
            &text,
            &[
                ("declarations", declarations.as_str()),
                ("return_conversion", return_conversion.as_str()),
                ("initializers", initializers.as_str()),
                ("modifications", modifications.as_str()),
                ("post_parsing", post_parsing.as_str()),
                ("cleanup", cleanup.as_str()),
                ("lock", lock.as_str()),
                ("unlock", unlock.as_str()),
            ],
        )?;

        let exit_label = if text.contains("goto exit;") { "exit:" } else { "" };
        text = linear_format(&text, &[("exit_label", exit_label)])?;

        let template = Template::parse(&text);
        let mut text = template.fill(|name| {
            template_dict
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        });

        if matches!(fragment, Fragment::ImplPrototype | Fragment::ImplDefinition) {
            text = wrap_declarations(&text);
        }

        if !clinic.line_prefix.is_empty() {
            let prefix = clinic.line_prefix.clone();
            text = templates::indent_all_lines(&text, &prefix);
        }
        if !clinic.line_suffix.is_empty() {
            let suffix = clinic.line_suffix.clone();
            text = templates::suffix_all_lines(&text, &suffix);
        }

        clinic.append_fragment(fragment, &text)?;
    }

    Ok(clinic.dump_block_destination())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::test_support;

    #[test]
    fn permutation_enumerates_left_first_in_ascending_arity() {
        let left = vec![vec!['A'], vec!['B']];
        let required = vec!['C'];
        let right = vec![vec!['D'], vec!['E']];
        let permutations = permute_optional_groups(&left, &required, &right).unwrap();
        let rendered: Vec<String> = permutations
            .iter()
            .map(|tuple| tuple.iter().collect::<String>())
            .collect();
        assert_eq!(
            rendered,
            vec!["C", "BC", "CD", "ABC", "BCD", "CDE", "ABCD", "BCDE", "ABCDE"],
        );
    }

    #[test]
    fn permutation_rejects_left_groups_without_required() {
        let left = vec![vec!['A']];
        let required: Vec<char> = vec![];
        let right: Vec<Vec<char>> = vec![];
        assert!(permute_optional_groups(&left, &required, &right).is_err());
    }

    #[test]
    fn group_variable_names_carry_side_and_depth() {
        assert_eq!(group_to_variable_name(-2), "group_left_2");
        assert_eq!(group_to_variable_name(1), "group_right_1");
    }

    #[test]
    fn docstrings_become_c_string_lines() {
        let rendered = docstring_for_c_string("sum\n--\n\nAdd.");
        assert_eq!(rendered, "\"sum\\n\"\n\"--\\n\"\n\"\\n\"\n\"Add.\"");
    }

    #[test]
    fn signature_only_docstrings_get_a_blank_line() {
        let rendered = docstring_for_c_string("f($module, /)\n--");
        assert!(rendered.ends_with("\"\\n\""));
    }

    #[test]
    fn compiler_banner_uses_version_hex() {
        let mut f = test_support::minimal_function("mod.f");
        let p = test_support::int_parameter("x", Some((3, 14)));
        f.parameters.insert("x".to_owned(), p);
        let params: Vec<Parameter> = f.parameters.values().skip(1).cloned().collect();
        let banner = compiler_deprecated_warning(&f, &params).unwrap();
        assert!(banner.contains("#if PY_VERSION_HEX >= 0x030e00C0"), "{banner}");
        assert!(banner.contains("#elif PY_VERSION_HEX >= 0x030e00A0"), "{banner}");
    }

    #[test]
    fn wrapped_literals_split_long_messages() {
        let message = "Passing keyword arguments 'a' and 'b' to mod.f() is deprecated. \
                       Parameters 'a' and 'b' will become positional-only in Python 3.14.";
        let wrapped = wrapped_c_string_literal(message, 64, 20);
        assert!(wrapped.contains("\n                    \""), "{wrapped}");
    }
}
