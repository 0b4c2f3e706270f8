//! The converter contract: typed fragment producers consumed by the
//! generator.
//!
//! A converter knows how to turn one value at the calling boundary into a
//! typed C variable. Each parameter carries one; the generator asks it for a
//! parse snippet and lets it append declarations, impl parameters, format
//! units and friends to the shared [`RenderData`].
//!
//! Variant behavior lives in [`ConverterKind`] and a handful of `match`es
//! rather than a type hierarchy; the set of converters is closed.

use crate::model::{FunctionKind, Include, Parameter};

/// The C type and variable name the receiver binds to, by function kind.
#[must_use]
pub fn correct_name_for_self(kind: FunctionKind, has_cls: bool) -> (&'static str, &'static str) {
    match kind {
        FunctionKind::Callable
        | FunctionKind::MethodInit
        | FunctionKind::Getter
        | FunctionKind::Setter => {
            if has_cls {
                ("PyObject *", "self")
            } else {
                ("PyObject *", "module")
            }
        }
        FunctionKind::StaticMethod => ("void *", "null"),
        FunctionKind::ClassMethod | FunctionKind::MethodNew => ("PyTypeObject *", "type"),
    }
}

/// Shared buffers that converters append to while a function renders.
#[derive(Debug, Default)]
pub struct RenderData {
    pub declarations: Vec<String>,
    pub initializers: Vec<String>,
    pub modifications: Vec<String>,
    pub keywords: Vec<String>,
    pub format_units: Vec<String>,
    pub parse_arguments: Vec<String>,
    pub impl_parameters: Vec<String>,
    pub impl_arguments: Vec<String>,
    pub return_conversion: Vec<String>,
    pub post_parsing: Vec<String>,
    pub cleanup: Vec<String>,
    pub lock: Vec<String>,
    pub unlock: Vec<String>,
    /// The variable the impl call assigns to; a return converter that
    /// declares `_return_value` redirects this.
    pub return_value: String,
}

impl RenderData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            return_value: "return_value".to_owned(),
            ..Self::default()
        }
    }
}

/// The closed set of converter behaviors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConverterKind {
    /// The receiver slot; always the first parameter.
    SelfSlot { type_override: Option<String> },
    /// The optional second parameter receiving the defining type object.
    DefiningClass,
    Object {
        type_name: Option<String>,
        subclass_of: Option<String>,
    },
    Bool { accept_int: bool },
    Int,
    UnsignedInt { bitwise: bool },
    Long,
    UnsignedLong { bitwise: bool },
    PySsizeT,
    Float,
    Double,
    Str,
}

/// One converter instance, bound to a parameter name and C identifier.
#[derive(Debug, Clone)]
pub struct CConverter {
    pub kind: ConverterKind,
    /// The Python-surface parameter name.
    pub name: String,
    /// The C identifier the value lands in (may be overridden with `as`).
    pub c_name: String,
    pub py_default: Option<String>,
    pub c_default: Option<String>,
    pub show_in_signature: bool,
    /// Overrides the name shown in the docstring signature (the receiver
    /// uses this for `module`/`type`).
    pub signature_name: Option<String>,
}

const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while",
];

impl CConverter {
    pub fn new(kind: ConverterKind, name: impl Into<String>, c_name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            c_name: c_name.into(),
            py_default: None,
            c_default: None,
            show_in_signature: true,
            signature_name: None,
        }
    }

    #[must_use]
    pub fn is_self(&self) -> bool {
        matches!(self.kind, ConverterKind::SelfSlot { .. })
    }

    #[must_use]
    pub fn is_defining_class(&self) -> bool {
        matches!(self.kind, ConverterKind::DefiningClass)
    }

    /// The C variable name, suffixed when it would collide with a C keyword.
    #[must_use]
    pub fn parser_name(&self) -> String {
        if C_KEYWORDS.contains(&self.c_name.as_str()) {
            format!("{}_value", self.c_name)
        } else {
            self.c_name.clone()
        }
    }

    /// The C type of the converted variable, with its trailing `*` when the
    /// type is a pointer.
    #[must_use]
    pub fn c_type(&self) -> String {
        match &self.kind {
            ConverterKind::SelfSlot { type_override } => type_override
                .clone()
                .unwrap_or_else(|| "PyObject *".to_owned()),
            ConverterKind::DefiningClass => "PyTypeObject *".to_owned(),
            ConverterKind::Object { type_name, .. } => type_name
                .clone()
                .unwrap_or_else(|| "PyObject *".to_owned()),
            ConverterKind::Bool { .. } | ConverterKind::Int => "int".to_owned(),
            ConverterKind::UnsignedInt { .. } => "unsigned int".to_owned(),
            ConverterKind::Long => "long".to_owned(),
            ConverterKind::UnsignedLong { .. } => "unsigned long".to_owned(),
            ConverterKind::PySsizeT => "Py_ssize_t".to_owned(),
            ConverterKind::Float => "float".to_owned(),
            ConverterKind::Double => "double".to_owned(),
            ConverterKind::Str => "const char *".to_owned(),
        }
    }

    /// The format unit for legacy varargs-style parsing, or `""` when the
    /// converter has no legacy spelling.
    #[must_use]
    pub fn format_unit(&self) -> &'static str {
        match &self.kind {
            ConverterKind::SelfSlot { .. } | ConverterKind::DefiningClass => "",
            ConverterKind::Object { subclass_of, .. } => {
                if subclass_of.is_some() {
                    "O!"
                } else {
                    "O"
                }
            }
            ConverterKind::Bool { accept_int } => {
                if *accept_int {
                    "i"
                } else {
                    "p"
                }
            }
            ConverterKind::Int => "i",
            ConverterKind::UnsignedInt { bitwise } => {
                if *bitwise {
                    "I"
                } else {
                    ""
                }
            }
            ConverterKind::Long => "l",
            ConverterKind::UnsignedLong { bitwise } => {
                if *bitwise {
                    "k"
                } else {
                    ""
                }
            }
            ConverterKind::PySsizeT => "n",
            ConverterKind::Float => "f",
            ConverterKind::Double => "d",
            ConverterKind::Str => "s",
        }
    }

    /// Whether this converter cannot generate correct code under the
    /// limited C API.
    #[must_use]
    pub fn broken_limited_capi(&self) -> bool {
        matches!(
            self.kind,
            ConverterKind::Object {
                subclass_of: Some(_),
                ..
            }
        )
    }

    /// Includes the generated parse snippet depends on.
    #[must_use]
    pub fn includes(&self) -> Vec<Include> {
        match self.kind {
            ConverterKind::PySsizeT => vec![Include::new(
                "pycore_abstract.h",
                "_PyNumber_Index()",
                None,
            )],
            _ => Vec::new(),
        }
    }

    /// `{type} {name}` with pointer spacing handled.
    #[must_use]
    pub fn simple_declaration(&self, name: &str) -> String {
        let c_type = self.c_type();
        if c_type.ends_with('*') {
            format!("{c_type}{name}")
        } else {
            format!("{c_type} {name}")
        }
    }

    /// The C statement declaring this variable inside the parser function.
    #[must_use]
    pub fn declaration(&self, param: &Parameter) -> String {
        let mut decl = self.simple_declaration(&self.parser_name());
        if let Some(default) = &self.c_default
            && (param.is_optional() || param.is_vararg())
        {
            decl.push_str(" = ");
            decl.push_str(default);
        }
        decl.push(';');
        decl
    }

    /// Generates the snippet converting one input value, jumping to `exit`
    /// on failure. Returns `None` when only legacy format-unit parsing can
    /// handle this converter (the caller falls back to a `PyArg_Parse`
    /// family call).
    ///
    /// Snippets keep a `{name}` hole for the function's display name; the
    /// final template pass fills it.
    #[must_use]
    pub fn parse_arg(&self, argname: &str, displayname: &str, limited: bool) -> Option<String> {
        let var = self.parser_name();
        match &self.kind {
            ConverterKind::SelfSlot { .. } | ConverterKind::DefiningClass => None,
            ConverterKind::Object {
                type_name,
                subclass_of,
            } => {
                let cast = type_name
                    .as_ref()
                    .map(|t| format!("({})", t.trim_end()))
                    .unwrap_or_default();
                if let Some(subclass) = subclass_of {
                    if limited {
                        return None;
                    }
                    return Some(format!(
                        r#"if (!PyObject_TypeCheck({argname}, {subclass})) {{
    _PyArg_BadArgument("{{name}}", {displayname}, ({subclass})->tp_name, {argname});
    goto exit;
}}
{var} = {cast}{argname};"#
                    ));
                }
                Some(format!("{var} = {cast}{argname};"))
            }
            ConverterKind::Bool { .. } => Some(format!(
                r"{var} = PyObject_IsTrue({argname});
if ({var} < 0) {{
    goto exit;
}}"
            )),
            ConverterKind::Int => Some(format!(
                r"{var} = PyLong_AsInt({argname});
if ({var} == -1 && PyErr_Occurred()) {{
    goto exit;
}}"
            )),
            ConverterKind::UnsignedInt { bitwise: true } => Some(format!(
                r#"if (!PyLong_Check({argname})) {{
    _PyArg_BadArgument("{{name}}", {displayname}, "int", {argname});
    goto exit;
}}
{var} = (unsigned int)PyLong_AsUnsignedLongMask({argname});"#
            )),
            ConverterKind::UnsignedInt { bitwise: false } => Some(format!(
                r"{var} = (unsigned int)PyLong_AsUnsignedLong({argname});
if ({var} == (unsigned int)-1 && PyErr_Occurred()) {{
    goto exit;
}}"
            )),
            ConverterKind::Long => Some(format!(
                r"{var} = PyLong_AsLong({argname});
if ({var} == -1 && PyErr_Occurred()) {{
    goto exit;
}}"
            )),
            ConverterKind::UnsignedLong { bitwise: true } => Some(format!(
                r#"if (!PyLong_Check({argname})) {{
    _PyArg_BadArgument("{{name}}", {displayname}, "int", {argname});
    goto exit;
}}
{var} = PyLong_AsUnsignedLongMask({argname});"#
            )),
            ConverterKind::UnsignedLong { bitwise: false } => Some(format!(
                r"{var} = PyLong_AsUnsignedLong({argname});
if ({var} == (unsigned long)-1 && PyErr_Occurred()) {{
    goto exit;
}}"
            )),
            ConverterKind::PySsizeT => {
                let index_call = if limited { "PyNumber_Index" } else { "_PyNumber_Index" };
                Some(format!(
                    r"{{
    Py_ssize_t ival = -1;
    PyObject *iobj = {index_call}({argname});
    if (iobj != NULL) {{
        ival = PyLong_AsSsize_t(iobj);
        Py_DECREF(iobj);
    }}
    if (ival == -1 && PyErr_Occurred()) {{
        goto exit;
    }}
    {var} = ival;
}}"
                ))
            }
            ConverterKind::Float => Some(format!(
                r"if (PyFloat_CheckExact({argname})) {{
    {var} = (float) (PyFloat_AS_DOUBLE({argname}));
}}
else
{{
    {var} = (float) PyFloat_AsDouble({argname});
    if ({var} == -1.0 && PyErr_Occurred()) {{
        goto exit;
    }}
}}"
            )),
            ConverterKind::Double => Some(format!(
                r"if (PyFloat_CheckExact({argname})) {{
    {var} = PyFloat_AS_DOUBLE({argname});
}}
else
{{
    {var} = PyFloat_AsDouble({argname});
    if ({var} == -1.0 && PyErr_Occurred()) {{
        goto exit;
    }}
}}"
            )),
            ConverterKind::Str => {
                if limited {
                    return None;
                }
                Some(format!(
                    r#"if (!PyUnicode_Check({argname})) {{
    _PyArg_BadArgument("{{name}}", {displayname}, "str", {argname});
    goto exit;
}}
Py_ssize_t {var}_length;
{var} = PyUnicode_AsUTF8AndSize({argname}, &{var}_length);
if ({var} == NULL) {{
    goto exit;
}}
if (strlen({var}) != (size_t){var}_length) {{
    PyErr_SetString(PyExc_ValueError, "embedded null character");
    goto exit;
}}"#
                ))
            }
        }
    }
}

/// Appends the standard per-parameter fragments for a regular converter.
///
/// The receiver and defining-class parameters have bespoke handling in the
/// generator and never come through here.
pub fn render_parameter(param: &Parameter, data: &mut RenderData) {
    let conv = &param.converter;
    data.declarations.push(conv.declaration(param));
    if param.is_positional_only() {
        data.keywords.push(String::new());
    } else if !param.is_vararg() {
        data.keywords.push(param.name.clone());
    }
    if param.is_optional() && !data.format_units.iter().any(|u| u == "|") {
        data.format_units.push("|".to_owned());
    }
    if param.is_keyword_only() && !data.format_units.iter().any(|u| u == "$") {
        data.format_units.push("$".to_owned());
    }
    if !param.is_vararg() {
        data.format_units.push(conv.format_unit().to_owned());
        data.parse_arguments.push(format!("&{}", conv.parser_name()));
    }
    data.impl_parameters
        .push(conv.simple_declaration(&conv.parser_name()));
    data.impl_arguments.push(conv.parser_name());
}

/// Turns the impl's C return value back into an object at the boundary.
///
/// The default converter passes a `PyObject *` straight through; the others
/// declare a typed `_return_value`, check the error sentinel, and box it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnConverter {
    #[default]
    Object,
    Bool,
    Int,
    Long,
    UnsignedLong,
    PySsizeT,
    SizeT,
    Double,
    Float,
}

impl ReturnConverter {
    /// The impl function's C return type.
    #[must_use]
    pub fn c_type(self) -> &'static str {
        match self {
            Self::Object => "PyObject *",
            Self::Bool | Self::Int => "int",
            Self::Long => "long",
            Self::UnsignedLong => "unsigned long",
            Self::PySsizeT => "Py_ssize_t",
            Self::SizeT => "size_t",
            Self::Double => "double",
            Self::Float => "float",
        }
    }

    fn declare(self, data: &mut RenderData) {
        let c_type = self.c_type();
        data.declarations.push(format!("{c_type} _return_value;"));
        data.return_value = "_return_value".to_owned();
    }

    fn err_occurred_if(expr: &str, data: &mut RenderData) {
        data.return_conversion
            .push(format!("if (({expr}) && PyErr_Occurred()) {{\n    goto exit;\n}}\n"));
    }

    /// Appends the declaration and conversion fragments.
    pub fn render(self, data: &mut RenderData) {
        match self {
            Self::Object => {}
            Self::Bool => {
                self.declare(data);
                Self::err_occurred_if("_return_value == -1", data);
                data.return_conversion
                    .push("return_value = PyBool_FromLong((long)_return_value);\n".to_owned());
            }
            Self::Int => {
                self.declare(data);
                Self::err_occurred_if("_return_value == -1", data);
                data.return_conversion
                    .push("return_value = PyLong_FromLong((long)_return_value);\n".to_owned());
            }
            Self::Long => {
                self.declare(data);
                Self::err_occurred_if("_return_value == -1", data);
                data.return_conversion
                    .push("return_value = PyLong_FromLong(_return_value);\n".to_owned());
            }
            Self::UnsignedLong => {
                self.declare(data);
                Self::err_occurred_if("_return_value == (unsigned long)-1", data);
                data.return_conversion
                    .push("return_value = PyLong_FromUnsignedLong(_return_value);\n".to_owned());
            }
            Self::PySsizeT => {
                self.declare(data);
                Self::err_occurred_if("_return_value == -1", data);
                data.return_conversion
                    .push("return_value = PyLong_FromSsize_t(_return_value);\n".to_owned());
            }
            Self::SizeT => {
                self.declare(data);
                Self::err_occurred_if("_return_value == (size_t)-1", data);
                data.return_conversion
                    .push("return_value = PyLong_FromSize_t(_return_value);\n".to_owned());
            }
            Self::Double => {
                self.declare(data);
                Self::err_occurred_if("_return_value == -1.0", data);
                data.return_conversion
                    .push("return_value = PyFloat_FromDouble(_return_value);\n".to_owned());
            }
            Self::Float => {
                self.declare(data);
                Self::err_occurred_if("_return_value == -1.0", data);
                data.return_conversion
                    .push("return_value = PyFloat_FromDouble((double)_return_value);\n".to_owned());
            }
        }
    }
}
