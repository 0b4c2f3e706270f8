//! The function model built by the DSL parser and consumed by the generator.
//!
//! Modules, classes, and functions form a cyclic graph (parameters point at
//! their function, functions at their class/module). The graph is stored as
//! one arena per category on the orchestrator with integer handles, so a
//! back-reference is a handle plus a lookup, never ownership.

use indexmap::IndexMap;

use crate::converters::{CConverter, ReturnConverter};
use crate::expr::Literal;

/// A `major.minor` interpreter version attached to deprecation markers.
pub type VersionTuple = (u32, u32);

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub usize);
    };
}

arena_id!(ModuleId);
arena_id!(ClassId);
arena_id!(FunctionId);

/// A named namespace owning child modules, classes, and functions.
///
/// The orchestrator itself acts as the root module; `parent` is `None` for
/// modules declared at the top level.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub parent: Option<ModuleId>,
    pub modules: IndexMap<String, ModuleId>,
    pub classes: IndexMap<String, ClassId>,
    pub functions: Vec<FunctionId>,
}

impl Module {
    pub fn new(name: impl Into<String>, parent: Option<ModuleId>) -> Self {
        Self {
            name: name.into(),
            parent,
            modules: IndexMap::new(),
            classes: IndexMap::new(),
            functions: Vec::new(),
        }
    }
}

/// A named type within a module (or nested in another class).
///
/// The C typedef and type-object expression are opaque strings; the core
/// only splices them into generated code.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub module: Option<ModuleId>,
    pub parent_class: Option<ClassId>,
    pub typedef: String,
    pub type_object: String,
    pub classes: IndexMap<String, ClassId>,
    pub functions: Vec<FunctionId>,
}

/// What kind of callable a function is at the C level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FunctionKind {
    Callable,
    StaticMethod,
    ClassMethod,
    MethodInit,
    MethodNew,
    Getter,
    Setter,
}

impl FunctionKind {
    #[must_use]
    pub fn new_or_init(self) -> bool {
        matches!(self, Self::MethodInit | Self::MethodNew)
    }

    /// Lowercase display name used in diagnostics (`@getter methods ...`).
    #[must_use]
    pub fn display(self) -> &'static str {
        match self {
            Self::Callable => "callable",
            Self::StaticMethod => "staticmethod",
            Self::ClassMethod => "classmethod",
            Self::MethodInit => "__init__",
            Self::MethodNew => "__new__",
            Self::Getter => "getter",
            Self::Setter => "setter",
        }
    }
}

/// How a parameter may be passed at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ParameterKind {
    PositionalOnly,
    PositionalOrKeyword,
    KeywordOnly,
    VarPositional,
}

/// The runtime default of a parameter.
///
/// `Unspecified` means the parameter is required. `Unknown` means a default
/// exists but its value cannot be evaluated here (a named constant or an
/// expression backed by an explicit C default). `Null` is the C `NULL`
/// sentinel, rendered as `<unrepresentable>` on the Python surface.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DefaultValue {
    Unspecified,
    Unknown,
    Null,
    Value(Literal),
}

impl DefaultValue {
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Self::Unspecified)
    }
}

/// One declared parameter of a function.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub converter: CConverter,
    pub default: DefaultValue,
    /// Optional-group id: 0 = required, negative = groups left of the
    /// required run, positive = groups to the right.
    pub group: i32,
    pub deprecated_positional: Option<VersionTuple>,
    pub deprecated_keyword: Option<VersionTuple>,
    pub docstring: String,
    /// Bracket nesting used by the docstring signature formatter.
    pub right_bracket_count: i32,
}

impl Parameter {
    #[must_use]
    pub fn is_positional_only(&self) -> bool {
        self.kind == ParameterKind::PositionalOnly
    }

    #[must_use]
    pub fn is_keyword_only(&self) -> bool {
        self.kind == ParameterKind::KeywordOnly
    }

    #[must_use]
    pub fn is_vararg(&self) -> bool {
        self.kind == ParameterKind::VarPositional
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        !self.is_vararg() && !self.default.is_unspecified()
    }

    /// The quoted display name used in generated error messages.
    #[must_use]
    pub fn display_name(&self, index: usize) -> String {
        if self.is_keyword_only() {
            format!("\"argument '{}'\"", self.name)
        } else {
            format!("\"argument {index}\"")
        }
    }

    /// Renders the per-parameter docstring chunk for `{parameters}`.
    #[must_use]
    pub fn render_docstring(&self) -> String {
        let mut lines = vec![format!("  {}", self.name)];
        for line in self.docstring.split('\n') {
            lines.push(format!("    {line}"));
        }
        lines.join("\n").trim_end().to_owned()
    }
}

/// The central record: one extension function declared by a directive block.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub full_name: String,
    /// The name shown in signatures and runtime error messages; the class
    /// name for `__init__`/`__new__`, the function name otherwise.
    pub display_name: String,
    pub module: Option<ModuleId>,
    pub cls: Option<ClassId>,
    pub c_basename: String,
    /// Insertion order is the canonical argument order; the first entry is
    /// always the receiver.
    pub parameters: IndexMap<String, Parameter>,
    pub return_converter: ReturnConverter,
    pub kind: FunctionKind,
    pub coexist: bool,
    pub critical_section: bool,
    pub target_critical_section: Vec<String>,
    pub docstring: String,
    /// Set when the signature is not machine-parseable (optional groups).
    pub docstring_only: bool,
}

impl Function {
    /// The short display name.
    #[must_use]
    pub fn displayname(&self) -> &str {
        &self.display_name
    }

    /// The dotted display name; constructors drop their `__init__`/`__new__`
    /// component so messages read as the class being called.
    #[must_use]
    pub fn fulldisplayname(&self) -> &str {
        if self.kind.new_or_init() {
            self.full_name
                .rsplit_once('.')
                .map_or(self.full_name.as_str(), |(head, _)| head)
        } else {
            &self.full_name
        }
    }

    /// Extra `METH_*` flags implied by the function kind.
    ///
    /// Returns `None` for `__init__`/`__new__`, which have no method-table
    /// entry of their own.
    #[must_use]
    pub fn methoddef_flags(&self) -> Option<String> {
        if self.kind.new_or_init() {
            return None;
        }
        let mut flags = Vec::new();
        match self.kind {
            FunctionKind::ClassMethod => flags.push("METH_CLASS"),
            FunctionKind::StaticMethod => flags.push("METH_STATIC"),
            _ => {}
        }
        if self.coexist {
            flags.push("METH_COEXIST");
        }
        Some(flags.join("|"))
    }
}

/// A requested `#include` for the generated code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Include {
    pub filename: String,
    pub reason: String,
    /// C preprocessor condition (e.g. `#if defined(X)`), or `None` when the
    /// include is unconditional.
    pub condition: Option<String>,
}

impl Include {
    pub fn new(filename: impl Into<String>, reason: impl Into<String>, condition: Option<String>) -> Self {
        Self {
            filename: filename.into(),
            reason: reason.into(),
            condition,
        }
    }

    /// Stable ordering: unconditional includes first, then by condition and
    /// filename.
    #[must_use]
    pub fn sort_key(&self) -> (String, String) {
        (
            self.condition.clone().unwrap_or_default(),
            self.filename.clone(),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use indexmap::IndexMap;

    use super::*;
    use crate::converters::{CConverter, ConverterKind, ReturnConverter};

    /// A module-level function with just its receiver, for generator tests.
    pub fn minimal_function(full_name: &str) -> Function {
        let receiver = Parameter {
            name: "module".to_owned(),
            kind: ParameterKind::PositionalOnly,
            converter: CConverter::new(
                ConverterKind::SelfSlot { type_override: None },
                "module",
                "module",
            ),
            default: DefaultValue::Unspecified,
            group: 0,
            deprecated_positional: None,
            deprecated_keyword: None,
            docstring: String::new(),
            right_bracket_count: 0,
        };
        let mut parameters = IndexMap::new();
        parameters.insert("module".to_owned(), receiver);
        Function {
            name: full_name.rsplit('.').next().unwrap_or(full_name).to_owned(),
            full_name: full_name.to_owned(),
            display_name: full_name.rsplit('.').next().unwrap_or(full_name).to_owned(),
            module: None,
            cls: None,
            c_basename: full_name.replace('.', "_"),
            parameters,
            return_converter: ReturnConverter::Object,
            kind: FunctionKind::Callable,
            coexist: false,
            critical_section: false,
            target_critical_section: Vec::new(),
            docstring: String::new(),
            docstring_only: false,
        }
    }

    pub fn int_parameter(name: &str, deprecated_positional: Option<VersionTuple>) -> Parameter {
        Parameter {
            name: name.to_owned(),
            kind: ParameterKind::PositionalOrKeyword,
            converter: CConverter::new(ConverterKind::Int, name, name),
            default: DefaultValue::Unspecified,
            group: 0,
            deprecated_positional,
            deprecated_keyword: None,
            docstring: String::new(),
            right_bracket_count: 0,
        }
    }
}

/// Special method names that cannot be processed: their C-level slots do not
/// take the calling conventions this tool generates.
pub const UNSUPPORTED_SPECIAL_METHODS: &[&str] = &[
    "__abs__", "__add__", "__and__", "__call__", "__delitem__", "__divmod__", "__eq__",
    "__float__", "__floordiv__", "__ge__", "__getattr__", "__getattribute__", "__getitem__",
    "__gt__", "__hash__", "__iadd__", "__iand__", "__ifloordiv__", "__ilshift__", "__imatmul__",
    "__imod__", "__imul__", "__index__", "__int__", "__invert__", "__ior__", "__ipow__",
    "__irshift__", "__isub__", "__iter__", "__itruediv__", "__ixor__", "__le__", "__len__",
    "__lshift__", "__lt__", "__matmul__", "__mod__", "__mul__", "__neg__", "__next__", "__or__",
    "__pos__", "__pow__", "__radd__", "__rand__", "__rdivmod__", "__repr__", "__rfloordiv__",
    "__rlshift__", "__rmatmul__", "__rmod__", "__rmul__", "__ror__", "__rpow__", "__rrshift__",
    "__rshift__", "__rsub__", "__rtruediv__", "__rxor__", "__setattr__", "__setitem__",
    "__str__", "__sub__", "__truediv__", "__xor__",
];
