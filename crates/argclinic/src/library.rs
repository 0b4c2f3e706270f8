//! The converter and return-converter registries.
//!
//! Registries are read-only tables built once at startup and passed by
//! reference into the orchestrator; nothing in the execution path reaches
//! for global state. Converter names are addressed by annotation (`x: int`),
//! legacy converters by their single-character format unit (`x: 'i'`).

use crate::converters::{CConverter, ConverterKind, ReturnConverter};
use crate::errors::{ClinicError, ClinicResult, fail};
use crate::expr::Literal;

/// One registry row: the converter's name and the keyword options its
/// annotation accepts (shown by `--converters`).
pub struct ConverterInfo {
    pub name: &'static str,
    pub options: &'static [&'static str],
}

const CONVERTERS: &[ConverterInfo] = &[
    ConverterInfo { name: "Py_ssize_t", options: &[] },
    ConverterInfo { name: "bool", options: &["accept_int"] },
    ConverterInfo { name: "defining_class", options: &[] },
    ConverterInfo { name: "double", options: &[] },
    ConverterInfo { name: "float", options: &[] },
    ConverterInfo { name: "int", options: &[] },
    ConverterInfo { name: "long", options: &[] },
    ConverterInfo { name: "object", options: &["type", "subclass_of"] },
    ConverterInfo { name: "self", options: &["type"] },
    ConverterInfo { name: "str", options: &[] },
    ConverterInfo { name: "unsigned_int", options: &["bitwise"] },
    ConverterInfo { name: "unsigned_long", options: &["bitwise"] },
];

/// Legacy format-unit converters: unit character to converter name.
const LEGACY_CONVERTERS: &[(&str, &str)] = &[
    ("O", "object"),
    ("d", "double"),
    ("f", "float"),
    ("i", "int"),
    ("k", "unsigned_long"),
    ("l", "long"),
    ("n", "Py_ssize_t"),
    ("p", "bool"),
    ("s", "str"),
];

const RETURN_CONVERTERS: &[(&str, ReturnConverter)] = &[
    ("Py_ssize_t", ReturnConverter::PySsizeT),
    ("bool", ReturnConverter::Bool),
    ("double", ReturnConverter::Double),
    ("float", ReturnConverter::Float),
    ("int", ReturnConverter::Int),
    ("long", ReturnConverter::Long),
    ("object", ReturnConverter::Object),
    ("size_t", ReturnConverter::SizeT),
    ("unsigned_long", ReturnConverter::UnsignedLong),
];

/// Keyword options parsed out of a converter annotation.
#[derive(Debug, Default)]
struct ConverterOptions {
    c_default: Option<String>,
    py_default: Option<String>,
    type_name: Option<String>,
    subclass_of: Option<String>,
    accept_int: bool,
    bitwise: bool,
}

/// The read-only converter tables.
#[derive(Debug, Default)]
pub struct Registry {
    _private: (),
}

impl Registry {
    #[must_use]
    pub fn standard() -> Self {
        Self { _private: () }
    }

    /// Converters in listing order.
    #[must_use]
    pub fn converters(&self) -> &'static [ConverterInfo] {
        CONVERTERS
    }

    /// Legacy (format-unit) converter units in listing order.
    #[must_use]
    pub fn legacy_converters(&self) -> Vec<&'static str> {
        LEGACY_CONVERTERS.iter().map(|(unit, _)| *unit).collect()
    }

    /// Return converter names in listing order.
    #[must_use]
    pub fn return_converters(&self) -> Vec<&'static str> {
        RETURN_CONVERTERS.iter().map(|(name, _)| *name).collect()
    }

    #[must_use]
    pub fn has_return_converter(&self, name: &str) -> bool {
        RETURN_CONVERTERS.iter().any(|(n, _)| *n == name)
    }

    pub fn create_return_converter(&self, name: &str) -> ClinicResult<ReturnConverter> {
        RETURN_CONVERTERS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, converter)| *converter)
            .ok_or_else(|| ClinicError::new(format!("No available return converter called {name:?}")))
    }

    /// Instantiates a converter for one parameter.
    ///
    /// `name` is the converter name (or format unit when `legacy`), `py_name`
    /// the parameter's Python-surface name, `c_name` the target C identifier.
    pub fn create_converter(
        &self,
        name: &str,
        legacy: bool,
        py_name: &str,
        c_name: &str,
        kwargs: &[(String, Literal)],
    ) -> ClinicResult<CConverter> {
        let resolved = if legacy {
            let Some((_, target)) = LEGACY_CONVERTERS.iter().find(|(unit, _)| *unit == name) else {
                fail!("{name:?} is not a valid legacy converter");
            };
            *target
        } else {
            if !CONVERTERS.iter().any(|info| info.name == name) {
                fail!("{name:?} is not a valid converter");
            }
            name
        };

        let options = Self::parse_options(resolved, kwargs)?;
        let kind = match resolved {
            "object" => ConverterKind::Object {
                type_name: options.type_name.clone(),
                subclass_of: options.subclass_of.clone(),
            },
            "bool" => ConverterKind::Bool {
                accept_int: options.accept_int,
            },
            "int" => ConverterKind::Int,
            "unsigned_int" => ConverterKind::UnsignedInt {
                bitwise: options.bitwise,
            },
            "long" => ConverterKind::Long,
            "unsigned_long" => ConverterKind::UnsignedLong {
                bitwise: options.bitwise,
            },
            "Py_ssize_t" => ConverterKind::PySsizeT,
            "float" => ConverterKind::Float,
            "double" => ConverterKind::Double,
            "str" => ConverterKind::Str,
            "self" => ConverterKind::SelfSlot {
                type_override: options.type_name.clone(),
            },
            "defining_class" => ConverterKind::DefiningClass,
            other => fail!("{other:?} is not a valid converter"),
        };

        let mut converter = CConverter::new(kind, py_name, c_name);
        converter.c_default = options.c_default;
        converter.py_default = options.py_default;
        if converter.is_defining_class() {
            converter.show_in_signature = false;
        }
        Ok(converter)
    }

    fn parse_options(name: &str, kwargs: &[(String, Literal)]) -> ClinicResult<ConverterOptions> {
        let allowed = CONVERTERS
            .iter()
            .find(|info| info.name == name)
            .map(|info| info.options)
            .unwrap_or_default();
        let mut options = ConverterOptions::default();
        for (key, value) in kwargs {
            match key.as_str() {
                "c_default" => options.c_default = Some(expect_str(name, key, value)?),
                "py_default" => options.py_default = Some(expect_str(name, key, value)?),
                "type" if allowed.contains(&"type") => {
                    options.type_name = Some(expect_str(name, key, value)?);
                }
                "subclass_of" if allowed.contains(&"subclass_of") => {
                    options.subclass_of = Some(expect_str(name, key, value)?);
                }
                "accept_int" if allowed.contains(&"accept_int") => {
                    options.accept_int = expect_bool(name, key, value)?;
                }
                "bitwise" if allowed.contains(&"bitwise") => {
                    options.bitwise = expect_bool(name, key, value)?;
                }
                other => fail!("{name}() got an unexpected keyword argument {other:?}"),
            }
        }
        Ok(options)
    }
}

fn expect_str(converter: &str, key: &str, value: &Literal) -> ClinicResult<String> {
    match value {
        Literal::Str(s) => Ok(s.clone()),
        other => fail!(
            "{converter}() argument {key:?} must be a string, got {}",
            other.py_repr()
        ),
    }
}

fn expect_bool(converter: &str, key: &str, value: &Literal) -> ClinicResult<bool> {
    match value {
        Literal::Bool(b) => Ok(*b),
        other => fail!(
            "{converter}() argument {key:?} must be True or False, got {}",
            other.py_repr()
        ),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn known_converters_resolve() {
        let registry = Registry::standard();
        let conv = registry.create_converter("int", false, "x", "x", &[]).unwrap();
        assert_eq!(conv.format_unit(), "i");
        assert_eq!(conv.c_type(), "int");
    }

    #[test]
    fn unknown_converters_are_rejected() {
        let registry = Registry::standard();
        let error = registry
            .create_converter("no_such", false, "x", "x", &[])
            .unwrap_err();
        assert!(error.message.contains("not a valid converter"));
    }

    #[test]
    fn legacy_converters_resolve_by_format_unit() {
        let registry = Registry::standard();
        let conv = registry.create_converter("s", true, "text", "text", &[]).unwrap();
        assert_eq!(conv.c_type(), "const char *");
        assert!(registry
            .create_converter("Z", true, "text", "text", &[])
            .is_err());
    }

    #[test]
    fn converter_options_are_checked_per_converter() {
        let registry = Registry::standard();
        let kwargs = vec![("bitwise".to_owned(), Literal::Bool(true))];
        assert!(registry.create_converter("unsigned_int", false, "x", "x", &kwargs).is_ok());
        assert!(registry.create_converter("int", false, "x", "x", &kwargs).is_err());
    }

    #[test]
    fn return_converters_resolve() {
        let registry = Registry::standard();
        assert_eq!(
            registry.create_return_converter("int").unwrap(),
            ReturnConverter::Int
        );
        assert!(registry.create_return_converter("str").is_err());
    }

    #[test]
    fn object_type_changes_declaration_and_cast() {
        let registry = Registry::standard();
        let kwargs = vec![("type".to_owned(), Literal::Str("PyCodeObject *".to_owned()))];
        let conv = registry.create_converter("object", false, "code", "code", &kwargs).unwrap();
        assert_eq!(conv.c_type(), "PyCodeObject *");
        let snippet = conv.parse_arg("args[0]", "\"argument 1\"", false).unwrap();
        assert_eq!(snippet, "code = (PyCodeObject *)args[0];");
    }
}
