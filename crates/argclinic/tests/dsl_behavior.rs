//! DSL parser behavior: markers, groups, clones, deprecation versions, and
//! the diagnostics a malformed block must produce.

use argclinic::{Clinic, ClinicError, Registry};

fn process(input: &str) -> String {
    try_process(input).unwrap()
}

fn try_process(input: &str) -> Result<String, ClinicError> {
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", false, true)?;
    clinic.parse(input)
}

fn block(body: &str) -> String {
    format!(
        "/*[clinic input]\noutput preset block\nmodule demo\n{body}\n[clinic start generated code]*/\n"
    )
}

fn expect_error(body: &str, needle: &str) {
    let error = try_process(&block(body)).unwrap_err();
    assert!(
        error.message.contains(needle),
        "expected {needle:?} in {:?}",
        error.message
    );
}

#[test]
fn clone_copies_parameters_and_return_converter() {
    let input = "\
/*[clinic input]
output preset block
module demo
demo.first
    count: int
    scale: double = 1.0
First function.
[clinic start generated code]*/

/*[clinic input]
demo.second = demo.first
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("demo_second_impl(PyObject *module, int count, double scale)"), "{out}");
    assert!(out.contains("DEMO_SECOND_METHODDEF"), "{out}");
}

#[test]
fn clone_may_not_change_the_kind_of_a_plain_function() {
    let input = "\
/*[clinic input]
module demo
demo.first
    count: int
First function.
[clinic start generated code]*/

/*[clinic input]
@classmethod
demo.second = demo.first
[clinic start generated code]*/
";
    let error = try_process(input).unwrap_err();
    assert!(
        error.message.contains("'kind' of function and cloned function don't match"),
        "{}",
        error.message
    );
}

#[test]
fn slash_then_star_deprecation_order_is_accepted() {
    let body = "\
demo.f
    a: int
    / [from 3.14]
    b: int
    * [from 3.15]
    c: int = 0
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("PyErr_WarnEx(PyExc_DeprecationWarning,"), "{out}");
}

#[test]
fn star_before_slash_deprecation_order_is_rejected() {
    let body = "\
demo.f
    a: int
    * [from 3.14]
    b: int = 0
    / [from 3.15]
Frobnicate.";
    expect_error(body, "'/ [from ...]' must precede '* [from ...]'");
}

#[test]
fn deprecated_positional_marker_emits_warning_and_banner() {
    let body = "\
demo.f
    a: int
    * [from 3.14]
    b: int = 0
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("PyErr_WarnEx(PyExc_DeprecationWarning,"), "{out}");
    assert!(out.contains("#if PY_VERSION_HEX >= 0x030e00C0"), "{out}");
    assert!(out.contains("will become a keyword-only parameter in Python 3.14."), "{out}");
    // the runtime check guards on the positional argument count
    assert!(out.contains("nargs == 2"), "{out}");
    // the note also lands in the docstring
    assert!(out.contains("Note: Passing 2 positional arguments"), "{out}");
}

#[test]
fn versioned_star_requires_following_parameters() {
    let body = "\
demo.f
    a: int
    * [from 3.14]
Frobnicate.";
    expect_error(body, "without following parameters");
}

#[test]
fn star_twice_is_rejected() {
    let body = "\
demo.f
    a: int
    *
    b: int
    *
    c: int
Frobnicate.";
    expect_error(body, "uses '*' more than once");
}

#[test]
fn slash_twice_is_rejected() {
    let body = "\
demo.f
    a: int
    /
    /
Frobnicate.";
    expect_error(body, "uses '/' more than once");
}

#[test]
fn groups_require_all_positional_only() {
    let body = "\
demo.f
    [
    a: int
    ]
    b: int
Frobnicate.";
    expect_error(body, "unless all parameters are positional-only");
}

#[test]
fn empty_groups_are_rejected() {
    let body = "\
demo.f
    [
    ]
    a: int
    /
Frobnicate.";
    expect_error(body, "has an empty group");
}

#[test]
fn unclosed_groups_are_rejected() {
    let body = "\
demo.f
    [
    a: int
Frobnicate.";
    expect_error(body, "']' without a matching '['");
}

#[test]
fn tabs_are_rejected() {
    let error = try_process(
        "/*[clinic input]\nmodule demo\ndemo.f\n\ta: int\n[clinic start generated code]*/\n",
    )
    .unwrap_err();
    assert!(error.message.contains("Tab characters are illegal"), "{}", error.message);
    assert!(error.lineno.is_some());
}

#[test]
fn duplicate_parameter_names_are_rejected() {
    let body = "\
demo.f
    a: int
    a: int
Frobnicate.";
    expect_error(body, "You can't have two parameters named");
}

#[test]
fn unknown_converters_are_rejected() {
    expect_error("demo.f\n    a: widget\nFrobnicate.", "not a valid converter");
}

#[test]
fn required_after_optional_is_rejected() {
    let body = "\
demo.f
    a: int = 0
    b: int
Frobnicate.";
    expect_error(body, "Can't have a parameter without a default");
}

#[test]
fn docstring_requires_a_summary_line() {
    let body = "\
demo.f
    a: int
First line
second line without a blank in between.";
    expect_error(body, "does not have a summary line");
}

#[test]
fn null_default_renders_as_unrepresentable() {
    let body = "\
demo.f
    obj: object = NULL
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("PyObject *obj = NULL;"), "{out}");
    assert!(out.contains("obj=<unrepresentable>"), "{out}");
}

#[test]
fn named_constants_require_a_c_default() {
    expect_error(
        "demo.f\n    size: int = sys.maxsize\nFrobnicate.",
        "you MUST specify a valid c_default",
    );
    let body = "\
demo.f
    size: int(c_default='PY_SSIZE_T_MAX') = sys.maxsize
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("int size = PY_SSIZE_T_MAX;"), "{out}");
    assert!(out.contains("size=sys.maxsize"), "{out}");
}

#[test]
fn call_and_collection_defaults_are_rejected() {
    expect_error(
        "demo.f\n    a: object = list()\nFrobnicate.",
        "Unsupported expression as default value",
    );
    expect_error(
        "demo.f\n    a: object = (1, 2)\nFrobnicate.",
        "Unsupported expression as default value",
    );
}

#[test]
fn as_clause_renames_the_c_variable() {
    let body = "\
demo.print_
    default as dflt: int = 0
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("int dflt = 0;"), "{out}");
    assert!(out.contains("default=0"), "{out}");
}

#[test]
fn c_keywords_get_a_safe_variable_name() {
    let body = "\
demo.f
    default: int = 0
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("int default_value = 0;"), "{out}");
}

#[test]
fn backslash_continues_a_parameter_line() {
    let body = "\
demo.f
    size: \\
        int = 0
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("int size = 0;"), "{out}");
}

#[test]
fn parameter_docstrings_flow_into_the_parameters_section() {
    let body = "\
demo.f
    path: str
        The path to open.
Do a thing.

{parameters}";
    let out = process(&block(body));
    assert!(out.contains("\"  path\\n\""), "{out}");
    assert!(out.contains("\"    The path to open.\""), "{out}");
}

#[test]
fn staticmethod_and_classmethod_add_method_flags() {
    let class_prelude = "class demo.Thing \"ThingObject *\" \"&Thing_Type\"\n";
    let static_input = format!(
        "/*[clinic input]\noutput preset block\nmodule demo\n{class_prelude}@staticmethod\ndemo.Thing.make\n    n: int\nMake a thing.\n[clinic start generated code]*/\n"
    );
    let out = process(&static_input);
    assert!(out.contains("|METH_STATIC"), "{out}");
    // static methods do not receive a self argument
    assert!(out.contains("demo_Thing_make_impl(int n)"), "{out}");

    let class_input = format!(
        "/*[clinic input]\noutput preset block\nmodule demo\n{class_prelude}@classmethod\ndemo.Thing.build\n    n: int\nBuild a thing.\n[clinic start generated code]*/\n"
    );
    let out = process(&class_input);
    assert!(out.contains("|METH_CLASS"), "{out}");
    assert!(out.contains("PyTypeObject *type"), "{out}");
}

#[test]
fn text_signature_overrides_the_generated_signature() {
    let body = "\
@text_signature \"($module, custom)\"
demo.f
    a: int
Frobnicate.";
    let out = process(&block(body));
    assert!(out.contains("\"f($module, custom)\\n\""), "{out}");
}

#[test]
fn special_method_names_are_rejected() {
    expect_error("demo.__len__\nFrobnicate.", "is a special method");
}

#[test]
fn getters_cannot_define_parameters() {
    let input = "\
/*[clinic input]
module demo
class demo.Thing \"ThingObject *\" \"&Thing_Type\"
@getter
demo.Thing.size
    n: int
[clinic start generated code]*/
";
    let error = try_process(input).unwrap_err();
    assert!(
        error.message.contains("@getter methods cannot define parameters"),
        "{}",
        error.message
    );
}
