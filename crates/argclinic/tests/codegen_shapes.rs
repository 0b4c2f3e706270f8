//! Calling-convention selection: one test per shape in the classification
//! order, plus the limited-API fallback.

use argclinic::{Clinic, Registry};

fn process(input: &str) -> String {
    process_with(input, false)
}

fn process_with(input: &str, limited: bool) -> String {
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", limited, true).unwrap();
    clinic.parse(input).unwrap()
}

fn block(body: &str) -> String {
    format!(
        "/*[clinic input]\noutput preset block\nmodule demo\n{body}\n[clinic start generated code]*/\n"
    )
}

#[test]
fn no_parameters_uses_meth_noargs() {
    let out = process(&block("demo.ping\nAnswer with pong."));
    assert!(out.contains("METH_NOARGS"), "{out}");
    assert!(out.contains("PyObject *Py_UNUSED(ignored)"), "{out}");
    assert!(out.contains("return demo_ping_impl(module);"), "{out}");
}

#[test]
fn single_object_parameter_fast_paths_to_meth_o() {
    let out = process(&block("demo.echo\n    value: object\n    /\nEcho the value."));
    assert!(out.contains("METH_O"), "{out}");
    // the impl is registered directly: no separate parser function and no
    // _impl suffix
    assert!(out.contains("demo_echo(PyObject *module, PyObject *value)"), "{out}");
    assert!(!out.contains("demo_echo_impl"), "{out}");
}

#[test]
fn meth_o_with_typed_converter_generates_a_parser() {
    let out = process(&block("demo.sqrt\n    x: double\n    /\nSquare root."));
    assert!(out.contains("METH_O"), "{out}");
    assert!(out.contains("demo_sqrt_impl(PyObject *module, double x)"), "{out}");
    assert!(out.contains("PyFloat_AsDouble(arg)"), "{out}");
    assert!(out.contains("goto exit;"), "{out}");
}

#[test]
fn optional_groups_generate_an_arity_switch() {
    let body = "\
demo.window
    [
    lo: int
    ]
    value: int
    [
    hi: int
    ]
    /
Clamp a value.";
    let out = process(&block(body));
    assert!(out.contains("METH_VARARGS"), "{out}");
    assert!(out.contains("switch (PyTuple_GET_SIZE(args))"), "{out}");
    assert!(out.contains("case 1:"), "{out}");
    assert!(out.contains("case 2:"), "{out}");
    assert!(out.contains("case 3:"), "{out}");
    assert!(out.contains("group_left_1 = 1;"), "{out}");
    assert!(out.contains("group_right_1 = 1;"), "{out}");
    assert!(out.contains("PyArg_ParseTuple(args, \"ii:window\""), "{out}");
    assert!(out.contains("int group_left_1 = 0;"), "{out}");
    assert!(
        out.contains("demo_window_impl(PyObject *module, int group_left_1, int lo, int value,"),
        "{out}"
    );
}

#[test]
fn all_positional_uses_fastcall_with_inline_conversions() {
    let body = "\
demo.scale
    x: double
    factor: double = 1.0
    /
Scale a value.";
    let out = process(&block(body));
    assert!(out.contains("METH_FASTCALL"), "{out}");
    assert!(!out.contains("METH_KEYWORDS"), "{out}");
    assert!(out.contains("_PyArg_CheckPositional(\"scale\", nargs, 1, 2)"), "{out}");
    assert!(out.contains("skip_optional:"), "{out}");
    assert!(out.contains("if (nargs < 2)"), "{out}");
}

#[test]
fn keyword_parameters_use_the_argument_unpacker() {
    let body = "\
demo.open
    path: str
    /
    mode: str = 'r'
    *
    buffering: int = -1
Open something.";
    let out = process(&block(body));
    assert!(out.contains("METH_FASTCALL|METH_KEYWORDS"), "{out}");
    assert!(out.contains("static _PyArg_Parser _parser"), "{out}");
    assert!(out.contains("_PyArg_UnpackKeywords"), "{out}");
    assert!(out.contains("PyObject *argsbuf[3];"), "{out}");
    assert!(out.contains("skip_optional_pos"), "{out}");
    assert!(out.contains("skip_optional_kwonly"), "{out}");
    // the keyword tuple is statically initialized for core builds
    assert!(
        out.contains("#if defined(Py_BUILD_CORE) && !defined(Py_BUILD_CORE_MODULE)"),
        "{out}"
    );
    assert!(out.contains("&_Py_ID(mode),"), "{out}");
    assert!(out.contains("\"\", \"mode\", \"buffering\","), "{out}");
}

#[test]
fn limited_api_downgrades_keyword_parsing() {
    let body = "\
demo.open
    path: object
    mode: object = None
Open something.";
    let out = process_with(&block(body), true);
    assert!(out.contains("METH_VARARGS|METH_KEYWORDS"), "{out}");
    assert!(out.contains("PyArg_ParseTupleAndKeywords(args, kwargs"), "{out}");
    assert!(out.contains("static char *_keywords[]"), "{out}");
    assert!(!out.contains("_PyArg_UnpackKeywords"), "{out}");
}

#[test]
fn docstrings_carry_the_text_signature() {
    let out = process(&block("demo.sum\n    a: int\n    b: int = 1\nSum two numbers."));
    assert!(out.contains("PyDoc_STRVAR(demo_sum__doc__,"), "{out}");
    assert!(out.contains("\"sum($module, /, a, b=1)\\n\""), "{out}");
    assert!(out.contains("\"--\\n\""), "{out}");
    assert!(out.contains("\"Sum two numbers.\""), "{out}");
}

#[test]
fn string_defaults_render_with_c_escapes() {
    let out = process(&block("demo.tag\n    sep: str = '\\n'\nJoin with a separator."));
    assert!(out.contains("const char *sep = \"\\n\";"), "{out}");
    assert!(out.contains("sep='\\n'"), "{out}");
}

#[test]
fn critical_sections_wrap_the_impl_call() {
    let body = "\
@critical_section
demo.bump
    by: int = 1
Increment under the object lock.";
    let out = process(&block(body));
    assert!(out.contains("Py_BEGIN_CRITICAL_SECTION(module);"), "{out}");
    assert!(out.contains("Py_END_CRITICAL_SECTION();"), "{out}");
}

#[test]
fn getters_have_no_method_flags() {
    let input = "\
/*[clinic input]
output preset block
module demo
class demo.Counter \"CounterObject *\" \"&Counter_Type\"
@getter
demo.Counter.value
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("DEMO_COUNTER_VALUE_GETSETDEF"), "{out}");
    assert!(out.contains("(getter)demo_Counter_value_get"), "{out}");
    assert!(out.contains("demo_Counter_value_get(CounterObject *self"), "{out}");
    assert!(!out.contains("METH_"), "{out}");
}

#[test]
fn init_rejects_keywords_when_it_parses_none() {
    let input = "\
/*[clinic input]
output preset block
module demo
class demo.Counter \"CounterObject *\" \"&Counter_Type\"
demo.Counter.__init__
    start: int
    /
Make a counter.
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("int return_value = -1;"), "{out}");
    assert!(out.contains("_PyArg_NoKeywords(\"Counter\", kwargs)"), "{out}");
    assert!(out.contains("PyTypeObject *base_tp = &Counter_Type;"), "{out}");
    assert!(out.contains("self->tp_init == base_tp->tp_init"), "{out}");
    assert!(out.contains("demo_Counter___init___impl((CounterObject *)self, start)"), "{out}");
    assert!(!out.contains("METHODDEF"), "{out}");
}

#[test]
fn defining_class_upgrades_the_calling_convention() {
    let input = "\
/*[clinic input]
output preset block
module demo
class demo.Counter \"CounterObject *\" \"&Counter_Type\"
demo.Counter.register
    cls: defining_class
    tag: object
Register the counter under its defining class.
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("METH_METHOD|METH_FASTCALL|METH_KEYWORDS"), "{out}");
    assert!(out.contains("PyTypeObject *cls"), "{out}");
    assert!(out.contains("demo_Counter_register_impl(CounterObject *self, PyTypeObject *cls, PyObject *tag)") || out.contains("demo_Counter_register_impl(CounterObject *self,"), "{out}");
}
