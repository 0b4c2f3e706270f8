//! Output routing: directives, buffer leakage, and sidecar header handling.

use argclinic::{Clinic, Registry, compute_checksum, parse_file};

fn process(input: &str) -> String {
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", false, true).unwrap();
    clinic.parse(input).unwrap()
}

#[test]
fn printout_writes_into_the_block_output() {
    let input = "\
/*[clinic input]
printout hello generated world
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("hello generated world\n"), "{out}");
}

#[test]
fn preserve_keeps_the_existing_output() {
    let body = "preserved by hand\n";
    let input = format!(
        "/*[clinic input]\npreserve\n[clinic start generated code]*/\n{body}\
         /*[clinic end generated code: output={} input={}]*/\n",
        compute_checksum(body, 16),
        compute_checksum("preserve\n", 16),
    );
    let out = process(&input);
    assert!(out.contains("preserved by hand\n"), "{out}");
}

#[test]
fn custom_destinations_can_be_dumped() {
    let input = "\
/*[clinic input]
destination scratch new buffer
output everything scratch
module demo
demo.f
    a: int
Frobnicate.
[clinic start generated code]*/

/*[clinic input]
dump scratch
[clinic start generated code]*/
";
    let out = process(input);
    // the first block produced nothing inline; the dump block received it
    let first_block_end = out.find("/*[clinic end").unwrap();
    let first_region = &out[..first_block_end];
    assert!(!first_region.contains("METHODDEF"), "{out}");
    assert!(out.contains("DEMO_F_METHODDEF"), "{out}");
}

#[test]
fn output_push_and_pop_restore_routing() {
    let input = "\
/*[clinic input]
output push
destination scratch new buffer
output everything scratch
output pop
output preset block
module demo
demo.f
    a: int
Frobnicate.
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("DEMO_F_METHODDEF"), "{out}");
}

#[test]
fn output_pop_with_empty_stack_fails() {
    let input = "\
/*[clinic input]
output pop
[clinic start generated code]*/
";
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", false, true).unwrap();
    let error = clinic.parse(input).unwrap_err();
    assert!(error.message.contains("stack is empty"), "{}", error.message);
}

#[test]
fn leftover_buffer_text_is_reinjected_as_a_dump_block() {
    let input = "\
/*[clinic input]
destination scratch new buffer
output everything scratch
module demo
demo.f
    a: int
Frobnicate.
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("/*[clinic input]\ndump scratch\n[clinic start generated code]*/"), "{out}");
    assert!(out.contains("DEMO_F_METHODDEF"), "{out}");
    // and the reinjected block must round-trip
    let again = process(&out);
    assert_eq!(out, again);
}

#[test]
fn line_prefix_and_suffix_wrap_emitted_lines() {
    let input = "\
/*[clinic input]
output preset block
set line_prefix \"//| \"
module demo
demo.f
    a: int
Frobnicate.
[clinic start generated code]*/
";
    let out = process(input);
    assert!(out.contains("//| #define DEMO_F_METHODDEF"), "{out}");
}

#[test]
fn sidecar_header_is_written_with_a_preserve_block() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("demomodule.c");
    let input = "\
/*[clinic input]
module demo
demo.f
    a: int
Frobnicate.
[clinic start generated code]*/

static PyObject *
demo_f_impl(PyObject *module, int a)
{
    return NULL;
}
";
    std::fs::write(&source, input).unwrap();
    let registry = Registry::standard();
    parse_file(&registry, source.to_str().unwrap(), None, false, true).unwrap();

    let sidecar = dir.path().join("clinic").join("demomodule.c.h");
    let header = std::fs::read_to_string(&sidecar).unwrap();
    assert!(header.starts_with("/*[clinic input]\npreserve\n[clinic start generated code]*/\n"), "{header}");
    assert!(header.contains("DEMO_F_METHODDEF"), "{header}");
    assert!(header.contains("#include \"pycore_modsupport.h\""), "{header}");

    // the rewritten source keeps only the impl prototype inline
    let rewritten = std::fs::read_to_string(&source).unwrap();
    assert!(rewritten.contains("demo_f_impl(PyObject *module, int a)"), "{rewritten}");
    assert!(!rewritten.contains("_PyArg_UnpackKeywords"), "{rewritten}");

    // a second run is a no-op
    parse_file(&registry, source.to_str().unwrap(), None, false, true).unwrap();
    assert_eq!(std::fs::read_to_string(&source).unwrap(), rewritten);
    assert_eq!(std::fs::read_to_string(&sidecar).unwrap(), header);
}

#[test]
fn modified_sidecar_headers_are_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("demomodule.c");
    let input = "\
/*[clinic input]
module demo
demo.f
    a: int
Frobnicate.
[clinic start generated code]*/
";
    std::fs::write(&source, input).unwrap();
    let clinic_dir = dir.path().join("clinic");
    std::fs::create_dir_all(&clinic_dir).unwrap();
    let sidecar = clinic_dir.join("demomodule.c.h");
    std::fs::write(&sidecar, "/* hand-written, no preserve block */\n").unwrap();

    let registry = Registry::standard();
    let error = parse_file(&registry, source.to_str().unwrap(), None, false, true).unwrap_err();
    assert!(error.message.contains("not overwriting"), "{}", error.message);
    assert!(
        error.message.contains("demomodule.c.h"),
        "the diagnostic names the file: {}",
        error.message
    );

    // --force (verify off) replaces it
    parse_file(&registry, source.to_str().unwrap(), None, false, false).unwrap();
    let header = std::fs::read_to_string(&sidecar).unwrap();
    assert!(header.contains("DEMO_F_METHODDEF"), "{header}");
}

#[test]
fn unknown_destinations_are_reported() {
    let input = "\
/*[clinic input]
dump nowhere
[clinic start generated code]*/
";
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", false, true).unwrap();
    let error = clinic.parse(input).unwrap_err();
    assert!(error.message.contains("Destination does not exist"), "{}", error.message);
}
