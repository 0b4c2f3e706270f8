//! Block I/O properties: idempotence, checksum enforcement, and
//! insensitivity to comment placement inside directive blocks.

use argclinic::{Clinic, Registry};

fn process(input: &str) -> String {
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", false, true).unwrap();
    clinic.parse(input).unwrap()
}

fn try_process(input: &str, verify: bool) -> Result<String, argclinic::ClinicError> {
    let registry = Registry::standard();
    let mut clinic = Clinic::new(&registry, "test.c", false, verify)?;
    clinic.parse(input)
}

/// Extracts the generated-output regions (between stop markers and checksum
/// lines) from a processed file.
fn generated_regions(text: &str) -> Vec<String> {
    let mut regions = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.starts_with("/*[clinic end generated code:") {
            regions.push(current.take().unwrap_or_default());
        } else if let Some(region) = current.as_mut() {
            region.push_str(line);
            region.push('\n');
        } else if line == "[clinic start generated code]*/" {
            current = Some(String::new());
        }
    }
    regions
}

const SIMPLE_INPUT: &str = "\
#include \"Python.h\"

/*[clinic input]
output preset block
module demo
demo.sum
    a: int
    b: int = 1
Sum two numbers.
[clinic start generated code]*/

static PyObject *
demo_sum_impl(PyObject *module, int a, int b)
{
    return PyLong_FromLong(a + b);
}
";

#[test]
fn processing_is_idempotent() {
    let once = process(SIMPLE_INPUT);
    let twice = process(&once);
    assert_eq!(once, twice, "a generated file must round-trip byte-identically");
}

#[test]
fn output_region_is_checksummed() {
    let once = process(SIMPLE_INPUT);
    assert!(once.contains("/*[clinic end generated code: output="));
    assert!(once.contains(" input="));
}

#[test]
fn tampered_output_is_refused() {
    let once = process(SIMPLE_INPUT);
    assert!(once.contains("METH_FASTCALL"), "precondition: {once}");
    let tampered = once.replacen("METH_FASTCALL", "XETH_FASTCALL", 1);

    let error = try_process(&tampered, true).unwrap_err();
    assert!(error.message.contains("Checksum mismatch"), "{error}");
    assert!(error.message.contains("'-f' option"), "{error}");
}

#[test]
fn force_overwrites_tampered_output() {
    let once = process(SIMPLE_INPUT);
    let tampered = once.replacen("METH_FASTCALL", "XETH_FASTCALL", 1);

    let regenerated = try_process(&tampered, false).unwrap();
    assert_eq!(regenerated, once, "--force regenerates the pristine output");
}

#[test]
fn comment_and_blank_lines_do_not_change_output() {
    let with_comments = "\
/*[clinic input]
# routing comment
output preset block

module demo

# declares the function
demo.sum
    a: int

    b: int = 1
Sum two numbers.
[clinic start generated code]*/
";
    let without_comments = "\
/*[clinic input]
output preset block
module demo
demo.sum
    a: int
    b: int = 1
Sum two numbers.
[clinic start generated code]*/
";
    assert_eq!(
        generated_regions(&process(with_comments)),
        generated_regions(&process(without_comments)),
    );
}

#[test]
fn files_without_markers_pass_through() {
    let registry = Registry::standard();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.c");
    std::fs::write(&path, "int main(void) { return 0; }\n").unwrap();
    argclinic::parse_file(&registry, path.to_str().unwrap(), None, false, true).unwrap();
    let after = std::fs::read_to_string(&path).unwrap();
    assert_eq!(after, "int main(void) { return 0; }\n");
}
