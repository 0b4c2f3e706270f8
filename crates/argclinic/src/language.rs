//! Marker-line formats for the host language.
//!
//! Only C is supported; the struct keeps the marker templates in one place
//! so the block parser and printer agree on them.

use crate::templates;

#[derive(Debug, Clone)]
pub struct Language {
    pub name: &'static str,
    pub start_line: &'static str,
    pub body_prefix: &'static str,
    pub stop_line: &'static str,
    pub checksum_line: &'static str,
}

impl Language {
    #[must_use]
    pub fn c() -> Self {
        Self {
            name: "C",
            start_line: "/*[{dsl_name} input]",
            body_prefix: "",
            stop_line: "[{dsl_name} start generated code]*/",
            checksum_line: "/*[{dsl_name} end generated code: {arguments}]*/",
        }
    }

    #[must_use]
    pub fn start_marker(&self, dsl_name: &str) -> String {
        templates::fill(self.start_line, &[("dsl_name", dsl_name)])
    }

    #[must_use]
    pub fn stop_marker(&self, dsl_name: &str) -> String {
        templates::fill(self.stop_line, &[("dsl_name", dsl_name)])
    }

    #[must_use]
    pub fn checksum_marker(&self, dsl_name: &str, arguments: &str) -> String {
        templates::fill(
            self.checksum_line,
            &[("dsl_name", dsl_name), ("arguments", arguments)],
        )
    }

    /// Splits a marker template into the text before and after the
    /// `{dsl_name}` hole, for matching host-file lines.
    #[must_use]
    pub fn split_marker(template: &str) -> (&str, &str) {
        template
            .split_once("{dsl_name}")
            .expect("marker templates carry a {dsl_name} hole")
    }
}
