//! Named output sinks for generated fragments.
//!
//! Every generated fragment is routed to a destination: an in-file buffer
//! (dumped back into a block), a sidecar file, or a suppressing sink. A
//! buffer destination owns a series of indexed text buffers; the series
//! grows on demand in both directions, so `series[i]` always exists.

use std::path::Path;

use crate::errors::{ClinicResult, fail};
use crate::templates;

/// The nine generated fragments a preset routes, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Fragment {
    CppIf,
    DocstringPrototype,
    DocstringDefinition,
    MethoddefDefine,
    ImplPrototype,
    ParserPrototype,
    ParserDefinition,
    CppEndif,
    MethoddefIfndef,
    ImplDefinition,
}

impl Fragment {
    /// All fragments in the order the printer emits them.
    pub const ALL: [Self; 10] = [
        Self::CppIf,
        Self::DocstringPrototype,
        Self::DocstringDefinition,
        Self::MethoddefDefine,
        Self::ImplPrototype,
        Self::ParserPrototype,
        Self::ParserDefinition,
        Self::CppEndif,
        Self::MethoddefIfndef,
        Self::ImplDefinition,
    ];
}

/// Where a fragment is routed: a destination name plus a buffer index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRef {
    pub destination: String,
    pub index: i64,
}

impl BufferRef {
    pub fn new(destination: impl Into<String>, index: i64) -> Self {
        Self {
            destination: destination.into(),
            index,
        }
    }
}

/// A growable array of text buffers supporting negative indices.
///
/// Asking for an index that does not exist yet grows the series until it
/// does; negative indices prepend buffers and shift the logical zero.
#[derive(Debug, Clone, Default)]
pub struct BufferSeries {
    start: i64,
    arrays: Vec<String>,
}

impl BufferSeries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_mut(&mut self, index: i64) -> &mut String {
        let mut offset = index - self.start;
        if offset < 0 {
            let grow = usize::try_from(-offset).expect("negative offset fits usize");
            for _ in 0..grow {
                self.arrays.insert(0, String::new());
            }
            self.start = index;
            offset = 0;
        }
        let offset = usize::try_from(offset).expect("offset fits usize");
        while offset >= self.arrays.len() {
            self.arrays.push(String::new());
        }
        &mut self.arrays[offset]
    }

    pub fn clear(&mut self) {
        for array in &mut self.arrays {
            array.clear();
        }
    }

    /// Concatenates every buffer in index order and clears the series.
    pub fn dump(&mut self) -> String {
        let text: String = self.arrays.concat();
        self.clear();
        text
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arrays.iter().all(String::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DestinationKind {
    Buffer,
    File,
    Suppress,
}

/// A named sink for generated text.
#[derive(Debug, Clone)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
    pub buffers: BufferSeries,
    /// Resolved path for `file` destinations.
    pub filename: Option<String>,
}

impl Destination {
    /// Creates a destination; `file` kinds resolve their filename template
    /// against the host file path.
    pub fn new(
        name: &str,
        kind: DestinationKind,
        template: Option<&str>,
        host_filename: &str,
    ) -> ClinicResult<Self> {
        let filename = match kind {
            DestinationKind::File => {
                let Some(template) = template else {
                    fail!("Not enough arguments for destination {name:?} new {kind}");
                };
                Some(resolve_filename_template(template, host_filename))
            }
            _ => {
                if template.is_some() {
                    fail!("Too many arguments for destination {name:?} new {kind}");
                }
                None
            }
        };
        Ok(Self {
            name: name.to_owned(),
            kind,
            buffers: BufferSeries::new(),
            filename,
        })
    }

    pub fn clear(&mut self) -> ClinicResult<()> {
        if self.kind != DestinationKind::Buffer {
            fail!("Can't clear destination {:?}: it's not of type 'buffer'", self.name);
        }
        self.buffers.clear();
        Ok(())
    }

    pub fn dump(&mut self) -> String {
        self.buffers.dump()
    }
}

fn resolve_filename_template(template: &str, host_filename: &str) -> String {
    let path = Path::new(host_filename);
    let dirname = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_owned());
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (root, extension) = match host_filename.rsplit_once('.') {
        Some((root, ext)) if !root.is_empty() => (root.to_owned(), format!(".{ext}")),
        _ => (host_filename.to_owned(), String::new()),
    };
    templates::fill(
        template,
        &[
            ("path", host_filename),
            ("dirname", &dirname),
            ("basename", &basename),
            ("basename_root", &root),
            ("basename_extension", &extension),
        ],
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn series_grows_on_demand() {
        let mut series = BufferSeries::new();
        series.buffer_mut(3).push_str("three");
        series.buffer_mut(0).push_str("zero");
        assert_eq!(series.dump(), "zerothree");
        assert!(series.is_empty());
    }

    #[test]
    fn negative_indices_prepend() {
        let mut series = BufferSeries::new();
        series.buffer_mut(0).push_str("middle");
        series.buffer_mut(-1).push_str("early");
        series.buffer_mut(1).push_str("late");
        assert_eq!(series.dump(), "earlymiddlelate");
    }

    #[test]
    fn file_destinations_resolve_their_template() {
        let dest = Destination::new(
            "file",
            DestinationKind::File,
            Some("{dirname}/clinic/{basename}.h"),
            "Modules/foomodule.c",
        )
        .unwrap();
        assert_eq!(dest.filename.as_deref(), Some("Modules/clinic/foomodule.c.h"));
    }

    #[test]
    fn buffer_destinations_reject_a_template() {
        assert!(Destination::new("b", DestinationKind::Buffer, Some("x"), "f.c").is_err());
    }

    #[test]
    fn fragment_names_round_trip() {
        assert_eq!(Fragment::MethoddefIfndef.to_string(), "methoddef_ifndef");
        assert_eq!("cpp_if".parse::<Fragment>().unwrap(), Fragment::CppIf);
        assert!("not_a_fragment".parse::<Fragment>().is_err());
    }
}
