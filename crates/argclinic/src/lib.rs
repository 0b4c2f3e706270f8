#![doc = include_str!("../../../README.md")]

mod blocks;
mod clinic;
mod codegen;
mod converters;
mod cpp;
mod destinations;
mod dsl;
mod errors;
mod expr;
mod files;
mod indent;
mod language;
mod library;
mod model;
mod templates;
mod tokenize;

pub use crate::{
    blocks::{Block, BlockParser, BlockPrinter, compute_checksum},
    clinic::{Clinic, parse_file},
    converters::{CConverter, ConverterKind, RenderData, ReturnConverter},
    cpp::CppMonitor,
    destinations::{BufferRef, BufferSeries, Destination, DestinationKind, Fragment},
    dsl::DslParser,
    errors::{ClinicError, ClinicResult},
    expr::Literal,
    indent::IndentStack,
    language::Language,
    library::{ConverterInfo, Registry},
    model::{
        Class, ClassId, DefaultValue, Function, FunctionId, FunctionKind, Include, Module,
        ModuleId, Parameter, ParameterKind, VersionTuple,
    },
};
