//! The directive DSL parser.
//!
//! An indentation-sensitive, line-by-line state machine. Each block is fed
//! one line at a time to the current state; states may tail-dispatch into
//! another state with the same line. The machine assembles a [`Function`]
//! (parameters, converters, groups, deprecation markers, kind flags) into
//! the orchestrator's catalogs, then composes the formatted docstring.
//!
//! The four meaningful indent depths: 0 directives and the declaration,
//! 1 function docstring, 2 parameters, 3 per-parameter docstrings.

use std::sync::LazyLock;

use regex::Regex;

use crate::blocks::Block;
use crate::clinic::Clinic;
use crate::destinations::{BufferRef, DestinationKind, Fragment};
use crate::errors::{ClinicError, ClinicResult, fail};
use crate::expr::{self, Annotation, Expr, Literal};
use crate::indent::IndentStack;
use crate::model::{
    Class, DefaultValue, Function, FunctionId, FunctionKind, Module, Parameter, ParameterKind,
    UNSUPPORTED_SPECIAL_METHODS, VersionTuple,
};
use crate::templates::{SIG_END_MARKER, linear_format};

static FROM_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([*/]) +\[from +(.+)\]$").expect("static regex compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    DslStart,
    ModulenameName,
    ParametersStart,
    Parameter,
    ParameterDocstringStart,
    ParameterDocstring,
    FunctionDocstring,
}

/// Parameter-section state; enforces the group bracket grammar.
///
/// ```text
///  [ [ a, b, ] c, ] d, e, f=3, [ g, h, [ i ] ]   <- line
/// 01   2          3       4    5           6     <- state transitions
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamState {
    Start,
    LeftSquareBefore,
    GroupBefore,
    Required,
    Optional,
    GroupAfter,
    RightSquareAfter,
}

pub struct DslParser {
    state: State,
    function: Option<FunctionId>,
    keyword_only: bool,
    positional_only: bool,
    deprecated_positional: Option<VersionTuple>,
    deprecated_keyword: Option<VersionTuple>,
    group: i32,
    parameter_state: ParamState,
    indent: IndentStack,
    kind: FunctionKind,
    coexist: bool,
    forced_text_signature: Option<String>,
    parameter_continuation: String,
    preserve_output: bool,
    critical_section: bool,
    target_critical_section: Vec<String>,
    parameter_docstring_indent: usize,
}

impl Default for DslParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DslParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::DslStart,
            function: None,
            keyword_only: false,
            positional_only: false,
            deprecated_positional: None,
            deprecated_keyword: None,
            group: 0,
            parameter_state: ParamState::Start,
            indent: IndentStack::new(),
            kind: FunctionKind::Callable,
            coexist: false,
            forced_text_signature: None,
            parameter_continuation: String::new(),
            preserve_output: false,
            critical_section: false,
            target_critical_section: Vec::new(),
            parameter_docstring_indent: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Processes one directive block: consumes every input line, then
    /// renders the declared function into the block's output.
    pub fn parse(
        &mut self,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        block_start_line: usize,
    ) -> ClinicResult<()> {
        self.reset();
        let saved_output = std::mem::take(&mut block.output);

        let lines: Vec<String> = block.input.split('\n').map(str::to_owned).collect();
        let mut lineno = block_start_line;
        for (offset, line) in lines.iter().enumerate() {
            lineno = block_start_line + offset;
            if line.contains('\t') {
                return Err(
                    ClinicError::new(format!("Tab characters are illegal in the Clinic DSL: {line:?}"))
                        .with_location(&clinic.filename, lineno),
                );
            }
            let filename = clinic.filename.clone();
            self.dispatch(clinic, block, line)
                .map_err(|e| e.with_location(&filename, lineno))?;
        }

        let filename = clinic.filename.clone();
        self.post_block_cleanup(clinic)
            .map_err(|e| e.with_location(&filename, lineno))?;

        let rendered = clinic.render_block(block)?;
        block.output.push_str(&rendered);

        if self.preserve_output {
            if !block.output.is_empty() {
                fail!("'preserve' only works for blocks that don't produce any output!");
            }
            block.output = saved_output;
        }
        Ok(())
    }

    fn dispatch(&mut self, clinic: &mut Clinic<'_>, block: &mut Block, line: &str) -> ClinicResult<()> {
        match self.state {
            State::DslStart => self.state_dsl_start(clinic, block, line),
            State::ModulenameName => self.state_modulename_name(clinic, block, line),
            State::ParametersStart => self.state_parameters_start(clinic, block, line),
            State::Parameter => self.state_parameter(clinic, block, line),
            State::ParameterDocstringStart => self.state_parameter_docstring_start(clinic, block, line),
            State::ParameterDocstring => self.state_parameter_docstring(clinic, block, line),
            State::FunctionDocstring => self.state_function_docstring(clinic, block, line),
        }
    }

    fn next_state(
        &mut self,
        state: State,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        line: Option<&str>,
    ) -> ClinicResult<()> {
        self.state = state;
        match line {
            Some(line) => self.dispatch(clinic, block, line),
            None => Ok(()),
        }
    }

    fn in_docstring(&self) -> bool {
        matches!(self.state, State::ParameterDocstring | State::FunctionDocstring)
    }

    /// Comment-only and blank lines are skipped outside docstrings.
    fn valid_line(&self, line: &str) -> bool {
        if line.trim_start().starts_with('#') {
            return false;
        }
        if !self.in_docstring() && line.trim().is_empty() {
            return false;
        }
        true
    }

    fn function_mut<'c>(&self, clinic: &'c mut Clinic<'_>) -> &'c mut Function {
        let id = self.function.expect("a function is being parsed");
        clinic.function_mut(id)
    }

    fn function_ref<'c>(&self, clinic: &'c Clinic<'_>) -> &'c Function {
        let id = self.function.expect("a function is being parsed");
        clinic.function(id)
    }

    // --- state: directives and dispatch -----------------------------------

    fn state_dsl_start(&mut self, clinic: &mut Clinic<'_>, block: &mut Block, line: &str) -> ClinicResult<()> {
        if !self.valid_line(line) {
            return Ok(());
        }

        let fields = crate::tokenize::split(line)?;
        let directive = fields.first().map(String::as_str).unwrap_or_default();
        let args: Vec<&str> = fields.iter().skip(1).map(String::as_str).collect();
        match directive {
            "module" => return Self::directive_module(clinic, &args),
            "class" => return Self::directive_class(clinic, &args),
            "set" => return Self::directive_set(clinic, &args),
            "destination" => return Self::directive_destination(clinic, &args),
            "output" => return Self::directive_output(clinic, block, &args),
            "dump" => return Self::directive_dump(clinic, block, &args),
            "printout" => {
                block.output.push_str(&args.join(" "));
                block.output.push('\n');
                return Ok(());
            }
            "preserve" => {
                if self.preserve_output {
                    fail!("Can't have 'preserve' twice in one block!");
                }
                self.preserve_output = true;
                return Ok(());
            }
            "@classmethod" => {
                if self.kind != FunctionKind::Callable {
                    fail!("Can't set @classmethod, function is not a normal callable");
                }
                self.kind = FunctionKind::ClassMethod;
                return Ok(());
            }
            "@staticmethod" => {
                if self.kind != FunctionKind::Callable {
                    fail!("Can't set @staticmethod, function is not a normal callable");
                }
                self.kind = FunctionKind::StaticMethod;
                return Ok(());
            }
            "@coexist" => {
                if self.coexist {
                    fail!("Called @coexist twice!");
                }
                self.coexist = true;
                return Ok(());
            }
            "@getter" => {
                match self.kind {
                    FunctionKind::Getter => fail!("Cannot apply @getter twice to the same function!"),
                    FunctionKind::Setter => {
                        fail!("Cannot apply both @getter and @setter to the same function!")
                    }
                    _ => self.kind = FunctionKind::Getter,
                }
                return Ok(());
            }
            "@setter" => {
                match self.kind {
                    FunctionKind::Setter => fail!("Cannot apply @setter twice to the same function!"),
                    FunctionKind::Getter => {
                        fail!("Cannot apply both @getter and @setter to the same function!")
                    }
                    _ => self.kind = FunctionKind::Setter,
                }
                return Ok(());
            }
            "@text_signature" => {
                let [signature] = args[..] else {
                    fail!("@text_signature takes exactly one argument");
                };
                if self.forced_text_signature.is_some() {
                    fail!("Called @text_signature twice!");
                }
                self.forced_text_signature = Some(signature.to_owned());
                return Ok(());
            }
            "@critical_section" => {
                if args.len() > 2 {
                    fail!("Up to 2 critical section variables are supported");
                }
                self.target_critical_section
                    .extend(args.iter().map(|&s| s.to_owned()));
                self.critical_section = true;
                return Ok(());
            }
            _ => {}
        }

        self.next_state(State::ModulenameName, clinic, block, Some(line))
    }

    fn directive_module(clinic: &mut Clinic<'_>, args: &[&str]) -> ClinicResult<()> {
        let [name] = args else {
            fail!("module takes exactly one argument");
        };
        let fields: Vec<&str> = name.split('.').collect();
        let (parents, last) = fields.split_at(fields.len() - 1);
        let (module, cls) = clinic.module_and_class(parents)?;
        if cls.is_some() {
            fail!("Can't nest a module inside a class!");
        }
        clinic.add_module(Module::new(*name, module), last[0], module)
    }

    fn directive_class(clinic: &mut Clinic<'_>, args: &[&str]) -> ClinicResult<()> {
        let [name, typedef, type_object] = args else {
            fail!("class takes exactly three arguments: name, typedef, type object");
        };
        let fields: Vec<&str> = name.split('.').collect();
        let (parents, last) = fields.split_at(fields.len() - 1);
        let (module, cls) = clinic.module_and_class(parents)?;
        let class = Class {
            name: (*last.first().expect("split always yields one field")).to_owned(),
            module,
            parent_class: cls,
            typedef: (*typedef).to_owned(),
            type_object: (*type_object).to_owned(),
            classes: indexmap::IndexMap::new(),
            functions: Vec::new(),
        };
        clinic.add_class(class, module, cls)
    }

    fn directive_set(clinic: &mut Clinic<'_>, args: &[&str]) -> ClinicResult<()> {
        let [name, value] = args else {
            fail!("set takes exactly two arguments");
        };
        let value = value
            .replace("{block comment start}", "/*")
            .replace("{block comment end}", "*/");
        match *name {
            "line_prefix" => clinic.line_prefix = value,
            "line_suffix" => clinic.line_suffix = value,
            other => fail!("unknown variable {other:?}"),
        }
        Ok(())
    }

    fn directive_destination(clinic: &mut Clinic<'_>, args: &[&str]) -> ClinicResult<()> {
        match args {
            [name, "new", kind, rest @ ..] => {
                let kind: DestinationKind = kind.parse().map_err(|_| {
                    ClinicError::new(format!(
                        "Invalid destination type {kind:?} for {name}, must be buffer, file, suppress"
                    ))
                })?;
                let template = match rest {
                    [] => None,
                    [template] => Some(*template),
                    _ => fail!("Too many arguments for destination {name:?} new {kind}"),
                };
                clinic.add_destination(name, kind, template)
            }
            [name, "clear"] => clinic.get_destination_mut(name)?.clear(),
            [_, command, ..] => fail!("unknown destination command {command:?}"),
            _ => fail!("destination takes a name and a command"),
        }
    }

    fn directive_output(clinic: &mut Clinic<'_>, block: &mut Block, args: &[&str]) -> ClinicResult<()> {
        let [command, rest @ ..] = args else {
            fail!("output takes a command");
        };
        match *command {
            "preset" => {
                let [name] = rest else {
                    fail!("output preset takes a preset name");
                };
                let Some(preset) = clinic.presets.get(*name).cloned() else {
                    fail!("Unknown preset {name:?}!");
                };
                for (fragment, buffer) in preset {
                    clinic.routing.insert(fragment, buffer);
                }
                Ok(())
            }
            "push" => {
                let snapshot = clinic.routing.clone();
                clinic.routing_stack.push(snapshot);
                Ok(())
            }
            "pop" => {
                let Some(previous) = clinic.routing_stack.pop() else {
                    fail!("Can't 'output pop', stack is empty!");
                };
                clinic.routing = previous;
                Ok(())
            }
            "print" => {
                for (fragment, buffer) in &clinic.routing {
                    block
                        .output
                        .push_str(&format!("{fragment} => {}[{}]\n", buffer.destination, buffer.index));
                }
                Ok(())
            }
            "everything" => {
                let [destination] = rest else {
                    fail!("output everything takes a destination name");
                };
                clinic.get_destination_mut(destination)?;
                for fragment in Fragment::ALL {
                    clinic.routing.insert(fragment, BufferRef::new(*destination, 0));
                }
                Ok(())
            }
            fragment_name => {
                let Ok(fragment) = fragment_name.parse::<Fragment>() else {
                    fail!(
                        "Invalid command or destination name {fragment_name:?}. Must be one of \
                         'preset', 'push', 'pop', 'print', 'everything' or a fragment name."
                    );
                };
                let [destination] = rest else {
                    fail!("output {fragment_name} takes a destination name");
                };
                clinic.get_destination_mut(destination)?;
                clinic.routing.insert(fragment, BufferRef::new(*destination, 0));
                Ok(())
            }
        }
    }

    fn directive_dump(clinic: &mut Clinic<'_>, block: &mut Block, args: &[&str]) -> ClinicResult<()> {
        let [name] = args else {
            fail!("dump takes exactly one destination name");
        };
        let text = clinic.get_destination_mut(name)?.dump();
        block.output.push_str(&text);
        Ok(())
    }

    // --- state: the declaration line --------------------------------------

    fn state_modulename_name(
        &mut self,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        line: &str,
    ) -> ClinicResult<()> {
        // the declaration establishes the leftmost column:
        //     modulename.fnname [as c_basename] [-> return annotation]
        // or the clone form:
        //     modulename.fnname [as c_basename] = modulename.existing_fn
        self.indent.infer(line)?;

        if let Some((before, existing)) = line.rsplit_once('=') {
            let existing = existing.trim();
            if expr::is_legal_py_identifier(existing) {
                let names = self.parse_function_names(clinic, before)?;
                return self.parse_cloned_function(clinic, block, names, existing);
            }
        }

        let (decl, returns) = match line.split_once("->") {
            Some((decl, returns)) => (decl, returns.trim()),
            None => (line, ""),
        };
        let (full_name, c_basename) = self.parse_function_names(clinic, decl)?;
        let return_converter = self.resolve_return_converter(clinic, &full_name, returns)?;

        let fields: Vec<&str> = full_name.split('.').collect();
        let (parents, last) = fields.split_at(fields.len() - 1);
        let function_name = last[0];
        let (module, cls) = clinic.module_and_class(parents)?;

        let display_name = if self.kind.new_or_init() {
            cls.map_or_else(|| function_name.to_owned(), |id| clinic.class(id).name.clone())
        } else {
            function_name.to_owned()
        };
        let mut function = Function {
            name: function_name.to_owned(),
            full_name: full_name.clone(),
            display_name,
            module,
            cls,
            c_basename,
            parameters: indexmap::IndexMap::new(),
            return_converter,
            kind: self.kind,
            coexist: self.coexist,
            critical_section: self.critical_section,
            target_critical_section: self.target_critical_section.clone(),
            docstring: String::new(),
            docstring_only: false,
        };
        Self::insert_receiver(clinic, &mut function);
        self.function = Some(clinic.add_function(function, block));

        self.next_state(State::ParametersStart, clinic, block, None)
    }

    /// Adds the automatic receiver parameter as the first entry.
    fn insert_receiver(clinic: &Clinic<'_>, function: &mut Function) {
        let (tp, name) =
            crate::converters::correct_name_for_self(function.kind, function.cls.is_some());
        let type_override = function.cls.and_then(|cls_id| {
            let typedef = &clinic.class(cls_id).typedef;
            (tp == "PyObject *" && !typedef.is_empty()).then(|| typedef.clone())
        });
        let mut converter = crate::converters::CConverter::new(
            crate::converters::ConverterKind::SelfSlot { type_override },
            name,
            name,
        );
        converter.signature_name = Some(name.to_owned());
        let receiver = Parameter {
            name: name.to_owned(),
            kind: ParameterKind::PositionalOnly,
            converter,
            default: DefaultValue::Unspecified,
            group: 0,
            deprecated_positional: None,
            deprecated_keyword: None,
            docstring: String::new(),
            right_bracket_count: 0,
        };
        function.parameters.insert(name.to_owned(), receiver);
    }

    /// Parses `fqname [as c_basename]`, validating both identifiers, and
    /// normalizes the function kind against the name.
    fn parse_function_names(
        &mut self,
        clinic: &Clinic<'_>,
        line: &str,
    ) -> ClinicResult<(String, String)> {
        let (full_name, c_basename) = match line.split_once(" as ") {
            Some((left, right)) => {
                let c_basename = right.trim().to_owned();
                if c_basename.is_empty() {
                    fail!("No C basename provided after 'as' keyword");
                }
                (left.trim().to_owned(), c_basename)
            }
            None => {
                let full_name = line.trim().to_owned();
                let mut fields: Vec<&str> = full_name.split('.').collect();
                if fields.last() == Some(&"__new__") {
                    fields.pop();
                }
                (full_name.clone(), fields.join("_"))
            }
        };
        if !expr::is_legal_py_identifier(&full_name) {
            fail!("Illegal function name: {full_name:?}");
        }
        if !expr::is_legal_c_identifier(&c_basename) {
            fail!("Illegal C basename: {c_basename:?}");
        }
        self.normalize_function_kind(clinic, &full_name)?;
        Ok((full_name, c_basename))
    }

    fn normalize_function_kind(&mut self, clinic: &Clinic<'_>, full_name: &str) -> ClinicResult<()> {
        let fields: Vec<&str> = full_name.split('.').collect();
        let (parents, last) = fields.split_at(fields.len() - 1);
        let name = last[0];
        let (_, cls) = clinic.module_and_class(parents)?;

        if UNSUPPORTED_SPECIAL_METHODS.contains(&name) {
            fail!("{name:?} is a special method and cannot be converted to Argument Clinic!");
        }
        if name == "__init__" && (self.kind != FunctionKind::Callable || cls.is_none()) {
            fail!(
                "{name:?} must be a normal method; got '{}'!",
                self.kind.display()
            );
        }
        if name == "__new__" && (self.kind != FunctionKind::ClassMethod || cls.is_none()) {
            fail!("'__new__' must be a class method!");
        }
        if matches!(self.kind, FunctionKind::Getter | FunctionKind::Setter) && cls.is_none() {
            fail!("@getter and @setter must be methods");
        }

        if name == "__new__" {
            self.kind = FunctionKind::MethodNew;
        } else if name == "__init__" {
            self.kind = FunctionKind::MethodInit;
        }
        Ok(())
    }

    fn resolve_return_converter(
        &self,
        clinic: &Clinic<'_>,
        full_name: &str,
        forced: &str,
    ) -> ClinicResult<crate::converters::ReturnConverter> {
        if !forced.is_empty() {
            if matches!(self.kind, FunctionKind::Getter | FunctionKind::Setter) {
                fail!("@{} method cannot define a return type", self.kind.display());
            }
            if self.kind == FunctionKind::MethodInit {
                fail!("__init__ methods cannot define a return type");
            }
            let annotation = expr::parse_annotation(forced)
                .map_err(|_| ClinicError::new(format!("Badly formed annotation for {full_name:?}: {forced:?}")))?;
            if annotation.legacy {
                fail!("Legacy converter {:?} not allowed as a return converter", annotation.name);
            }
            if !clinic.registry.has_return_converter(&annotation.name) {
                fail!("No available return converter called {:?}", annotation.name);
            }
            return clinic.registry.create_return_converter(&annotation.name);
        }

        if matches!(self.kind, FunctionKind::MethodInit | FunctionKind::Setter) {
            return Ok(crate::converters::ReturnConverter::Int);
        }
        Ok(crate::converters::ReturnConverter::Object)
    }

    fn parse_cloned_function(
        &mut self,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        names: (String, String),
        existing: &str,
    ) -> ClinicResult<()> {
        let (full_name, c_basename) = names;
        let fields: Vec<&str> = existing.split('.').map(str::trim).collect();
        let (parents, last) = fields.split_at(fields.len() - 1);
        let donor_name = last[0];
        let (module, cls) = clinic.module_and_class(parents)?;
        let donor_id = clinic
            .functions_of(module, cls)
            .iter()
            .copied()
            .find(|&id| clinic.function(id).name == donor_name)
            .ok_or_else(|| ClinicError::new(format!("Couldn't find existing function {existing:?}!")))?;

        let fields: Vec<&str> = full_name.split('.').collect();
        let (parents, last) = fields.split_at(fields.len() - 1);
        let function_name = last[0];
        let (module, cls) = clinic.module_and_class(parents)?;

        let donor = clinic.function(donor_id);
        let mut function = donor.clone();
        function.name = function_name.to_owned();
        function.full_name = full_name;
        function.module = module;
        function.cls = cls;
        function.c_basename = c_basename;
        function.docstring = String::new();

        if !(donor.kind == self.kind && donor.coexist == self.coexist) {
            if donor.kind.new_or_init() {
                function.kind = self.kind;
                function.coexist = self.coexist;
                function.return_converter = crate::converters::ReturnConverter::Object;
            } else {
                fail!(
                    "'kind' of function and cloned function don't match! \
                     (@classmethod/@staticmethod/@coexist)"
                );
            }
        }
        function.display_name = if function.kind.new_or_init() {
            function
                .cls
                .map_or_else(|| function.name.clone(), |id| clinic.class(id).name.clone())
        } else {
            function.name.clone()
        };

        self.function = Some(clinic.add_function(function, block));
        self.next_state(State::FunctionDocstring, clinic, block, None)
    }

    // --- state: parameters -------------------------------------------------

    fn state_parameters_start(
        &mut self,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        line: &str,
    ) -> ClinicResult<()> {
        if !self.valid_line(line) {
            return Ok(());
        }

        // an unindented first body line means there are no parameters
        if self.indent.infer(line)? == 0 {
            return self.next_state(State::FunctionDocstring, clinic, block, Some(line));
        }

        let function = self.function_ref(clinic);
        if matches!(function.kind, FunctionKind::Getter | FunctionKind::Setter) {
            fail!("@{} methods cannot define parameters", function.kind.display());
        }

        self.parameter_continuation.clear();
        self.next_state(State::Parameter, clinic, block, Some(line))
    }

    /// Commits the left-side polarity of every group seen so far.
    fn to_required(&mut self, clinic: &mut Clinic<'_>) {
        if self.parameter_state != ParamState::Required {
            self.parameter_state = ParamState::Required;
            for p in self.function_mut(clinic).parameters.values_mut() {
                p.group = -p.group;
            }
        }
    }

    fn state_parameter(&mut self, clinic: &mut Clinic<'_>, block: &mut Block, line: &str) -> ClinicResult<()> {
        if !self.valid_line(line) {
            return Ok(());
        }

        let line = if self.parameter_continuation.is_empty() {
            line.to_owned()
        } else {
            let joined = format!("{} {}", self.parameter_continuation, line.trim_start());
            self.parameter_continuation.clear();
            joined
        };

        match self.indent.infer(&line)? {
            -1 => return self.next_state(State::FunctionDocstring, clinic, block, Some(&line)),
            1 => return self.next_state(State::ParameterDocstringStart, clinic, block, Some(&line)),
            _ => {}
        }

        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            self.parameter_continuation = stripped.to_owned();
            return Ok(());
        }

        let mut text = trimmed.trim_start().to_owned();
        let mut version: Option<VersionTuple> = None;
        if let Some(captures) = FROM_VERSION_RE.captures(&text) {
            let marker = captures.get(1).expect("group 1 always captures").as_str().to_owned();
            version = Some(self.parse_version(clinic, captures.get(2).expect("group 2").as_str())?);
            text = marker;
        }

        match text.as_str() {
            "*" => self.parse_star(clinic, version),
            "[" => self.parse_opening_square_bracket(clinic),
            "]" => self.parse_closing_square_bracket(clinic),
            "/" => self.parse_slash(clinic, version),
            _ => self.parse_parameter(clinic, &text),
        }
    }

    fn parse_version(&self, clinic: &Clinic<'_>, text: &str) -> ClinicResult<VersionTuple> {
        let name = self.function_ref(clinic).name.clone();
        let parsed = text.split_once('.').and_then(|(major, minor)| {
            Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?))
        });
        parsed.ok_or_else(|| {
            ClinicError::new(format!(
                "Function {name:?}: expected format '[from major.minor]' \
                 where 'major' and 'minor' are integers; got {text:?}"
            ))
        })
    }

    fn parse_star(&mut self, clinic: &mut Clinic<'_>, version: Option<VersionTuple>) -> ClinicResult<()> {
        let name = self.function_ref(clinic).name.clone();
        match version {
            None => {
                if self.keyword_only {
                    fail!("Function {name:?} uses '*' more than once.");
                }
                self.check_previous_star(clinic)?;
                self.check_remaining_star(clinic)?;
                self.keyword_only = true;
            }
            Some(version) => {
                if self.keyword_only {
                    fail!("Function {name:?}: '* [from ...]' must precede '*'");
                }
                if let Some(existing) = self.deprecated_positional {
                    if existing == version {
                        fail!(
                            "Function {name:?} uses '* [from {}.{}]' more than once.",
                            version.0,
                            version.1
                        );
                    }
                    if existing < version {
                        fail!(
                            "Function {name:?}: '* [from {}.{}]' must precede '* [from {}.{}]'",
                            version.0,
                            version.1,
                            existing.0,
                            existing.1
                        );
                    }
                }
            }
        }
        self.deprecated_positional = version;
        Ok(())
    }

    fn parse_opening_square_bracket(&mut self, clinic: &mut Clinic<'_>) -> ClinicResult<()> {
        let name = self.function_ref(clinic).name.clone();
        self.parameter_state = match self.parameter_state {
            ParamState::Start | ParamState::LeftSquareBefore => ParamState::LeftSquareBefore,
            ParamState::Required | ParamState::GroupAfter => ParamState::GroupAfter,
            st => fail!(
                "Function {name:?} has an unsupported group configuration. (Unexpected state {st:?}.b)"
            ),
        };
        self.group += 1;
        self.function_mut(clinic).docstring_only = true;
        Ok(())
    }

    fn parse_closing_square_bracket(&mut self, clinic: &mut Clinic<'_>) -> ClinicResult<()> {
        let name = self.function_ref(clinic).name.clone();
        if self.group == 0 {
            fail!("Function {name:?} has a ']' without a matching '['.");
        }
        let group = self.group;
        if !self
            .function_ref(clinic)
            .parameters
            .values()
            .any(|p| p.group == group)
        {
            fail!(
                "Function {name:?} has an empty group. All groups must contain at least one parameter."
            );
        }
        self.group -= 1;
        self.parameter_state = match self.parameter_state {
            ParamState::LeftSquareBefore | ParamState::GroupBefore => ParamState::GroupBefore,
            ParamState::GroupAfter | ParamState::RightSquareAfter => ParamState::RightSquareAfter,
            st => fail!(
                "Function {name:?} has an unsupported group configuration. (Unexpected state {st:?}.c)"
            ),
        };
        Ok(())
    }

    fn parse_slash(&mut self, clinic: &mut Clinic<'_>, version: Option<VersionTuple>) -> ClinicResult<()> {
        let name = self.function_ref(clinic).name.clone();
        match version {
            None => {
                if self.deprecated_keyword.is_some() {
                    fail!("Function {name:?}: '/' must precede '/ [from ...]'");
                }
                if self.deprecated_positional.is_some() {
                    fail!("Function {name:?}: '/' must precede '* [from ...]'");
                }
                if self.keyword_only {
                    fail!("Function {name:?}: '/' must precede '*'");
                }
                if self.positional_only {
                    fail!("Function {name:?} uses '/' more than once.");
                }
            }
            Some(version) => {
                if let Some(existing) = self.deprecated_keyword {
                    if existing == version {
                        fail!(
                            "Function {name:?} uses '/ [from {}.{}]' more than once.",
                            version.0,
                            version.1
                        );
                    }
                    if existing > version {
                        fail!(
                            "Function {name:?}: '/ [from {}.{}]' must precede '/ [from {}.{}]'",
                            version.0,
                            version.1,
                            existing.0,
                            existing.1
                        );
                    }
                }
                if self.deprecated_positional.is_some() {
                    fail!("Function {name:?}: '/ [from ...]' must precede '* [from ...]'");
                }
                if self.keyword_only {
                    fail!("Function {name:?}: '/ [from ...]' must precede '*'");
                }
            }
        }
        self.positional_only = true;
        self.deprecated_keyword = version;

        if version.is_some() {
            let found = self
                .function_ref(clinic)
                .parameters
                .values()
                .last()
                .is_some_and(|p| p.kind == ParameterKind::PositionalOrKeyword);
            if !found {
                fail!("Function {name:?} specifies '/ [from ...]' without preceding parameters.");
            }
        }

        // Required and Optional are allowed here: positional-only without
        // option groups works, and can have default values
        let allowed = matches!(
            self.parameter_state,
            ParamState::Required
                | ParamState::Optional
                | ParamState::RightSquareAfter
                | ParamState::GroupBefore
        );
        if !allowed || self.group != 0 {
            fail!(
                "Function {name:?} has an unsupported group configuration. (Unexpected state {:?}.d)",
                self.parameter_state
            );
        }

        for p in self.function_mut(clinic).parameters.values_mut() {
            if p.kind == ParameterKind::PositionalOrKeyword {
                if version.is_none() {
                    p.kind = ParameterKind::PositionalOnly;
                } else if p.deprecated_keyword.is_none() {
                    p.deprecated_keyword = version;
                }
            }
        }
        Ok(())
    }

    fn parse_parameter(&mut self, clinic: &mut Clinic<'_>, line: &str) -> ClinicResult<()> {
        let function_name = self.function_ref(clinic).name.clone();

        match self.parameter_state {
            ParamState::Start | ParamState::Required => self.to_required(clinic),
            ParamState::LeftSquareBefore => self.parameter_state = ParamState::GroupBefore,
            ParamState::GroupBefore => {
                if self.group == 0 {
                    self.to_required(clinic);
                }
            }
            ParamState::GroupAfter | ParamState::Optional => {}
            st => fail!(
                "Function {function_name} has an unsupported group configuration. (Unexpected state {st:?}.a)"
            ),
        }

        // the `as` clause names the C variable; the annotation stays with
        // the Python name
        let mut c_name: Option<String> = None;
        let mut line = line.to_owned();
        let rebuilt = match line.split_once(" as ") {
            Some((name_part, trailing)) => {
                let mut name = name_part.trim().to_owned();
                if name.contains(' ') {
                    None
                } else {
                    let mut fields: Vec<String> =
                        trailing.trim().split(' ').map(str::to_owned).collect();
                    if fields.is_empty() {
                        fail!("Invalid 'as' clause!");
                    }
                    let mut c = fields[0].clone();
                    if let Some(stripped) = c.strip_suffix(':') {
                        name.push(':');
                        c = stripped.to_owned();
                    }
                    c_name = Some(c);
                    fields[0] = name;
                    Some(fields.join(" "))
                }
            }
            None => None,
        };
        if let Some(rebuilt) = rebuilt {
            line = rebuilt;
        }

        let (base, default_text) = match line.rsplit_once('=') {
            Some((base, default)) => (base.to_owned(), Some(default.trim().to_owned())),
            None => (line.clone(), None),
        };

        // the last '=' may have been inside a call annotation like
        // `c: int(accept={str})`; retry without splitting off a default
        let (decl, default_text) = match expr::parse_param_decl(base.trim()) {
            Ok(decl) => (decl, default_text),
            Err(_) => match expr::parse_param_decl(line.trim()) {
                Ok(decl) => (decl, None),
                Err(_) => fail!(
                    "Function {function_name:?} has an invalid parameter declaration:\n\t{line:?}"
                ),
            },
        };

        let is_vararg = decl.is_vararg;
        if is_vararg
            && self
                .function_ref(clinic)
                .parameters
                .values()
                .any(Parameter::is_vararg)
        {
            fail!("Too many var args");
        }

        let parameter_name = decl.name.clone();
        let Some(Annotation { name, legacy, kwargs }) = decl.annotation else {
            fail!("Annotations must be either a name, a function call, or a string.");
        };

        let mut user_c_default = kwargs
            .iter()
            .find(|(k, _)| k == "c_default")
            .and_then(|(_, v)| match v {
                Literal::Str(s) => Some(s.clone()),
                _ => None,
            });
        let user_py_default = kwargs
            .iter()
            .find(|(k, _)| k == "py_default")
            .and_then(|(_, v)| match v {
                Literal::Str(s) => Some(s.clone()),
                _ => None,
            });

        let mut computed_c_default: Option<String> = None;
        let mut computed_py_default: Option<String> = None;
        let value: DefaultValue;
        match &default_text {
            None => {
                if self.parameter_state == ParamState::Optional {
                    fail!(
                        "Can't have a parameter without a default ({parameter_name:?}) \
                         after a parameter with a default!"
                    );
                }
                if is_vararg {
                    value = DefaultValue::Null;
                    if user_c_default.is_none() {
                        user_c_default = Some("NULL".to_owned());
                    }
                } else {
                    value = DefaultValue::Unspecified;
                }
                if user_py_default.is_some() {
                    fail!("You can't specify py_default without specifying a default value!");
                }
            }
            Some(default) => {
                if is_vararg {
                    fail!("Vararg can't take a default value!");
                }
                if self.parameter_state == ParamState::Required {
                    self.parameter_state = ParamState::Optional;
                }

                match expr::parse_expression(default) {
                    Ok(Expr::Name(name)) if name == "NULL" => {
                        value = DefaultValue::Null;
                        computed_py_default = Some("<unrepresentable>".to_owned());
                        computed_c_default = Some("NULL".to_owned());
                    }
                    Ok(Expr::Literal(lit)) => {
                        computed_py_default = Some(lit.py_repr());
                        computed_c_default = Some(lit.c_repr());
                        value = DefaultValue::Value(lit);
                    }
                    Ok(Expr::Attribute(parts)) => {
                        let py_default = parts.join(".");
                        if user_c_default.is_none() {
                            fail!(
                                "When you specify a named constant ({py_default:?}) as your \
                                 default value, you MUST specify a valid c_default."
                            );
                        }
                        computed_py_default = Some(py_default);
                        value = DefaultValue::Unknown;
                    }
                    Ok(Expr::Name(other)) => {
                        if user_c_default.is_none() {
                            fail!(
                                "When you specify a named constant ({other:?}) as your \
                                 default value, you MUST specify a valid c_default."
                            );
                        }
                        computed_py_default = Some(other);
                        value = DefaultValue::Unknown;
                    }
                    _ => {
                        if user_c_default.is_none() {
                            fail!("Unsupported expression as default value: {default:?}");
                        }
                        computed_py_default = Some(default.clone());
                        value = DefaultValue::Unknown;
                    }
                }
            }
        }

        let c_default = user_c_default.or(computed_c_default);
        let py_default = user_py_default.or(computed_py_default);

        let converter_kwargs: Vec<(String, Literal)> = kwargs
            .into_iter()
            .filter(|(k, _)| k != "c_default" && k != "py_default")
            .collect();
        let registry = clinic.registry;
        let mut converter = registry.create_converter(
            &name,
            legacy,
            &parameter_name,
            c_name.as_deref().unwrap_or(&parameter_name),
            &converter_kwargs,
        )?;
        converter.c_default = c_default;
        converter.py_default = py_default;

        let mut kind = if is_vararg {
            ParameterKind::VarPositional
        } else if self.keyword_only {
            ParameterKind::KeywordOnly
        } else {
            ParameterKind::PositionalOrKeyword
        };

        if converter.is_self() {
            let function = self.function_mut(clinic);
            if function.parameters.len() == 1 {
                if self.parameter_state != ParamState::Required {
                    fail!("A 'self' parameter cannot be marked optional.");
                }
                if !value.is_unspecified() {
                    fail!("A 'self' parameter cannot have a default value.");
                }
                if self.group != 0 {
                    fail!("A 'self' parameter cannot be in an optional group.");
                }
                kind = ParameterKind::PositionalOnly;
                self.parameter_state = ParamState::Start;
                converter.signature_name = Some(converter.name.clone());
                function.parameters.clear();
            } else {
                fail!(
                    "A 'self' parameter, if specified, must be the very first thing \
                     in the parameter block."
                );
            }
        }

        if converter.is_defining_class() {
            let count = self.function_ref(clinic).parameters.len();
            if count == 1 {
                if self.parameter_state != ParamState::Required {
                    fail!("A 'defining_class' parameter cannot be marked optional.");
                }
                if !value.is_unspecified() {
                    fail!("A 'defining_class' parameter cannot have a default value.");
                }
                if self.group != 0 {
                    fail!("A 'defining_class' parameter cannot be in an optional group.");
                }
            } else {
                fail!(
                    "A 'defining_class' parameter, if specified, must either be the first \
                     thing in the parameter block, or come just after 'self'."
                );
            }
        }

        let parameter = Parameter {
            name: parameter_name.clone(),
            kind,
            converter,
            default: value,
            group: self.group,
            deprecated_positional: self.deprecated_positional,
            deprecated_keyword: None,
            docstring: String::new(),
            right_bracket_count: 0,
        };

        let function = self.function_mut(clinic);
        let names: Vec<&String> = function.parameters.values().map(|p| &p.name).collect();
        if names.iter().skip(1).any(|n| **n == parameter_name) {
            fail!("You can't have two parameters named {parameter_name:?}!");
        } else if let Some(first) = names.first()
            && **first == parameter_name
            && c_name.is_none()
        {
            fail!("Parameter {parameter_name:?} requires a custom C name");
        }

        let key = match &c_name {
            Some(c_name) => format!("{parameter_name}_as_{c_name}"),
            None => parameter_name,
        };
        function.parameters.insert(key, parameter);
        Ok(())
    }

    // --- state: docstrings --------------------------------------------------

    fn state_parameter_docstring_start(
        &mut self,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        line: &str,
    ) -> ClinicResult<()> {
        self.parameter_docstring_indent = self.indent.margin_width();
        self.next_state(State::ParameterDocstring, clinic, block, Some(line))
    }

    fn docstring_append_function(&self, clinic: &mut Clinic<'_>, line: &str) -> ClinicResult<()> {
        let dedented = self.dedent_docstring_line(line)?;
        let function = self.function_mut(clinic);
        if !function.docstring.is_empty() {
            function.docstring.push('\n');
        }
        function.docstring.push_str(&dedented);
        Ok(())
    }

    fn docstring_append_parameter(&self, clinic: &mut Clinic<'_>, line: &str) -> ClinicResult<()> {
        let dedented = self.dedent_docstring_line(line)?;
        let function = self.function_mut(clinic);
        let parameter = function
            .parameters
            .values_mut()
            .last()
            .expect("a parameter docstring follows a parameter");
        if !parameter.docstring.is_empty() {
            parameter.docstring.push('\n');
        }
        parameter.docstring.push_str(&dedented);
        Ok(())
    }

    fn dedent_docstring_line(&self, line: &str) -> ClinicResult<String> {
        for c in line.chars() {
            if !c.is_ascii() {
                log::warn!("Non-ascii characters are not allowed in docstrings: {c:?}");
                break;
            }
        }
        let stripped = line.trim_end();
        if stripped.is_empty() {
            Ok(String::new())
        } else {
            Ok(self.indent.dedent(stripped)?.to_owned())
        }
    }

    fn state_parameter_docstring(
        &mut self,
        clinic: &mut Clinic<'_>,
        block: &mut Block,
        line: &str,
    ) -> ClinicResult<()> {
        if !self.valid_line(line) {
            return Ok(());
        }

        let indent = self.indent.measure(line)?;
        if indent < self.parameter_docstring_indent {
            self.indent.infer(line)?;
            if self.indent.depth() == 2 {
                return self.next_state(State::Parameter, clinic, block, Some(line));
            }
            return self.next_state(State::FunctionDocstring, clinic, block, Some(line));
        }

        self.docstring_append_parameter(clinic, line)
    }

    fn state_function_docstring(
        &mut self,
        clinic: &mut Clinic<'_>,
        _block: &mut Block,
        line: &str,
    ) -> ClinicResult<()> {
        if self.group != 0 {
            let name = self.function_ref(clinic).name.clone();
            fail!("Function {name:?} has a ']' without a matching '['.");
        }
        if !self.valid_line(line) {
            return Ok(());
        }
        self.docstring_append_function(clinic, line)
    }

    // --- post-block ---------------------------------------------------------

    fn check_remaining_star(&self, clinic: &Clinic<'_>) -> ClinicResult<()> {
        let symbol = if self.keyword_only {
            "*"
        } else if self.deprecated_positional.is_some() {
            "* [from ...]"
        } else {
            return Ok(());
        };

        let function = self.function_ref(clinic);
        if let Some(p) = function.parameters.values().last() {
            if self.keyword_only {
                if p.kind == ParameterKind::KeywordOnly {
                    return Ok(());
                }
            } else if p.deprecated_positional == self.deprecated_positional {
                return Ok(());
            }
        }
        fail!(
            "Function {:?} specifies {symbol:?} without following parameters.",
            function.name
        );
    }

    fn check_previous_star(&self, clinic: &Clinic<'_>) -> ClinicResult<()> {
        let function = self.function_ref(clinic);
        if function.parameters.values().any(Parameter::is_vararg) {
            fail!("Function {:?} uses '*' more than once.", function.name);
        }
        Ok(())
    }

    fn post_block_cleanup(&mut self, clinic: &mut Clinic<'_>) -> ClinicResult<()> {
        if self.function.is_none() {
            return Ok(());
        }
        self.check_remaining_star(clinic)?;
        let docstring = self.format_docstring(clinic)?;
        self.function_mut(clinic).docstring = docstring;
        Ok(())
    }

    // --- docstring composition ---------------------------------------------

    fn format_docstring(&self, clinic: &Clinic<'_>) -> ClinicResult<String> {
        let f = self.function_ref(clinic);
        // no docstring is rendered for constructors and accessors without one
        if matches!(
            f.kind,
            FunctionKind::MethodInit | FunctionKind::MethodNew | FunctionKind::Getter | FunctionKind::Setter
        ) && f.docstring.is_empty()
        {
            return Ok(f.docstring.clone());
        }

        // every non-blank docstring must start with a one-line summary
        // followed by an empty line
        let mut lines: Vec<String> = f.docstring.split('\n').map(str::to_owned).collect();
        if lines.len() >= 2 {
            if !lines[1].is_empty() {
                fail!(
                    "Docstring for {:?} does not have a summary line!\n\
                     Every non-blank function docstring must start with \
                     a single line summary followed by an empty line.",
                    f.full_name
                );
            }
        } else if lines.len() == 1 {
            lines.push(String::new());
        }

        let marker_count = f.docstring.matches("{parameters}").count();
        if marker_count > 1 {
            fail!("You may not specify {{parameters}} more than once in a docstring!");
        }
        if marker_count == 0 {
            let at = lines.len().min(2);
            lines.insert(at, "{parameters}".to_owned());
        }
        lines.insert(0, "{signature}".to_owned());

        let mut params: Vec<Parameter> = f.parameters.values().cloned().collect();
        let parameters_text: String = params
            .iter()
            .filter(|p| !p.docstring.is_empty())
            .map(|p| format!("{}\n", p.render_docstring()))
            .collect();
        let signature = self.format_docstring_signature(f, &mut params);
        let docstring = lines.join("\n");
        let formatted = linear_format(
            &docstring,
            &[("signature", signature.as_str()), ("parameters", parameters_text.as_str())],
        )?;
        Ok(formatted.trim_end().to_owned())
    }

    fn format_docstring_signature(&self, f: &Function, parameters: &mut [Parameter]) -> String {
        let mut lines: Vec<String> = vec![f.displayname().to_owned()];
        if let Some(forced) = &self.forced_text_signature {
            lines.push(forced.clone());
        } else if matches!(f.kind, FunctionKind::Getter | FunctionKind::Setter) {
            // accessors do not carry a machine-readable signature
            return String::new();
        } else {
            lines.push("(".to_owned());

            // group brackets only decorate the positional-only prefix
            let mut positional_only = true;
            for p in parameters.iter_mut().skip(1) {
                if !p.is_positional_only() {
                    positional_only = false;
                }
                p.right_bracket_count = if positional_only && p.is_positional_only() {
                    p.group.abs()
                } else {
                    0
                };
            }

            let mut right_bracket_count = 0i32;
            let fix_right_bracket_count = |current: &mut i32, desired: i32| -> String {
                let mut s = String::new();
                while *current < desired {
                    s.push('[');
                    *current += 1;
                }
                while *current > desired {
                    s.push(']');
                    *current -= 1;
                }
                s
            };

            let show_receiver = !matches!(f.kind, FunctionKind::StaticMethod) && !f.kind.new_or_init();
            let shown: Vec<&Parameter> = parameters
                .iter()
                .filter(|p| {
                    if p.converter.is_self() {
                        show_receiver || f.docstring_only
                    } else {
                        p.converter.show_in_signature
                    }
                })
                .collect();

            let mut need_a_trailing_slash = false;
            if !f.docstring_only
                && let Some(last_shown) = shown.last()
            {
                need_a_trailing_slash = last_shown.is_positional_only();
            }

            let mut need_slash = false;
            let mut added_slash = false;
            let mut added_star = false;
            let mut first_parameter = true;
            let mut line_length: usize = lines.iter().map(String::len).sum();
            let indent = " ".repeat(line_length);

            let mut add_parameter = |lines: &mut Vec<String>,
                                     line_length: &mut usize,
                                     first_parameter: &mut bool,
                                     text: &str| {
                let s = if *first_parameter {
                    *first_parameter = false;
                    text.to_owned()
                } else {
                    let with_space = format!(" {text}");
                    if *line_length + with_space.len() >= 72 {
                        lines.push("\n".to_owned());
                        lines.push(indent.clone());
                        *line_length = indent.len();
                        text.to_owned()
                    } else {
                        with_space
                    }
                };
                *line_length += s.len();
                lines.push(s);
            };

            let last_index = shown.len().saturating_sub(1);
            for (i, p) in shown.iter().enumerate() {
                let is_self = p.converter.is_self();
                if is_self && f.docstring_only {
                    continue;
                }

                if p.is_positional_only() {
                    need_slash = !f.docstring_only;
                } else if need_slash && !added_slash {
                    added_slash = true;
                    add_parameter(&mut lines, &mut line_length, &mut first_parameter, "/,");
                }
                if p.is_keyword_only() && !added_star {
                    added_star = true;
                    add_parameter(&mut lines, &mut line_length, &mut first_parameter, "*,");
                }

                let mut p_text = fix_right_bracket_count(&mut right_bracket_count, p.right_bracket_count);
                if is_self {
                    // a bound signature strips the receiver; an unbound one
                    // marks it positional-only
                    p_text.push('$');
                }
                if p.is_vararg() {
                    p_text.push('*');
                }
                p_text.push_str(p.converter.signature_name.as_deref().unwrap_or(&p.name));

                if !p.is_vararg() && p.is_optional() {
                    p_text.push('=');
                    let value = p.converter.py_default.clone().unwrap_or_else(|| match &p.default {
                        DefaultValue::Value(lit) => lit.py_repr(),
                        _ => "None".to_owned(),
                    });
                    p_text.push_str(&value);
                }
                if i != last_index || need_a_trailing_slash {
                    p_text.push(',');
                }
                add_parameter(&mut lines, &mut line_length, &mut first_parameter, &p_text);
            }

            lines.push(fix_right_bracket_count(&mut right_bracket_count, 0));
            if need_a_trailing_slash {
                add_parameter(&mut lines, &mut line_length, &mut first_parameter, "/");
            }
            lines.push(")".to_owned());
        }

        if !f.docstring_only {
            lines.push(format!("\n{SIG_END_MARKER}\n"));
        }

        let signature_line = lines.concat();
        // nudge brackets that land after a comma back against it
        signature_line.replace(", ]", ",] ")
    }
}
