//! The per-file orchestrator.
//!
//! One `Clinic` owns everything a single host file needs: the module, class
//! and function catalogs (arenas addressed by handle), the include set, the
//! destination map with its routing presets, and the preprocessor monitor.
//! It drives the block parser, hands directive blocks to the DSL parser, and
//! serializes the rewritten file.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::blocks::{Block, BlockParser, BlockPrinter};
use crate::codegen;
use crate::cpp::CppMonitor;
use crate::destinations::{BufferRef, Destination, DestinationKind, Fragment};
use crate::dsl::DslParser;
use crate::errors::{ClinicError, ClinicResult, fail};
use crate::files;
use crate::language::Language;
use crate::library::Registry;
use crate::model::{Class, ClassId, Function, FunctionId, Include, Module, ModuleId};

/// The built-in routing presets, in the same declarative form the
/// `output preset` directive consumes.
const PRESETS_TEXT: &str = "
preset block
everything block
methoddef_ifndef buffer 1
docstring_prototype suppress
parser_prototype suppress
cpp_if suppress
cpp_endif suppress

preset original
everything block
methoddef_ifndef buffer 1
docstring_prototype suppress
parser_prototype suppress
cpp_if suppress
cpp_endif suppress

preset file
everything file
methoddef_ifndef file 1
docstring_prototype suppress
parser_prototype suppress
impl_definition block

preset buffer
everything buffer
methoddef_ifndef buffer 1
impl_definition block
docstring_prototype suppress
impl_prototype suppress
parser_prototype suppress

preset partial-buffer
everything buffer
methoddef_ifndef buffer 1
docstring_prototype block
impl_prototype suppress
methoddef_define block
parser_prototype block
impl_definition block
";

pub struct Clinic<'r> {
    pub registry: &'r Registry,
    pub language: Language,
    pub filename: String,
    pub limited_capi: bool,
    pub verify: bool,
    pub line_prefix: String,
    pub line_suffix: String,
    pub cpp: CppMonitor,
    pub includes: IndexMap<String, Include>,
    pub ifndef_symbols: HashSet<String>,

    pub(crate) modules: Vec<Module>,
    pub(crate) classes: Vec<Class>,
    pub(crate) functions: Vec<Function>,
    pub(crate) root_modules: IndexMap<String, ModuleId>,
    pub(crate) root_classes: IndexMap<String, ClassId>,
    pub(crate) root_functions: Vec<FunctionId>,

    pub(crate) destinations: IndexMap<String, Destination>,
    pub(crate) routing: IndexMap<Fragment, BufferRef>,
    pub(crate) routing_stack: Vec<IndexMap<Fragment, BufferRef>>,
    pub(crate) presets: IndexMap<String, IndexMap<Fragment, BufferRef>>,
}

impl<'r> Clinic<'r> {
    pub fn new(
        registry: &'r Registry,
        filename: impl Into<String>,
        limited_capi: bool,
        verify: bool,
    ) -> ClinicResult<Self> {
        let filename = filename.into();
        let mut clinic = Self {
            registry,
            language: Language::c(),
            filename,
            limited_capi,
            verify,
            line_prefix: String::new(),
            line_suffix: String::new(),
            cpp: CppMonitor::new(),
            includes: IndexMap::new(),
            ifndef_symbols: HashSet::new(),
            modules: Vec::new(),
            classes: Vec::new(),
            functions: Vec::new(),
            root_modules: IndexMap::new(),
            root_classes: IndexMap::new(),
            root_functions: Vec::new(),
            destinations: IndexMap::new(),
            routing: IndexMap::new(),
            routing_stack: Vec::new(),
            presets: IndexMap::new(),
        };

        clinic.add_destination("block", DestinationKind::Buffer, None)?;
        clinic.add_destination("suppress", DestinationKind::Suppress, None)?;
        clinic.add_destination("buffer", DestinationKind::Buffer, None)?;
        if !clinic.filename.is_empty() {
            clinic.add_destination(
                "file",
                DestinationKind::File,
                Some("{dirname}/clinic/{basename}.h"),
            )?;
        }

        // the default routing: generated code goes to the sidecar header,
        // with only the impl prototype left inline above the user's body
        let file_or_block = if clinic.destinations.contains_key("file") {
            "file"
        } else {
            "block"
        };
        clinic.routing = IndexMap::from([
            (Fragment::CppIf, BufferRef::new(file_or_block, 0)),
            (Fragment::DocstringPrototype, BufferRef::new("suppress", 0)),
            (Fragment::DocstringDefinition, BufferRef::new(file_or_block, 0)),
            (Fragment::MethoddefDefine, BufferRef::new(file_or_block, 0)),
            (Fragment::ImplPrototype, BufferRef::new(file_or_block, 0)),
            (Fragment::ParserPrototype, BufferRef::new("suppress", 0)),
            (Fragment::ParserDefinition, BufferRef::new(file_or_block, 0)),
            (Fragment::CppEndif, BufferRef::new(file_or_block, 0)),
            (Fragment::MethoddefIfndef, BufferRef::new(file_or_block, 1)),
            (Fragment::ImplDefinition, BufferRef::new("block", 0)),
        ]);

        clinic.parse_presets()?;
        Ok(clinic)
    }

    fn parse_presets(&mut self) -> ClinicResult<()> {
        let mut current: Option<String> = None;
        for line in PRESETS_TEXT.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let name = words.next().expect("non-empty line has a first word");
            let value = words
                .next()
                .ok_or_else(|| ClinicError::new(format!("Malformed preset line: {line:?}")))?;
            if name == "preset" {
                self.presets.insert(value.to_owned(), IndexMap::new());
                current = Some(value.to_owned());
                continue;
            }
            let index: i64 = match words.next() {
                Some(index) => index
                    .parse()
                    .map_err(|_| ClinicError::new(format!("Malformed preset line: {line:?}")))?,
                None => 0,
            };
            let preset_name = current
                .clone()
                .ok_or_else(|| ClinicError::new("Preset assignment before any 'preset' line"))?;
            let preset = self
                .presets
                .get_mut(&preset_name)
                .expect("preset was just inserted");
            let buffer = BufferRef::new(value, index);
            if name == "everything" {
                for fragment in Fragment::ALL {
                    preset.insert(fragment, buffer.clone());
                }
                continue;
            }
            let fragment: Fragment = name
                .parse()
                .map_err(|_| ClinicError::new(format!("Malformed preset line: {line:?}")))?;
            preset.insert(fragment, buffer);
        }
        Ok(())
    }

    // --- catalogs -----------------------------------------------------------

    pub(crate) fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    pub(crate) fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0]
    }

    pub(crate) fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0]
    }

    pub(crate) fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0]
    }

    /// Walks dotted fields to the (module, class) pair that should own a new
    /// item. The orchestrator itself is the root module.
    pub(crate) fn module_and_class(
        &self,
        fields: &[&str],
    ) -> ClinicResult<(Option<ModuleId>, Option<ClassId>)> {
        let mut module: Option<ModuleId> = None;
        let mut cls: Option<ClassId> = None;

        for (idx, field) in fields.iter().enumerate() {
            let (child_modules, child_classes) = match (cls, module) {
                (Some(class_id), _) => (None, Some(&self.class(class_id).classes)),
                (None, Some(module_id)) => {
                    let m = self.module(module_id);
                    (Some(&m.modules), Some(&m.classes))
                }
                (None, None) => (Some(&self.root_modules), Some(&self.root_classes)),
            };

            if let Some(modules) = child_modules
                && let Some(&child) = modules.get(*field)
            {
                module = Some(child);
                continue;
            }
            if let Some(classes) = child_classes
                && let Some(&child) = classes.get(*field)
            {
                cls = Some(child);
                continue;
            }
            let rest = fields[idx..].join(".");
            fail!("Parent class or module {rest:?} does not exist.");
        }

        Ok((module, cls))
    }

    pub(crate) fn add_module(
        &mut self,
        module: Module,
        key: &str,
        parent: Option<ModuleId>,
    ) -> ClinicResult<()> {
        let owner = match parent {
            Some(parent_id) => &self.modules[parent_id.0].modules,
            None => &self.root_modules,
        };
        if owner.contains_key(key) {
            fail!("Already defined module {:?}!", module.name);
        }
        let id = ModuleId(self.modules.len());
        self.modules.push(module);
        match parent {
            Some(parent_id) => {
                self.modules[parent_id.0].modules.insert(key.to_owned(), id);
            }
            None => {
                self.root_modules.insert(key.to_owned(), id);
            }
        }
        Ok(())
    }

    pub(crate) fn add_class(
        &mut self,
        class: Class,
        module: Option<ModuleId>,
        parent_class: Option<ClassId>,
    ) -> ClinicResult<()> {
        let key = class.name.clone();
        let owner = match (parent_class, module) {
            (Some(class_id), _) => &self.classes[class_id.0].classes,
            (None, Some(module_id)) => &self.modules[module_id.0].classes,
            (None, None) => &self.root_classes,
        };
        if owner.contains_key(&key) {
            fail!("Already defined class {key:?}!");
        }
        let id = ClassId(self.classes.len());
        self.classes.push(class);
        match (parent_class, module) {
            (Some(class_id), _) => {
                self.classes[class_id.0].classes.insert(key, id);
            }
            (None, Some(module_id)) => {
                self.modules[module_id.0].classes.insert(key, id);
            }
            (None, None) => {
                self.root_classes.insert(key, id);
            }
        }
        Ok(())
    }

    /// Registers a finished function with its owner and the block.
    pub(crate) fn add_function(&mut self, function: Function, block: &mut Block) -> FunctionId {
        let id = FunctionId(self.functions.len());
        let owner_cls = function.cls;
        let owner_module = function.module;
        self.functions.push(function);
        match (owner_cls, owner_module) {
            (Some(class_id), _) => self.classes[class_id.0].functions.push(id),
            (None, Some(module_id)) => self.modules[module_id.0].functions.push(id),
            (None, None) => self.root_functions.push(id),
        }
        block.signatures.push(id);
        id
    }

    pub(crate) fn functions_of(
        &self,
        module: Option<ModuleId>,
        cls: Option<ClassId>,
    ) -> &[FunctionId] {
        match (cls, module) {
            (Some(class_id), _) => &self.class(class_id).functions,
            (None, Some(module_id)) => &self.module(module_id).functions,
            (None, None) => &self.root_functions,
        }
    }

    // --- includes -----------------------------------------------------------

    /// Records an include request.
    ///
    /// Merge rule: an unconditional include wins over a conditional one for
    /// the same name; otherwise the first recorded reason is kept.
    pub fn add_include(&mut self, name: &str, reason: &str, condition: Option<String>) {
        if let Some(existing) = self.includes.get(name) {
            let upgrade = existing.condition.is_some() && condition.is_none();
            if !upgrade {
                return;
            }
        }
        self.includes
            .insert(name.to_owned(), Include::new(name, reason, condition));
    }

    // --- destinations -------------------------------------------------------

    pub(crate) fn add_destination(
        &mut self,
        name: &str,
        kind: DestinationKind,
        filename_template: Option<&str>,
    ) -> ClinicResult<()> {
        if self.destinations.contains_key(name) {
            fail!("Destination already exists: {name:?}");
        }
        let destination = Destination::new(name, kind, filename_template, &self.filename)?;
        self.destinations.insert(name.to_owned(), destination);
        Ok(())
    }

    pub(crate) fn get_destination_mut(&mut self, name: &str) -> ClinicResult<&mut Destination> {
        self.destinations
            .get_mut(name)
            .ok_or_else(|| ClinicError::new(format!("Destination does not exist: {name:?}")))
    }

    /// Appends one rendered fragment to its routed buffer.
    pub(crate) fn append_fragment(&mut self, fragment: Fragment, text: &str) -> ClinicResult<()> {
        let Some(buffer_ref) = self.routing.get(&fragment).cloned() else {
            fail!("No destination routed for fragment {fragment}");
        };
        let destination = self.get_destination_mut(&buffer_ref.destination)?;
        destination.buffers.buffer_mut(buffer_ref.index).push_str(text);
        Ok(())
    }

    pub(crate) fn dump_block_destination(&mut self) -> String {
        self.destinations
            .get_mut("block")
            .expect("the block destination is built in")
            .dump()
    }

    // --- rendering ----------------------------------------------------------

    /// Renders the functions a block declared; at most one is allowed.
    pub(crate) fn render_block(&mut self, block: &Block) -> ClinicResult<String> {
        if block.signatures.len() > 1 {
            let first = self.function(block.signatures[0]).full_name.clone();
            let second = self.function(block.signatures[1]).full_name.clone();
            fail!(
                "You may specify at most one function per block.\n\
                 Found a block containing at least two:\n\t{first} and {second}"
            );
        }
        match block.signatures.first() {
            Some(&id) => {
                // the function is taken out for rendering so the generator
                // can append deprecation notes to its docstring while it
                // also reaches back into the orchestrator
                let mut function = self.functions[id.0].clone();
                let result = codegen::render_function(self, &mut function);
                self.functions[id.0] = function;
                result
            }
            None => Ok(String::new()),
        }
    }

    /// Processes one host file's text and returns the rewritten text.
    pub fn parse(&mut self, input: &str) -> ClinicResult<String> {
        let mut printer = BlockPrinter::new(self.language.clone());
        let mut parser = BlockParser::new(input, self.language.clone(), self.verify);
        let mut dsl = DslParser::new();

        loop {
            let Some(mut block) = parser.next_block(&mut self.cpp)? else {
                break;
            };
            if let Some(dsl_name) = block.dsl_name.clone() {
                if dsl_name != "clinic" {
                    fail!("No parser to handle {dsl_name:?} block.");
                }
                let start = parser.block_start_line_number;
                dsl.parse(self, &mut block, start)?;
            }
            printer.print_block(&block, false, &[]);
        }

        self.flush_destinations(&mut printer)?;
        Ok(printer.finish())
    }

    /// End-of-file flush: leftover buffer text is re-injected as a `dump`
    /// block; file destinations are written out as sidecar headers.
    fn flush_destinations(&mut self, printer: &mut BlockPrinter) -> ClinicResult<()> {
        let names: Vec<String> = self.destinations.keys().cloned().collect();
        for name in names {
            let destination = self.destinations.get_mut(&name).expect("name comes from keys");
            if destination.kind == DestinationKind::Suppress {
                continue;
            }
            let output = destination.dump();
            if output.is_empty() {
                continue;
            }

            match destination.kind {
                DestinationKind::Buffer => {
                    log::warn!("Destination buffer {name:?} not empty at end of file, emptying.");
                    let block = Block {
                        input: format!("dump {name}\n"),
                        output,
                        dsl_name: Some("clinic".to_owned()),
                        signatures: Vec::new(),
                    };
                    printer.write("\n");
                    printer.print_block(&block, false, &[]);
                }
                DestinationKind::File => {
                    let filename = destination
                        .filename
                        .clone()
                        .expect("file destinations always resolve a filename");
                    // shallow self-overwrite guard, by path string only
                    if filename == self.filename {
                        fail!("Destination is the source file itself: {filename:?}");
                    }
                    if self.verify
                        && let Ok(existing) = files::read_file(&filename)
                    {
                        let mut existing_parser =
                            BlockParser::new(&existing, self.language.clone(), false);
                        let mut cpp = CppMonitor::new();
                        let mut blocks = Vec::new();
                        while let Some(parsed) = existing_parser.next_block(&mut cpp)? {
                            blocks.push(parsed);
                        }
                        let pristine = blocks.len() == 1 && blocks[0].input == "preserve\n";
                        if !pristine {
                            fail!("Modified destination file {filename:?}; not overwriting!");
                        }
                    }

                    let block = Block {
                        input: "preserve\n".to_owned(),
                        output,
                        dsl_name: Some("clinic".to_owned()),
                        signatures: Vec::new(),
                    };
                    let includes: Vec<Include> = self.includes.values().cloned().collect();
                    let mut file_printer = BlockPrinter::new(self.language.clone());
                    file_printer.print_block(&block, true, &includes);
                    files::write_file(&filename, &file_printer.finish())?;
                }
                DestinationKind::Suppress => {}
            }
        }
        Ok(())
    }
}

static LIMITED_CAPI_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"#\s*define\s+Py_LIMITED_API").expect("static regex compiles")
});

const SUPPORTED_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx"];

/// Runs the preprocessor over one file, writing the result to `output`
/// (defaults to rewriting the file in place).
pub fn parse_file(
    registry: &Registry,
    filename: &str,
    output: Option<&str>,
    limited_capi: bool,
    verify: bool,
) -> ClinicResult<()> {
    let output = output.unwrap_or(filename);

    let extension = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if extension.is_empty() {
        fail!("Can't extract file type for file {filename:?}");
    }
    if !SUPPORTED_EXTENSIONS.contains(&extension) {
        fail!("Can't identify file type for file {filename:?}");
    }

    let raw = files::read_file(filename)?;

    // exit quickly if there are no directive markers in the file
    let language = Language::c();
    if !BlockParser::contains_start_marker(&language, &raw) {
        return Ok(());
    }

    let limited_capi = limited_capi || LIMITED_CAPI_RE.is_match(&raw);

    log::debug!("processing {filename}");
    let mut clinic = Clinic::new(registry, filename, limited_capi, verify)?;
    let cooked = clinic.parse(&raw).map_err(|e| e.with_filename(filename))?;

    files::write_file(output, &cooked)?;
    Ok(())
}
