//! Command-line front end for the argclinic preprocessor.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use walkdir::WalkDir;

use argclinic::{ClinicResult, Registry, parse_file};

/// Preprocessor for C files implementing extension functions.
///
/// Automates the argument-parsing boilerplate for builtins and provides
/// introspection signatures ("docstrings") for them.
#[derive(Parser, Debug)]
#[command(name = "argclinic", version, about)]
struct Cli {
    /// Force output regeneration even when checksums do not match.
    #[arg(short, long)]
    force: bool,

    /// Redirect file output to OUTPUT.
    #[arg(short, long)]
    output: Option<String>,

    /// Enable verbose mode.
    #[arg(short, long)]
    verbose: bool,

    /// Print a list of all supported converters and return converters.
    #[arg(long)]
    converters: bool,

    /// Walk --srcdir to run over all relevant files.
    #[arg(long)]
    make: bool,

    /// The directory tree to walk in --make mode.
    #[arg(long, default_value = ".")]
    srcdir: String,

    /// A file to exclude in --make mode; can be given multiple times.
    #[arg(long)]
    exclude: Vec<String>,

    /// Use the limited C API.
    #[arg(long = "limited")]
    limited_capi: bool,

    /// The list of files to process.
    #[arg(value_name = "FILE")]
    filename: Vec<String>,
}

/// Directories never descended into when walking a source tree.
const SKIP_DIRS: &[&str] = &[".svn", ".git", ".hg", "build", "externals"];

fn print_converters(registry: &Registry) {
    println!();

    println!("Legacy converters:");
    let legacy = registry.legacy_converters();
    let upper: Vec<&str> = legacy
        .iter()
        .copied()
        .filter(|c| c.chars().next().is_some_and(char::is_uppercase))
        .collect();
    let lower: Vec<&str> = legacy
        .iter()
        .copied()
        .filter(|c| c.chars().next().is_some_and(char::is_lowercase))
        .collect();
    if !upper.is_empty() {
        println!("    {}", upper.join(" "));
    }
    println!("    {}", lower.join(" "));
    println!();

    println!("Converters:");
    for info in registry.converters() {
        println!("    {}({})", info.name, info.options.join(", "));
    }
    println!();

    println!("Return converters:");
    for name in registry.return_converters() {
        println!("    {name}()");
    }
    println!();
    println!("All converters also accept (c_default=None, py_default=None).");
}

fn run_make(cli: &Cli, registry: &Registry) -> ClinicResult<()> {
    let excludes: Vec<PathBuf> = cli
        .exclude
        .iter()
        .map(|f| Path::new(&cli.srcdir).join(f))
        .collect();

    let walker = WalkDir::new(&cli.srcdir).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIP_DIRS.contains(&name)))
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                log::warn!("skipping unreadable entry: {error}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_source = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "c" | "cpp" | "h"));
        if !is_source {
            continue;
        }
        if excludes.iter().any(|excluded| excluded == path) {
            continue;
        }
        let Some(path) = path.to_str() else {
            continue;
        };
        if cli.verbose {
            println!("{path}");
        }
        parse_file(registry, path, None, cli.limited_capi, !cli.force)?;
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<(), String> {
    let registry = Registry::standard();

    if cli.converters {
        if !cli.filename.is_empty() {
            return Err("can't specify --converters and a filename at the same time".to_owned());
        }
        print_converters(&registry);
        return Ok(());
    }

    if cli.make {
        if cli.output.is_some() || !cli.filename.is_empty() {
            return Err("can't use -o or filenames with --make".to_owned());
        }
        if cli.srcdir.is_empty() {
            return Err("--srcdir must not be empty with --make".to_owned());
        }
        return run_make(cli, &registry).map_err(|e| e.report());
    }

    if cli.filename.is_empty() {
        return Err("no input files".to_owned());
    }
    if cli.output.is_some() && cli.filename.len() > 1 {
        return Err("can't use -o with multiple filenames".to_owned());
    }

    for filename in &cli.filename {
        if cli.verbose {
            println!("{filename}");
        }
        parse_file(
            &registry,
            filename,
            cli.output.as_deref(),
            cli.limited_capi,
            !cli.force,
        )
        .map_err(|e| e.report())?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprint!("{message}");
            if !message.ends_with('\n') {
                eprintln!();
            }
            ExitCode::FAILURE
        }
    }
}
