extern crate clap;
#[macro_use] extern crate log;
extern crate fern;
extern crate chrono;
extern crate serde;
extern crate serde_json;
extern crate term_grid;
extern crate asm36;

use asm36::assembler::{lexer, Assembler, AssemblerOption};
use asm36::assembler::diagnostic::Level;
use asm36::assembler::module::RelocatableModule;
use asm36::linker::{Linker, LinkOption};
use asm36::linker::bank::{AbsoluteModule, BankDeclaration};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use serde::{Deserialize, Serialize};
use term_grid::{Cell, Direction, Filling, Grid, GridOptions};

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// What the `link` subcommand reads: the relocatable module files (relative
/// to the plan) and how their pools go into banks.
#[derive(Deserialize, Debug)]
struct LinkPlan {
    name: String,
    modules: Vec<String>,
    banks: Vec<BankDeclaration>,
    #[serde(default)]
    stack_depth: usize,
    #[serde(default)]
    options: Vec<String>,
}

fn main() {
    let args = process_arguments();
    let (name, sub) = match args.subcommand() {
        (name, Some(sub)) => (name, sub),
        _ => {
            initialize_logging(args.occurrences_of("verbose"));
            error!("fatal: no subcommand given");
            std::process::exit(1);
        }
    };
    // Global flags may be given on either side of the subcommand.
    initialize_logging(args.occurrences_of("verbose").max(sub.occurrences_of("verbose")));
    let print_debug = args.is_present("print-debug") || sub.is_present("print-debug");

    match name {
        "assemble" => assemble(sub, print_debug),
        "link" => link(sub, print_debug),
        _ => {
            error!("fatal: no subcommand given");
            std::process::exit(1);
        }
    }
}

fn assemble(args: &ArgMatches, print_debug: bool) {
    let ifile = args.value_of("INPUT").unwrap_or_default();
    let ipath = Path::new(ifile);
    debug!("Arguments:\n\tInfile: {}\n\tOutfile: {}\n\tEmit: {:?}",
        ifile,
        args.value_of("output").unwrap_or("None"),
        args.values_of("emit").map(|v| v.collect::<Vec<_>>()).unwrap_or_default()
    );

    let file = match File::open(&ipath) {
        Err(err) => {
            error!("fatal: unable to open input file `{}`: {}", ipath.display(), err);
            std::process::exit(1);
        },
        Ok(file) => file,
    };
    let lines = match lexer::read_source(Box::new(BufReader::new(file))) {
        Err(err) => {
            error!("fatal: unable to read input file `{}`: {}", ipath.display(), err);
            std::process::exit(1);
        },
        Ok(lines) => lines,
    };

    let name = match args.value_of("name") {
        Some(name) => name.to_uppercase(),
        None => file_stem(ipath).to_uppercase(),
    };
    let options: Vec<AssemblerOption> = args.values_of("emit")
        .map(|values| values.filter_map(assembler_option).collect())
        .unwrap_or_default();

    let mut assembler = Assembler::new().with_options(&options);
    let module = match assembler.assemble_source(&name, &lines) {
        Some(module) => module,
        None => {
            error!("fatal: assembly of `{}` failed", ipath.display());
            std::process::exit(1);
        }
    };

    if print_debug {
        print_diagnostics(&assembler);
        println!("{}", module.code_listing());
    }

    let errors = assembler.diagnostics().count(Level::Error);
    if errors > 0 {
        error!("fatal: {} error(s) assembling `{}`", errors, ipath.display());
        std::process::exit(1);
    }

    let opath = output_path(args, ipath, "rel.json");
    write_json(&opath, &module);
}

fn link(args: &ArgMatches, print_debug: bool) {
    let pfile = args.value_of("PLAN").unwrap_or_default();
    let ppath = Path::new(pfile);
    let plan: LinkPlan = match File::open(&ppath) {
        Err(err) => {
            error!("fatal: unable to open link plan `{}`: {}", ppath.display(), err);
            std::process::exit(1);
        },
        Ok(file) => match serde_json::from_reader(BufReader::new(file)) {
            Err(err) => {
                error!("fatal: unable to parse link plan `{}`: {}", ppath.display(), err);
                std::process::exit(1);
            },
            Ok(plan) => plan,
        },
    };

    let base = ppath.parent().unwrap_or_else(|| Path::new(""));
    let modules: Vec<RelocatableModule> = plan.modules.iter().map(|m| read_module(&base.join(m))).collect();

    let mut names: Vec<&str> = plan.options.iter().map(|s| s.as_str()).collect();
    if let Some(values) = args.values_of("option") {
        names.extend(values);
    }
    let mut options = Vec::new();
    for name in names {
        match LinkOption::from_name(name) {
            Some(option) => options.push(option),
            None => {
                error!("fatal: unknown link option `{}`", name);
                std::process::exit(1);
            }
        }
    }

    let stack_depth = match args.value_of("stack-depth") {
        None => plan.stack_depth,
        Some(text) => match text.parse::<usize>() {
            Ok(depth) => depth,
            Err(err) => {
                error!("fatal: bad stack depth `{}`: {}", text, err);
                std::process::exit(1);
            }
        },
    };

    let mut linker = Linker::new().with_options(&options);
    let module = match linker.link(&plan.name, &modules, &plan.banks, stack_depth) {
        Some(module) => module,
        None => {
            error!("fatal: linking `{}` failed with {} error(s)", plan.name, linker.errors());
            std::process::exit(1);
        }
    };

    if print_debug {
        print_banks(&module);
    }

    let opath = output_path(args, ppath, "abs.json");
    write_json(&opath, &module);
}

fn assembler_option(name: &str) -> Option<AssemblerOption> {
    match name {
        "source" => Some(AssemblerOption::EmitSource),
        "dictionary" => Some(AssemblerOption::EmitDictionary),
        "code" => Some(AssemblerOption::EmitGeneratedCode),
        "summary" => Some(AssemblerOption::EmitModuleSummary),
        _ => None,
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "MODULE".to_string())
}

fn output_path(args: &ArgMatches, input: &Path, extension: &str) -> PathBuf {
    match args.value_of("output") {
        Some(filename) => PathBuf::from(filename),
        None => input.with_file_name(format!("{}.{}", file_stem(input), extension)),
    }
}

fn read_module(path: &Path) -> RelocatableModule {
    let file = match File::open(path) {
        Err(err) => {
            error!("fatal: unable to open module file `{}`: {}", path.display(), err);
            std::process::exit(1);
        },
        Ok(file) => file,
    };
    match serde_json::from_reader(BufReader::new(file)) {
        Err(err) => {
            error!("fatal: unable to parse module file `{}`: {}", path.display(), err);
            std::process::exit(1);
        },
        Ok(module) => module,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    let text = match serde_json::to_string_pretty(value) {
        Err(err) => {
            error!("fatal: unable to serialize output: {}", err);
            std::process::exit(1);
        },
        Ok(text) => text,
    };
    let mut ofile = match File::create(&path) {
        Err(err) => {
            error!("fatal: unable to open output file `{}`: {}", path.display(), err);
            std::process::exit(1);
        },
        Ok(file) => file,
    };
    if let Err(err) = ofile.write_all(text.as_bytes()) {
        error!("fatal: unable to write to output file `{}`: {}", path.display(), err);
        std::process::exit(1);
    }
    info!("wrote {}", path.display());
}

fn print_diagnostics(assembler: &Assembler) {
    let mut grid = Grid::new(GridOptions {
        filling:     Filling::Spaces(1),
        direction:   Direction::LeftToRight,
    });
    for diagnostic in assembler.diagnostics().iter() {
        grid.add(Cell::from(format!("{}", diagnostic.level.indicator())));
        grid.add(Cell::from(format!("{}", diagnostic.locale)));
        grid.add(Cell::from(diagnostic.message.clone()));
    }
    println!("{}", grid.fit_into_columns(3));
}

fn print_banks(module: &AbsoluteModule) {
    println!("{}", module.summary());
    println!("{}", module.code_listing());
}

fn process_arguments() -> ArgMatches<'static> {
    let output = Arg::with_name("output")
        .short("o")
        .takes_value(true)
        .help("write output to an outfile");
    let print_debug = Arg::with_name("print-debug")
        .short("d")
        .alias("show")
        .takes_value(false)
        .global(true)
        .help("prints the debug information alongside the output to STDOUT");

    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .takes_value(false)
            .global(true)
            .help("Sets the level of verbosity"))
        .arg(print_debug)
        .subcommand(SubCommand::with_name("assemble")
            .about("Assembles a source file into a relocatable module")
            .arg(Arg::with_name("INPUT")
                .help("Sets the input file to use")
                .required(true)
                .multiple(false)
                .index(1))
            .arg(output.clone())
            .arg(Arg::with_name("name")
                .short("m")
                .takes_value(true)
                .help("module name (defaults to the input file stem)"))
            .arg(Arg::with_name("emit")
                .short("e")
                .takes_value(true)
                .multiple(true)
                .possible_values(&["source", "dictionary", "code", "summary"])
                .help("listings to log at info level")))
        .subcommand(SubCommand::with_name("link")
            .about("Links relocatable modules into an absolute module")
            .arg(Arg::with_name("PLAN")
                .help("JSON link plan naming the modules and bank declarations")
                .required(true)
                .multiple(false)
                .index(1))
            .arg(output)
            .arg(Arg::with_name("stack-depth")
                .short("s")
                .takes_value(true)
                .help("return control stack depth, overriding the plan"))
            .arg(Arg::with_name("option")
                .long("option")
                .takes_value(true)
                .multiple(true)
                .possible_values(&LinkOption::NAMES)
                .help("link options, added to those in the plan")))
        .get_matches()
}

fn initialize_logging(verbosity: u64) {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(match verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .chain(std::io::stdout())
        .apply().ok();
}
