use std::{
    fs,
    io::IsTerminal,
    path::{Path, PathBuf},
    process::ExitCode,
};

use bpaf::{Parser, construct, positional, short};
use koto_lang::{
    ElaborateResult, Error, Result,
    backend::{anf, generate},
    elaborate, parse,
    util::{Diagnostic, report::render},
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
enum Command {
    Check {
        path: PathBuf,
    },
    Build {
        output: Option<PathBuf>,
        path: PathBuf,
    },
}

fn source() -> impl Parser<PathBuf> {
    positional::<PathBuf>("PATH").help("Source file")
}

fn command() -> impl Parser<Command> {
    let path = source();
    let check = construct!(Command::Check { path })
        .to_options()
        .descr("Type check a file and report its diagnostics")
        .command("check");
    let output = short('o')
        .long("output")
        .help("Where to write the module, defaults to PATH with extension mjs")
        .argument::<PathBuf>("OUT")
        .optional();
    let path = source();
    let build = construct!(Command::Build { output, path })
        .to_options()
        .descr("Type check a file and compile it to a JavaScript module")
        .command("build");
    construct!([check, build])
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Elaborates `path`, printing every diagnostic. `None` when any is an error.
fn check(path: &Path) -> Result<Option<ElaborateResult>> {
    let text = read(path)?;
    let parsed = parse(&text);
    let elaborated = elaborate(&parsed)?;
    let diagnostics = parsed
        .diagnostics
        .iter()
        .chain(&elaborated.diagnostics)
        .cloned()
        .collect::<Vec<Diagnostic>>();
    if !diagnostics.is_empty() {
        let color = std::io::stderr().is_terminal();
        eprint!("{}", render(&text, &diagnostics, color));
    }
    let errors = diagnostics.iter().filter(|d| d.is_error()).count();
    debug!(
        errors,
        warnings = diagnostics.len() - errors,
        "checked {}",
        path.display()
    );
    if errors > 0 {
        eprintln!("{}: {errors} error(s)", path.display());
        return Ok(None);
    }
    Ok(Some(elaborated))
}

fn build(path: &Path, output: Option<PathBuf>) -> Result<bool> {
    let Some(elaborated) = check(path)? else {
        eprintln!("Build failed with errors.");
        return Ok(false);
    };
    let code = generate(&anf(&elaborated.term)?)?.code;
    let output = output.unwrap_or_else(|| path.with_extension("mjs"));
    fs::write(&output, code).map_err(|source| Error::Io {
        path: output.display().to_string(),
        source,
    })?;
    info!("wrote {}", output.display());
    println!("Build succeeded. Output written to {}", output.display());
    Ok(true)
}

fn run(command: Command) -> Result<bool> {
    match command {
        Command::Check { path } => Ok(check(&path)?.is_some()),
        Command::Build { output, path } => build(&path, output),
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let command = command()
        .to_options()
        .descr("Toolchain for the koto language")
        .run();
    match run(command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
