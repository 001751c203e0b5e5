//! # wave-run
//!
//! Load a WebAssembly module, run its start function, then invoke an export
//! (`main` by default) and print the result.
//!
//! ```text
//! wave-run [-v]... [--no-signature-check] <module.wasm> [export]
//! ```
//!
//! Verbosity: no flag logs warnings, `-v` info, `-vv` debug, `-vvv` the
//! per-instruction compile listing. `WAVE_LOG=<level>` overrides the flags.
//! Any failure prints its category and exits with status 1.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use wave::{Runtime, RuntimeConfig, Value, WaveError};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

struct Options {
    verbosity: u8,
    check_signatures: bool,
    module: PathBuf,
    export: String,
}

fn parse_args() -> Result<Options> {
    let mut verbosity = 0u8;
    let mut check_signatures = true;
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--no-signature-check" => check_signatures = false,
            flag if flag.starts_with("-v") && flag[1..].chars().all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((flag.len() - 1) as u8);
            }
            flag if flag.starts_with('-') => bail!("unknown option `{flag}`"),
            _ => positional.push(arg),
        }
    }
    let mut positional = positional.into_iter();
    let Some(module) = positional.next() else {
        bail!("usage: wave-run [-v]... [--no-signature-check] <module.wasm> [export]");
    };
    Ok(Options {
        verbosity,
        check_signatures,
        module: PathBuf::from(module),
        export: positional.next().unwrap_or_else(|| "main".to_string()),
    })
}

fn init_logging(verbosity: u8) {
    let from_flags = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let level = std::env::var("WAVE_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(from_flags);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn run(options: &Options) -> Result<Option<Value>> {
    let bytes = std::fs::read(&options.module)
        .with_context(|| format!("reading {}", options.module.display()))?;
    let config = RuntimeConfig {
        check_indirect_signatures: options.check_signatures,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::load_with_config(&bytes, config)
        .with_context(|| format!("loading {}", options.module.display()))?;
    log::info!(
        "loaded {}: {} functions, {} exports",
        options.module.display(),
        runtime.module().function_count(),
        runtime.module().exports.len()
    );

    runtime.run_start().context("running the start function")?;
    let result = runtime
        .invoke(&options.export, &[])
        .with_context(|| format!("invoking `{}`", options.export))?;

    let stats = runtime.jit_stats();
    log::info!(
        "compiled {} functions, {} bytes of code",
        stats.functions_compiled,
        stats.total_code_size
    );
    Ok(result)
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("wave-run: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(options.verbosity);

    match run(&options) {
        Ok(Some(value)) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            let category = err
                .downcast_ref::<WaveError>()
                .map_or("Io", WaveError::category);
            eprintln!("wave-run: {category}: {err:#}");
            ExitCode::FAILURE
        }
    }
}
