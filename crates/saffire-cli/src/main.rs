//! The `saffire` command: compiles syntax trees, writes bytecode files and runs them.

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::UNIX_EPOCH,
};

use clap::{Args, Parser, Subcommand};
use saffire::{
    CompileOptions, Error, LimitedTracker, MarshalOptions, NoLimitTracker, ResourceLimits, Runner, StdPrint,
    StderrTracer, ast::Node,
};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
const LOG_ENV: &str = "SAFFIRE_LOG";

#[derive(Debug, Parser)]
#[command(name = "saffire", version, about = "Saffire bytecode compiler and virtual machine")]
struct Cli {
    #[command(flatten)]
    run: RunOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RunOptions {
    /// Print every dispatched instruction to stderr.
    #[arg(long, global = true)]
    trace: bool,

    /// Abort the run after this many instructions.
    #[arg(long, global = true, value_name = "N")]
    max_operations: Option<usize>,

    /// Maximum call depth.
    #[arg(long, global = true, value_name = "N")]
    max_recursion: Option<usize>,
}

impl RunOptions {
    fn limits(&self) -> Option<ResourceLimits> {
        if self.max_operations.is_none() && self.max_recursion.is_none() {
            return None;
        }
        let mut limits = ResourceLimits::new();
        if let Some(n) = self.max_operations {
            limits = limits.max_operations(n);
        }
        if let Some(n) = self.max_recursion {
            limits = limits.max_recursion_depth(Some(n));
        }
        Some(limits)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a JSON syntax tree and run it.
    Run { file: PathBuf },
    /// Print the assembly listing of a JSON syntax tree.
    Asm { file: PathBuf },
    /// Compile a JSON syntax tree into a bytecode file.
    Compile {
        file: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Deflate the code body.
        #[arg(long)]
        compress: bool,
        /// Sign the file with this hex-encoded key.
        #[arg(long, value_name = "HEX", value_parser = parse_key)]
        sign_key: Option<Key>,
    },
    /// Run a bytecode file.
    Exec {
        file: PathBuf,
        /// Verify the file signature with this hex-encoded key.
        #[arg(long, value_name = "HEX", value_parser = parse_key)]
        verify_key: Option<Key>,
    },
    /// Disassemble a bytecode file.
    Disasm { file: PathBuf },
}

/// A signing key given on the command line.
#[derive(Debug, Clone)]
struct Key(Vec<u8>);

fn parse_key(hex: &str) -> Result<Key, String> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err("expected an even number of hex digits".to_owned());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex digits at offset {i}"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Key)
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode, String> {
    match &cli.command {
        Command::Run { file } => {
            let runner = compile_tree(file)?;
            Ok(execute(&runner, &cli.run))
        }
        Command::Asm { file } => {
            let runner = compile_tree(file)?;
            print!("{}", runner.listing());
            Ok(ExitCode::SUCCESS)
        }
        Command::Compile {
            file,
            output,
            compress,
            sign_key,
        } => {
            let runner = compile_tree(file)?;
            let mut options = MarshalOptions {
                timestamp: source_timestamp(file),
                ..MarshalOptions::default()
            };
            if *compress {
                options = options.compressed();
            }
            if let Some(Key(key)) = sign_key {
                options = options.signed(key.clone());
            }
            let bytes = runner.serialize(&options).map_err(|err| err.to_string())?;
            fs::write(output, &bytes).map_err(|err| format!("{}: {err}", output.display()))?;
            tracing::debug!(path = %output.display(), bytes = bytes.len(), "wrote bytecode");
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec { file, verify_key } => {
            let key = verify_key.as_ref().map(|Key(key)| key.as_slice());
            let runner = load_bytecode(file, key)?;
            Ok(execute(&runner, &cli.run))
        }
        Command::Disasm { file } => {
            let runner = load_bytecode(file, None)?;
            print!("{}", runner.listing());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn compile_tree(path: &Path) -> Result<Runner, String> {
    let json = fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()))?;
    let ast = Node::from_json(&json).map_err(|err| format!("{}: {err}", path.display()))?;
    let options = CompileOptions::default().source_file(path.display().to_string());
    Runner::new(&ast, &options).map_err(|err| err.to_string())
}

fn load_bytecode(path: &Path, verify_key: Option<&[u8]>) -> Result<Runner, String> {
    let bytes = fs::read(path).map_err(|err| format!("{}: {err}", path.display()))?;
    Runner::from_bytecode(&bytes, verify_key).map_err(|err| err.to_string())
}

/// Modification time of `path` in seconds, or 0 when unavailable.
fn source_timestamp(path: &Path) -> u32 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|elapsed| u32::try_from(elapsed.as_secs()).ok())
        .unwrap_or(0)
}

/// Runs `runner` and turns its exit code (or uncaught exception) into the process status.
fn execute(runner: &Runner, options: &RunOptions) -> ExitCode {
    let mut print = StdPrint;
    let result = match (options.limits(), options.trace) {
        (Some(limits), true) => runner.run_traced(LimitedTracker::new(limits), &mut print, &mut StderrTracer::new()),
        (Some(limits), false) => runner.run(LimitedTracker::new(limits), &mut print),
        (None, true) => runner.run_traced(NoLimitTracker, &mut print, &mut StderrTracer::new()),
        (None, false) => runner.run(NoLimitTracker, &mut print),
    };
    match result {
        Ok(code) => ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(u8::MAX)),
        Err(Error::Runtime(exc)) => {
            eprintln!("{exc}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("00ff10").unwrap().0, vec![0x00, 0xff, 0x10]);
        assert!(parse_key("abc").is_err());
        assert!(parse_key("zz").is_err());
        assert!(parse_key("").is_err());
    }

    #[test]
    fn test_cli_parses_compile_flags() {
        let cli = Cli::parse_from([
            "saffire",
            "compile",
            "prog.json",
            "-o",
            "prog.sfc",
            "--compress",
            "--sign-key",
            "6b6579",
        ]);
        let Command::Compile {
            output,
            compress,
            sign_key,
            ..
        } = cli.command
        else {
            panic!("expected the compile subcommand");
        };
        assert_eq!(output, PathBuf::from("prog.sfc"));
        assert!(compress);
        assert_eq!(sign_key.unwrap().0, b"key".to_vec());
    }

    #[test]
    fn test_limits_only_when_requested() {
        let cli = Cli::parse_from(["saffire", "run", "prog.json"]);
        assert!(cli.run.limits().is_none());
        let cli = Cli::parse_from(["saffire", "run", "prog.json", "--max-operations", "10"]);
        assert!(cli.run.limits().is_some());
    }
}
