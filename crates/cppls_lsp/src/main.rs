//! cppls entry point.
//!
//! Modes: `pipe` (default, stdin/stdout), `socket` (bind host:port), and
//! `indexer` (batch-index the workspace and exit). Logs go to stderr;
//! stdout belongs to the protocol.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use cppls::frontend::mini::MiniFrontEnd;

struct Options {
    mode: Mode,
    host: String,
    port: u16,
    log_color: ColorMode,
    log_level: String,
    plugin_paths: Vec<String>,
    workspace: Option<String>,
}

#[derive(PartialEq)]
enum Mode {
    Pipe,
    Socket,
    Indexer,
}

#[derive(PartialEq)]
enum ColorMode {
    Always,
    Auto,
    Never,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Pipe,
            host: "127.0.0.1".to_owned(),
            port: 50051,
            log_color: ColorMode::Auto,
            log_level: "info".to_owned(),
            plugin_paths: Vec::new(),
            workspace: None,
        }
    }
}

fn print_help() {
    println!("cppls - C/C++ language server");
    println!();
    println!("Usage: cppls [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --mode <pipe|socket|indexer>   How to serve (default: pipe)");
    println!("  --host <addr>                  Socket mode bind address (default: 127.0.0.1)");
    println!("  --port <port>                  Socket mode port (default: 50051)");
    println!("  --log-color <always|auto|never>");
    println!("  --log-level <trace|debug|info|warn|error|off>");
    println!("  --plugin-path <a,b,...>        Server plugins to load");
    println!("  --workspace <dir>              Workspace root for indexer mode");
    println!("  -V, --version                  Print version");
    println!("  -h, --help                     Print help");
}

fn parse_options() -> Result<Option<Options>, String> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value_of = |name: &str| {
            args.next().ok_or_else(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("cppls {}", cppls_lsp::VERSION);
                return Ok(None);
            }
            "--mode" => {
                options.mode = match value_of("--mode")?.as_str() {
                    "pipe" => Mode::Pipe,
                    "socket" => Mode::Socket,
                    "indexer" => Mode::Indexer,
                    other => return Err(format!("unknown mode: {other}")),
                };
            }
            "--host" => options.host = value_of("--host")?,
            "--port" => {
                options.port = value_of("--port")?
                    .parse()
                    .map_err(|_| "port must be a number".to_owned())?;
            }
            "--log-color" => {
                options.log_color = match value_of("--log-color")?.as_str() {
                    "always" => ColorMode::Always,
                    "auto" => ColorMode::Auto,
                    "never" => ColorMode::Never,
                    other => return Err(format!("unknown color mode: {other}")),
                };
            }
            "--log-level" => options.log_level = value_of("--log-level")?,
            "--plugin-path" => {
                options
                    .plugin_paths
                    .extend(value_of("--plugin-path")?.split(',').map(str::to_owned));
            }
            "--workspace" => options.workspace = Some(value_of("--workspace")?),
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(Some(options))
}

fn init_logging(options: &Options) {
    let level = if options.log_level == "off" { "error" } else { &options.log_level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cppls={level},cppls_lsp={level}")));
    let ansi = match options.log_color {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let options = match parse_options() {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("cppls: {error}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&options);

    if !options.plugin_paths.is_empty() {
        // Dynamic loading is delegated to the host integration; the
        // registration ABI lives in `cppls_lsp::plugin`.
        tracing::warn!(
            paths = ?options.plugin_paths,
            "plugin loading is not built into this binary"
        );
    }

    // One cooperative loop; CPU-heavy work goes through the blocking
    // pool.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let frontend = Arc::new(MiniFrontEnd::new());
    let code = runtime.block_on(async move {
        match options.mode {
            Mode::Pipe => cppls_lsp::run_pipe(frontend).await,
            Mode::Socket => cppls_lsp::run_socket(frontend, &options.host, options.port).await,
            Mode::Indexer => {
                let workspace = options
                    .workspace
                    .map(std::path::PathBuf::from)
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_default();
                cppls_lsp::run_indexer(frontend, workspace).await
            }
        }
    });

    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
