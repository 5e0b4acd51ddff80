//! Driver probing.
//!
//! A compile command names a driver (`gcc`, `clang++`, a cross toolchain
//! wrapper). To parse the file the way that driver would, we need its
//! default system include directories and target triple. GCC-compatible
//! drivers print both when invoked as `<driver> -E -v -xc++ <null>`; the
//! interesting output goes to stderr, which we capture in a temp file and
//! parse. Results are cached per driver path by the database.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Target triple, e.g. `x86_64-unknown-linux-gnu`.
    pub target: String,
    /// Default system include search path, in search order.
    pub system_includes: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryDriverError {
    #[error("driver not found in PATH: {0}")]
    NotFoundInPath(String),
    #[error("failed to create temp file: {0}")]
    FailToCreateTempFile(std::io::Error),
    #[error("failed to invoke driver: {0}")]
    InvokeDriverFail(String),
    #[error("driver output not readable: {0}")]
    OutputFileNotReadable(std::io::Error),
    #[error("unexpected driver output: {0}")]
    InvalidOutputFormat(&'static str),
    #[error("driver kind is not supported: {0}")]
    NotImplemented(String),
}

const TARGET_PREFIX: &str = "Target: ";
const SEARCH_START: &str = "#include <...> search starts here:";
const SEARCH_END: &str = "End of search list.";

/// Resolve a driver spelling to an absolute executable path.
pub fn resolve_driver(driver: &str) -> Result<PathBuf, QueryDriverError> {
    let as_path = Path::new(driver);
    if as_path.components().count() > 1 {
        return std::fs::canonicalize(as_path)
            .map_err(|_| QueryDriverError::NotFoundInPath(driver.to_owned()));
    }
    let path_var = std::env::var_os("PATH")
        .ok_or_else(|| QueryDriverError::NotFoundInPath(driver.to_owned()))?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(driver);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(QueryDriverError::NotFoundInPath(driver.to_owned()))
}

fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Probe a resolved driver executable. `query_driver` on the database is
/// the cached entry point; this does the actual work.
pub fn probe(resolved: &Path) -> Result<DriverInfo, QueryDriverError> {
    let name = resolved.file_stem().and_then(|s| s.to_str()).unwrap_or_default();

    // MSVC and clang-cl do not speak `-E -v`; their include path comes from
    // the host toolchain locator, which is the front end's business.
    // The exotic drivers do not print the GCC-style search list at all.
    let unsupported = name == "cl"
        || name.starts_with("clang-cl")
        || name.starts_with("nvcc")
        || name.starts_with("icx")
        || name.starts_with("icc")
        || name == "zig";
    if unsupported {
        return Err(QueryDriverError::NotImplemented(name.to_owned()));
    }

    let output = tempfile::NamedTempFile::new().map_err(QueryDriverError::FailToCreateTempFile)?;
    let stderr = output.reopen().map_err(QueryDriverError::FailToCreateTempFile)?;

    let mut command = Command::new(resolved);
    command
        .args(["-E", "-v", "-xc++", null_device()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr);
    // Force a parseable locale. On Windows the inherited environment is
    // what locates the toolchain, so it stays untouched.
    if !cfg!(windows) {
        command.env("LANG", "C");
    }

    let status = command.status().map_err(|e| QueryDriverError::InvokeDriverFail(e.to_string()))?;
    if !status.success() {
        return Err(QueryDriverError::InvokeDriverFail(format!(
            "driver exited with {status}"
        )));
    }

    let content =
        std::fs::read_to_string(output.path()).map_err(QueryDriverError::OutputFileNotReadable)?;
    parse_probe_output(&content)
}

pub fn parse_probe_output(content: &str) -> Result<DriverInfo, QueryDriverError> {
    let mut target = String::new();
    let mut includes: Vec<PathBuf> = Vec::new();
    let mut in_block = false;
    let mut saw_start = false;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(TARGET_PREFIX) {
            target = rest.to_owned();
        } else if line == SEARCH_START {
            saw_start = true;
            in_block = true;
        } else if line == SEARCH_END {
            in_block = false;
        } else if in_block && !line.is_empty() {
            includes.push(PathBuf::from(line));
        }
    }

    if !saw_start {
        return Err(QueryDriverError::InvalidOutputFormat("search list start marker not found"));
    }
    if in_block {
        return Err(QueryDriverError::InvalidOutputFormat("search list end marker not found"));
    }

    Ok(DriverInfo { target, system_includes: includes })
}

/// Canonicalize the probed include directories and drop the driver's own
/// resource directory; the front end supplies its own via `-resource-dir`.
pub fn sanitize_includes(info: DriverInfo) -> DriverInfo {
    let system_includes = info
        .system_includes
        .into_iter()
        .filter_map(|dir| std::fs::canonicalize(&dir).ok())
        .filter(|dir| !dir.to_string_lossy().contains("lib/gcc"))
        .collect();
    DriverInfo { target: info.target, system_includes }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Using built-in specs.
Target: x86_64-linux-gnu
#include \"...\" search starts here:
#include <...> search starts here:
 /usr/lib/gcc/x86_64-linux-gnu/13/include
 /usr/local/include
 /usr/include
End of search list.
COMPILER_PATH=...
";

    #[test]
    fn parses_target_and_search_list() {
        let info = parse_probe_output(SAMPLE).unwrap();
        assert_eq!(info.target, "x86_64-linux-gnu");
        assert_eq!(
            info.system_includes,
            [
                PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/13/include"),
                PathBuf::from("/usr/local/include"),
                PathBuf::from("/usr/include"),
            ]
        );
    }

    #[test]
    fn missing_markers_are_format_errors() {
        assert!(matches!(
            parse_probe_output("Target: x\n"),
            Err(QueryDriverError::InvalidOutputFormat(_))
        ));
        let unterminated = "#include <...> search starts here:\n /usr/include\n";
        assert!(matches!(
            parse_probe_output(unterminated),
            Err(QueryDriverError::InvalidOutputFormat(_))
        ));
    }

    #[test]
    fn msvc_like_drivers_are_not_implemented() {
        for name in ["cl", "clang-cl", "nvcc", "icx", "zig"] {
            let path = PathBuf::from(format!("/opt/bin/{name}"));
            assert!(matches!(probe(&path), Err(QueryDriverError::NotImplemented(_))));
        }
    }

    #[test]
    fn unresolvable_driver_is_not_found() {
        assert!(matches!(
            resolve_driver("definitely-not-a-compiler-xyz"),
            Err(QueryDriverError::NotFoundInPath(_))
        ));
    }
}
