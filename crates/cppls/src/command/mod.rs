//! The compilation database.
//!
//! Maps every source file to the canonical compiler invocation the rest of
//! the server uses: loaded from `compile_commands.json`, updated in memory,
//! filtered of arguments that are meaningless to a front end (`-c`, `-o`,
//! PCH injection), rewritten by user rules, and augmented with
//! driver-probed system includes and the resource directory on lookup.

pub mod driver;
pub mod options;
pub mod rules;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config;
use crate::pool::{ArgListRef, ArgPool, PathPool};

pub use driver::{DriverInfo, QueryDriverError};
use options::{parse_arguments, tokenize_command, OptionId, ParsedArg};
use rules::RuleManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Inserted,
    Unchanged,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub kind: UpdateKind,
    pub file: String,
}

/// Stored per-file command state.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Working directory of the invocation.
    pub directory: String,
    /// Canonical filtered argument vector, driver first, no input file.
    pub arguments: ArgListRef,
    /// Response file reference: path and the argument index it occupied.
    pub response_file: Option<(String, u32)>,
    /// Indices into the argument vector of include-directory arguments.
    pub include_indices: Vec<u32>,
}

/// Result of a command lookup.
#[derive(Debug, Clone)]
pub struct LookupInfo {
    pub directory: String,
    pub arguments: ArgListRef,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    /// Probe the driver for system includes and target.
    pub query_driver: bool,
    /// Inject `-resource-dir=` if the database knows one.
    pub resource_dir: bool,
    /// Suppress the warning on driver-probe failure.
    pub suppress_log: bool,
}

#[derive(Default)]
pub struct CompilationDatabase {
    pub args: ArgPool,
    pub paths: PathPool,
    commands: HashMap<String, CommandInfo>,
    drivers: HashMap<PathBuf, DriverInfo>,
    rules: RuleManager,
    resource_dir: Option<String>,
    workspace: PathBuf,
}

impl CompilationDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_workspace(&mut self, workspace: &Path) {
        self.workspace = workspace.to_path_buf();
    }

    /// The resource directory injected on lookup. Owned here; callers never
    /// pass their own.
    pub fn set_resource_dir(&mut self, dir: Option<String>) {
        self.resource_dir = dir;
    }

    pub fn load_rules(&mut self, rules: &[config::Rule]) {
        self.rules.load(rules);
    }

    pub fn command(&self, file: &str) -> Option<&CommandInfo> {
        self.commands.get(file)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Parse a compilation database document and apply it. Entries missing
    /// from the new document are reported `Deleted` and dropped.
    pub fn load_commands(
        &mut self,
        content: &str,
        workspace: &Path,
    ) -> Result<Vec<UpdateInfo>, String> {
        let json: serde_json::Value =
            serde_json::from_str(content).map_err(|e| format!("parse json failed: {e}"))?;
        let Some(entries) = json.as_array() else {
            return Err("compile_commands.json must be an array of objects".to_owned());
        };

        let mut infos = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for entry in entries {
            let Some(object) = entry.as_object() else {
                continue;
            };
            let Some(directory) = object.get("directory").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(file) = object.get("file").and_then(|v| v.as_str()) else {
                continue;
            };

            // Always store the absolute path of the source file.
            let base = if Path::new(directory).is_absolute() {
                PathBuf::from(directory)
            } else {
                workspace.join(directory)
            };
            let source = crate::pool::normalize(Path::new(file), &base);
            let source = source.to_string_lossy().into_owned();

            let tokens = if let Some(arguments) = object.get("arguments").and_then(|v| v.as_array())
            {
                arguments.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect()
            } else if let Some(command) = object.get("command").and_then(|v| v.as_str()) {
                tokenize_command(command)
            } else {
                continue;
            };
            if tokens.is_empty() {
                continue;
            }

            seen.push(source.clone());
            infos.push(self.update_command(directory, &source, tokens));
        }

        let stale: Vec<String> = self
            .commands
            .keys()
            .filter(|file| !seen.iter().any(|s| s == *file))
            .cloned()
            .collect();
        for file in stale {
            self.commands.remove(&file);
            infos.push(UpdateInfo { kind: UpdateKind::Deleted, file });
        }

        Ok(infos)
    }

    /// In-memory update of one file's command.
    pub fn update_command(
        &mut self,
        directory: &str,
        file: &str,
        tokens: Vec<String>,
    ) -> UpdateInfo {
        let (tokens, response_file) = self.expand_response_files(directory, tokens);

        let mut filtered: Vec<String> = Vec::new();
        let mut include_indices: Vec<u32> = Vec::new();

        // The driver is kept verbatim and never parsed as an option.
        let mut iter = tokens.iter();
        if let Some(driver) = iter.next() {
            filtered.push(driver.clone());
        }
        let rest: Vec<String> = iter.cloned().collect();
        let parsed = parse_arguments(&rest);

        let mut strip_next_xclang = false;
        for arg in &parsed {
            if is_ignored(arg.id) {
                continue;
            }
            match arg.id {
                // Trailing inputs are re-attached at lookup.
                OptionId::Input => continue,
                // CMake emits `-Xclang -include-pch -Xclang x.pch` when PCH
                // is enabled; both pairs must go.
                OptionId::Xclang => {
                    if strip_next_xclang {
                        strip_next_xclang = false;
                        continue;
                    }
                    if arg.values.first().map(String::as_str) == Some("-include-pch") {
                        strip_next_xclang = true;
                        continue;
                    }
                }
                // CMake's preamble injection header.
                OptionId::IncludeFile => {
                    if arg.values.first().is_some_and(|v| {
                        v.ends_with("cmake_pch.hxx") || v.ends_with("cmake_pch.h")
                    }) {
                        continue;
                    }
                }
                // Relative include directories are resolved against the
                // entry's working directory; xmake emits them relative.
                OptionId::IncludeDir
                | OptionId::Isystem
                | OptionId::Iquote
                | OptionId::Idirafter => {
                    include_indices.push(filtered.len() as u32);
                    filtered.push(arg.spelling.clone());
                    let value = arg.values.first().cloned().unwrap_or_default();
                    if !value.is_empty() && !Path::new(&value).is_absolute() {
                        filtered.push(
                            crate::pool::normalize(Path::new(&value), Path::new(directory))
                                .to_string_lossy()
                                .into_owned(),
                        );
                    } else {
                        filtered.push(value);
                    }
                    continue;
                }
                _ => {}
            }
            arg.render(&mut filtered);
        }

        let arguments = self.args.intern_args(&filtered);
        let directory = directory.to_owned();
        let info = CommandInfo {
            directory: directory.clone(),
            arguments,
            response_file,
            include_indices,
        };

        let kind = match self.commands.get(file) {
            Some(existing)
                if existing.arguments == arguments && existing.directory == directory =>
            {
                UpdateKind::Unchanged
            }
            _ => {
                self.commands.insert(file.to_owned(), info);
                UpdateKind::Inserted
            }
        };
        UpdateInfo { kind, file: file.to_owned() }
    }

    /// Canonical arguments for a file, mutated per `options`. Repeated
    /// calls with unchanged state and options return the same interned
    /// vector.
    pub fn lookup(&mut self, file: &str, options: LookupOptions) -> LookupInfo {
        let (directory, stored) = match self.commands.get(file) {
            Some(info) => (info.directory.clone(), self.args.render(info.arguments)),
            None => self.guess_or_fallback(file),
        };

        let mut tokens: Vec<String> = Vec::new();
        let mut iter = stored.into_iter();
        if let Some(driver) = iter.next() {
            tokens.push(driver);
        }
        let rest: Vec<String> = iter.collect();

        if options.query_driver && !tokens.is_empty() {
            let driver = tokens[0].clone();
            match self.query_driver(&driver) {
                Ok(info) => {
                    tokens.push("-nostdlibinc".to_owned());
                    for dir in &info.system_includes {
                        tokens.push("-isystem".to_owned());
                        tokens.push(dir.to_string_lossy().into_owned());
                    }
                    if !info.target.is_empty() {
                        tokens.push(format!("--target={}", info.target));
                    }
                }
                Err(error) if !options.suppress_log => {
                    tracing::warn!(driver = %tokens[0], %error, "driver query failed");
                }
                Err(_) => {}
            }
        }

        if options.resource_dir {
            if let Some(dir) = &self.resource_dir {
                tokens.push(format!("-resource-dir={dir}"));
            }
        }

        // Stored arguments plus injected ones, then user rewrite rules.
        let parsed = parse_arguments(&rest);
        let rule = self.rules.find(file);
        let mut rendered: Vec<String> = Vec::new();
        for arg in &parsed {
            if rule.is_some_and(|rule| rule.removes(arg)) {
                continue;
            }
            arg.render(&mut rendered);
        }
        // Injections go after the stored vector; the rule's removes apply
        // to them as well.
        let injected: Vec<String> = tokens.drain(1..).collect();
        for arg in &parse_arguments(&injected) {
            if rule.is_some_and(|rule| rule.removes(arg)) {
                continue;
            }
            arg.render(&mut rendered);
        }
        tokens.extend(rendered);
        if let Some(rule) = rule {
            tokens.extend(rule.append.iter().cloned());
        }

        // Exactly one input file, at the tail.
        tokens.push(file.to_owned());

        LookupInfo { directory, arguments: self.args.intern_args(&tokens) }
    }

    /// Probe a driver, caching the result per resolved path.
    pub fn query_driver(&mut self, spelling: &str) -> Result<DriverInfo, QueryDriverError> {
        if let Some(info) = self.drivers.get(Path::new(spelling)) {
            return Ok(info.clone());
        }
        let resolved = driver::resolve_driver(spelling)?;
        if let Some(info) = self.drivers.get(&resolved) {
            return Ok(info.clone());
        }
        let info = driver::sanitize_includes(driver::probe(&resolved)?);
        self.drivers.insert(resolved, info.clone());
        Ok(info)
    }

    /// Drop cached driver probes, e.g. after a toolchain update.
    pub fn clear_driver_cache(&mut self) {
        self.drivers.clear();
    }

    /// Seed the driver cache; used by tests and by configuration overrides.
    pub fn insert_driver_info(&mut self, path: PathBuf, info: DriverInfo) {
        self.drivers.insert(path, info);
    }

    /// Try the configured directories for a `compile_commands.json`; fall
    /// back to a recursive search of the workspace, skipping hidden
    /// directories.
    pub fn load_compile_database(&mut self, dirs: &[String], workspace: &Path) -> bool {
        let mut try_load = |dir: &Path, this: &mut Self| -> bool {
            let path = dir.join("compile_commands.json");
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(error) => {
                    tracing::debug!(path = %path.display(), %error, "no database here");
                    return false;
                }
            };
            match this.load_commands(&content, workspace) {
                Ok(infos) => {
                    tracing::info!(path = %path.display(), entries = infos.len(), "loaded compile database");
                    true
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to load compile database");
                    false
                }
            }
        };

        for dir in dirs {
            if try_load(Path::new(dir), self) {
                return true;
            }
        }

        tracing::warn!(
            workspace = %workspace.display(),
            "no compile database in configured directories, searching workspace"
        );
        for entry in walkdir::WalkDir::new(workspace)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .is_some_and(|name| name.starts_with('.') && name.len() > 1)
            })
            .filter_map(Result::ok)
        {
            if entry.file_type().is_file()
                && entry.file_name() == "compile_commands.json"
                && try_load(entry.path().parent().unwrap_or(workspace), self)
            {
                return true;
            }
        }

        tracing::warn!("no compile database found, falling back to default commands");
        false
    }

    fn expand_response_files(
        &mut self,
        directory: &str,
        tokens: Vec<String>,
    ) -> (Vec<String>, Option<(String, u32)>) {
        if !tokens.iter().any(|t| t.starts_with('@')) {
            return (tokens, None);
        }
        let mut out = Vec::with_capacity(tokens.len());
        let mut response_file = None;
        for (index, token) in tokens.into_iter().enumerate() {
            if !token.starts_with('@') {
                out.push(token);
                continue;
            }
            let resolved = crate::pool::normalize(Path::new(&token[1..]), Path::new(directory));
            match std::fs::read_to_string(&resolved) {
                Ok(content) => {
                    if response_file.is_none() {
                        response_file =
                            Some((resolved.to_string_lossy().into_owned(), index as u32));
                    }
                    out.extend(tokenize_command(&content));
                }
                Err(error) => {
                    tracing::warn!(path = %resolved.display(), %error, "cannot expand response file");
                    out.push(token);
                }
            }
        }
        (out, response_file)
    }

    /// A file with no entry borrows the command of a neighbor: any known
    /// file in the same directory, walking up at most three parents.
    fn guess_or_fallback(&self, file: &str) -> (String, Vec<String>) {
        let mut dir = Path::new(file).parent();
        for _ in 0..3 {
            let Some(current) = dir else { break };
            let prefix = current.to_string_lossy();
            for (other, info) in &self.commands {
                let matches = other.strip_prefix(prefix.as_ref()).is_some_and(|rest| {
                    rest.is_empty() || rest.starts_with(std::path::MAIN_SEPARATOR)
                });
                if matches {
                    tracing::info!(file, from = %other, "guessed command from neighbor");
                    return (info.directory.clone(), self.args.render(info.arguments));
                }
            }
            dir = current.parent();
        }

        let directory = self.workspace.to_string_lossy().into_owned();
        (directory, vec!["clang++".to_owned(), "-std=c++20".to_owned()])
    }

    /// Invalidates every pooled ref. Only used on shutdown or full reload.
    pub fn clear(&mut self) {
        self.args.clear();
        self.commands.clear();
        self.drivers.clear();
        self.rules.clear();
    }
}

fn is_ignored(id: OptionId) -> bool {
    matches!(
        id,
        OptionId::C
            | OptionId::O
            | OptionId::OutputEq
            | OptionId::EmitPch
            | OptionId::IncludePch
            | OptionId::FTimeTrace
            | OptionId::FTimeTraceEq
            | OptionId::FTimeTraceGranularity
            | OptionId::FTimeTraceVerbose
            | OptionId::FTimeReport
            | OptionId::FTimeReportEq
            | OptionId::ModuleFileEq
            | OptionId::ModuleOutput
            | OptionId::ModuleOutputEq
            | OptionId::PrebuiltModulePathEq
            | OptionId::SlashYu
            | OptionId::SlashFI
            | OptionId::SlashFp
            | OptionId::SlashFo
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_args(db: &mut CompilationDatabase, file: &str, options: LookupOptions) -> Vec<String> {
        let info = db.lookup(file, options);
        db.args.render(info.arguments)
    }

    #[test]
    fn load_then_lookup_strips_output_flags() {
        let mut db = CompilationDatabase::new();
        let content = r#"[{
            "directory": "/w/b",
            "file": "/w/s/main.cpp",
            "command": "clang++ -I/w/s/include -std=c++20 -c -o main.o /w/s/main.cpp"
        }]"#;
        let infos = db.load_commands(content, Path::new("/w")).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].kind, UpdateKind::Inserted);
        assert_eq!(infos[0].file, "/w/s/main.cpp");

        let info = db.lookup("/w/s/main.cpp", LookupOptions::default());
        assert_eq!(info.directory, "/w/b");
        assert_eq!(
            db.args.render(info.arguments),
            ["clang++", "-I", "/w/s/include", "-std=c++20", "/w/s/main.cpp"]
        );
    }

    #[test]
    fn lookup_is_idempotent() {
        let mut db = CompilationDatabase::new();
        db.update_command(
            "/w",
            "/w/a.cpp",
            vec!["g++".into(), "-DX".into(), "a.cpp".into()],
        );
        let first = db.lookup("/w/a.cpp", LookupOptions::default());
        let second = db.lookup("/w/a.cpp", LookupOptions::default());
        assert_eq!(first.arguments, second.arguments);
        assert_eq!(first.directory, second.directory);
    }

    #[test]
    fn rules_remove_and_append() {
        let mut db = CompilationDatabase::new();
        db.load_rules(&[config::Rule {
            patterns: vec!["*".into(), "**/*".into()],
            remove: vec!["-D*".into()],
            append: vec!["-D".into(), "C".into()],
            ..config::Rule::default()
        }]);
        db.update_command(
            "/fake",
            "main.cpp",
            vec![
                "clang++".into(),
                "--output=main.o".into(),
                "-D".into(),
                "A".into(),
                "-D".into(),
                "B=0".into(),
                "main.cpp".into(),
            ],
        );
        assert_eq!(
            lookup_args(&mut db, "main.cpp", LookupOptions::default()),
            ["clang++", "-D", "C", "main.cpp"]
        );
    }

    #[test]
    fn relative_includes_are_joined_with_directory() {
        let mut db = CompilationDatabase::new();
        db.update_command(
            "/w/build",
            "/w/src/a.cpp",
            vec!["clang++".into(), "-I../src/include".into(), "a.cpp".into()],
        );
        assert_eq!(
            lookup_args(&mut db, "/w/src/a.cpp", LookupOptions::default()),
            ["clang++", "-I", "/w/src/include", "/w/src/a.cpp"]
        );
    }

    #[test]
    fn cmake_pch_injection_is_stripped() {
        let mut db = CompilationDatabase::new();
        db.update_command(
            "/w",
            "/w/a.cpp",
            vec![
                "clang++".into(),
                "-Xclang".into(),
                "-include-pch".into(),
                "-Xclang".into(),
                "pch.pch".into(),
                "-include".into(),
                "cmake_pch.hxx".into(),
                "-Xclang".into(),
                "-fno-pch-timestamp".into(),
                "-std=c++17".into(),
                "a.cpp".into(),
            ],
        );
        assert_eq!(
            lookup_args(&mut db, "/w/a.cpp", LookupOptions::default()),
            ["clang++", "-Xclang", "-fno-pch-timestamp", "-std=c++17", "/w/a.cpp"]
        );
    }

    #[test]
    fn reload_reports_deletions() {
        let mut db = CompilationDatabase::new();
        let first = r#"[
            {"directory": "/w", "file": "a.cpp", "arguments": ["c++", "a.cpp"]},
            {"directory": "/w", "file": "b.cpp", "arguments": ["c++", "b.cpp"]}
        ]"#;
        db.load_commands(first, Path::new("/w")).unwrap();
        assert_eq!(db.len(), 2);

        let second = r#"[
            {"directory": "/w", "file": "a.cpp", "arguments": ["c++", "a.cpp"]}
        ]"#;
        let infos = db.load_commands(second, Path::new("/w")).unwrap();
        assert!(infos
            .iter()
            .any(|i| i.kind == UpdateKind::Deleted && i.file == "/w/b.cpp"));
        assert!(infos
            .iter()
            .any(|i| i.kind == UpdateKind::Unchanged && i.file == "/w/a.cpp"));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn guesses_from_neighbor_commands() {
        let mut db = CompilationDatabase::new();
        db.set_workspace(Path::new("/w"));
        db.update_command(
            "/w",
            "/w/src/a.cpp",
            vec!["clang++".into(), "-DFROM_A".into(), "a.cpp".into()],
        );
        let args = lookup_args(&mut db, "/w/src/deep/b.cpp", LookupOptions::default());
        assert_eq!(args, ["clang++", "-DFROM_A", "/w/src/deep/b.cpp"]);

        // Nothing nearby: fall back to a default command.
        let args = lookup_args(&mut db, "/elsewhere/c.cpp", LookupOptions::default());
        assert_eq!(args, ["clang++", "-std=c++20", "/elsewhere/c.cpp"]);
    }

    #[test]
    fn driver_injection_uses_cache() {
        let mut db = CompilationDatabase::new();
        db.update_command("/w", "/w/a.cpp", vec!["/opt/bin/cc".into(), "a.cpp".into()]);
        // Seed the cache the way a successful probe would; the fake path
        // never gets invoked.
        db.insert_driver_info(
            PathBuf::from("/opt/bin/cc"),
            DriverInfo {
                target: "x86_64-linux-gnu".into(),
                system_includes: vec![PathBuf::from("/usr/include")],
            },
        );
        let args = lookup_args(
            &mut db,
            "/w/a.cpp",
            LookupOptions { query_driver: true, suppress_log: true, ..Default::default() },
        );
        assert_eq!(
            args,
            [
                "/opt/bin/cc",
                "-nostdlibinc",
                "-isystem",
                "/usr/include",
                "--target=x86_64-linux-gnu",
                "/w/a.cpp"
            ]
        );
    }

    #[test]
    fn driver_query_failure_is_nonfatal() {
        let mut db = CompilationDatabase::new();
        db.update_command("/w", "/w/a.cpp", vec!["not-a-real-cc-xyz".into(), "a.cpp".into()]);
        let args = lookup_args(
            &mut db,
            "/w/a.cpp",
            LookupOptions { query_driver: true, suppress_log: true, ..Default::default() },
        );
        assert_eq!(args, ["not-a-real-cc-xyz", "/w/a.cpp"]);
    }

    #[test]
    fn resource_dir_is_injected_on_request() {
        let mut db = CompilationDatabase::new();
        db.set_resource_dir(Some("/opt/llvm/lib/clang/19".into()));
        db.update_command("/w", "/w/a.cpp", vec!["clang++".into(), "a.cpp".into()]);
        let args = lookup_args(
            &mut db,
            "/w/a.cpp",
            LookupOptions { resource_dir: true, ..Default::default() },
        );
        assert_eq!(args, ["clang++", "-resource-dir=/opt/llvm/lib/clang/19", "/w/a.cpp"]);
    }

    #[test]
    fn response_files_are_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let rsp = dir.path().join("flags.rsp");
        std::fs::write(&rsp, "-DFROM_RSP -I/inc\n").unwrap();

        let mut db = CompilationDatabase::new();
        let dir_str = dir.path().to_string_lossy().into_owned();
        db.update_command(
            &dir_str,
            "/w/a.cpp",
            vec!["clang++".into(), format!("@{}", rsp.display()), "a.cpp".into()],
        );
        let info = db.command("/w/a.cpp").unwrap();
        assert_eq!(info.response_file.as_ref().unwrap().1, 1);
        let args = lookup_args(&mut db, "/w/a.cpp", LookupOptions::default());
        assert_eq!(args, ["clang++", "-DFROM_RSP", "-I", "/inc", "/w/a.cpp"]);
    }
}
