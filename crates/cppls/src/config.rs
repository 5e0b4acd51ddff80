//! Project configuration (`cppls.toml`).
//!
//! Loaded once at startup from the workspace root. `${workspace}` in any
//! path-valued field is substituted at `initialize`, once the client has
//! told us where the workspace is.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerOptions,
    pub cache: CacheOptions,
    pub index: IndexOptions,
    #[serde(rename = "rules")]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    /// Directories searched for `compile_commands.json`, in order.
    pub compile_commands_dirs: Vec<String>,
    /// Bound on concurrently retained ASTs for open files.
    pub max_active_files: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            compile_commands_dirs: vec!["${workspace}/build".to_owned()],
            max_active_files: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Where preparsed headers are written.
    pub dir: String,
    /// Maximum number of cached preambles kept on disk; 0 means unlimited.
    pub limit: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { dir: "${workspace}/.cppls/cache".to_owned(), limit: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexOptions {
    /// Where persisted indices are written.
    pub dir: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { dir: "${workspace}/.cppls/index".to_owned() }
    }
}

/// A compile-command rewrite rule. Matched in declaration order; the first
/// rule whose pattern matches a file applies to it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Rule {
    pub patterns: Vec<String>,
    pub append: Vec<String>,
    pub remove: Vec<String>,
    /// `auto` | `always` | `never`
    pub readonly: String,
    /// `auto` | `always` | `never`
    pub header: String,
    pub context: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Load `cppls.toml` from the workspace root, falling back to defaults
    /// when it does not exist. Parse failures are reported; the entry is
    /// dropped and the server continues with defaults.
    pub fn load_or_default(workspace: &Path) -> Self {
        let path = workspace.join("cppls.toml");
        if !path.is_file() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "ignoring malformed config");
                Self::default()
            }
        }
    }

    /// Replace `${workspace}` in every path-valued field.
    pub fn substitute_workspace(&mut self, workspace: &Path) {
        let workspace = workspace.display().to_string();
        let substitute = |value: &mut String| {
            if value.contains("${workspace}") {
                *value = value.replace("${workspace}", &workspace);
            }
        };
        for dir in &mut self.server.compile_commands_dirs {
            substitute(dir);
        }
        substitute(&mut self.cache.dir);
        substitute(&mut self.index.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_workspace_relative() {
        let mut config = Config::default();
        config.substitute_workspace(Path::new("/w"));
        assert_eq!(config.server.compile_commands_dirs, ["/w/build"]);
        assert_eq!(config.cache.dir, "/w/.cppls/cache");
        assert_eq!(config.index.dir, "/w/.cppls/index");
        assert_eq!(config.server.max_active_files, 8);
    }

    #[test]
    fn parses_rules() {
        let config: Config = toml::from_str(
            r#"
            [server]
            compile_commands_dirs = ["${workspace}/out"]

            [[rules]]
            patterns = ["**/*.cu"]
            remove = ["-D*"]
            append = ["-D", "C"]
            readonly = "always"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.compile_commands_dirs, ["${workspace}/out"]);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].remove, ["-D*"]);
        assert_eq!(config.rules[0].readonly, "always");
    }

    #[test]
    fn malformed_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cppls.toml"), "[server\nbroken").unwrap();
        let config = Config::load_or_default(dir.path());
        assert_eq!(config.server.max_active_files, 8);
    }
}
