//! User rewrite rules for compile commands.
//!
//! Rules come from the project configuration. Each rule carries glob
//! patterns selecting files, arguments to append, and patterns of arguments
//! to remove. Rules are matched in declaration order; the first match wins.

use crate::config;
use crate::glob::GlobPattern;

use super::options::ParsedArg;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule has no pattern")]
    EmptyPattern,
    #[error("rule has no valid pattern")]
    NoValidPattern,
    #[error("rule has no effect")]
    NoEffect,
    #[error("invalid `{field}` value `{value}`, expected auto|always|never")]
    InvalidTristate { field: &'static str, value: String },
}

#[derive(Debug)]
pub struct Rule {
    pub patterns: Vec<GlobPattern>,
    pub append: Vec<String>,
    remove: Vec<GlobPattern>,
    pub readonly: Option<bool>,
    pub header: Option<bool>,
    pub context: Vec<String>,
}

fn tristate(field: &'static str, value: &str) -> Result<Option<bool>, RuleError> {
    match value {
        "" | "auto" => Ok(None),
        "always" => Ok(Some(true)),
        "never" => Ok(Some(false)),
        other => Err(RuleError::InvalidTristate { field, value: other.to_owned() }),
    }
}

impl Rule {
    pub fn compile(rule: &config::Rule) -> Result<Self, RuleError> {
        if rule.patterns.is_empty() {
            return Err(RuleError::EmptyPattern);
        }

        let readonly = tristate("readonly", &rule.readonly)?;
        let header = tristate("header", &rule.header)?;

        let patterns: Vec<GlobPattern> =
            rule.patterns.iter().filter_map(|p| GlobPattern::new(p).ok()).collect();
        if patterns.is_empty() {
            return Err(RuleError::NoValidPattern);
        }

        let remove: Vec<GlobPattern> =
            rule.remove.iter().filter_map(|p| GlobPattern::new(p).ok()).collect();

        let has_effect = readonly.is_some()
            || header.is_some()
            || !rule.context.is_empty()
            || !rule.append.is_empty()
            || !remove.is_empty();
        if !has_effect {
            return Err(RuleError::NoEffect);
        }

        Ok(Self {
            patterns,
            append: rule.append.clone(),
            remove,
            readonly,
            header,
            context: rule.context.clone(),
        })
    }

    pub fn matches(&self, file: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(file))
    }

    /// Whether a parsed argument is selected by this rule's remove list.
    /// Patterns match against the canonical joined form (`-DA` for
    /// `-D A`) and against the bare spelling.
    pub fn removes(&self, arg: &ParsedArg) -> bool {
        if self.remove.is_empty() {
            return false;
        }
        let joined = arg.joined_form();
        self.remove.iter().any(|p| p.matches(&joined) || p.matches(&arg.spelling))
    }
}

#[derive(Debug, Default)]
pub struct RuleManager {
    rules: Vec<Rule>,
}

impl RuleManager {
    pub fn load(&mut self, configs: &[config::Rule]) {
        for config in configs {
            match Rule::compile(config) {
                Ok(rule) => self.rules.push(rule),
                Err(error) => tracing::warn!(%error, "ignoring invalid rewrite rule"),
            }
        }
    }

    /// First matching rule wins.
    pub fn find(&self, file: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(file))
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::options::parse_arguments;

    fn make(patterns: &[&str], append: &[&str], remove: &[&str]) -> config::Rule {
        config::Rule {
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            append: append.iter().map(|s| s.to_string()).collect(),
            remove: remove.iter().map(|s| s.to_string()).collect(),
            ..config::Rule::default()
        }
    }

    #[test]
    fn first_match_wins() {
        let mut manager = RuleManager::default();
        manager.load(&[
            make(&["**/generated/**"], &["-w"], &[]),
            make(&["**/*.cpp"], &["-DALL"], &[]),
        ]);
        let rule = manager.find("/w/generated/a.cpp").unwrap();
        assert_eq!(rule.append, ["-w"]);
        let rule = manager.find("/w/src/a.cpp").unwrap();
        assert_eq!(rule.append, ["-DALL"]);
    }

    #[test]
    fn remove_matches_joined_form() {
        let rule = Rule::compile(&make(&["*"], &[], &["-D*"])).unwrap();
        let parsed = parse_arguments(&[
            "-D".to_string(),
            "A".to_string(),
            "-DB=0".to_string(),
            "-I/x".to_string(),
        ]);
        assert!(rule.removes(&parsed[0]));
        assert!(rule.removes(&parsed[1]));
        assert!(!rule.removes(&parsed[2]));
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert_eq!(Rule::compile(&make(&[], &[], &[])).unwrap_err(), RuleError::EmptyPattern);
        assert_eq!(Rule::compile(&make(&["*"], &[], &[])).unwrap_err(), RuleError::NoEffect);
        let mut bad = make(&["*"], &["-DX"], &[]);
        bad.readonly = "sometimes".to_owned();
        assert!(matches!(Rule::compile(&bad), Err(RuleError::InvalidTristate { .. })));
    }
}
