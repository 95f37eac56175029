//! Analyzer configuration.

use serde::{Deserialize, Serialize};

/// The enumerated options the driver can set per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)] // Configuration struct requires multiple boolean flags
pub struct AnalyzerConfig {
    /// Package path prefixes to analyze; empty means everything.
    pub include_pkgs: Vec<String>,
    /// Package path prefixes to skip.
    pub exclude_pkgs: Vec<String>,
    /// Substrings of file doc-comments that exclude the whole file
    /// (generated-code markers and the like).
    pub exclude_file_docstrings: Vec<String>,
    /// Also flag reads out of maps that are themselves possibly nil.
    pub error_on_nilable_map_read: bool,
    /// Collapse diagnostics sharing one conflict site into one message.
    pub group_error_messages: bool,
    /// Enable struct-initialization checking.
    pub experimental_struct_init: bool,
    /// Descend into function literals.
    pub experimental_anonymous_func: bool,
    /// Render diagnostics with color and layout.
    pub pretty_print: bool,
    /// Trailing path components of file names shown in printed trigger
    /// positions; 0 prints full paths.
    pub dir_levels_to_print_for_triggers: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            include_pkgs: Vec::new(),
            exclude_pkgs: Vec::new(),
            exclude_file_docstrings: Vec::new(),
            error_on_nilable_map_read: false,
            group_error_messages: false,
            experimental_struct_init: false,
            experimental_anonymous_func: false,
            pretty_print: true,
            dir_levels_to_print_for_triggers: 2,
        }
    }
}

impl AnalyzerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from TOML, filling unspecified options with
    /// their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Loads a configuration from a TOML file on disk.
    pub fn from_toml_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading analyzer config at {}", path.display()))?;
        Self::from_toml_str(&source)
            .with_context(|| format!("parsing analyzer config at {}", path.display()))
    }

    /// Whether a package path is in scope under the include/exclude
    /// prefix lists.
    pub fn is_pkg_in_scope(&self, path: &str) -> bool {
        if self.exclude_pkgs.iter().any(|p| path.starts_with(p)) {
            return false;
        }
        self.include_pkgs.is_empty() || self.include_pkgs.iter().any(|p| path.starts_with(p))
    }

    pub fn with_include(mut self, prefix: impl Into<String>) -> Self {
        self.include_pkgs.push(prefix.into());
        self
    }

    pub fn with_exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_pkgs.push(prefix.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_respects_prefix_lists() {
        let config = AnalyzerConfig::new()
            .with_include("corp/")
            .with_exclude("corp/vendor/");
        assert!(config.is_pkg_in_scope("corp/service"));
        assert!(!config.is_pkg_in_scope("corp/vendor/dep"));
        assert!(!config.is_pkg_in_scope("thirdparty/lib"));
    }

    #[test]
    fn empty_include_means_everything() {
        let config = AnalyzerConfig::new();
        assert!(config.is_pkg_in_scope("anything/at/all"));
    }

    #[test]
    fn toml_file_loading_reports_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nilgazer.toml");
        std::fs::write(&path, "group_error_messages = true\n").unwrap();
        let config = AnalyzerConfig::from_toml_path(&path).unwrap();
        assert!(config.group_error_messages);
        let missing = AnalyzerConfig::from_toml_path(dir.path().join("absent.toml"));
        assert!(missing.is_err());
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let config = AnalyzerConfig::from_toml_str(
            r#"
            include_pkgs = ["corp/"]
            error_on_nilable_map_read = true
            dir_levels_to_print_for_triggers = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.include_pkgs, vec!["corp/".to_string()]);
        assert!(config.error_on_nilable_map_read);
        assert_eq!(config.dir_levels_to_print_for_triggers, 3);
        // Unspecified options keep their defaults.
        assert!(config.pretty_print);
        assert!(!config.experimental_struct_init);
    }
}
