//! Language registry.
//!
//! A language either runs its source straight through an interpreter or
//! goes through a compile step first. Commands are argv templates; the
//! placeholders `{file}`, `{dir}` and `{entry}` are filled in per request.
//!
//! ```toml
//! [[execution.languages]]
//! name = "java"
//! extension = "java"
//! mode = "toolchain"
//! entry_pattern = 'public\s+class\s+([a-zA-Z0-9_]+)'
//! compile = ["javac", "{file}"]
//! run = ["java", "-cp", "{dir}", "{entry}"]
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ExecError;

/// Reported when a toolchain source has no entry point.
pub const MISSING_ENTRY: &str = "Error: No public class found.";

/// How a language is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Runner {
    /// Write the source to `main.<ext>` and run `command`.
    Interpreted { command: Vec<String> },
    /// Find the entry point, write `<entry>.<ext>`, run `compile` then `run`.
    Toolchain {
        /// Regex whose first capture group is the entry-point name.
        entry_pattern: String,
        compile: Vec<String>,
        run: Vec<String>,
        #[serde(default = "default_missing_entry")]
        missing_entry_message: String,
    },
}

fn default_missing_entry() -> String {
    MISSING_ENTRY.to_string()
}

/// Configured description of one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Source file extension, without the dot.
    pub extension: String,
    #[serde(flatten)]
    pub runner: Runner,
}

impl LanguageSpec {
    pub fn interpreted(name: &str, aliases: &[&str], extension: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            extension: extension.to_string(),
            runner: Runner::Interpreted {
                command: to_argv(command),
            },
        }
    }

    pub fn toolchain(
        name: &str,
        aliases: &[&str],
        extension: &str,
        entry_pattern: &str,
        compile: &[&str],
        run: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            extension: extension.to_string(),
            runner: Runner::Toolchain {
                entry_pattern: entry_pattern.to_string(),
                compile: to_argv(compile),
                run: to_argv(run),
                missing_entry_message: default_missing_entry(),
            },
        }
    }

    fn matches(&self, requested: &str) -> bool {
        self.name.eq_ignore_ascii_case(requested)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(requested))
    }
}

fn to_argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Languages available out of the box.
pub fn default_languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec::interpreted("javascript", &["js", "node"], "js", &["node", "{file}"]),
        LanguageSpec::interpreted("python", &["py", "python3"], "py", &["python3", "{file}"]),
        LanguageSpec::toolchain(
            "java",
            &[],
            "java",
            r"public\s+class\s+([a-zA-Z0-9_]+)",
            &["javac", "-J-Xmx256m", "-J-XX:CompressedClassSpaceSize=64m", "-J-XX:-UsePerfData", "{file}"],
            &[
                "java",
                "-Xmx256m",
                "-XX:CompressedClassSpaceSize=64m",
                "-XX:-UsePerfData",
                "-cp",
                "{dir}",
                "{entry}",
            ],
        ),
    ]
}

/// Values substituted into command templates.
#[derive(Debug, Clone, Default)]
pub struct Placeholders<'a> {
    pub file: &'a str,
    pub dir: &'a str,
    pub entry: &'a str,
}

impl Placeholders<'_> {
    pub fn expand(&self, template: &[String]) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace("{file}", self.file)
                    .replace("{dir}", self.dir)
                    .replace("{entry}", self.entry)
            })
            .collect()
    }
}

/// A validated language, with its entry pattern compiled.
#[derive(Debug, Clone)]
pub struct Language {
    spec: LanguageSpec,
    entry: Option<Regex>,
}

impl Language {
    fn compile(spec: LanguageSpec) -> Result<Self, ExecError> {
        let entry = match &spec.runner {
            Runner::Interpreted { command } => {
                if command.is_empty() {
                    return Err(ExecError::EmptyCommand(spec.name.clone()));
                }
                None
            }
            Runner::Toolchain {
                entry_pattern,
                compile,
                run,
                ..
            } => {
                if compile.is_empty() || run.is_empty() {
                    return Err(ExecError::EmptyCommand(spec.name.clone()));
                }
                let regex = Regex::new(entry_pattern).map_err(|e| ExecError::InvalidPattern {
                    language: spec.name.clone(),
                    reason: e.to_string(),
                })?;
                if regex.captures_len() < 2 {
                    return Err(ExecError::InvalidPattern {
                        language: spec.name.clone(),
                        reason: "pattern needs a capture group for the entry name".into(),
                    });
                }
                Some(regex)
            }
        };
        Ok(Self { spec, entry })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn extension(&self) -> &str {
        &self.spec.extension
    }

    pub fn runner(&self) -> &Runner {
        &self.spec.runner
    }

    /// First entry-point name declared in `source`. Always `None` for
    /// interpreted languages.
    pub fn find_entry(&self, source: &str) -> Option<String> {
        self.entry
            .as_ref()?
            .captures(source)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Lookup table from requested language names to languages.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: Vec<Language>,
}

impl LanguageRegistry {
    pub fn new(specs: Vec<LanguageSpec>) -> Result<Self, ExecError> {
        let languages = specs
            .into_iter()
            .map(Language::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { languages })
    }

    pub fn builtin() -> Result<Self, ExecError> {
        Self::new(default_languages())
    }

    /// Case-insensitive lookup by name or alias.
    pub fn lookup(&self, requested: &str) -> Option<&Language> {
        let requested = requested.trim();
        self.languages.iter().find(|l| l.spec.matches(requested))
    }

    pub fn names(&self) -> Vec<&str> {
        self.languages.iter().map(Language::name).collect()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
