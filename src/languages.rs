//! Language registry for compilation and execution
//!
//! The registry is loaded once at startup from TOML (embedded, or a file named
//! by `LANGUAGES_CONFIG`) and probed against the host: a language whose
//! compiler or interpreter cannot be found is kept but marked disabled.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EvalError, Result};
use crate::sandbox::Directory;

/// Replaced in compile commands with the list of files to compile
pub const SOURCE_PLACEHOLDER: &str = "<SOURCES>";

const EMBEDDED_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Why a language cannot be used on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    /// `disabled = true` in the registry
    Configured,
    EmptyCommand,
    NotInPath(String),
    BadSymlink(String),
    NotExecutable(PathBuf),
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::Configured => write!(f, "disabled in configuration"),
            DisableReason::EmptyCommand => write!(f, "empty command line"),
            DisableReason::NotInPath(program) => {
                write!(f, "compiler/interpreter {:?} was not found in $PATH", program)
            }
            DisableReason::BadSymlink(err) => {
                write!(f, "compiler/interpreter had a bad symlink: {}", err)
            }
            DisableReason::NotExecutable(path) => write!(f, "{:?} is not executable", path),
        }
    }
}

/// A supported programming language
#[derive(Debug, Clone)]
pub struct Language {
    pub name: String,
    pub printable_name: String,
    /// File extensions including the dot (e.g. ".cpp")
    pub extensions: Vec<String>,
    pub compiled: bool,
    pub compile_command: Vec<String>,
    pub run_command: Vec<String>,
    /// Prints the toolchain version; empty when the language has none
    pub version_command: Vec<String>,
    /// Sandbox path the submission source is written to
    pub source_name: String,
    /// Sandbox path of the runnable artifact (the source itself when interpreted)
    pub compiled_name: String,
    /// Needed at compile time for compiled languages, at run time otherwise
    pub mounts: Vec<Directory>,
    pub build_env: BTreeMap<String, String>,
    pub run_env: BTreeMap<String, String>,
    /// Applied in both phases, before the phase-specific overlay
    pub common_env: BTreeMap<String, String>,
    /// Preferred match when several languages share an extension
    pub preferred: bool,
    pub disabled: Option<DisableReason>,
}

impl Language {
    pub fn is_enabled(&self) -> bool {
        self.disabled.is_none()
    }

    /// The command whose program must exist on the host for this language to work
    fn probe_command(&self) -> &[String] {
        if self.compiled {
            &self.compile_command
        } else {
            &self.run_command
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguage {
    printable_name: Option<String>,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    compiled: bool,
    compile_command: Option<String>,
    run_command: String,
    version_command: Option<String>,
    source_name: String,
    compiled_name: Option<String>,
    #[serde(default)]
    mounts: Vec<Directory>,
    #[serde(default)]
    build_env: BTreeMap<String, String>,
    #[serde(default)]
    run_env: BTreeMap<String, String>,
    #[serde(default)]
    common_env: BTreeMap<String, String>,
    #[serde(default)]
    preferred: bool,
    #[serde(default)]
    disabled: bool,
}

impl RawLanguage {
    fn into_language(self, name: &str) -> Result<Language> {
        let compile_command = self.compile_command.as_deref().map(into_command).unwrap_or_default();
        if self.compiled && self.compile_command.is_none() {
            return Err(EvalError::LanguageConfig(format!(
                "{} is compiled but has no compile_command",
                name
            )));
        }

        Ok(Language {
            name: name.to_string(),
            printable_name: self.printable_name.unwrap_or_else(|| name.to_string()),
            extensions: self.extensions,
            compiled: self.compiled,
            compile_command,
            run_command: into_command(&self.run_command),
            version_command: self.version_command.as_deref().map(into_command).unwrap_or_default(),
            compiled_name: self.compiled_name.unwrap_or_else(|| self.source_name.clone()),
            source_name: self.source_name,
            mounts: self.mounts,
            build_env: self.build_env,
            run_env: self.run_env,
            common_env: self.common_env,
            preferred: self.preferred,
            disabled: self.disabled.then_some(DisableReason::Configured),
        })
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

/// Read-only table of languages, keyed by lowercase name
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, Language>,
    aliases: BTreeMap<String, String>,
}

impl LanguageRegistry {
    /// Parse a registry without probing the host
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawLanguage> =
            toml::from_str(content).map_err(|e| EvalError::LanguageConfig(e.to_string()))?;

        let mut registry = Self::default();
        for (name, raw) in raw {
            let name = name.to_lowercase();
            for alias in &raw.aliases {
                registry.aliases.insert(alias.to_lowercase(), name.clone());
            }
            let language = raw.into_language(&name)?;
            registry.languages.insert(name, language);
        }
        Ok(registry)
    }

    /// Load the configured registry and probe it against the host `PATH`
    pub fn load(config: &EngineConfig) -> Result<Self> {
        let registry = match &config.languages_path {
            Some(path) => {
                info!("Loading languages from {:?}", path);
                Self::from_toml_str(&fs::read_to_string(path)?)?
            }
            None => Self::from_toml_str(EMBEDDED_LANGUAGES)?,
        };
        Ok(registry.probe_host(std::env::var_os("PATH").as_deref()))
    }

    /// Disable every language whose toolchain is missing from `search_path`
    pub fn probe_host(mut self, search_path: Option<&OsStr>) -> Self {
        for language in self.languages.values_mut() {
            if !language.is_enabled() {
                continue;
            }
            match probe(language, search_path) {
                Ok(path) => debug!("Language {} uses {:?}", language.name, path),
                Err(reason) => {
                    info!("Disabled language {}: {}", language.name, reason);
                    language.disabled = Some(reason);
                }
            }
        }
        self
    }

    /// Look up a language by name or alias, enabled or not
    pub fn get(&self, name: &str) -> Option<&Language> {
        let name = name.to_lowercase();
        let key = self.aliases.get(&name).unwrap_or(&name);
        self.languages.get(key)
    }

    /// Look up a language that is usable on this host
    pub fn enabled(&self, name: &str) -> Result<&Language> {
        let language = self
            .get(name)
            .ok_or_else(|| EvalError::UnknownLanguage(name.to_string()))?;
        if !language.is_enabled() {
            return Err(EvalError::LanguageDisabled(language.name.clone()));
        }
        Ok(language)
    }

    /// Pick the enabled language for a file name by its extension
    pub fn by_extension(&self, filename: &str) -> Option<&Language> {
        let ext = Path::new(filename).extension()?.to_str()?;
        let ext = format!(".{}", ext);

        let mut matches = self
            .languages
            .values()
            .filter(|lang| lang.is_enabled() && lang.extensions.iter().any(|e| *e == ext));
        let first = matches.next()?;
        Some(
            std::iter::once(first)
                .chain(matches)
                .find(|lang| lang.preferred)
                .unwrap_or(first),
        )
    }

    /// Names of the enabled languages, sorted
    pub fn names(&self) -> Vec<&str> {
        self.languages
            .values()
            .filter(|lang| lang.is_enabled())
            .map(|lang| lang.name.as_str())
            .collect()
    }

    /// Every language, including disabled ones
    pub fn iter(&self) -> impl Iterator<Item = &Language> {
        self.languages.values()
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find `program` the way a shell would
fn look_path(program: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search_path = search_path?;
    std::env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Check that a language's toolchain resolves to an executable file
pub fn probe(language: &Language, search_path: Option<&OsStr>) -> std::result::Result<PathBuf, DisableReason> {
    let Some(program) = language.probe_command().first() else {
        return Err(DisableReason::EmptyCommand);
    };
    if program.starts_with("/box") {
        return Ok(PathBuf::from(program));
    }

    let found = look_path(program, search_path).ok_or_else(|| DisableReason::NotInPath(program.clone()))?;
    let resolved = fs::canonicalize(&found).map_err(|e| DisableReason::BadSymlink(e.to_string()))?;
    if !is_executable(&resolved) {
        return Err(DisableReason::NotExecutable(resolved));
    }
    Ok(resolved)
}

/// Rewrite the program of `command` to an absolute, symlink-free path.
///
/// isolate executes the program directly, so it cannot rely on `PATH`.
/// Programs already inside the box are left alone.
pub fn resolve_command(command: &[String], search_path: Option<&OsStr>) -> Result<Vec<String>> {
    let Some(program) = command.first() else {
        return Err(EvalError::CommandResolve {
            command: String::new(),
            reason: "empty command".to_string(),
        });
    };
    if program.starts_with("/box") {
        return Ok(command.to_vec());
    }

    let found = look_path(program, search_path).ok_or_else(|| EvalError::CommandResolve {
        command: program.clone(),
        reason: "not found in $PATH".to_string(),
    })?;
    let canonical = fs::canonicalize(&found).map_err(|e| EvalError::CommandResolve {
        command: program.clone(),
        reason: e.to_string(),
    })?;

    // ccache wrappers dispatch on their own name, keep the symlink
    let resolved = if canonical.to_string_lossy().contains("ccache") {
        found
    } else {
        canonical
    };

    let mut command = command.to_vec();
    command[0] = resolved.to_string_lossy().into_owned();
    Ok(command)
}

/// Host search path captured once, for callers that resolve many commands
pub fn host_search_path() -> Option<OsString> {
    std::env::var_os("PATH")
}
