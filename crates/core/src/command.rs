//! Engine command construction.
//!
//! [`CommandBuilder`] turns [`ProcessingOptions`] into an [`EngineCommand`]:
//! the resolved interpreter plus a validated argument vector in a fixed
//! canonical order. Commands are immutable once built; the progress endpoint
//! is attached through [`EngineCommand::with_progress_endpoint`], which
//! returns a new command.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::validation::{self, PathPolicy, ValidationError};

/// Flag carrying the loopback progress endpoint.
pub const PROGRESS_ENDPOINT_FLAG: &str = "--ae";

/// Model and method names are plain identifiers.
static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"));

/// Feature toggles and their parameters for one processing run.
///
/// Numeric parameters are strings because the panel sends them as typed by
/// the user (`"2x"`, `"50%"`); the builder normalizes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingOptions {
    pub resize: bool,
    pub resize_factor: String,

    pub interpolate: bool,
    pub interpolate_factor: String,
    pub interpolation_model: String,
    pub ensemble: bool,

    pub upscale: bool,
    pub upscale_factor: String,
    pub upscale_model: String,

    pub deduplicate: bool,
    pub dedup_method: String,
    pub dedup_sensitivity: String,

    pub restore: bool,
    pub restore_model: String,

    pub sharpen: bool,
    pub sharpen_sensitivity: String,

    pub half_precision: bool,
    pub encode_method: String,
    pub bit_depth: String,
    pub preview: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            resize: false,
            resize_factor: "1".to_string(),
            interpolate: false,
            interpolate_factor: "2".to_string(),
            interpolation_model: "rife".to_string(),
            ensemble: false,
            upscale: false,
            upscale_factor: "2".to_string(),
            upscale_model: "shufflecugan".to_string(),
            deduplicate: false,
            dedup_method: "ssim".to_string(),
            dedup_sensitivity: "35".to_string(),
            restore: false,
            restore_model: "scunet".to_string(),
            sharpen: false,
            sharpen_sensitivity: "50".to_string(),
            half_precision: true,
            encode_method: "x264".to_string(),
            bit_depth: "8bit".to_string(),
            preview: false,
        }
    }
}

impl ProcessingOptions {
    /// Whether any feature that needs the external engine is enabled.
    ///
    /// When none is, phase 2 imports the prepared artifact directly.
    pub fn has_processing_enabled(&self) -> bool {
        self.resize
            || self.interpolate
            || self.upscale
            || self.deduplicate
            || self.restore
            || self.sharpen
    }
}

/// Command construction failures.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Where the engine lives. Resolved by the application, never taken from
/// panel input.
#[derive(Debug, Clone)]
pub struct EngineLocation {
    pub interpreter: PathBuf,
    pub script: PathBuf,
}

impl EngineLocation {
    /// Conventional layout of an engine install directory.
    pub fn resolve(engine_dir: &Path) -> Self {
        let interpreter = if cfg!(windows) {
            engine_dir.join("python.exe")
        } else {
            engine_dir.join("bin").join("python3")
        };
        Self {
            interpreter,
            script: engine_dir.join("main.py"),
        }
    }

    /// Resolve from `REELCTL_ENGINE_DIR`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var("REELCTL_ENGINE_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|dir| Self::resolve(Path::new(&dir)))
    }
}

/// A fully validated engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<String>,
    /// Indices into `args` holding filesystem paths (quoted for display).
    path_args: Vec<usize>,
}

impl EngineCommand {
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Return a copy pointing the engine at `endpoint`.
    ///
    /// Replaces the value of an existing [`PROGRESS_ENDPOINT_FLAG`], or
    /// inserts the flag right after the unconditional input/output block.
    pub fn with_progress_endpoint(&self, endpoint: &str) -> Result<Self, ValidationError> {
        let url = validation::validate_url(endpoint)?;
        let host = url.host_str().unwrap_or_default();
        if !validation::net::is_loopback_host(host) {
            return Err(ValidationError::InvalidUrl(format!(
                "progress endpoint must be loopback: {endpoint}"
            )));
        }
        let value = endpoint.trim().to_string();
        validation::validate_command_args(&[value.as_str()])?;

        let mut next = self.clone();
        match next.args.iter().position(|a| a == PROGRESS_ENDPOINT_FLAG) {
            Some(i) if i + 1 < next.args.len() => next.args[i + 1] = value,
            Some(_) => next.args.push(value),
            None => {
                let at = next
                    .args
                    .iter()
                    .position(|a| a == "--output")
                    .map(|i| (i + 2).min(next.args.len()))
                    .unwrap_or(next.args.len());
                next.args.insert(at, PROGRESS_ENDPOINT_FLAG.to_string());
                next.args.insert(at + 1, value);
                for idx in next.path_args.iter_mut() {
                    if *idx >= at {
                        *idx += 2;
                    }
                }
            }
        }
        Ok(next)
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.program.display())?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.path_args.contains(&i) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Maps [`ProcessingOptions`] to engine arguments.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    engine: EngineLocation,
    paths: PathPolicy,
}

impl CommandBuilder {
    pub fn new(engine: EngineLocation, paths: PathPolicy) -> Self {
        Self { engine, paths }
    }

    pub fn engine(&self) -> &EngineLocation {
        &self.engine
    }

    /// Build the engine invocation for `input` -> `output`.
    ///
    /// Order: script, input/output, encoder settings and preview, then
    /// resize, interpolate, upscale, deduplicate, restore, sharpen,
    /// precision.
    pub fn build(
        &self,
        options: &ProcessingOptions,
        input: &Path,
        output: &Path,
    ) -> Result<EngineCommand, CommandError> {
        let input = self.paths.validate(&input.to_string_lossy())?;
        let output = self.paths.validate(&output.to_string_lossy())?;

        let mut args = ArgList::default();
        args.path(self.engine.script.to_string_lossy());
        args.flag("--input");
        args.path(input.to_string_lossy());
        args.flag("--output");
        args.path(output.to_string_lossy());

        args.pair("--encode_method", identifier("encodeMethod", &options.encode_method)?);
        args.pair("--bit_depth", identifier("bitDepth", &options.bit_depth)?);
        if options.preview {
            args.flag("--preview");
        }

        if options.resize {
            args.flag("--resize");
            args.pair("--resize_factor", numeric("resizeFactor", &options.resize_factor)?);
        }
        if options.interpolate {
            args.flag("--interpolate");
            args.pair(
                "--interpolate_factor",
                numeric("interpolateFactor", &options.interpolate_factor)?,
            );
            args.pair(
                "--interpolate_method",
                identifier("interpolationModel", &options.interpolation_model)?,
            );
            if options.ensemble {
                args.flag("--ensemble");
            }
        }
        if options.upscale {
            args.flag("--upscale");
            args.pair("--upscale_factor", numeric("upscaleFactor", &options.upscale_factor)?);
            args.pair("--upscale_method", identifier("upscaleModel", &options.upscale_model)?);
        }
        if options.deduplicate {
            args.flag("--dedup");
            args.pair("--dedup_method", identifier("dedupMethod", &options.dedup_method)?);
            args.pair(
                "--dedup_sens",
                numeric("dedupSensitivity", &options.dedup_sensitivity)?,
            );
        }
        if options.restore {
            args.flag("--restore");
            args.pair("--restore_method", identifier("restoreModel", &options.restore_model)?);
        }
        if options.sharpen {
            args.flag("--sharpen");
            args.pair(
                "--sharpen_sens",
                numeric("sharpenSensitivity", &options.sharpen_sensitivity)?,
            );
        }
        if options.half_precision {
            args.flag("--half");
        }

        validation::validate_command_args(&args.args)?;

        Ok(EngineCommand {
            program: self.engine.interpreter.clone(),
            args: args.args,
            path_args: args.path_args,
        })
    }
}

#[derive(Default)]
struct ArgList {
    args: Vec<String>,
    path_args: Vec<usize>,
}

impl ArgList {
    fn flag(&mut self, flag: &str) {
        self.args.push(flag.to_string());
    }

    fn pair(&mut self, flag: &str, value: String) {
        self.args.push(flag.to_string());
        self.args.push(value);
    }

    fn path(&mut self, value: impl Into<String>) {
        self.path_args.push(self.args.len());
        self.args.push(value.into());
    }
}

/// Strip a trailing unit suffix (`"2x"`, `"50%"`) and require a finite number.
pub fn normalize_numeric(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%')
        .trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(trimmed.to_string()),
        _ => None,
    }
}

fn numeric(name: &'static str, raw: &str) -> Result<String, CommandError> {
    normalize_numeric(raw).ok_or_else(|| CommandError::InvalidOption {
        name,
        reason: format!("{raw:?} is not a number"),
    })
}

fn identifier(name: &'static str, raw: &str) -> Result<String, CommandError> {
    let value = raw.trim();
    if IDENTIFIER_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(CommandError::InvalidOption {
            name,
            reason: format!("{raw:?} is not a valid identifier"),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        builder: CommandBuilder,
        input: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineLocation::resolve(&dir.path().join("engine"));
        let builder = CommandBuilder::new(engine, PathPolicy::new(vec![dir.path().to_path_buf()]));
        Fixture {
            input: dir.path().join("in.mp4"),
            output: dir.path().join("out.mp4"),
            builder,
            _dir: dir,
        }
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("{needle} missing from {args:?}"))
    }

    #[test]
    fn interpolation_flags_in_order() {
        let fx = fixture();
        let options: ProcessingOptions = serde_json::from_value(serde_json::json!({
            "interpolate": true,
            "interpolateFactor": "2x",
            "interpolationModel": "rife"
        }))
        .unwrap();

        let cmd = fx.builder.build(&options, &fx.input, &fx.output).unwrap();
        let args = cmd.args();
        let i = position(args, "--interpolate");
        assert_eq!(args[i + 1], "--interpolate_factor");
        assert_eq!(args[i + 2], "2");
        assert_eq!(args[i + 3], "--interpolate_method");
        assert_eq!(args[i + 4], "rife");
    }

    #[test]
    fn unconditional_flags_come_first() {
        let fx = fixture();
        let options = ProcessingOptions {
            sharpen: true,
            resize: true,
            resize_factor: "0.5x".into(),
            ..Default::default()
        };
        let cmd = fx.builder.build(&options, &fx.input, &fx.output).unwrap();
        let args = cmd.args();

        assert_eq!(cmd.program(), fx.builder.engine().interpreter.as_path());
        assert_eq!(args[0], fx.builder.engine().script.to_string_lossy());
        assert_eq!(args[1], "--input");
        assert_eq!(args[3], "--output");
        assert!(position(args, "--encode_method") < position(args, "--resize"));
        assert!(position(args, "--resize") < position(args, "--sharpen"));
        assert!(position(args, "--sharpen") < position(args, "--half"));
        assert_eq!(cmd.flag_value("--resize_factor"), Some("0.5"));
    }

    #[test]
    fn canonical_feature_order() {
        let fx = fixture();
        let options = ProcessingOptions {
            resize: true,
            interpolate: true,
            upscale: true,
            deduplicate: true,
            restore: true,
            sharpen: true,
            ..Default::default()
        };
        let cmd = fx.builder.build(&options, &fx.input, &fx.output).unwrap();
        let order: Vec<usize> = [
            "--resize",
            "--interpolate",
            "--upscale",
            "--dedup",
            "--restore",
            "--sharpen",
            "--half",
        ]
        .iter()
        .map(|f| position(cmd.args(), f))
        .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");
    }

    #[test]
    fn non_numeric_factor_is_rejected() {
        let fx = fixture();
        let options = ProcessingOptions {
            upscale: true,
            upscale_factor: "big".into(),
            ..Default::default()
        };
        assert_matches!(
            fx.builder.build(&options, &fx.input, &fx.output),
            Err(CommandError::InvalidOption { name: "upscaleFactor", .. })
        );
    }

    #[test]
    fn injected_model_name_is_rejected() {
        let fx = fixture();
        let options = ProcessingOptions {
            restore: true,
            restore_model: "scunet; rm -rf /".into(),
            ..Default::default()
        };
        assert_matches!(
            fx.builder.build(&options, &fx.input, &fx.output),
            Err(CommandError::InvalidOption { name: "restoreModel", .. })
        );
    }

    #[test]
    fn paths_outside_policy_are_rejected() {
        let fx = fixture();
        let other = tempfile::tempdir().unwrap();
        let strict = CommandBuilder::new(
            fx.builder.engine().clone(),
            PathPolicy::new(vec![fx.input.parent().unwrap().join("nested")]),
        );
        assert_matches!(
            strict.build(&ProcessingOptions::default(), &other.path().join("a.mp4"), &fx.output),
            Err(CommandError::Validation(ValidationError::PathNotAllowed(_)))
        );
    }

    #[test]
    fn progress_endpoint_is_inserted_or_replaced() {
        let fx = fixture();
        let cmd = fx
            .builder
            .build(&ProcessingOptions::default(), &fx.input, &fx.output)
            .unwrap();
        assert_eq!(cmd.flag_value(PROGRESS_ENDPOINT_FLAG), None);

        let with = cmd.with_progress_endpoint("http://127.0.0.1:8765").unwrap();
        assert_eq!(with.args()[5], PROGRESS_ENDPOINT_FLAG);
        assert_eq!(with.flag_value(PROGRESS_ENDPOINT_FLAG), Some("http://127.0.0.1:8765"));
        assert_eq!(with.args().len(), cmd.args().len() + 2);

        let replaced = with.with_progress_endpoint("http://localhost:8770").unwrap();
        assert_eq!(replaced.args().len(), with.args().len());
        assert_eq!(replaced.flag_value(PROGRESS_ENDPOINT_FLAG), Some("http://localhost:8770"));

        assert!(cmd.with_progress_endpoint("http://example.com:80").is_err());
    }

    #[test]
    fn display_quotes_paths_only() {
        let fx = fixture();
        let cmd = fx
            .builder
            .build(&ProcessingOptions::default(), &fx.input, &fx.output)
            .unwrap()
            .with_progress_endpoint("http://127.0.0.1:8765")
            .unwrap();
        let rendered = cmd.to_string();
        assert!(rendered.contains(&format!("--input \"{}\"", fx.input.display())));
        assert!(rendered.contains(&format!("--output \"{}\"", fx.output.display())));
        assert!(rendered.contains("--ae http://127.0.0.1:8765"));
        assert!(!cmd.args().iter().any(|a| a.starts_with('"')));
    }

    #[test]
    fn normalize_numeric_suffixes() {
        assert_eq!(normalize_numeric("2x").as_deref(), Some("2"));
        assert_eq!(normalize_numeric(" 1.5X ").as_deref(), Some("1.5"));
        assert_eq!(normalize_numeric("50%").as_deref(), Some("50"));
        assert_eq!(normalize_numeric("x"), None);
        assert_eq!(normalize_numeric("inf"), None);
    }

    #[test]
    fn processing_enabled_detection() {
        assert!(!ProcessingOptions::default().has_processing_enabled());
        let opts = ProcessingOptions {
            deduplicate: true,
            ..Default::default()
        };
        assert!(opts.has_processing_enabled());
    }
}
