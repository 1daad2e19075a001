/// Configuration -- typed view of `config.toml`.
///
/// Loaded from `$XDG_CONFIG_HOME/kbflash/config.toml` (or
/// `~/.config/kbflash/config.toml`) unless a path is given. Missing
/// optional fields take defaults; every validation problem is collected
/// and reported together.
use crate::build::container::{DEFAULT_IMAGE, DEFAULT_RUNTIME};
use crate::build::{Builder, ContainerBuilder, NativeBuilder};
use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FILE_PATTERN: &str = "*.uf2";
pub const DEFAULT_FIRMWARE_DIR: &str = "./firmware";

/// Template written by `kbflash init`.
pub const EXAMPLE_CONFIG: &str = r#"# kbflash configuration

[keyboard]
# Required: name of your keyboard
name = "corne"

# Keyboard type: "split" or "uni"
type = "split"

# For split keyboards, the side names (flashed in this order)
sides = ["left", "right"]

[build]
# Enable firmware building (set to false for flash-only mode)
enabled = true

# Build mode: "docker" (only needs a container runtime) or "native"
mode = "docker"

# --- Docker mode settings ---
image = "zmkfirmware/zmk-dev-arm:stable"
# Your ZMK board (e.g. nice_nano_v2, seeeduino_xiao_ble)
board = "nice_nano_v2"
# Your ZMK shield, without the _left/_right suffix
shield = "corne"
# Container runtime with a docker-compatible CLI
# runtime = "podman"

# --- Native mode settings (if mode = "native") ---
# command = "./build.sh"
# args = ["{{side}}"]

# zmk-config checkout (docker) or directory to run the command in (native)
working_dir = "."

# Where built firmware is written and looked up
firmware_dir = "./firmware"

# Glob pattern matching firmware files
file_pattern = "*.uf2"

[device]
# Required: volume name shown when the keyboard enters its bootloader
# Common values: "NICENANO", "RPI-RP2", "XIAO-SENSE"
name = "NICENANO"

# How often to poll for the device
poll_interval = "500ms"

# How long the headless flash waits for the device
wait_timeout = "5m"
"#;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub keyboard: KeyboardConfig,
    pub build: BuildConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyboardType {
    Split,
    #[default]
    Uni,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: KeyboardType,
    pub sides: Vec<String>,
}

impl KeyboardConfig {
    pub fn is_split(&self) -> bool {
        self.kind == KeyboardType::Split
    }

    /// Configured sides, or the default for the keyboard type.
    pub fn sides(&self) -> Vec<String> {
        if !self.sides.is_empty() {
            return self.sides.clone();
        }
        if self.is_split() {
            vec!["left".into(), "right".into()]
        } else {
            vec!["main".into()]
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Native,
    Docker,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub enabled: bool,
    pub mode: BuildMode,
    pub command: String,
    pub args: Vec<String>,
    pub image: String,
    pub board: String,
    pub shield: String,
    pub runtime: String,
    pub working_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub file_pattern: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: BuildMode::default(),
            command: String::new(),
            args: Vec::new(),
            image: DEFAULT_IMAGE.into(),
            board: String::new(),
            shield: String::new(),
            runtime: DEFAULT_RUNTIME.into(),
            working_dir: PathBuf::from("."),
            firmware_dir: PathBuf::from(DEFAULT_FIRMWARE_DIR),
            file_pattern: DEFAULT_FILE_PATTERN.into(),
        }
    }
}

impl BuildConfig {
    /// The configured build strategy, or `None` when building is disabled.
    pub fn builder(&self) -> Option<Arc<dyn Builder>> {
        if !self.enabled {
            return None;
        }
        let builder: Arc<dyn Builder> = match self.mode {
            BuildMode::Native => Arc::new(
                NativeBuilder::new(&self.command, self.args.clone()).working_dir(&self.working_dir),
            ),
            BuildMode::Docker => Arc::new(
                ContainerBuilder::new(
                    &self.image,
                    &self.board,
                    &self.shield,
                    &self.working_dir,
                    &self.firmware_dir,
                )
                .runtime(&self.runtime),
            ),
        };
        Some(builder)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub wait_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl Config {
    /// Parse, fill defaults and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Replace explicitly empty optional values with their defaults.
    fn apply_defaults(&mut self) {
        if self.build.file_pattern.is_empty() {
            self.build.file_pattern = DEFAULT_FILE_PATTERN.into();
        }
        if self.build.image.is_empty() {
            self.build.image = DEFAULT_IMAGE.into();
        }
        if self.build.runtime.is_empty() {
            self.build.runtime = DEFAULT_RUNTIME.into();
        }
        if self.build.firmware_dir.as_os_str().is_empty() {
            self.build.firmware_dir = PathBuf::from(DEFAULT_FIRMWARE_DIR);
        }
        if self.device.poll_interval.is_zero() {
            self.device.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.device.wait_timeout.is_zero() {
            self.device.wait_timeout = DEFAULT_WAIT_TIMEOUT;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.keyboard.name.trim().is_empty() {
            problems.push("keyboard.name is required".to_string());
        }
        if self.device.name.trim().is_empty() {
            problems.push("device.name is required".to_string());
        }
        if self.keyboard.sides.iter().any(|s| s.trim().is_empty()) {
            problems.push("keyboard.sides must not contain empty names".to_string());
        }
        if let Err(e) = glob::Pattern::new(&self.build.file_pattern) {
            problems.push(format!("build.file_pattern is not a valid glob: {e}"));
        }

        if self.build.enabled {
            match self.build.mode {
                BuildMode::Native => {
                    if self.build.command.trim().is_empty() {
                        problems.push("build.command is required in native mode".to_string());
                    }
                }
                BuildMode::Docker => {
                    if self.build.board.trim().is_empty() {
                        problems.push("build.board is required in docker mode".to_string());
                    }
                    if self.build.shield.trim().is_empty() {
                        problems.push("build.shield is required in docker mode".to_string());
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Load the config at `path`, or at [`default_path`] when `None`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_path()?,
    };
    let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Config::from_toml_str(&text)
}

/// `$XDG_CONFIG_HOME/kbflash/config.toml`, else `~/.config/kbflash/config.toml`.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    default_path_with(std::env::var_os("XDG_CONFIG_HOME"), dirs::home_dir())
}

pub fn default_path_with(
    xdg_config_home: Option<OsString>,
    home: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    let base = match xdg_config_home.filter(|v| !v.is_empty()) {
        Some(xdg) => PathBuf::from(xdg),
        None => home.ok_or(ConfigError::HomeDirUnavailable)?.join(".config"),
    };
    Ok(base.join("kbflash").join("config.toml"))
}

/// Write [`EXAMPLE_CONFIG`] to `path` (or the default path), creating
/// parent directories. Never overwrites an existing file.
pub fn generate_example_config(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_path()?,
    };
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(&path, EXAMPLE_CONFIG).map_err(|source| ConfigError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

static DURATION_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)")
        .unwrap_or_else(|e| panic!("invalid duration regex: {e}"))
});

/// Parse a duration such as `500ms`, `2s`, `1m30s` or `1.5h`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err("empty duration".into());
    }

    let mut total = 0f64;
    let mut consumed = 0;
    for caps in DURATION_PART.captures_iter(text) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or_default();
        if whole.start != consumed {
            return Err(format!("invalid duration {text:?}"));
        }
        consumed = whole.end;

        let value: f64 = caps[1]
            .parse()
            .map_err(|_| format!("invalid number in duration {text:?}"))?;
        let unit_secs = match &caps[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            _ => 3600.0,
        };
        total += value * unit_secs;
    }

    if consumed != text.len() {
        return Err(format!("invalid duration {text:?} (expected e.g. \"500ms\" or \"5m\")"));
    }
    Duration::try_from_secs_f64(total).map_err(|e| format!("invalid duration {text:?}: {e}"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [keyboard]
        name = "corne"
        [device]
        name = "NICENANO"
    "#;

    #[test]
    fn example_config_is_valid() {
        let cfg = Config::from_toml_str(EXAMPLE_CONFIG).unwrap();
        assert!(cfg.keyboard.is_split());
        assert_eq!(cfg.keyboard.sides(), ["left", "right"]);
        assert_eq!(cfg.build.mode, BuildMode::Docker);
        assert_eq!(cfg.build.board, "nice_nano_v2");
        assert_eq!(cfg.device.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.device.wait_timeout, Duration::from_secs(300));
    }

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert!(!cfg.keyboard.is_split());
        assert_eq!(cfg.keyboard.sides(), ["main"]);
        assert!(!cfg.build.enabled);
        assert!(cfg.build.builder().is_none());
        assert_eq!(cfg.build.file_pattern, "*.uf2");
        assert_eq!(cfg.build.firmware_dir, PathBuf::from("./firmware"));
        assert_eq!(cfg.build.image, DEFAULT_IMAGE);
        assert_eq!(cfg.build.runtime, "docker");
        assert_eq!(cfg.device.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn split_without_sides_defaults_to_left_right() {
        let cfg = Config::from_toml_str(
            r#"
            [keyboard]
            name = "sofle"
            type = "split"
            [device]
            name = "NICENANO"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.keyboard.sides(), ["left", "right"]);
    }

    #[test]
    fn every_problem_is_reported() {
        let err = Config::from_toml_str(
            r#"
            [build]
            enabled = true
            mode = "docker"
        "#,
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid(problems) => {
                assert_eq!(
                    problems,
                    [
                        "keyboard.name is required",
                        "device.name is required",
                        "build.board is required in docker mode",
                        "build.shield is required in docker mode",
                    ]
                );
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn native_mode_requires_command() {
        let text = format!("{MINIMAL}\n[build]\nenabled = true\nmode = \"native\"\n");
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("build.command is required"));
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let text = format!("{MINIMAL}\n[build]\nmode = \"cloud\"\n");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn enabled_build_selects_strategy() {
        let text = format!(
            "{MINIMAL}\n[build]\nenabled = true\nmode = \"native\"\ncommand = \"./build.sh\"\n"
        );
        let cfg = Config::from_toml_str(&text).unwrap();
        assert_eq!(cfg.build.builder().map(|b| b.name()), Some("native"));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1.5h"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("500").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("1s garbage").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let text = format!("{MINIMAL}poll_interval = \"soon\"\n");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn oversized_duration_is_a_parse_error() {
        let text = format!("{MINIMAL}wait_timeout = \"99999999999999999999h\"\n");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn default_path_prefers_xdg() {
        let p = default_path_with(Some("/xdg".into()), Some("/home/u".into())).unwrap();
        assert_eq!(p, PathBuf::from("/xdg/kbflash/config.toml"));
        let p = default_path_with(Some("".into()), Some("/home/u".into())).unwrap();
        assert_eq!(p, PathBuf::from("/home/u/.config/kbflash/config.toml"));
        assert!(matches!(
            default_path_with(None, None),
            Err(ConfigError::HomeDirUnavailable)
        ));
    }

    #[test]
    fn generate_refuses_to_overwrite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        assert_eq!(generate_example_config(Some(&path)).unwrap(), path);
        assert_eq!(fs::read_to_string(&path).unwrap(), EXAMPLE_CONFIG);
        assert!(matches!(
            generate_example_config(Some(&path)),
            Err(ConfigError::AlreadyExists(_))
        ));
        assert!(load(Some(&path)).is_ok());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            load(Some(&tmp.path().join("absent.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
