/// Containerised build strategy: `west build` inside a ZMK toolchain image.
///
/// The working directory (a zmk-config checkout) is mounted at `/workdir`.
/// Each side builds into `/workdir/build/<side>` with `-DSHIELD=<shield>_<side>`;
/// the single-target form uses `build/main` and the bare shield name. The
/// resulting `zmk.uf2` is copied to `<firmware_dir>/<YYYYMMDD>/`.
use super::process::run_streaming;
use super::{BuildOutcome, BuildProgress, Builder, ProgressTracker};
use crate::error::BuildError;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "zmkfirmware/zmk-dev-arm:stable";

/// Mount point of the working directory inside the container.
const CONTAINER_WORKDIR: &str = "/workdir";

/// Pull output worth showing; layer-by-layer noise is dropped.
const PULL_PROGRESS_MARKERS: [&str; 4] = ["Pulling", "Download", "Pull complete", "Already exists"];

#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    runtime: String,
    image: String,
    board: String,
    shield: String,
    working_dir: PathBuf,
    output_dir: PathBuf,
}

impl ContainerBuilder {
    pub fn new(
        image: impl Into<String>,
        board: impl Into<String>,
        shield: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime: DEFAULT_RUNTIME.to_string(),
            image: image.into(),
            board: board.into(),
            shield: shield.into(),
            working_dir: working_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Use another OCI runtime with a docker-compatible CLI (e.g. `podman`).
    pub fn runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Make sure the image is available locally, pulling it if needed.
    pub fn ensure_image(
        &self,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(BuildProgress),
    ) -> Result<(), BuildError> {
        if cancel.load(Ordering::Relaxed) {
            return Err(BuildError::Cancelled);
        }
        let present = Command::new(&self.runtime)
            .args(["image", "inspect", &self.image])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);

        if !present {
            info!("Pulling image {}", self.image);
            progress(BuildProgress::output(format!(
                "Pulling {} (this may take a few minutes)...",
                self.image
            )));

            let mut pull = Command::new(&self.runtime);
            pull.args(["pull", &self.image]);
            run_streaming(pull, cancel, &mut |line| {
                if is_pull_progress(line) {
                    progress(BuildProgress::output(line));
                }
            })
            .map_err(|e| match e {
                BuildError::Cancelled => BuildError::Cancelled,
                other => BuildError::ImagePull {
                    image: self.image.clone(),
                    reason: other.to_string(),
                },
            })?;
        }

        progress(BuildProgress::output(format!("Image ready: {}", self.image)));
        Ok(())
    }

    /// Runtime arguments for building `target` with `workdir` mounted.
    pub fn run_args(&self, workdir: &Path, target: &str) -> Vec<String> {
        let slug = build_slug(target);
        vec![
            "run".into(),
            "--rm".into(),
            "-v".into(),
            format!("{}:{CONTAINER_WORKDIR}", workdir.display()),
            "-w".into(),
            CONTAINER_WORKDIR.into(),
            self.image.clone(),
            "west".into(),
            "build".into(),
            "-s".into(),
            "zmk/app".into(),
            "-p".into(),
            "-b".into(),
            self.board.clone(),
            "-d".into(),
            format!("{CONTAINER_WORKDIR}/build/{slug}"),
            "--".into(),
            format!("-DSHIELD={}", self.shield_for(target)),
            format!("-DZMK_CONFIG={CONTAINER_WORKDIR}/config"),
        ]
    }

    /// Shield name with the side suffix, if `target` is a real side.
    pub fn shield_for(&self, target: &str) -> String {
        match side_suffix(target) {
            Some(side) => format!("{}_{side}", self.shield),
            None => self.shield.clone(),
        }
    }

    /// File name the artifact is stored under in the dated directory.
    pub fn output_name(&self, target: &str) -> String {
        format!("{}.uf2", self.shield_for(target))
    }

    /// Where the toolchain leaves the image for `target` on the host.
    pub fn artifact_path(workdir: &Path, target: &str) -> PathBuf {
        workdir
            .join("build")
            .join(build_slug(target))
            .join("zephyr")
            .join("zmk.uf2")
    }

    fn run_build(
        &self,
        target: &str,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(BuildProgress),
    ) -> Result<(), BuildError> {
        let workdir = std::path::absolute(&self.working_dir).map_err(|source| BuildError::Io {
            context: format!("invalid working directory {}", self.working_dir.display()),
            source,
        })?;
        let output_dir = std::path::absolute(&self.output_dir).map_err(|source| BuildError::Io {
            context: format!("invalid output directory {}", self.output_dir.display()),
            source,
        })?;
        fs::create_dir_all(&output_dir).map_err(|source| BuildError::Io {
            context: format!("cannot create output directory {}", output_dir.display()),
            source,
        })?;

        self.ensure_image(cancel, progress)?;

        progress(BuildProgress::status(
            5,
            format!("Starting container build for {target}"),
        ));

        let mut command = Command::new(&self.runtime);
        command.args(self.run_args(&workdir, target));

        let mut tracker = ProgressTracker::anywhere();
        run_streaming(command, cancel, &mut |line| {
            if let Some(mut p) = tracker.observe(line) {
                p.percent = 10 + p.percent * 85 / 100;
                progress(p);
            } else if line.contains("error:") || line.contains("Error:") {
                progress(BuildProgress::error_line(line));
            }
        })?;

        progress(BuildProgress::status(95, "Copying firmware..."));

        let artifact = Self::artifact_path(&workdir, target);
        let dated_dir = output_dir.join(Local::now().format("%Y%m%d").to_string());
        fs::create_dir_all(&dated_dir).map_err(|source| BuildError::Io {
            context: format!("cannot create dated output directory {}", dated_dir.display()),
            source,
        })?;

        let data = fs::read(&artifact).map_err(|source| BuildError::MissingArtifact {
            path: artifact.clone(),
            source,
        })?;
        let name = self.output_name(target);
        let destination = dated_dir.join(&name);
        fs::write(&destination, data).map_err(|source| BuildError::Io {
            context: format!("cannot write firmware to {}", destination.display()),
            source,
        })?;
        debug!("Copied {} -> {}", artifact.display(), destination.display());

        progress(BuildProgress::status(100, format!("Build complete: {name}")));
        Ok(())
    }
}

impl Builder for ContainerBuilder {
    fn name(&self) -> &'static str {
        "container"
    }

    /// The runtime must be installed and its daemon reachable.
    fn preflight(&self, cancel: &AtomicBool) -> Result<(), BuildError> {
        if cancel.load(Ordering::Relaxed) {
            return Err(BuildError::Cancelled);
        }
        let status = Command::new(&self.runtime)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => Ok(()),
            _ => Err(BuildError::RuntimeUnavailable(format!(
                "{} is not running. Please start it and try again",
                self.runtime
            ))),
        }
    }

    fn build(
        &self,
        target: &str,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(BuildProgress),
    ) -> BuildOutcome {
        BuildOutcome::from_result(self.run_build(target, cancel, progress))
    }
}

/// `Some(side)` for a real side, `None` for the side-agnostic targets.
fn side_suffix(target: &str) -> Option<&str> {
    match target {
        "" | "all" | "main" => None,
        side => Some(side),
    }
}

fn build_slug(target: &str) -> &str {
    side_suffix(target).unwrap_or("main")
}

fn is_pull_progress(line: &str) -> bool {
    PULL_PROGRESS_MARKERS.iter().any(|m| line.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corne() -> ContainerBuilder {
        ContainerBuilder::new(DEFAULT_IMAGE, "nice_nano_v2", "corne", ".", "./firmware")
    }

    #[test]
    fn side_targets_get_suffixed_shield_and_build_dir() {
        let args = corne().run_args(Path::new("/home/u/zmk-config"), "left");
        assert_eq!(args[3], "/home/u/zmk-config:/workdir");
        assert_eq!(args[6], DEFAULT_IMAGE);
        assert!(args.contains(&"/workdir/build/left".to_string()));
        assert!(args.contains(&"-DSHIELD=corne_left".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-DZMK_CONFIG=/workdir/config"));
    }

    #[test]
    fn side_agnostic_targets_fall_back_to_main() {
        let b = corne();
        for target in ["", "all", "main"] {
            let args = b.run_args(Path::new("/w"), target);
            assert!(args.contains(&"/workdir/build/main".to_string()));
            assert!(args.contains(&"-DSHIELD=corne".to_string()));
            assert_eq!(b.output_name(target), "corne.uf2");
            assert_eq!(
                ContainerBuilder::artifact_path(Path::new("/w"), target),
                PathBuf::from("/w/build/main/zephyr/zmk.uf2")
            );
        }
        assert_eq!(b.output_name("right"), "corne_right.uf2");
        assert_eq!(
            ContainerBuilder::artifact_path(Path::new("/w"), "right"),
            PathBuf::from("/w/build/right/zephyr/zmk.uf2")
        );
    }

    #[test]
    fn pull_filter_keeps_only_progress_lines() {
        assert!(is_pull_progress("stable: Pulling from zmkfirmware/zmk-dev-arm"));
        assert!(is_pull_progress("a1b2c3: Download complete"));
        assert!(is_pull_progress("a1b2c3: Pull complete"));
        assert!(is_pull_progress("d4e5f6: Already exists"));
        assert!(!is_pull_progress("a1b2c3: Waiting"));
        assert!(!is_pull_progress("Digest: sha256:abc"));
    }

    #[test]
    fn missing_runtime_fails_preflight() {
        let b = corne().runtime("/nonexistent/kbflash-runtime");
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            b.preflight(&cancel),
            Err(BuildError::RuntimeUnavailable(_))
        ));
    }

    #[test]
    fn cancelled_preflight_spawns_nothing() {
        let b = corne().runtime("/nonexistent/kbflash-runtime");
        let cancel = AtomicBool::new(true);
        assert!(matches!(b.preflight(&cancel), Err(BuildError::Cancelled)));
        assert!(matches!(
            b.ensure_image(&cancel, &mut |_| {}),
            Err(BuildError::Cancelled)
        ));
    }
}
