/// Mount-point discovery for bootloader volumes.
///
/// On macOS a volume named `NICENANO` always appears at `/Volumes/NICENANO`.
/// On Linux desktop automounters place it under a per-user root, either
/// `/run/media/<user>/` (udisks2) or `/media/<user>/` (Debian family), so
/// both are probed in that order.
use crate::model::VolumeEvent;
use std::path::PathBuf;

/// Ordered list of paths where a named volume may appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLocator {
    candidates: Vec<PathBuf>,
}

impl VolumeLocator {
    /// Candidate mount paths for `volume_name` on the running platform.
    pub fn for_volume(volume_name: &str) -> Self {
        if cfg!(target_os = "macos") {
            Self::from_candidates(vec![PathBuf::from("/Volumes").join(volume_name)])
        } else {
            Self::from_candidates(linux_candidates(&resolve_username(), volume_name))
        }
    }

    /// Probe an explicit candidate list, highest priority first.
    pub fn from_candidates(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Check every candidate once.
    ///
    /// Reports the first path that exists. When none does, the first
    /// candidate is reported as the place the volume is expected to appear.
    pub fn probe(&self) -> VolumeEvent {
        if let Some(found) = self.candidates.iter().find(|p| p.exists()) {
            return VolumeEvent {
                connected: true,
                path: found.clone(),
            };
        }
        VolumeEvent {
            connected: false,
            path: self.candidates.first().cloned().unwrap_or_default(),
        }
    }
}

/// Per-user automount roots used by Linux desktops.
pub fn linux_candidates(username: &str, volume_name: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/run/media").join(username).join(volume_name),
        PathBuf::from("/media").join(username).join(volume_name),
    ]
}

/// Current username: `$USER`, then `$LOGNAME`, then the passwd entry of
/// the real uid. Empty when every source fails.
pub fn resolve_username() -> String {
    resolve_username_with(|key| std::env::var(key).ok(), system_username)
}

/// Layered username lookup with injectable sources.
pub fn resolve_username_with<E, S>(env: E, system: S) -> String
where
    E: Fn(&str) -> Option<String>,
    S: FnOnce() -> Option<String>,
{
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|key| env(key))
        .find(|value| !value.is_empty())
        .or_else(system)
        .unwrap_or_default()
}

#[cfg(unix)]
fn system_username() -> Option<String> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!("passwd lookup failed: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
fn system_username() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn user_variable_wins() {
        let env = env_from(&[("USER", "alice"), ("LOGNAME", "bob")]);
        assert_eq!(resolve_username_with(env, || Some("carol".into())), "alice");
    }

    #[test]
    fn logname_is_second() {
        let env = env_from(&[("USER", ""), ("LOGNAME", "bob")]);
        assert_eq!(resolve_username_with(env, || Some("carol".into())), "bob");
    }

    #[test]
    fn system_lookup_is_last_resort() {
        let env = env_from(&[]);
        assert_eq!(resolve_username_with(env, || Some("carol".into())), "carol");
        let env = env_from(&[]);
        assert_eq!(resolve_username_with(env, || None), "");
    }

    #[test]
    fn linux_candidates_prefer_run_media() {
        let c = linux_candidates("alice", "NICENANO");
        assert_eq!(c[0], PathBuf::from("/run/media/alice/NICENANO"));
        assert_eq!(c[1], PathBuf::from("/media/alice/NICENANO"));
    }

    #[test]
    fn probe_reports_first_existing_candidate() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = tmp.path().join("run").join("VOL");
        let second = tmp.path().join("media").join("VOL");
        std::fs::create_dir_all(&second).unwrap();

        let locator = VolumeLocator::from_candidates(vec![first.clone(), second.clone()]);
        assert_eq!(
            locator.probe(),
            VolumeEvent {
                connected: true,
                path: second
            }
        );

        std::fs::create_dir_all(&first).unwrap();
        assert_eq!(locator.probe().path, first);
    }

    #[test]
    fn probe_reports_expected_path_when_absent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = tmp.path().join("a").join("VOL");
        let second = tmp.path().join("b").join("VOL");
        let locator = VolumeLocator::from_candidates(vec![first.clone(), second]);
        let event = locator.probe();
        assert!(!event.connected);
        assert_eq!(event.path, first);
    }
}
