// Parent display availability checking

use super::{DisplayError, ParentDisplay, Result};
use log::{debug, trace};
use std::path::{Path, PathBuf};

/// Display availability status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayStatus {
    /// Display is available and can be connected to
    Available,
    /// Display is unavailable with error message
    Unavailable(String),
}

impl DisplayStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, DisplayStatus::Available)
    }
}

/// Detects the display server the compositor is nested in
pub struct DisplayDetector;

impl DisplayDetector {
    /// Find a reachable parent display from the process environment
    pub fn detect() -> Result<ParentDisplay> {
        Self::detect_with(|key| std::env::var(key).ok())
    }

    /// Same as [`DisplayDetector::detect`] with an explicit environment lookup
    ///
    /// Wayland wins over X11 when both are set.
    pub fn detect_with(env: impl Fn(&str) -> Option<String>) -> Result<ParentDisplay> {
        let candidates = [
            env("WAYLAND_DISPLAY")
                .filter(|v| !v.is_empty())
                .map(ParentDisplay::Wayland),
            env("DISPLAY").filter(|v| !v.is_empty()).map(ParentDisplay::X11),
        ];

        let mut last_error = None;
        for display in candidates.into_iter().flatten() {
            match Self::check_display(&display, &env) {
                DisplayStatus::Available => {
                    debug!("Using parent {}", display);
                    return Ok(display);
                }
                DisplayStatus::Unavailable(reason) => {
                    trace!("{} unavailable: {}", display, reason);
                    last_error = Some(DisplayError::Unreachable(display, reason));
                }
            }
        }
        Err(last_error.unwrap_or(DisplayError::NoDisplayAvailable))
    }

    /// Check that the display's endpoint exists
    ///
    /// Only local endpoints are checked; remote X11 displays are assumed reachable.
    pub fn check_display(display: &ParentDisplay, env: &impl Fn(&str) -> Option<String>) -> DisplayStatus {
        match display {
            ParentDisplay::Wayland(name) => {
                let path = if Path::new(name).is_absolute() {
                    PathBuf::from(name)
                } else {
                    match env("XDG_RUNTIME_DIR") {
                        Some(dir) => Path::new(&dir).join(name),
                        None => return DisplayStatus::Unavailable("XDG_RUNTIME_DIR is not set".to_string()),
                    }
                };
                Self::check_socket(&path)
            }
            ParentDisplay::X11(name) => match Self::x11_display_number(name) {
                Some(number) => Self::check_socket(&PathBuf::from(format!("/tmp/.X11-unix/X{}", number))),
                None if name.starts_with(':') => {
                    DisplayStatus::Unavailable(format!("Invalid display string: {}", name))
                }
                None => DisplayStatus::Available,
            },
        }
    }

    /// Display number of a local X11 display string such as `:0` or `:1.0`
    fn x11_display_number(display: &str) -> Option<u32> {
        let rest = display.strip_prefix(':')?;
        let number = rest.split('.').next()?;
        number.parse().ok()
    }

    fn check_socket(path: &Path) -> DisplayStatus {
        if path.exists() {
            DisplayStatus::Available
        } else {
            DisplayStatus::Unavailable(format!("{} does not exist", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_no_display() {
        let result = DisplayDetector::detect_with(env(&[]));
        assert!(matches!(result, Err(DisplayError::NoDisplayAvailable)));
        let result = DisplayDetector::detect_with(env(&[("DISPLAY", "")]));
        assert!(matches!(result, Err(DisplayError::NoDisplayAvailable)));
    }

    #[test]
    fn test_wayland_socket_in_runtime_dir() {
        let dir = std::env::temp_dir();
        let name = format!("nestcomp-detect-{}", std::process::id());
        let path = dir.join(&name);
        std::fs::write(&path, b"").unwrap();

        let lookup = env(&[
            ("WAYLAND_DISPLAY", name.as_str()),
            ("XDG_RUNTIME_DIR", dir.to_str().unwrap()),
        ]);
        let result = DisplayDetector::detect_with(lookup);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(result.unwrap(), ParentDisplay::Wayland(name));
    }

    #[test]
    fn test_missing_wayland_socket() {
        let lookup = env(&[
            ("WAYLAND_DISPLAY", "wayland-does-not-exist"),
            ("XDG_RUNTIME_DIR", "/nonexistent"),
        ]);
        let result = DisplayDetector::detect_with(lookup);
        assert!(matches!(result, Err(DisplayError::Unreachable(ParentDisplay::Wayland(_), _))));
    }

    #[test]
    fn test_remote_x11_assumed_available() {
        let result = DisplayDetector::detect_with(env(&[("DISPLAY", "remote-host:0")]));
        assert_eq!(result.unwrap(), ParentDisplay::X11("remote-host:0".to_string()));
    }

    #[test]
    fn test_x11_display_number() {
        assert_eq!(DisplayDetector::x11_display_number(":0"), Some(0));
        assert_eq!(DisplayDetector::x11_display_number(":12.1"), Some(12));
        assert_eq!(DisplayDetector::x11_display_number(":x"), None);
        assert_eq!(DisplayDetector::x11_display_number("host:0"), None);
    }
}
