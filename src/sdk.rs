//! Android SDK tool resolution.
//!
//! The set of tools is small and fixed, so it is a plain enum with a pure
//! path function per variant rather than pluggable locator objects. SDK
//! discovery (env var probing, auto-install) is left to the caller; an
//! [`Sdk`] with no root simply resolves tools from `PATH`.

use std::path::{Path, PathBuf};

/// Env var the SDK tools read for their per-user state.
pub const ANDROID_SDK_HOME: &str = "ANDROID_SDK_HOME";

/// Library path needed by the emulator and legacy tools on unix.
pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

/// SDK tools this crate can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// Android Debug Bridge.
    Adb,
    /// Legacy `android` SDK manager script.
    Android,
}

impl Tool {
    /// Directory holding the tool, relative to the SDK root.
    #[must_use]
    pub fn relative_dir(self) -> &'static Path {
        match self {
            Tool::Adb => Path::new("platform-tools"),
            Tool::Android => Path::new("tools"),
        }
    }

    /// Executable file name on the given platform family.
    #[must_use]
    pub fn executable(self, unix: bool) -> String {
        let (name, windows_ext) = match self {
            Tool::Adb => ("adb", ".exe"),
            Tool::Android => ("android", ".bat"),
        };
        if unix {
            name.to_string()
        } else {
            format!("{name}{windows_ext}")
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.executable(true))
    }
}

/// Location of an Android SDK installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sdk {
    root: Option<PathBuf>,
    home: Option<PathBuf>,
}

impl Sdk {
    /// SDK with optional root and home directories.
    pub fn new(root: Option<PathBuf>, home: Option<PathBuf>) -> Self {
        Self { root, home }
    }

    /// SDK root, if known.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// SDK home, if known.
    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    /// Full path to `tool` for the current platform.
    pub fn tool_path(&self, tool: Tool) -> PathBuf {
        self.tool_path_for(tool, cfg!(unix))
    }

    /// Full path to `tool` for an explicit platform family.
    ///
    /// Falls back to the bare executable name (a `PATH` lookup) when the root
    /// is unknown.
    pub fn tool_path_for(&self, tool: Tool, unix: bool) -> PathBuf {
        let executable = tool.executable(unix);
        match &self.root {
            Some(root) => root.join(tool.relative_dir()).join(executable),
            None => {
                log::warn!("[Sdk] SDK root not configured, resolving {} from PATH", tool);
                PathBuf::from(executable)
            }
        }
    }

    /// Environment the SDK tools expect.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(home) = &self.home {
            env.push((ANDROID_SDK_HOME.to_string(), home.display().to_string()));
        }
        if cfg!(unix) {
            if let Some(root) = &self.root {
                env.push((
                    LD_LIBRARY_PATH.to_string(),
                    root.join("tools").join("lib").display().to_string(),
                ));
            }
        }
        env
    }
}
