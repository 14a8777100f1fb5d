//! Application manifest: what the application under test declares about
//! itself.
//!
//! The manifest is a small YAML document next to the application source; it
//! names the supported `(platform, arch)` targets and the runtime needs
//! (memory, ports, filesystem, networking, success marker). A shell script
//! named `custom.sh` next to the manifest may override the generated build
//! and run commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default manifest file name inside the application directory.
pub const MANIFEST_FILE: &str = "app.yaml";

/// Optional override script next to the manifest.
pub const CUSTOM_SCRIPT: &str = "custom.sh";

/// Whether the application builds a kernel image or reuses a prebuilt one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// The build phase produces a kernel image.
    #[default]
    Kernel,
    /// An example binary running on a pre-existing runtime kernel.
    Example,
}

/// How the application's root filesystem is delivered to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootfsKind {
    /// Packed into a cpio archive and passed as an initial ramdisk.
    Initrd,
    /// Shared into the guest over a 9p mount.
    #[serde(rename = "9pfs")]
    Ninep,
    /// Baked into the kernel image at build time.
    Embedded,
}

impl RootfsKind {
    /// The `rootfs` axis level this kind occupies at run time. An embedded
    /// filesystem needs nothing from the run setup.
    #[must_use]
    pub fn axis_level(self) -> &'static str {
        match self {
            RootfsKind::Initrd => "initrd",
            RootfsKind::Ninep => "9pfs",
            RootfsKind::Embedded => "none",
        }
    }
}

/// One `(platform, arch)` pair the application supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppTarget {
    pub platform: String,
    pub arch: String,
}

impl<'de> Deserialize<'de> for AppTarget {
    // Targets are written `platform/arch`, e.g. `qemu/x86_64`.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let (platform, arch) = raw
            .split_once('/')
            .ok_or_else(|| serde::de::Error::custom(format!("target '{raw}' is not plat/arch")))?;
        if platform.is_empty() || arch.is_empty() {
            return Err(serde::de::Error::custom(format!(
                "target '{raw}' is not plat/arch"
            )));
        }
        Ok(AppTarget {
            platform: platform.to_owned(),
            arch: arch.to_owned(),
        })
    }
}

/// A declared port binding: the guest listens on `exposed`, the host side
/// is published on `public` (subject to the session port allocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub public: u16,
    pub exposed: u16,
}

/// The application's test declaration: a command to poke the running guest
/// and a literal substring whose presence in the captured output means pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub command: Option<String>,
    pub marker: Option<String>,
}

/// Runtime needs declared by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeNeeds {
    /// Guest memory in mebibytes.
    pub memory: u32,
    /// The application serves traffic and needs network plumbing.
    pub networking: bool,
    /// Declared port bindings.
    pub ports: Vec<PortBinding>,
    /// Test command and success marker.
    pub test: Option<TestSpec>,
}

impl Default for RuntimeNeeds {
    fn default() -> Self {
        Self {
            memory: 64,
            networking: false,
            ports: Vec::new(),
            test: None,
        }
    }
}

/// The parsed application manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
    pub name: String,
    #[serde(default)]
    pub kind: AppKind,
    pub targets: Vec<AppTarget>,
    /// Path of the root filesystem source (directory or Dockerfile),
    /// relative to the application directory.
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    /// How the rootfs reaches the guest. Ignored when `rootfs` is unset.
    #[serde(default)]
    pub filesystem: Option<RootfsKind>,
    /// Kernel configuration keys copied verbatim into the generated
    /// defconfig / tool manifest.
    #[serde(default)]
    pub kconfig: BTreeMap<String, String>,
    /// Free-form guest command line appended at boot.
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeNeeds,
}

impl AppManifest {
    /// Load and validate the manifest from `<app_dir>/app.yaml`.
    ///
    /// # Errors
    /// [`ConfigError::Read`] / [`ConfigError::Parse`] on I/O or YAML
    /// failures; [`ConfigError::InvalidField`] for an empty target list.
    pub fn load(app_dir: &Path) -> Result<Self, ConfigError> {
        let file = app_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&file).map_err(|source| ConfigError::Read {
            file: file.clone(),
            source,
        })?;
        let manifest: AppManifest =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                file: file.clone(),
                source,
            })?;
        if manifest.targets.is_empty() {
            return Err(ConfigError::InvalidField {
                file,
                field: "targets",
                reason: "at least one platform/arch target is required".to_owned(),
            });
        }
        Ok(manifest)
    }

    /// True when the application declares a target for this pair.
    #[must_use]
    pub fn has_target(&self, platform: &str, arch: &str) -> bool {
        self.targets
            .iter()
            .any(|t| t.platform == platform && t.arch == arch)
    }

    /// The rootfs kind in effect, `None` when the application has no root
    /// filesystem at all.
    #[must_use]
    pub fn rootfs_kind(&self) -> Option<RootfsKind> {
        self.rootfs.as_ref()?;
        Some(self.filesystem.unwrap_or(RootfsKind::Initrd))
    }

    /// Whether the run setup must provide a filesystem (initrd or 9p). An
    /// embedded rootfs is the build's problem, not the run's.
    #[must_use]
    pub fn needs_external_rootfs(&self) -> bool {
        matches!(
            self.rootfs_kind(),
            Some(RootfsKind::Initrd | RootfsKind::Ninep)
        )
    }

    /// The declared success marker, if any.
    #[must_use]
    pub fn success_marker(&self) -> Option<&str> {
        self.runtime
            .test
            .as_ref()
            .and_then(|t| t.marker.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: hello-http
targets:
  - qemu/x86_64
  - fc/x86_64
rootfs: ./rootfs
filesystem: initrd
kconfig:
  CONFIG_LIBDEVFS: "y"
runtime:
  memory: 256
  networking: true
  ports:
    - { public: 8080, exposed: 80 }
  test:
    command: curl -s http://localhost:8080
    marker: "hello from guest"
"#;

    #[test]
    fn manifest_parses_targets_and_runtime() {
        let m: AppManifest = serde_yaml::from_str(MANIFEST).expect("parses");
        assert_eq!(m.name, "hello-http");
        assert_eq!(m.kind, AppKind::Kernel, "kind defaults to kernel");
        assert!(m.has_target("qemu", "x86_64"));
        assert!(!m.has_target("qemu", "arm64"));
        assert_eq!(m.runtime.memory, 256);
        assert!(m.runtime.networking);
        assert_eq!(m.success_marker(), Some("hello from guest"));
        assert_eq!(m.rootfs_kind(), Some(RootfsKind::Initrd));
        assert!(m.needs_external_rootfs());
    }

    #[test]
    fn malformed_target_is_rejected() {
        let err = serde_yaml::from_str::<AppManifest>("name: x\ntargets: [qemu]\n")
            .expect_err("bare platform without arch must fail");
        assert!(err.to_string().contains("plat/arch"));
    }

    #[test]
    fn embedded_rootfs_needs_nothing_at_run_time() {
        let m: AppManifest = serde_yaml::from_str(
            "name: x\ntargets: [qemu/x86_64]\nrootfs: ./rootfs\nfilesystem: embedded\n",
        )
        .expect("parses");
        assert_eq!(m.rootfs_kind(), Some(RootfsKind::Embedded));
        assert!(!m.needs_external_rootfs());
        assert_eq!(RootfsKind::Embedded.axis_level(), "none");
    }

    #[test]
    fn no_rootfs_means_no_kind() {
        let m: AppManifest =
            serde_yaml::from_str("name: x\ntargets: [qemu/x86_64]\n").expect("parses");
        assert_eq!(m.rootfs_kind(), None);
        assert!(!m.needs_external_rootfs());
        assert_eq!(m.runtime.memory, 64, "memory defaults to 64 MiB");
    }
}
