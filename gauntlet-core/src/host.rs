//! The observed capabilities of the host machine.
//!
//! Produced once by the probe at session start and read-only afterwards.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::axis::well_known;
use crate::Assignment;

/// A virtual-machine monitor present on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmmTool {
    /// Platform this VMM serves, e.g. `qemu` or `fc`.
    pub platform: String,
    /// Guest architecture this VMM binary targets.
    pub arch: String,
    /// Absolute path of the executable.
    pub path: PathBuf,
}

/// A compiler installation present on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerTool {
    /// Compiler family, e.g. `gcc` or `clang`.
    pub kind: String,
    /// Target architecture the installation produces code for.
    pub arch: String,
    /// Absolute path of the executable.
    pub path: PathBuf,
}

/// Everything the harness knows about the machine it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HostCapabilities {
    /// Host CPU architecture, normalized (`aarch64` reported as `arm64`).
    pub arch: String,
    /// VMMs found on the host.
    pub vmms: Vec<VmmTool>,
    /// Compilers found on the host, including cross toolchains.
    pub compilers: Vec<CompilerTool>,
    /// `/dev/kvm` is present.
    pub kvm: bool,
    /// A Xen control interface is present.
    pub xen: bool,
    /// The harness runs with an effective UID of 0.
    pub privileged: bool,
}

impl HostCapabilities {
    /// Constructs a [`HostCapabilities`] from its fields.
    #[must_use]
    pub fn new(
        arch: String,
        vmms: Vec<VmmTool>,
        compilers: Vec<CompilerTool>,
        kvm: bool,
        xen: bool,
        privileged: bool,
    ) -> Self {
        Self {
            arch,
            vmms,
            compilers,
            kvm,
            xen,
            privileged,
        }
    }

    /// The VMM serving `platform` for guest `arch`, if present.
    #[must_use]
    pub fn vmm_for(&self, platform: &str, arch: &str) -> Option<&VmmTool> {
        self.vmms
            .iter()
            .find(|v| v.platform == platform && v.arch == arch)
    }

    /// Any compiler targeting `arch`, if present.
    #[must_use]
    pub fn compiler_for(&self, arch: &str) -> Option<&CompilerTool> {
        self.compilers.iter().find(|c| c.arch == arch)
    }

    /// Whether a `hypervisor` axis level can be honoured for a guest of the
    /// given architecture. Hardware acceleration is only offered when guest
    /// and host architectures match.
    #[must_use]
    pub fn supports_hypervisor(&self, level: &str, guest_arch: &str) -> bool {
        match level {
            "none" => true,
            "kvm" => self.kvm && guest_arch == self.arch,
            "xen" => self.xen && guest_arch == self.arch,
            _ => false,
        }
    }

    /// Whether the host can satisfy an assignment's tool requirements: the
    /// architecture gate, the build-tool compiler requirement, the run-tool
    /// VMM requirement, and the hypervisor flags.
    #[must_use]
    pub fn allows(&self, assignment: &Assignment) -> bool {
        let arch = assignment.level(well_known::ARCH).unwrap_or(&self.arch);
        let platform = assignment.level(well_known::PLATFORM).unwrap_or_default();

        // Foreign architectures need a cross toolchain.
        if arch != self.arch && self.compiler_for(arch).is_none() {
            return false;
        }

        if let Some(hypervisor) = assignment.level(well_known::HYPERVISOR) {
            if !self.supports_hypervisor(hypervisor, arch) {
                return false;
            }
        }

        // The native-make branch drives the compiler directly; the
        // integrated tool ships its own.
        if assignment.level(well_known::BUILD_TOOL) == Some("make")
            && self.compiler_for(arch).is_none()
        {
            return false;
        }

        // Launching through a VMM directly requires that VMM on the host.
        if assignment.level(well_known::RUN_TOOL) == Some("vmm")
            && self.vmm_for(platform, arch).is_none()
        {
            return false;
        }

        true
    }
}
