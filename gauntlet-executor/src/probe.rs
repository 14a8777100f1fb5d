//! Host probe: inspect the machine once and report its capabilities.
//!
//! For each tool named `system` in the configuration the probe looks on
//! PATH for the canonical executable name per architecture; explicit
//! `{arch, type, path}` records are accepted as-is. Failure to find any one
//! tool is not an error, the tool is simply absent from the capability set.

use std::path::Path;

use gauntlet_core::{CompilerTool, HostCapabilities, ToolEntry, VmmTool};

use crate::error::ProbeError;

/// Canonical PATH names of VMM executables, per `(platform, arch)`.
const VMM_CANDIDATES: &[(&str, &str, &str)] = &[
    ("qemu", "x86_64", "qemu-system-x86_64"),
    ("qemu", "arm64", "qemu-system-aarch64"),
    ("fc", "x86_64", "firecracker-x86_64"),
    ("fc", "arm64", "firecracker-aarch64"),
    ("xen", "x86_64", "xl"),
    ("xen", "arm64", "xl"),
];

/// Canonical PATH names of compiler executables, per `(kind, arch)`.
const COMPILER_CANDIDATES: &[(&str, &str, &str)] = &[
    ("gcc", "x86_64", "gcc"),
    ("gcc", "x86_64", "x86_64-linux-gnu-gcc"),
    ("gcc", "arm64", "aarch64-linux-gnu-gcc"),
    ("clang", "x86_64", "clang"),
    ("clang", "arm64", "clang"),
];

/// Probe the host once.
///
/// # Errors
/// Returns [`ProbeError::UnknownArchitecture`] when the host CPU is not an
/// architecture the harness can test; every other probe failure is
/// non-fatal and only narrows the capability set.
pub fn probe_host(
    vmm_entries: &[ToolEntry],
    compiler_entries: &[ToolEntry],
) -> Result<HostCapabilities, ProbeError> {
    let arch = normalize_arch(std::env::consts::ARCH)?;

    let mut vmms = Vec::new();
    for entry in vmm_entries {
        match entry {
            ToolEntry::Keyword(_) => {
                for (platform, tool_arch, exe) in VMM_CANDIDATES {
                    match which::which(exe) {
                        Ok(path) => {
                            // First hit wins per (platform, arch) slot.
                            if !vmms
                                .iter()
                                .any(|v: &VmmTool| v.platform == *platform && v.arch == *tool_arch)
                            {
                                vmms.push(VmmTool {
                                    platform: (*platform).to_owned(),
                                    arch: (*tool_arch).to_owned(),
                                    path,
                                });
                            }
                        }
                        Err(err) => {
                            tracing::debug!(exe, %err, "vmm not on PATH");
                        }
                    }
                }
            }
            ToolEntry::Record(rec) => vmms.push(VmmTool {
                platform: rec.kind.clone(),
                arch: rec.arch.clone(),
                path: rec.path.clone(),
            }),
        }
    }

    let mut compilers = Vec::new();
    for entry in compiler_entries {
        match entry {
            ToolEntry::Keyword(_) => {
                for (kind, tool_arch, exe) in COMPILER_CANDIDATES {
                    // A bare `gcc`/`clang` only targets the host architecture.
                    let is_cross_name = exe.contains("-linux-gnu-");
                    if *tool_arch != arch && !is_cross_name && *kind != "clang" {
                        continue;
                    }
                    match which::which(exe) {
                        Ok(path) => compilers.push(CompilerTool {
                            kind: (*kind).to_owned(),
                            arch: (*tool_arch).to_owned(),
                            path,
                        }),
                        Err(err) => {
                            tracing::debug!(exe, %err, "compiler not on PATH");
                        }
                    }
                }
            }
            ToolEntry::Record(rec) => compilers.push(CompilerTool {
                kind: rec.kind.clone(),
                arch: rec.arch.clone(),
                path: rec.path.clone(),
            }),
        }
    }

    let kvm = Path::new("/dev/kvm").exists();
    let xen = xen_present();
    let privileged = effective_uid() == 0;

    let caps = HostCapabilities::new(arch, vmms, compilers, kvm, xen, privileged);
    tracing::info!(
        arch = %caps.arch,
        vmms = caps.vmms.len(),
        compilers = caps.compilers.len(),
        kvm = caps.kvm,
        xen = caps.xen,
        "host probe complete"
    );
    Ok(caps)
}

fn normalize_arch(raw: &str) -> Result<String, ProbeError> {
    match raw {
        "x86_64" => Ok("x86_64".to_owned()),
        "aarch64" => Ok("arm64".to_owned()),
        other => Err(ProbeError::UnknownArchitecture {
            raw: other.to_owned(),
        }),
    }
}

/// A Xen dom0 exposes a control interface through /proc or /dev.
fn xen_present() -> bool {
    if Path::new("/dev/xen/privcmd").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/xen/capabilities")
        .map(|caps| caps.contains("control_d"))
        .unwrap_or(false)
}

fn effective_uid() -> u32 {
    // geteuid never fails.
    unsafe { libc::geteuid() }
}
