//! Script materializer: pure template functions from a case's variant
//! assignment to the files in its directory.
//!
//! Every renderer is a function of the materializer's immutable inputs and
//! the case; nothing consults external state at render time, so running
//! materialization twice produces byte-identical files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gauntlet_core::app::{AppKind, AppManifest, RootfsKind, CUSTOM_SCRIPT};
use gauntlet_core::axis::well_known;
use gauntlet_core::{Assignment, HostCapabilities, TargetCase};
use serde::Serialize;

use crate::resources::NetNames;
use crate::workspace::CasePaths;

/// Shared helpers written to `<session-root>/common.sh` and sourced by
/// every generated script. Network and mount operations go through the
/// pre-arranged passwordless allowlist (`sudo -n`); a missing allowlisted
/// binary fails the script closed.
pub const COMMON_HELPERS: &str = r#"# Shared helpers for generated gauntlet scripts.

log() { printf '[%s] %s\n' "$(date +%H:%M:%S)" "$*"; }

require_bin() {
    command -v "$1" >/dev/null 2>&1 || { log "missing required binary: $1"; exit 90; }
}

net_up() {
    bridge="$1"; tap="$2"
    require_bin ip
    sudo -n ip link add name "$bridge" type bridge
    sudo -n ip tuntap add dev "$tap" mode tap
    sudo -n ip link set "$tap" master "$bridge"
    sudo -n ip link set "$bridge" up
    sudo -n ip link set "$tap" up
}

net_down() {
    bridge="$1"; tap="$2"
    sudo -n ip link del "$tap" 2>/dev/null || true
    sudo -n ip link del "$bridge" 2>/dev/null || true
}
"#;

/// The resolved case document written to `config.yaml`.
#[derive(Debug, Serialize)]
struct CaseConfigDoc<'a> {
    session: &'a str,
    index: usize,
    ident: &'a str,
    base: &'a Path,
    assignment: &'a Assignment,
    memory: u32,
    ports: Vec<PortDoc>,
    rootfs: Option<&'a str>,
    cmd: Option<&'a str>,
    test_command: Option<&'a str>,
    marker: Option<&'a str>,
    kernel: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    vmm: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compiler: Option<&'a Path>,
}

#[derive(Debug, Serialize)]
struct PortDoc {
    public: u16,
    exposed: u16,
}

/// Renders and writes every per-case artifact.
#[derive(Debug, Clone)]
pub struct Materializer {
    app: Arc<AppManifest>,
    host: Arc<HostCapabilities>,
    session_name: String,
    /// `source.base` from the global configuration.
    source_base: PathBuf,
    /// The staged application copy inside the session root.
    app_dir: PathBuf,
    common_sh: PathBuf,
}

impl Materializer {
    #[must_use]
    pub fn new(
        app: Arc<AppManifest>,
        host: Arc<HostCapabilities>,
        session_name: impl Into<String>,
        source_base: PathBuf,
        app_dir: PathBuf,
        common_sh: PathBuf,
    ) -> Self {
        Self {
            app,
            host,
            session_name: session_name.into(),
            source_base,
            app_dir,
            common_sh,
        }
    }

    /// Write every artifact for one case into its directory: `config.yaml`,
    /// `defconfig` or `Kraftfile`, the `build` and `run` scripts, and the
    /// VMM-specific config file where the platform needs one. Deterministic
    /// overwrite on re-run.
    ///
    /// # Errors
    /// Propagates filesystem errors from the case directory.
    pub fn materialize(
        &self,
        case: &TargetCase,
        paths: &CasePaths,
        public_port: Option<u16>,
    ) -> std::io::Result<()> {
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let build_tool = self.level(case, well_known::BUILD_TOOL, "make");
        let run_tool = self.level(case, well_known::RUN_TOOL, "vmm");

        std::fs::write(
            paths.case_dir.join("config.yaml"),
            self.render_case_config(case, paths, public_port),
        )?;

        if build_tool == "make" && self.app.kind == AppKind::Kernel {
            std::fs::write(paths.case_dir.join("defconfig"), self.render_defconfig(case))?;
        }
        if build_tool == "kraft" || run_tool == "kraft" {
            std::fs::write(
                paths.case_dir.join("Kraftfile"),
                self.render_tool_manifest(case),
            )?;
        }
        if run_tool == "vmm" && platform == "fc" {
            std::fs::write(
                paths.case_dir.join("config.json"),
                self.render_fc_config(case, paths, public_port),
            )?;
        }
        if run_tool == "vmm" && platform == "xen" {
            std::fs::write(paths.case_dir.join("xen.cfg"), self.render_xen_config(case, paths))?;
        }

        write_executable(&paths.build_script, &self.render_build_script(case, paths))?;
        write_executable(&paths.run_script, &self.render_run_script(case, paths, public_port))?;
        Ok(())
    }

    fn level<'a>(&'a self, case: &'a TargetCase, axis: &str, default: &'a str) -> &'a str {
        case.assignment.level(axis).unwrap_or(default)
    }

    /// Name of the image the build tool produces.
    fn kernel_artifact(&self, case: &TargetCase) -> String {
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let arch = self.level(case, well_known::ARCH, &self.host.arch);
        format!("{}_{platform}-{arch}", self.app.name)
    }

    fn render_case_config(
        &self,
        case: &TargetCase,
        paths: &CasePaths,
        public_port: Option<u16>,
    ) -> String {
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let arch = self.level(case, well_known::ARCH, &self.host.arch);
        let ports = self
            .app
            .runtime
            .ports
            .iter()
            .map(|p| PortDoc {
                public: public_port.unwrap_or(p.public),
                exposed: p.exposed,
            })
            .collect();
        let test = self.app.runtime.test.as_ref();
        let doc = CaseConfigDoc {
            session: &self.session_name,
            index: case.index,
            ident: &case.ident,
            base: &self.source_base,
            assignment: &case.assignment,
            memory: self.app.runtime.memory,
            ports,
            rootfs: self.app.rootfs_kind().map(RootfsKind::axis_level),
            cmd: self.app.cmd.as_deref(),
            test_command: test.and_then(|t| t.command.as_deref()),
            marker: test.and_then(|t| t.marker.as_deref()),
            kernel: &paths.kernel,
            vmm: self.host.vmm_for(platform, arch).map(|v| v.path.as_path()),
            compiler: self.host.compiler_for(arch).map(|c| c.path.as_path()),
        };
        serde_yaml::to_string(&doc).unwrap_or_default()
    }

    /// Kernel configuration for the native-make branch.
    fn render_defconfig(&self, case: &TargetCase) -> String {
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let arch = self.level(case, well_known::ARCH, &self.host.arch);
        let debug = self.level(case, well_known::DEBUG, "0");

        let mut s = String::new();
        let name = &self.app.name;
        let _ = writeln!(s, "CONFIG_UK_NAME=\"{name}\"");
        let _ = writeln!(s, "CONFIG_UK_DEFNAME=\"{name}\"");
        match platform {
            "fc" => {
                s.push_str("CONFIG_PLAT_KVM=y\n");
                s.push_str("CONFIG_KVM_VMM_FIRECRACKER=y\n");
            }
            "xen" => s.push_str("CONFIG_PLAT_XEN=y\n"),
            _ => {
                s.push_str("CONFIG_PLAT_KVM=y\n");
                s.push_str("CONFIG_KVM_VMM_QEMU=y\n");
            }
        }
        match arch {
            "arm64" => s.push_str("CONFIG_ARCH_ARM_64=y\n"),
            _ => s.push_str("CONFIG_ARCH_X86_64=y\n"),
        }
        if self.app.rootfs_kind() == Some(RootfsKind::Embedded) {
            s.push_str("CONFIG_LIBVFSCORE_AUTOMOUNT_CI=y\n");
            s.push_str("CONFIG_LIBVFSCORE_AUTOMOUNT_CI_EINITRD=y\n");
        } else {
            s.push_str("CONFIG_LIBVFSCORE_AUTOMOUNT_CI=n\n");
            s.push_str("CONFIG_LIBVFSCORE_AUTOMOUNT_CI_EINITRD=n\n");
        }
        if debug != "0" && debug != "none" {
            s.push_str("CONFIG_LIBUKDEBUG=y\n");
            s.push_str("CONFIG_LIBUKDEBUG_PRINTK_INFO=y\n");
        }
        for (key, value) in &self.app.kconfig {
            let _ = writeln!(s, "{key}={value}");
        }
        s
    }

    /// The integrated tool's manifest, used for kraft builds and kraft runs.
    fn render_tool_manifest(&self, case: &TargetCase) -> String {
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let arch = self.level(case, well_known::ARCH, &self.host.arch);

        let mut s = String::from("spec: v0.6\n\n");
        let _ = writeln!(s, "name: {}\n", self.app.name);
        if let Some(rootfs) = &self.app.rootfs {
            let _ = writeln!(s, "rootfs: {}\n", self.app_dir.join(rootfs).display());
        }
        if let Some(cmd) = &self.app.cmd {
            let _ = writeln!(s, "cmd: \"{cmd}\"\n");
        }
        s.push_str("targets:\n");
        let _ = writeln!(s, "- {platform}/{arch}\n");
        if self.app.kind == AppKind::Kernel {
            s.push_str("unikraft:\n");
            let _ = writeln!(s, "  source: {}", self.source_base.join("unikraft").display());
            if !self.app.kconfig.is_empty() {
                s.push_str("  kconfig:\n");
                for (key, value) in &self.app.kconfig {
                    let _ = writeln!(s, "    {key}: \"{value}\"");
                }
            }
        }
        s
    }

    fn render_build_script(&self, case: &TargetCase, paths: &CasePaths) -> String {
        let build_tool = self.level(case, well_known::BUILD_TOOL, "make");
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let arch = self.level(case, well_known::ARCH, &self.host.arch);
        let artifact = self.kernel_artifact(case);

        let mut s = String::new();
        let _ = writeln!(s, "#!/usr/bin/env bash");
        let _ = writeln!(s, "# build {}: {build_tool} {platform}/{arch}", case.ident);
        s.push_str("set -euo pipefail\n\n");
        let _ = writeln!(s, ". \"{}\"\n", self.common_sh.display());
        let _ = writeln!(s, "CASE_DIR=\"{}\"", paths.case_dir.display());
        let _ = writeln!(s, "APP_DIR=\"{}\"", self.app_dir.display());
        s.push_str("BUILD_DIR=\"$CASE_DIR/build\"\n\n");
        let _ = writeln!(
            s,
            "if [ -e \"$APP_DIR/{CUSTOM_SCRIPT}\" ]; then . \"$APP_DIR/{CUSTOM_SCRIPT}\"; fi\n"
        );

        if matches!(
            self.app.rootfs_kind(),
            Some(RootfsKind::Initrd | RootfsKind::Embedded)
        ) {
            if let Some(rootfs) = &self.app.rootfs {
                s.push_str("require_bin cpio\n");
                let _ = writeln!(
                    s,
                    "( cd \"$APP_DIR/{}\" && find . | cpio -o -H newc ) > \"$CASE_DIR/initrd.cpio\"",
                    rootfs.display()
                );
                s.push('\n');
            }
        }

        s.push_str("if declare -F build_cmd >/dev/null; then\n    build_cmd\nelse\n");
        match (build_tool, self.app.kind) {
            ("make", AppKind::Kernel) => {
                let cc = self
                    .host
                    .compiler_for(arch)
                    .map_or_else(|| "cc".to_owned(), |c| c.path.display().to_string());
                s.push_str("    require_bin make\n");
                s.push_str("    mkdir -p \"$BUILD_DIR\"\n");
                let _ = writeln!(
                    s,
                    "    make -C \"{base}/unikraft\" A=\"$APP_DIR\" O=\"$BUILD_DIR\" \\\n        UK_DEFCONFIG=\"$CASE_DIR/defconfig\" defconfig",
                    base = self.source_base.display()
                );
                let _ = writeln!(
                    s,
                    "    make -C \"{base}/unikraft\" A=\"$APP_DIR\" O=\"$BUILD_DIR\" \\\n        CC=\"{cc}\" -j\"$(nproc)\"",
                    base = self.source_base.display()
                );
                let _ = writeln!(s, "    cp \"$BUILD_DIR/{artifact}\" \"$CASE_DIR/kernel\"");
            }
            ("make", AppKind::Example) => {
                // Examples reuse a prebuilt runtime kernel; nothing to compile.
                s.push_str("    cp \"$APP_DIR/.unikraft/bin/kernel\" \"$CASE_DIR/kernel\"\n");
            }
            _ => {
                s.push_str("    require_bin kraft\n");
                let _ = writeln!(
                    s,
                    "    kraft build --log-level info --log-type basic --no-cache --no-update \\\n        --kraftfile \"$CASE_DIR/Kraftfile\" --arch {arch} --plat {platform} \"$APP_DIR\""
                );
                let _ = writeln!(
                    s,
                    "    cp \"$APP_DIR/.unikraft/build/{artifact}\" \"$CASE_DIR/kernel\""
                );
            }
        }
        s.push_str("fi\n\n");
        s.push_str("log \"kernel image ready: $CASE_DIR/kernel\"\n");
        s
    }

    fn render_run_script(
        &self,
        case: &TargetCase,
        paths: &CasePaths,
        public_port: Option<u16>,
    ) -> String {
        let platform = self.level(case, well_known::PLATFORM, "qemu");
        let run_tool = self.level(case, well_known::RUN_TOOL, "vmm");
        let hypervisor = self.level(case, well_known::HYPERVISOR, "none");
        let networking = self.level(case, well_known::NETWORKING, "none");
        let rootfs = self.level(case, well_known::ROOTFS, "none");
        let net = NetNames::for_case(case.index);

        let mut s = String::new();
        let _ = writeln!(s, "#!/usr/bin/env bash");
        let _ = writeln!(
            s,
            "# run {}: {run_tool}/{platform} hypervisor={hypervisor} net={networking} rootfs={rootfs}",
            case.ident
        );
        s.push_str("set -euo pipefail\n\n");
        let _ = writeln!(s, ". \"{}\"\n", self.common_sh.display());
        let _ = writeln!(s, "CASE_DIR=\"{}\"", paths.case_dir.display());
        let _ = writeln!(s, "APP_DIR=\"{}\"\n", self.app_dir.display());
        let _ = writeln!(
            s,
            "if [ -e \"$APP_DIR/{CUSTOM_SCRIPT}\" ]; then . \"$APP_DIR/{CUSTOM_SCRIPT}\"; fi"
        );
        s.push_str("if declare -F run_cmd >/dev/null; then\n    run_cmd\n    exit $?\nfi\n\n");

        if networking == "bridge" {
            let _ = writeln!(s, "trap 'net_down \"{}\" \"{}\"' EXIT", net.bridge, net.tap);
            let _ = writeln!(s, "net_up \"{}\" \"{}\"\n", net.bridge, net.tap);
        }

        match run_tool {
            "kraft" => self.push_kraft_run(&mut s, hypervisor, public_port),
            _ => match platform {
                "fc" => self.push_fc_run(&mut s, case),
                "xen" => self.push_xen_run(&mut s),
                _ => self.push_qemu_run(&mut s, case, public_port, &net),
            },
        }
        s
    }

    fn push_kraft_run(&self, s: &mut String, hypervisor: &str, public_port: Option<u16>) {
        s.push_str("require_bin kraft\n");
        s.push_str("kraft run --log-level info --log-type basic \\\n");
        let _ = writeln!(s, "    -M {}M \\", self.app.runtime.memory);
        if hypervisor == "none" {
            s.push_str("    -W \\\n");
        }
        for port in &self.app.runtime.ports {
            let public = public_port.unwrap_or(port.public);
            let _ = writeln!(s, "    --port {public}:{} \\", port.exposed);
        }
        s.push_str("    --kraftfile \"$CASE_DIR/Kraftfile\" \"$APP_DIR\"\n");
    }

    fn push_fc_run(&self, s: &mut String, case: &TargetCase) {
        let arch = self.level(case, well_known::ARCH, &self.host.arch);
        let fc = self.vmm_invocation("fc", arch);
        let _ = writeln!(s, "require_bin \"{fc}\"");
        s.push_str("rm -f \"$CASE_DIR/fc.sock\"\n");
        let _ = writeln!(
            s,
            "\"{fc}\" --api-sock \"$CASE_DIR/fc.sock\" --config-file \"$CASE_DIR/config.json\""
        );
    }

    fn push_xen_run(&self, s: &mut String) {
        s.push_str("require_bin xl\n");
        s.push_str("sudo -n xl create -c \"$CASE_DIR/xen.cfg\"\n");
    }

    fn push_qemu_run(
        &self,
        s: &mut String,
        case: &TargetCase,
        public_port: Option<u16>,
        net: &NetNames,
    ) {
        let arch = self.level(case, well_known::ARCH, &self.host.arch);
        let hypervisor = self.level(case, well_known::HYPERVISOR, "none");
        let networking = self.level(case, well_known::NETWORKING, "none");
        let rootfs = self.level(case, well_known::ROOTFS, "none");
        let qemu = self.vmm_invocation("qemu", arch);

        let _ = writeln!(s, "require_bin \"{qemu}\"");
        let _ = writeln!(s, "\"{qemu}\" \\");
        s.push_str("    -kernel \"$CASE_DIR/kernel\" \\\n");
        s.push_str("    -nographic \\\n");
        let _ = writeln!(s, "    -m {}M \\", self.app.runtime.memory);
        if hypervisor == "kvm" {
            s.push_str("    -enable-kvm \\\n");
        }
        if arch != self.host.arch {
            // Foreign-architecture guests run under full emulation.
            s.push_str("    -machine virt \\\n");
        }
        if rootfs == "initrd" {
            s.push_str("    -initrd \"$CASE_DIR/initrd.cpio\" \\\n");
        }
        if rootfs == "9pfs" {
            if let Some(dir) = &self.app.rootfs {
                let _ = writeln!(
                    s,
                    "    -fsdev local,id=fs0,path=\"$APP_DIR/{}\",security_model=none \\",
                    dir.display()
                );
                s.push_str("    -device virtio-9p-pci,fsdev=fs0,mount_tag=fs0 \\\n");
            }
        }
        match networking {
            "nat" => {
                let forwards: String = self
                    .app
                    .runtime
                    .ports
                    .iter()
                    .map(|p| {
                        format!(
                            ",hostfwd=tcp::{}-:{}",
                            public_port.unwrap_or(p.public),
                            p.exposed
                        )
                    })
                    .collect();
                let _ = writeln!(s, "    -netdev user,id=net0{forwards} \\");
                s.push_str("    -device virtio-net-pci,netdev=net0 \\\n");
            }
            "bridge" => {
                let _ = writeln!(
                    s,
                    "    -netdev tap,id=net0,ifname={},script=no,downscript=no \\",
                    net.tap
                );
                s.push_str("    -device virtio-net-pci,netdev=net0 \\\n");
            }
            _ => {}
        }
        let _ = writeln!(s, "    -append \"{}\"", self.app.cmd.as_deref().unwrap_or(""));
    }

    /// The VMM executable to invoke: the probed absolute path when the host
    /// has one, otherwise the canonical name (scripts can still be
    /// inspected on hosts that lack the tool).
    fn vmm_invocation(&self, platform: &str, arch: &str) -> String {
        if let Some(vmm) = self.host.vmm_for(platform, arch) {
            return vmm.path.display().to_string();
        }
        match (platform, arch) {
            ("qemu", "arm64") => "qemu-system-aarch64".to_owned(),
            ("qemu", _) => "qemu-system-x86_64".to_owned(),
            ("fc", "arm64") => "firecracker-aarch64".to_owned(),
            ("fc", _) => "firecracker-x86_64".to_owned(),
            _ => platform.to_owned(),
        }
    }

    fn render_fc_config(
        &self,
        case: &TargetCase,
        paths: &CasePaths,
        _public_port: Option<u16>,
    ) -> String {
        let networking = self.level(case, well_known::NETWORKING, "none");
        let rootfs = self.level(case, well_known::ROOTFS, "none");
        let net = NetNames::for_case(case.index);

        let boot_args = format!(
            "console=ttyS0 panic=1 {}",
            self.app.cmd.as_deref().unwrap_or("")
        );
        let mut boot_source = serde_json::json!({
            "kernel_image_path": paths.kernel,
            "boot_args": boot_args.trim(),
        });
        if rootfs == "initrd" {
            boot_source["initrd_path"] =
                serde_json::json!(paths.case_dir.join("initrd.cpio"));
        }
        let mut doc = serde_json::json!({
            "boot-source": boot_source,
            "drives": [],
            "machine-config": {
                "vcpu_count": 1,
                "mem_size_mib": self.app.runtime.memory,
                "smt": false,
            },
        });
        if networking == "bridge" {
            doc["network-interfaces"] = serde_json::json!([{
                "iface_id": "net0",
                "host_dev_name": net.tap,
            }]);
        }
        serde_json::to_string_pretty(&doc).unwrap_or_default()
    }

    fn render_xen_config(&self, case: &TargetCase, paths: &CasePaths) -> String {
        let networking = self.level(case, well_known::NETWORKING, "none");
        let net = NetNames::for_case(case.index);

        let mut s = String::new();
        let _ = writeln!(s, "name = \"{}-{}\"", self.app.name, case.index);
        let _ = writeln!(s, "kernel = \"{}\"", paths.kernel.display());
        let _ = writeln!(s, "memory = {}", self.app.runtime.memory);
        s.push_str("vcpus = 1\n");
        if networking == "bridge" {
            let _ = writeln!(s, "vif = [\"bridge={}\"]", net.bridge);
        }
        if let Some(cmd) = &self.app.cmd {
            let _ = writeln!(s, "extra = \"{cmd}\"");
        }
        s.push_str("on_crash = \"destroy\"\n");
        s
    }
}

fn write_executable(path: &Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(test)]
mod tests {
    use gauntlet_core::{Axis, AxisFamily, AxisSet, CompilerTool, VmmTool};

    use super::*;

    fn axes() -> AxisSet {
        AxisSet::new(vec![
            Axis {
                name: "arch".to_owned(),
                family: AxisFamily::Build,
                levels: vec!["x86_64".to_owned()],
            },
            Axis {
                name: "platform".to_owned(),
                family: AxisFamily::Build,
                levels: vec!["qemu".to_owned(), "fc".to_owned()],
            },
            Axis {
                name: "build_tool".to_owned(),
                family: AxisFamily::Build,
                levels: vec!["make".to_owned(), "kraft".to_owned()],
            },
            Axis {
                name: "hypervisor".to_owned(),
                family: AxisFamily::Run,
                levels: vec!["none".to_owned(), "kvm".to_owned()],
            },
            Axis {
                name: "run_tool".to_owned(),
                family: AxisFamily::Run,
                levels: vec!["vmm".to_owned()],
            },
            Axis {
                name: "rootfs".to_owned(),
                family: AxisFamily::Run,
                levels: vec!["none".to_owned(), "initrd".to_owned()],
            },
            Axis {
                name: "networking".to_owned(),
                family: AxisFamily::Run,
                levels: vec!["none".to_owned(), "nat".to_owned(), "bridge".to_owned()],
            },
        ])
        .expect("valid axes")
    }

    fn case(index: usize, pairs: &[(&str, &str)]) -> TargetCase {
        let assignment = Assignment::from_pairs(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned())),
        );
        TargetCase::new(index, assignment, &axes())
    }

    fn app() -> Arc<AppManifest> {
        let manifest: AppManifest = serde_yaml::from_str(
            r#"
name: hello
targets: [qemu/x86_64, fc/x86_64]
rootfs: ./rootfs
filesystem: initrd
cmd: "hello world"
runtime:
  memory: 128
  networking: true
  ports: [{ public: 8080, exposed: 80 }]
  test: { command: "curl -s http://localhost:8080", marker: "hello" }
"#,
        )
        .expect("manifest parses");
        Arc::new(manifest)
    }

    fn host() -> Arc<HostCapabilities> {
        Arc::new(HostCapabilities::new(
            "x86_64".to_owned(),
            vec![
                VmmTool {
                    platform: "qemu".to_owned(),
                    arch: "x86_64".to_owned(),
                    path: PathBuf::from("/usr/bin/qemu-system-x86_64"),
                },
                VmmTool {
                    platform: "fc".to_owned(),
                    arch: "x86_64".to_owned(),
                    path: PathBuf::from("/usr/bin/firecracker-x86_64"),
                },
            ],
            vec![CompilerTool {
                kind: "gcc".to_owned(),
                arch: "x86_64".to_owned(),
                path: PathBuf::from("/usr/bin/gcc"),
            }],
            true,
            false,
            false,
        ))
    }

    fn materializer() -> Materializer {
        Materializer::new(
            app(),
            host(),
            "smoke",
            PathBuf::from("/srv/toolchain"),
            PathBuf::from("/work/session/app"),
            PathBuf::from("/work/session/common.sh"),
        )
    }

    fn qemu_case() -> TargetCase {
        case(
            1,
            &[
                ("arch", "x86_64"),
                ("platform", "qemu"),
                ("build_tool", "make"),
                ("hypervisor", "kvm"),
                ("run_tool", "vmm"),
                ("rootfs", "initrd"),
                ("networking", "bridge"),
            ],
        )
    }

    #[test]
    fn materialization_is_byte_deterministic() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let c = qemu_case();
        let paths = CasePaths::new(tmp.path().join("1"), "smoke");
        std::fs::create_dir_all(&paths.case_dir).expect("case dir");

        m.materialize(&c, &paths, Some(9000)).expect("first render");
        let first: Vec<(String, Vec<u8>)> = read_all(&paths.case_dir);
        m.materialize(&c, &paths, Some(9000)).expect("second render");
        let second: Vec<(String, Vec<u8>)> = read_all(&paths.case_dir);
        assert_eq!(first, second, "re-materialization must be byte-identical");
        assert!(first.iter().any(|(name, _)| name == "build"));
        assert!(first.iter().any(|(name, _)| name == "run"));
        assert!(first.iter().any(|(name, _)| name == "config.yaml"));
        assert!(first.iter().any(|(name, _)| name == "defconfig"));
    }

    fn read_all(dir: &Path) -> Vec<(String, Vec<u8>)> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .expect("readable dir")
            .map(|e| e.expect("entry"))
            .filter(|e| e.path().is_file())
            .map(|e| {
                (
                    e.file_name().to_string_lossy().into_owned(),
                    std::fs::read(e.path()).expect("readable file"),
                )
            })
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn defconfig_reflects_platform_arch_and_kconfig() {
        let m = materializer();
        let text = m.render_defconfig(&qemu_case());
        assert!(text.contains("CONFIG_UK_NAME=\"hello\""));
        assert!(text.contains("CONFIG_PLAT_KVM=y"));
        assert!(text.contains("CONFIG_KVM_VMM_QEMU=y"));
        assert!(text.contains("CONFIG_ARCH_X86_64=y"));
        assert!(
            text.contains("CONFIG_LIBVFSCORE_AUTOMOUNT_CI_EINITRD=n"),
            "initrd (non-embedded) rootfs must not enable the embedded automount"
        );
    }

    #[test]
    fn qemu_run_script_wires_kvm_bridge_and_initrd() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let c = qemu_case();
        let paths = CasePaths::new(tmp.path().join("1"), "smoke");
        let script = m.render_run_script(&c, &paths, Some(9000));
        assert!(script.contains("-enable-kvm"));
        assert!(script.contains("-initrd"));
        assert!(script.contains("net_up \"gkbr1\" \"gktap1\""));
        assert!(script.contains("trap 'net_down"));
        assert!(script.contains("ifname=gktap1"));
        assert!(script.contains("-append \"hello world\""));
        assert!(
            !script.contains("-machine virt"),
            "native-arch guests run without the generic machine model"
        );
    }

    #[test]
    fn bridge_names_are_unique_across_cases() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let paths1 = CasePaths::new(tmp.path().join("1"), "smoke");
        let paths2 = CasePaths::new(tmp.path().join("2"), "smoke");
        let mut c2 = qemu_case();
        c2.index = 2;
        let s1 = m.render_run_script(&qemu_case(), &paths1, None);
        let s2 = m.render_run_script(&c2, &paths2, None);
        assert!(s1.contains("gktap1") && !s1.contains("gktap2"));
        assert!(s2.contains("gktap2") && !s2.contains("gktap1"));
    }

    #[test]
    fn nat_networking_forwards_the_leased_port() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let c = case(
            3,
            &[
                ("arch", "x86_64"),
                ("platform", "qemu"),
                ("build_tool", "make"),
                ("hypervisor", "none"),
                ("run_tool", "vmm"),
                ("rootfs", "none"),
                ("networking", "nat"),
            ],
        );
        let paths = CasePaths::new(tmp.path().join("3"), "smoke");
        let script = m.render_run_script(&c, &paths, Some(9123));
        assert!(
            script.contains("hostfwd=tcp::9123-:80"),
            "the leased public port must replace the declared one"
        );
        assert!(!script.contains("-enable-kvm"));
    }

    #[test]
    fn fc_config_names_kernel_initrd_and_tap() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let c = case(
            2,
            &[
                ("arch", "x86_64"),
                ("platform", "fc"),
                ("build_tool", "kraft"),
                ("hypervisor", "kvm"),
                ("run_tool", "vmm"),
                ("rootfs", "initrd"),
                ("networking", "bridge"),
            ],
        );
        let paths = CasePaths::new(tmp.path().join("2"), "smoke");
        let json = m.render_fc_config(&c, &paths, None);
        let doc: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert!(doc["boot-source"]["kernel_image_path"]
            .as_str()
            .expect("kernel path")
            .ends_with("kernel"));
        assert!(doc["boot-source"]["initrd_path"]
            .as_str()
            .expect("initrd path")
            .ends_with("initrd.cpio"));
        assert_eq!(doc["machine-config"]["mem_size_mib"], 128);
        assert_eq!(doc["network-interfaces"][0]["host_dev_name"], "gktap2");
    }

    #[test]
    fn kraft_branch_writes_tool_manifest_and_kraft_commands() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let c = case(
            2,
            &[
                ("arch", "x86_64"),
                ("platform", "fc"),
                ("build_tool", "kraft"),
                ("hypervisor", "kvm"),
                ("run_tool", "vmm"),
                ("rootfs", "initrd"),
                ("networking", "none"),
            ],
        );
        let paths = CasePaths::new(tmp.path().join("2"), "smoke");
        std::fs::create_dir_all(&paths.case_dir).expect("case dir");
        m.materialize(&c, &paths, None).expect("materializes");
        assert!(paths.case_dir.join("Kraftfile").is_file());
        assert!(
            !paths.case_dir.join("defconfig").exists(),
            "the integrated-tool branch carries no defconfig"
        );
        let manifest =
            std::fs::read_to_string(paths.case_dir.join("Kraftfile")).expect("manifest");
        assert!(manifest.contains("spec: v0.6"));
        assert!(manifest.contains("- fc/x86_64"));
        assert!(manifest.contains("unikraft:"));
        let build = std::fs::read_to_string(&paths.build_script).expect("build script");
        assert!(build.contains("kraft build"));
        assert!(build.contains("--no-cache"));
    }

    #[test]
    fn custom_script_hook_is_sourced_and_overrides() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let m = materializer();
        let paths = CasePaths::new(tmp.path().join("1"), "smoke");
        let build = m.render_build_script(&qemu_case(), &paths);
        let run = m.render_run_script(&qemu_case(), &paths, None);
        for script in [&build, &run] {
            assert!(script.contains("custom.sh"));
        }
        assert!(build.contains("declare -F build_cmd"));
        assert!(run.contains("declare -F run_cmd"));
    }
}
