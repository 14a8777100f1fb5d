//! The global harness configuration document.
//!
//! Three top-level sections: `variants` (the build and run axis families),
//! `exclude_variants` (rules as in [`crate::exclude`]), and `tools` (VMMs
//! and compilers, each either the literal `system` for PATH discovery or an
//! explicit `{arch, type, path}` record). `source.base` names the directory
//! holding the external toolchain working copy.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::axis::{Axis, AxisFamily, AxisSet};
use crate::error::{ConfigError, MatrixError};
use crate::exclude::{compile_rules, ExcludeRule, RawRule};

/// Default config file name.
pub const CONFIG_FILE: &str = "gauntlet.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    /// Directory containing the toolchain working copy (kernel sources,
    /// library trees) referenced by generated build scripts.
    pub base: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantsSection {
    pub build: serde_yaml::Mapping,
    pub run: serde_yaml::Mapping,
}

/// An explicit tool record in the `tools` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolRecord {
    pub arch: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: PathBuf,
}

/// One entry under `tools.vmm` or `tools.compiler`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ToolEntry {
    /// The literal `system`: discover on PATH by canonical name.
    Keyword(String),
    /// Use this exact tool, no probing.
    Record(ToolRecord),
}

impl ToolEntry {
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, ToolEntry::Keyword(k) if k == "system")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub vmm: Vec<ToolEntry>,
    pub compiler: Vec<ToolEntry>,
}

/// The parsed global configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    pub source: SourceSection,
    pub variants: VariantsSection,
    #[serde(default)]
    pub exclude_variants: Vec<RawRule>,
    #[serde(default)]
    pub tools: ToolsSection,
}

impl GlobalConfig {
    /// Load the configuration from `path`.
    ///
    /// # Errors
    /// [`ConfigError::Read`] / [`ConfigError::Parse`] on I/O or YAML
    /// failures; [`ConfigError::InvalidField`] for a tool keyword other
    /// than `system`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            file: path.to_owned(),
            source,
        })?;
        let config: GlobalConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                file: path.to_owned(),
                source,
            })?;
        for (section, entries) in [
            ("tools.vmm", &config.tools.vmm),
            ("tools.compiler", &config.tools.compiler),
        ] {
            if let Some(ToolEntry::Keyword(word)) = entries
                .iter()
                .find(|e| matches!(e, ToolEntry::Keyword(k) if k != "system"))
            {
                return Err(ConfigError::InvalidField {
                    file: path.to_owned(),
                    field: section,
                    reason: format!("unknown tool keyword '{word}' (expected 'system')"),
                });
            }
        }
        Ok(config)
    }

    /// Convert the `variants` section into the declared axis set, build
    /// family first, preserving document order within each family.
    ///
    /// # Errors
    /// Returns [`MatrixError::EmptyAxis`] when an axis has no level list or
    /// an empty one.
    pub fn axes(&self) -> Result<AxisSet, MatrixError> {
        let mut axes = Vec::new();
        for (family, mapping) in [
            (AxisFamily::Build, &self.variants.build),
            (AxisFamily::Run, &self.variants.run),
        ] {
            for (key, value) in mapping {
                let name = scalar_to_string(key);
                let Value::Sequence(seq) = value else {
                    return Err(MatrixError::EmptyAxis { axis: name });
                };
                let levels: Vec<String> = seq.iter().map(scalar_to_string).collect();
                axes.push(Axis {
                    name,
                    family,
                    levels,
                });
            }
        }
        AxisSet::new(axes)
    }

    /// Compile the `exclude_variants` section against the declared axes.
    ///
    /// # Errors
    /// Propagates [`MatrixError::UnknownAxisOrLevel`] from rule compilation.
    pub fn rules(&self, axes: &AxisSet) -> Result<Vec<ExcludeRule>, MatrixError> {
        compile_rules(&self.exclude_variants, axes)
    }
}

/// Render a YAML scalar as an axis name or level. Numbers and booleans are
/// legal level spellings (`0`, `3`) and keep their document text.
fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
source:
  base: /srv/toolchain

variants:
  build:
    arch: [x86_64, arm64]
    platform: [qemu, fc, xen]
    build_tool: [make, kraft]
    debug: [0, 3]
  run:
    hypervisor: [none, kvm, xen]
    run_tool: [vmm, kraft]
    rootfs: [none, initrd, 9pfs]
    networking: [none, nat, bridge]

exclude_variants:
  - platform: fc
    hypervisor: not kvm
  - bootloader_unknown_example: never

tools:
  vmm:
    - system
    - arch: x86_64
      type: qemu
      path: /opt/qemu/bin/qemu-system-x86_64
  compiler:
    - system
"#;

    fn parsed() -> GlobalConfig {
        // Drop the deliberately-bad rule for the happy-path tests.
        let cleaned = CONFIG.replace("  - bootloader_unknown_example: never\n", "");
        serde_yaml::from_str(&cleaned).expect("config parses")
    }

    #[test]
    fn axes_preserve_family_and_document_order() {
        let config = parsed();
        let axes = config.axes().expect("axes build");
        let names: Vec<&str> = axes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "arch",
                "platform",
                "build_tool",
                "debug",
                "hypervisor",
                "run_tool",
                "rootfs",
                "networking"
            ],
            "build axes come first, each family in document order"
        );
        let debug = axes.get("debug").expect("debug axis");
        assert_eq!(
            debug.levels,
            vec!["0", "3"],
            "numeric levels keep their document spelling"
        );
        assert_eq!(debug.family, AxisFamily::Build);
        assert_eq!(
            axes.get("networking").expect("networking axis").family,
            AxisFamily::Run
        );
    }

    #[test]
    fn tool_entries_distinguish_system_and_records() {
        let config = parsed();
        assert!(config.tools.vmm[0].is_system());
        match &config.tools.vmm[1] {
            ToolEntry::Record(rec) => {
                assert_eq!(rec.arch, "x86_64");
                assert_eq!(rec.kind, "qemu");
                assert_eq!(rec.path, PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
            }
            ToolEntry::Keyword(_) => panic!("second vmm entry must be a record"),
        }
    }

    #[test]
    fn unknown_rule_axis_surfaces_matrix_error() {
        let config: GlobalConfig = serde_yaml::from_str(CONFIG).expect("config parses");
        let axes = config.axes().expect("axes build");
        let err = config.rules(&axes).expect_err("unknown axis must fail");
        assert!(matches!(err, MatrixError::UnknownAxisOrLevel { .. }));
    }

    #[test]
    fn missing_level_list_is_an_empty_axis() {
        let text = "source: {base: /x}\nvariants:\n  build:\n    arch: x86_64\n  run: {}\n";
        let config: GlobalConfig = serde_yaml::from_str(text).expect("config parses");
        let err = config.axes().expect_err("scalar level list must fail");
        assert!(matches!(err, MatrixError::EmptyAxis { axis } if axis == "arch"));
    }
}
