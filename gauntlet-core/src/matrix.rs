//! The configuration-matrix engine.
//!
//! Expands the declared axes into the Cartesian product, prunes by
//! exclusion rules, host capabilities, and application targets, and indexes
//! the survivors. Expansion order is lexicographic in axis declaration
//! order (first declared axis varies slowest), which fixes the case index.

use crate::app::AppManifest;
use crate::axis::{well_known, Assignment, AxisSet};
use crate::case::TargetCase;
use crate::error::MatrixError;
use crate::exclude::ExcludeRule;
use crate::host::HostCapabilities;

/// Produce the pruned, indexed list of target cases.
///
/// Returns an empty list (with a diagnostic) when the exclusion rules alone
/// eliminate every assignment; callers distinguish "nothing survived" from
/// configuration errors.
///
/// # Errors
/// Returns [`MatrixError::EmptyAxis`] via [`AxisSet`] construction upstream;
/// this function itself only fails if `axes` is empty.
pub fn generate_cases(
    axes: &AxisSet,
    rules: &[ExcludeRule],
    host: &HostCapabilities,
    app: &AppManifest,
) -> Result<Vec<TargetCase>, MatrixError> {
    if axes.is_empty() {
        return Err(MatrixError::EmptyAxis {
            axis: "<none declared>".to_owned(),
        });
    }

    let all = expand(axes);
    let total = all.len();

    let after_rules: Vec<Assignment> = all
        .into_iter()
        .filter(|a| !rules.iter().any(|r| r.matches(a)))
        .collect();
    tracing::debug!(
        total,
        surviving = after_rules.len(),
        "exclusion rules applied"
    );
    if after_rules.is_empty() {
        tracing::warn!(total, "exclusion rules removed every assignment");
        return Ok(Vec::new());
    }

    let cases: Vec<TargetCase> = after_rules
        .into_iter()
        .filter(|a| host.allows(a))
        .filter(|a| app_declares(app, a))
        .filter(|a| app_overrides_allow(app, a))
        .enumerate()
        .map(|(i, assignment)| TargetCase::new(i + 1, assignment, axes))
        .collect();

    tracing::info!(cases = cases.len(), "matrix generation complete");
    Ok(cases)
}

/// The full Cartesian product in declaration order.
fn expand(axes: &AxisSet) -> Vec<Assignment> {
    let decls: Vec<_> = axes.iter().collect();
    let mut out = Vec::with_capacity(axes.cardinality());
    // Odometer over level indices; the last axis spins fastest.
    let mut cursor = vec![0usize; decls.len()];
    loop {
        out.push(Assignment::from_pairs(
            decls
                .iter()
                .zip(&cursor)
                .map(|(axis, &i)| (axis.name.clone(), axis.levels[i].clone())),
        ));
        let mut pos = decls.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            cursor[pos] += 1;
            if cursor[pos] < decls[pos].levels.len() {
                break;
            }
            cursor[pos] = 0;
        }
    }
}

/// Step 4: the `(platform, arch)` pair must be declared by the application.
fn app_declares(app: &AppManifest, a: &Assignment) -> bool {
    match (a.level(well_known::PLATFORM), a.level(well_known::ARCH)) {
        (Some(platform), Some(arch)) => app.has_target(platform, arch),
        // An axis set without platform/arch axes has nothing to intersect.
        _ => true,
    }
}

/// Step 5: application-derived networking and rootfs overrides.
fn app_overrides_allow(app: &AppManifest, a: &Assignment) -> bool {
    if let Some(networking) = a.level(well_known::NETWORKING) {
        if app.runtime.networking && networking == "none" {
            return false;
        }
        if !app.runtime.networking && networking != "none" {
            return false;
        }
    }

    if let Some(rootfs) = a.level(well_known::ROOTFS) {
        let wanted = app
            .rootfs_kind()
            .map_or("none", crate::app::RootfsKind::axis_level);
        if rootfs != wanted {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::axis::{Axis, AxisFamily};
    use crate::exclude::{compile_rules, RawRhs, RawRule};
    use crate::host::{CompilerTool, VmmTool};

    fn axis(name: &str, family: AxisFamily, levels: &[&str]) -> Axis {
        Axis {
            name: name.to_owned(),
            family,
            levels: levels.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    fn permissive_host() -> HostCapabilities {
        HostCapabilities {
            arch: "x86_64".to_owned(),
            vmms: vec![
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
                VmmTool {
                    platform: "xen".to_owned(),
                    arch: "x86_64".to_owned(),
                    path: PathBuf::from("/usr/sbin/xl"),
                },
            ],
            compilers: vec![CompilerTool {
                kind: "gcc".to_owned(),
                arch: "x86_64".to_owned(),
                path: PathBuf::from("/usr/bin/gcc"),
            }],
            kvm: true,
            xen: true,
            privileged: false,
        }
    }

    fn app_for(targets: &[(&str, &str)]) -> AppManifest {
        let yaml = format!(
            "name: t\ntargets: [{}]\n",
            targets
                .iter()
                .map(|(p, a)| format!("{p}/{a}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        serde_yaml::from_str(&yaml).expect("valid manifest")
    }

    fn rule(entries: &[(&str, &str)]) -> RawRule {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), RawRhs::One((*v).to_owned())))
            .collect()
    }

    #[test]
    fn expansion_order_is_lexicographic_in_declaration_order() {
        let axes = AxisSet::new(vec![
            axis("platform", AxisFamily::Build, &["qemu", "fc"]),
            axis("hypervisor", AxisFamily::Run, &["none", "kvm"]),
        ])
        .expect("valid axes");
        let all = expand(&axes);
        let pairs: Vec<(String, String)> = all
            .iter()
            .map(|a| {
                (
                    a.level("platform").expect("platform").to_owned(),
                    a.level("hypervisor").expect("hypervisor").to_owned(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("qemu".to_owned(), "none".to_owned()),
                ("qemu".to_owned(), "kvm".to_owned()),
                ("fc".to_owned(), "none".to_owned()),
                ("fc".to_owned(), "kvm".to_owned()),
            ],
            "first declared axis must vary slowest"
        );
    }

    // Exclusion cascade over platform × hypervisor: only four pairs survive.
    #[test]
    fn exclusion_cascade_leaves_expected_survivors() {
        let axes = AxisSet::new(vec![
            axis("platform", AxisFamily::Build, &["xen", "qemu", "fc"]),
            axis("hypervisor", AxisFamily::Run, &["none", "xen", "kvm"]),
        ])
        .expect("valid axes");
        let raw = vec![
            [
                ("platform".to_owned(), RawRhs::One("fc".to_owned())),
                ("hypervisor".to_owned(), RawRhs::One("not kvm".to_owned())),
            ]
            .into_iter()
            .collect(),
            [
                ("platform".to_owned(), RawRhs::One("xen".to_owned())),
                ("hypervisor".to_owned(), RawRhs::One("not xen".to_owned())),
            ]
            .into_iter()
            .collect(),
            rule(&[("platform", "qemu"), ("hypervisor", "xen")]),
        ];
        let rules = compile_rules(&raw, &axes).expect("rules compile");
        let app = app_for(&[]);
        // No platform/arch axes to intersect against targets; use a host
        // that cannot veto anything either.
        let host = HostCapabilities {
            arch: "x86_64".to_owned(),
            vmms: Vec::new(),
            compilers: Vec::new(),
            kvm: true,
            xen: true,
            privileged: false,
        };

        let cases = generate_cases(&axes, &rules, &host, &app).expect("generates");
        let survivors: Vec<(String, String)> = cases
            .iter()
            .map(|c| {
                (
                    c.assignment.level("platform").expect("platform").to_owned(),
                    c.assignment
                        .level("hypervisor")
                        .expect("hypervisor")
                        .to_owned(),
                )
            })
            .collect();
        assert_eq!(
            survivors,
            vec![
                ("xen".to_owned(), "xen".to_owned()),
                ("qemu".to_owned(), "none".to_owned()),
                ("qemu".to_owned(), "kvm".to_owned()),
                ("fc".to_owned(), "kvm".to_owned()),
            ]
        );
    }

    // Host arch arm64 and no x86_64 cross toolchain: only arm64 survives.
    #[test]
    fn architecture_gate_drops_foreign_targets() {
        let axes = AxisSet::new(vec![
            axis("arch", AxisFamily::Build, &["x86_64", "arm64"]),
            axis("platform", AxisFamily::Build, &["qemu"]),
        ])
        .expect("valid axes");
        let host = HostCapabilities {
            arch: "arm64".to_owned(),
            vmms: Vec::new(),
            compilers: vec![CompilerTool {
                kind: "gcc".to_owned(),
                arch: "arm64".to_owned(),
                path: PathBuf::from("/usr/bin/gcc"),
            }],
            kvm: false,
            xen: false,
            privileged: false,
        };
        let app = app_for(&[("qemu", "x86_64"), ("qemu", "arm64")]);

        let cases = generate_cases(&axes, &[], &host, &app).expect("generates");
        assert_eq!(cases.len(), 1);
        assert!(cases
            .iter()
            .all(|c| c.assignment.level("arch") == Some("arm64")));
    }

    // A rule listing only `bootloader: uefi` drops every uefi assignment.
    #[test]
    fn lone_atom_drops_level_unconditionally() {
        let axes = AxisSet::new(vec![
            axis("platform", AxisFamily::Build, &["qemu", "fc"]),
            axis("bootloader", AxisFamily::Build, &["bios", "uefi"]),
        ])
        .expect("valid axes");
        let rules =
            compile_rules(&[rule(&[("bootloader", "uefi")])], &axes).expect("rules compile");
        let host = HostCapabilities {
            arch: "x86_64".to_owned(),
            vmms: Vec::new(),
            compilers: Vec::new(),
            kvm: false,
            xen: false,
            privileged: false,
        };
        let cases = generate_cases(&axes, &rules, &host, &app_for(&[])).expect("generates");
        assert_eq!(cases.len(), 2);
        assert!(
            cases
                .iter()
                .all(|c| c.assignment.level("bootloader") == Some("bios")),
            "every uefi assignment must be gone regardless of other axes"
        );
    }

    #[test]
    fn indices_are_dense_and_one_based() {
        let axes = AxisSet::new(vec![
            axis("arch", AxisFamily::Build, &["x86_64"]),
            axis("platform", AxisFamily::Build, &["qemu", "fc", "xen"]),
            axis("hypervisor", AxisFamily::Run, &["none", "kvm"]),
        ])
        .expect("valid axes");
        let rules = compile_rules(
            &[rule(&[("platform", "fc"), ("hypervisor", "none")])],
            &axes,
        )
        .expect("rules compile");
        let app = app_for(&[("qemu", "x86_64"), ("fc", "x86_64"), ("xen", "x86_64")]);
        let cases =
            generate_cases(&axes, &rules, &permissive_host(), &app).expect("generates");
        assert!(!cases.is_empty());
        for (i, case) in cases.iter().enumerate() {
            assert_eq!(case.index, i + 1, "indices must be dense and 1-based");
        }
        // Pairwise distinct assignments.
        for a in &cases {
            for b in &cases {
                if a.index != b.index {
                    assert_ne!(a.assignment, b.assignment);
                }
            }
        }
    }

    #[test]
    fn networking_override_prunes_both_directions() {
        let axes = AxisSet::new(vec![
            axis("arch", AxisFamily::Build, &["x86_64"]),
            axis("platform", AxisFamily::Build, &["qemu"]),
            axis("networking", AxisFamily::Run, &["none", "nat", "bridge"]),
        ])
        .expect("valid axes");
        let host = permissive_host();

        let mut app = app_for(&[("qemu", "x86_64")]);
        app.runtime.networking = true;
        let cases = generate_cases(&axes, &[], &host, &app).expect("generates");
        assert!(
            cases
                .iter()
                .all(|c| c.assignment.level("networking") != Some("none")),
            "a networked app never runs without networking"
        );

        app.runtime.networking = false;
        let cases = generate_cases(&axes, &[], &host, &app).expect("generates");
        assert!(
            cases
                .iter()
                .all(|c| c.assignment.level("networking") == Some("none")),
            "a non-networked app only runs without networking"
        );
    }

    #[test]
    fn rules_removing_everything_yield_empty_list_not_error() {
        let axes = AxisSet::new(vec![axis("platform", AxisFamily::Build, &["qemu"])])
            .expect("valid axes");
        let rules = compile_rules(&[rule(&[("platform", "qemu")])], &axes).expect("compiles");
        let cases = generate_cases(&axes, &rules, &permissive_host(), &app_for(&[]))
            .expect("still Ok");
        assert!(cases.is_empty());
    }

    proptest::proptest! {
        // The engine must agree with brute-force filtering of the product.
        #[test]
        fn proptest_engine_matches_brute_force(
            plat_levels in proptest::sample::subsequence(
                vec!["qemu", "fc", "xen"], 1..=3),
            hyp_levels in proptest::sample::subsequence(
                vec!["none", "kvm", "xen"], 1..=3),
            drop_plat in proptest::sample::select(vec!["qemu", "fc", "xen"]),
        ) {
            let axes = AxisSet::new(vec![
                axis("platform", AxisFamily::Build, &plat_levels),
                axis("hypervisor", AxisFamily::Run, &hyp_levels),
            ]).expect("valid axes");
            let raw: Vec<RawRule> = if plat_levels.contains(&drop_plat) {
                vec![rule(&[("platform", drop_plat)])]
            } else {
                Vec::new()
            };
            let rules = compile_rules(&raw, &axes).expect("rules compile");
            let host = HostCapabilities {
                arch: "x86_64".to_owned(),
                vmms: Vec::new(),
                compilers: Vec::new(),
                kvm: true,
                xen: true,
                privileged: false,
            };
            let app = app_for(&[]);

            let engine = generate_cases(&axes, &rules, &host, &app).expect("generates");
            let brute: Vec<Assignment> = expand(&axes)
                .into_iter()
                .filter(|a| !rules.iter().any(|r| r.matches(a)))
                .collect();
            proptest::prop_assert_eq!(engine.len(), brute.len());
        }
    }
}
