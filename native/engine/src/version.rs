//! Version comparison and donation filtering over installed vs. catalog apps.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::models::{CatalogApp, InstalledPackage};

/// How the catalog version relates to the installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VersionComparison {
    Newer,
    Same,
    Older,
}

pub fn classify(installed_code: u64, catalog_code: u64) -> VersionComparison {
    use std::cmp::Ordering;
    match catalog_code.cmp(&installed_code) {
        Ordering::Greater => VersionComparison::Newer,
        Ordering::Equal => VersionComparison::Same,
        Ordering::Less => VersionComparison::Older,
    }
}

/// What installing a catalog release would do to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UpdateAction {
    Install,
    Update,
    /// Same version again. Only on explicit request.
    Reinstall,
    /// Older version over a newer one. Needs confirmation and may corrupt app state.
    Downgrade,
}

impl UpdateAction {
    pub fn for_versions(installed_code: Option<u64>, catalog_code: u64) -> Self {
        match installed_code.map(|installed| classify(installed, catalog_code)) {
            None => Self::Install,
            Some(VersionComparison::Newer) => Self::Update,
            Some(VersionComparison::Same) => Self::Reinstall,
            Some(VersionComparison::Older) => Self::Downgrade,
        }
    }

    pub fn requires_override(&self) -> bool {
        matches!(self, Self::Reinstall | Self::Downgrade)
    }

    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Self::Downgrade)
    }

    pub fn is_risky(&self) -> bool {
        matches!(self, Self::Downgrade)
    }
}

const RENAME_PREFIX: &str = "mr.";
const RENAME_SUFFIXES: [&str; 3] = [".mrf", ".rookie", ".vrp"];

/// Strips rename markers so a renamed package can be matched with its catalog entry.
///
/// `mr.com.example.game.mrf` becomes `com.example.game`.
pub fn normalize_package_name(name: &str) -> String {
    let mut name = name.trim();
    while let Some(rest) = name.strip_prefix(RENAME_PREFIX) {
        name = rest;
    }
    loop {
        let Some(rest) = RENAME_SUFFIXES.iter().find_map(|suffix| name.strip_suffix(suffix))
        else {
            break;
        };
        name = rest;
    }
    name.to_string()
}

/// Reserved namespaces of the platform and its system apps.
const RESERVED_PREFIXES: [&str; 8] = [
    "android",
    "com.android.",
    "com.oculus.",
    "com.meta.",
    "com.facebook.",
    "com.qualcomm.",
    "oculus.",
    "horizonos.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DonationStatus {
    NewApp,
    NewerVersionThanCatalog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Disqualifier {
    Blacklisted,
    RenamedPackage,
    SystemOrUnwanted,
    /// The catalog already has the same or a newer version.
    AlreadyExists,
}

/// Decides whether an installed app is worth donating.
pub fn donation_eligibility(
    installed: &InstalledPackage,
    catalog_index: &HashMap<String, CatalogApp>,
    blacklist: &HashSet<String>,
) -> Result<DonationStatus, Vec<Disqualifier>> {
    let name = installed.package_name.as_str();
    let normalized = normalize_package_name(name);
    let mut reasons = Vec::new();

    if blacklist.contains(name) || blacklist.contains(&normalized) {
        reasons.push(Disqualifier::Blacklisted);
    }
    if normalized != name {
        reasons.push(Disqualifier::RenamedPackage);
    }
    if installed.system || RESERVED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        reasons.push(Disqualifier::SystemOrUnwanted);
    }

    let in_catalog = catalog_index.get(name).or_else(|| catalog_index.get(&normalized));
    if let Some(app) = in_catalog
        && classify(installed.version_code, app.version_code) != VersionComparison::Older
    {
        reasons.push(Disqualifier::AlreadyExists);
    }

    if !reasons.is_empty() {
        return Err(reasons);
    }
    Ok(match in_catalog {
        Some(_) => DonationStatus::NewerVersionThanCatalog,
        None => DonationStatus::NewApp,
    })
}

/// Newest release per package. Ties keep the first listed release.
pub fn newest_per_package(apps: &[CatalogApp]) -> HashMap<String, CatalogApp> {
    let mut index: HashMap<String, CatalogApp> = HashMap::new();
    for app in apps {
        match index.get(&app.package_name) {
            Some(existing) if existing.version_code >= app.version_code => {}
            _ => {
                index.insert(app.package_name.clone(), app.clone());
            }
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(package: &str, version_code: u64, full_name: &str) -> CatalogApp {
        CatalogApp {
            app_name: "Game".into(),
            full_name: full_name.into(),
            package_name: package.into(),
            version_code,
            last_updated: "2024-01-01 00:00 UTC".into(),
            size_bytes: 0,
        }
    }

    fn installed(package: &str, version_code: u64) -> InstalledPackage {
        InstalledPackage { package_name: package.into(), version_code, system: false }
    }

    #[test]
    fn classify_compares_codes() {
        assert_eq!(classify(100, 150), VersionComparison::Newer);
        assert_eq!(classify(100, 100), VersionComparison::Same);
        assert_eq!(classify(100, 90), VersionComparison::Older);
    }

    #[test]
    fn update_actions() {
        assert_eq!(UpdateAction::for_versions(None, 5), UpdateAction::Install);
        assert_eq!(UpdateAction::for_versions(Some(4), 5), UpdateAction::Update);
        let reinstall = UpdateAction::for_versions(Some(5), 5);
        assert!(reinstall.requires_override() && !reinstall.requires_confirmation());
        let downgrade = UpdateAction::for_versions(Some(6), 5);
        assert!(downgrade.requires_confirmation() && downgrade.is_risky());
        assert!(!UpdateAction::Update.requires_override());
    }

    #[test]
    fn rename_markers_are_stripped() {
        assert_eq!(normalize_package_name("mr.com.example.game"), "com.example.game");
        assert_eq!(normalize_package_name("com.example.game.rookie"), "com.example.game");
        assert_eq!(normalize_package_name("mr.com.example.game.mrf"), "com.example.game");
        assert_eq!(normalize_package_name("com.example.vrpgame"), "com.example.vrpgame");
    }

    #[test]
    fn donation_filters() {
        let index = newest_per_package(&[
            app("com.example.old", 10, "Old v10"),
            app("com.example.same", 3, "Same v3"),
        ]);
        let blacklist = HashSet::from(["com.example.banned".to_string()]);

        assert_eq!(
            donation_eligibility(&installed("com.example.new", 1), &index, &blacklist),
            Ok(DonationStatus::NewApp)
        );
        assert_eq!(
            donation_eligibility(&installed("com.example.old", 11), &index, &blacklist),
            Ok(DonationStatus::NewerVersionThanCatalog)
        );
        assert_eq!(
            donation_eligibility(&installed("com.example.same", 3), &index, &blacklist),
            Err(vec![Disqualifier::AlreadyExists])
        );
        assert_eq!(
            donation_eligibility(&installed("com.example.banned", 1), &index, &blacklist),
            Err(vec![Disqualifier::Blacklisted])
        );
        assert_eq!(
            donation_eligibility(&installed("mr.com.example.old", 5), &index, &blacklist),
            Err(vec![Disqualifier::RenamedPackage, Disqualifier::AlreadyExists])
        );
        let mut system = installed("com.oculus.vrshell", 1);
        assert_eq!(
            donation_eligibility(&system, &index, &blacklist),
            Err(vec![Disqualifier::SystemOrUnwanted])
        );
        system.package_name = "com.vendor.launcher".into();
        system.system = true;
        assert!(donation_eligibility(&system, &index, &blacklist).is_err());
    }

    #[test]
    fn newest_release_wins() {
        let index = newest_per_package(&[
            app("com.example.game", 5, "Game v5"),
            app("com.example.game", 7, "Game v7"),
            app("com.example.game", 7, "Game v7 (alt)"),
            app("com.example.other", 1, "Other v1"),
        ]);
        assert_eq!(index.len(), 2);
        assert_eq!(index["com.example.game"].full_name, "Game v7");
    }
}
