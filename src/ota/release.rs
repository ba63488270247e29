// Update discovery formats: the hosted manifest and the release API response,
// plus version ordering and release asset selection.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Deserialize;

use super::OtaError;
use crate::version::Board;

const BOARD_MATCH_PRIORITY: u32 = 200;
const GENERIC_NAME_PRIORITY: u32 = 50;

/// `major.minor.patch`, parsed leniently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionTriple(pub u32, pub u32, pub u32);

impl VersionTriple {
    /// Reads up to three dot-separated integers. Parsing stops at the first
    /// component without leading digits; that and every later component is 0.
    /// Trailing text after a component's digits ("3-beta") is ignored.
    pub fn parse(version: &str) -> Self {
        let mut parts = [0u32; 3];
        for (slot, component) in parts.iter_mut().zip(version.trim().split('.')) {
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            match digits.parse::<u32>() {
                Ok(value) => *slot = value,
                Err(_) => break,
            }
        }
        VersionTriple(parts[0], parts[1], parts[2])
    }
}

/// True when `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    VersionTriple::parse(a).cmp(&VersionTriple::parse(b))
}

/// Release tags are `v1.2.3`; the version is the tag without the prefix.
pub fn extract_version(tag: &str) -> &str {
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetRef {
    #[serde(default)]
    pub url: String,
}

/// `{"version", "build_id"?, "build_date"?, "firmware": {board: {url}}, ...}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub build_date: Option<String>,
    #[serde(default)]
    pub firmware: BTreeMap<String, AssetRef>,
    #[serde(default)]
    pub filesystem: BTreeMap<String, AssetRef>,
    #[serde(default)]
    pub bundle: BTreeMap<String, AssetRef>,
}

/// Where to fetch the images of one release for one board.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedRelease {
    pub version: String,
    pub firmware_url: String,
    pub filesystem_url: String,
    pub bundle_url: String,
}

impl Manifest {
    pub fn parse(body: &str) -> Result<Self, OtaError> {
        Ok(serde_json::from_str(body)?)
    }

    fn url_for(map: &BTreeMap<String, AssetRef>, board: Board) -> String {
        map.get(board.id()).map(|a| a.url.clone()).unwrap_or_default()
    }

    /// Pick this board's entries. A usable manifest names a version, a
    /// firmware image and either a filesystem image or a bundle.
    pub fn resolve(&self, board: Board) -> Result<ResolvedRelease, OtaError> {
        if self.version.is_empty() {
            return Err(OtaError::MissingField("version"));
        }
        let resolved = ResolvedRelease {
            version: self.version.clone(),
            firmware_url: Self::url_for(&self.firmware, board),
            filesystem_url: Self::url_for(&self.filesystem, board),
            bundle_url: Self::url_for(&self.bundle, board),
        };
        if resolved.firmware_url.is_empty() {
            return Err(OtaError::MissingField("firmware url"));
        }
        if resolved.filesystem_url.is_empty() && resolved.bundle_url.is_empty() {
            return Err(OtaError::MissingField("filesystem url"));
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    pub fn parse(body: &str) -> Result<Self, OtaError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn resolve(&self, board: Board) -> Result<ResolvedRelease, OtaError> {
        let version = extract_version(&self.tag_name);
        if version.is_empty() {
            return Err(OtaError::MissingField("tag_name"));
        }
        let assets = select_release_assets(&self.assets, board)?;
        Ok(ResolvedRelease {
            version: version.to_string(),
            firmware_url: assets.firmware_url,
            filesystem_url: assets.filesystem_url,
            bundle_url: String::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAssets {
    pub firmware_url: String,
    pub filesystem_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetRole {
    Firmware,
    Filesystem,
}

fn classify(name_lower: &str) -> Option<AssetRole> {
    if name_lower.contains("firmware") {
        Some(AssetRole::Firmware)
    } else if name_lower.contains("littlefs") || name_lower.contains("spiffs") {
        Some(AssetRole::Filesystem)
    } else {
        None
    }
}

fn priority(name_lower: &str, role: AssetRole, board: Board) -> u32 {
    let mut priority = 0;
    if board.matches_asset(name_lower) {
        priority = BOARD_MATCH_PRIORITY;
    }
    let generic = match role {
        AssetRole::Firmware => name_lower == "firmware.bin",
        AssetRole::Filesystem => name_lower == "littlefs.bin" || name_lower == "spiffs.bin",
    };
    if generic {
        priority = priority.max(GENERIC_NAME_PRIORITY);
    }
    priority
}

/// Choose the firmware and filesystem images for `board` from a release.
///
/// Only `.bin` assets count and bootstrap images are never picked. A name for
/// this board beats the generic `firmware.bin`/`littlefs.bin`; anything else
/// is not a candidate. The first asset wins a tie.
pub fn select_release_assets(assets: &[ReleaseAsset], board: Board) -> Result<SelectedAssets, OtaError> {
    let mut best_firmware: Option<(u32, &str)> = None;
    let mut best_filesystem: Option<(u32, &str)> = None;

    for asset in assets {
        let name = asset.name.to_lowercase();
        if !name.ends_with(".bin") || name.contains("bootstrap") {
            continue;
        }
        let Some(role) = classify(&name) else {
            continue;
        };
        let score = priority(&name, role, board);
        if score == 0 {
            continue;
        }
        let slot = match role {
            AssetRole::Firmware => &mut best_firmware,
            AssetRole::Filesystem => &mut best_filesystem,
        };
        if slot.map_or(true, |(best, _)| score > best) {
            *slot = Some((score, asset.browser_download_url.as_str()));
        }
    }

    let (_, firmware_url) = best_firmware.ok_or(OtaError::NoMatchingAsset("firmware"))?;
    let (_, filesystem_url) = best_filesystem.ok_or(OtaError::NoMatchingAsset("filesystem"))?;
    log::info!("Using firmware: {}", firmware_url);
    log::info!("Using filesystem: {}", filesystem_url);

    Ok(SelectedAssets {
        firmware_url: firmware_url.to_string(),
        filesystem_url: filesystem_url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://dl.example/{}", name),
        }
    }

    #[test]
    fn newer_versions() {
        assert!(is_newer("2.0.0", "1.9.0"));
        assert!(is_newer("1.10.0", "1.9.9"));
        assert!(is_newer("1.0.1", "1.0.0"));
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("1.9.0", "2.0.0"));
    }

    #[test]
    fn lenient_parsing() {
        assert_eq!(VersionTriple::parse("1.2"), VersionTriple(1, 2, 0));
        assert_eq!(VersionTriple::parse("1.2.3-beta"), VersionTriple(1, 2, 3));
        assert_eq!(VersionTriple::parse("garbage"), VersionTriple(0, 0, 0));
        assert_eq!(VersionTriple::parse("1.x.3"), VersionTriple(1, 0, 0));
        assert_eq!(VersionTriple::parse(""), VersionTriple(0, 0, 0));
    }

    #[test]
    fn tag_prefix_is_stripped() {
        assert_eq!(extract_version("v2.1.0"), "2.1.0");
        assert_eq!(extract_version("V2.1.0"), "2.1.0");
        assert_eq!(extract_version("2.1.0"), "2.1.0");
    }

    #[test]
    fn picks_board_assets_over_generic_and_bootstrap() {
        let assets = vec![
            asset("firmware.bin"),
            asset("bootstrap-esp32.bin"),
            asset("firmware-esp32s3.bin"),
            asset("firmware-esp32.bin"),
            asset("littlefs.bin"),
            asset("littlefs-esp32.bin"),
            asset("firmware-esp32.elf"),
        ];
        let selected = select_release_assets(&assets, Board::Esp32).unwrap();
        assert_eq!(selected.firmware_url, "https://dl.example/firmware-esp32.bin");
        assert_eq!(selected.filesystem_url, "https://dl.example/littlefs-esp32.bin");
    }

    #[test]
    fn generic_names_are_a_fallback() {
        let assets = vec![asset("Firmware.BIN"), asset("spiffs.bin")];
        let selected = select_release_assets(&assets, Board::Esp32S3).unwrap();
        assert_eq!(selected.firmware_url, "https://dl.example/Firmware.BIN");
        assert_eq!(selected.filesystem_url, "https://dl.example/spiffs.bin");
    }

    #[test]
    fn fails_without_board_asset() {
        let assets = vec![
            asset("firmware-esp32s3.bin"),
            asset("littlefs-esp32s3.bin"),
            asset("bootstrap-firmware-esp32.bin"),
        ];
        assert_eq!(
            select_release_assets(&assets, Board::Esp32),
            Err(OtaError::NoMatchingAsset("firmware"))
        );
    }

    #[test]
    fn manifest_resolves_board_entries() {
        let body = r#"{
            "version": "2.0.0",
            "build_id": "abc123",
            "firmware": {"esp32": {"url": "https://u/fw32.bin"}, "esp32s3": {"url": "https://u/fws3.bin"}},
            "filesystem": {"esp32": {"url": "https://u/fs32.bin"}}
        }"#;
        let manifest = Manifest::parse(body).unwrap();
        let resolved = manifest.resolve(Board::Esp32).unwrap();
        assert_eq!(resolved.firmware_url, "https://u/fw32.bin");
        assert_eq!(resolved.filesystem_url, "https://u/fs32.bin");
        assert!(resolved.bundle_url.is_empty());
        assert_eq!(manifest.build_id.as_deref(), Some("abc123"));
        // s3 has firmware but nothing to update the filesystem with
        assert!(manifest.resolve(Board::Esp32S3).is_err());
    }

    #[test]
    fn manifest_without_version_is_rejected() {
        let manifest = Manifest::parse(r#"{"firmware": {}}"#).unwrap();
        assert_eq!(manifest.resolve(Board::Esp32), Err(OtaError::MissingField("version")));
    }

    #[test]
    fn release_resolves_from_tag_and_assets() {
        let body = r#"{"tag_name": "v1.10.2", "assets": [
            {"name": "firmware-esp32.bin", "browser_download_url": "https://gh/fw.bin"},
            {"name": "littlefs-esp32.bin", "browser_download_url": "https://gh/fs.bin"}
        ]}"#;
        let resolved = Release::parse(body).unwrap().resolve(Board::Esp32).unwrap();
        assert_eq!(resolved.version, "1.10.2");
        assert_eq!(resolved.firmware_url, "https://gh/fw.bin");
    }

    proptest! {
        #[test]
        fn ordering_is_irreflexive(a in 0u32..50, b in 0u32..50, c in 0u32..50) {
            let v = format!("{}.{}.{}", a, b, c);
            prop_assert!(!is_newer(&v, &v));
        }

        #[test]
        fn ordering_is_asymmetric(
            a in (0u32..20, 0u32..20, 0u32..20),
            b in (0u32..20, 0u32..20, 0u32..20),
        ) {
            let va = format!("{}.{}.{}", a.0, a.1, a.2);
            let vb = format!("{}.{}.{}", b.0, b.1, b.2);
            prop_assert!(!(is_newer(&va, &vb) && is_newer(&vb, &va)));
            prop_assert_eq!(is_newer(&va, &vb), a > b);
        }
    }
}
