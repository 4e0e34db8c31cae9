//! Core domain model and shared helpers for the community health dashboard.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Accounts whose activity is excluded from contributor rankings.
pub const DEFAULT_BOT_ACCOUNTS: &[&str] = &[
    "dependabot[bot]",
    "pre-commit-ci[bot]",
    "napari-bot",
    "github-actions[bot]",
];

pub const DEFAULT_CORE_DEVS: &[&str] = &[
    "andy-sweet",
    "DragaDoncila",
    "GenevieveBuckley",
    "Czaki",
    "jni",
    "kevinyamauchi",
    "kne42",
    "kephale",
    "brisvag",
    "melissawm",
    "melonora",
    "psobolewskiPhD",
    "AhmetCanSolak",
    "alisterburt",
    "justinelarsen",
    "royerloic",
    "sofroniewn",
    "shanaxel42",
    "tlambert03",
    "potating-potato",
    "lucyleeow",
];

/// Title prefix used by pull requests opened by automation workflows.
pub const AUTOMATIC_PR_PREFIX: &str = "test: [Automatic]";

/// Login recorded for activity whose remote account was deleted.
pub const GHOST_USER: &str = "ghost";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid repository reference `{0}`, expected owner/name")]
    InvalidRepository(String),
    #[error("cannot parse distribution file name `{0}`")]
    InvalidFileName(String),
}

/// Repository identity on the code host: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let trimmed = input.trim();
        match trimmed.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(CoreError::InvalidRepository(input.to_string())),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Installer platform of a bundled release artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    Windows,
    #[serde(rename = "macOS")]
    MacOs,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Windows, Platform::Linux, Platform::MacOs];

    /// Maps an asset file name to its platform; unknown extensions yield `None`.
    pub fn from_artifact_name(name: &str) -> Option<Self> {
        if name.ends_with(".sh") {
            Some(Self::Linux)
        } else if name.ends_with(".exe") {
            Some(Self::Windows)
        } else if name.ends_with(".pkg") {
            Some(Self::MacOs)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "Linux",
            Self::Windows => "Windows",
            Self::MacOs => "macOS",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_bot<S: AsRef<str>>(login: &str, bots: &[S]) -> bool {
    bots.iter().any(|b| b.as_ref() == login)
}

pub fn is_automatic_pr_title(title: &str) -> bool {
    title.starts_with(AUTOMATIC_PR_PREFIX)
}

/// Lower-cases a package name and collapses runs of `-`, `_` and `.` into a single `-`.
pub fn normalized_package_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.extend(ch.to_lowercase());
            in_separator = false;
        }
    }
    out
}

/// Project information recovered from a distribution file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionFile {
    pub name: String,
    pub version: String,
    pub wheel: bool,
}

/// Parses names such as `napari-0.5.4.tar.gz` or `napari-0.5.4-py3-none-any.whl`.
pub fn parse_distribution_file_name(file_name: &str) -> Result<DistributionFile, CoreError> {
    let (stem, wheel) = if let Some(stem) = file_name.strip_suffix(".whl") {
        (stem, true)
    } else if let Some(stem) = [".tar.gz", ".tar.bz2", ".tar.xz"]
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
    {
        (stem, false)
    } else {
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphabetic()) => {
                (stem, false)
            }
            _ => (file_name, false),
        }
    };

    let mut parts = stem.splitn(3, '-');
    match (parts.next(), parts.next()) {
        (Some(name), Some(version)) if !name.is_empty() && !version.is_empty() => {
            Ok(DistributionFile {
                name: name.to_string(),
                version: version.to_string(),
                wheel,
            })
        }
        _ => Err(CoreError::InvalidFileName(file_name.to_string())),
    }
}

/// Heuristic CI detection based on the kernel release string. Only catches part of
/// Linux cloud images.
pub fn is_ci_install(system_release: &str) -> bool {
    ["azure", "amzn", "aws", "gcp", "cloud-amd64"]
        .iter()
        .any(|marker| system_release.contains(marker))
}

/// Decimal human-readable byte size (`1.2 GB`).
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];
    if bytes == 1 {
        return "1 Byte".to_string();
    }
    if bytes < 1000 {
        return format!("{bytes} Bytes");
    }
    let mut value = bytes as f64 / 1000.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

/// One package download event loaded from the analytical warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PypiDownload {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub country_code: Option<String>,
    pub project: String,
    pub version: String,
    pub python_version: Option<String>,
    pub system_name: String,
    pub system_release: String,
    pub distro_name: String,
    pub distro_version: String,
    pub wheel: bool,
    pub ci_install: bool,
}

/// Per-day category breakdowns published by the package statistics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadCategory {
    PythonMinor,
    System,
}

impl DownloadCategory {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::PythonMinor => "python_minor",
            Self::System => "system",
        }
    }
}

pub const KNOWN_OPERATING_SYSTEMS: &[&str] = &["darwin", "linux", "windows", "other", "null"];

pub fn known_python_versions() -> Vec<String> {
    (6..19)
        .map(|minor| format!("3.{minor}"))
        .chain(std::iter::once("null".to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_parses_owner_and_name() {
        let repo: RepoRef = "napari/docs".parse().unwrap();
        assert_eq!(repo, RepoRef::new("napari", "docs"));
        assert_eq!(repo.to_string(), "napari/docs");
        assert!(RepoRef::parse("napari").is_err());
        assert!(RepoRef::parse("a/b/c").is_err());
        assert!(RepoRef::parse("/docs").is_err());
    }

    #[test]
    fn artifact_extensions_map_to_platforms() {
        assert_eq!(
            Platform::from_artifact_name("napari-0.5.0-Linux-x86_64.sh"),
            Some(Platform::Linux)
        );
        assert_eq!(
            Platform::from_artifact_name("napari-0.5.0-Windows-x86_64.exe"),
            Some(Platform::Windows)
        );
        assert_eq!(
            Platform::from_artifact_name("napari-0.5.0-macOS-arm64.pkg"),
            Some(Platform::MacOs)
        );
        assert_eq!(Platform::from_artifact_name("napari-0.5.0.zip"), None);
        assert_eq!(Platform::MacOs.as_str(), "macOS");
    }

    #[test]
    fn package_names_are_normalized() {
        assert_eq!(normalized_package_name("Napari_Plugin.Manager"), "napari-plugin-manager");
        assert_eq!(normalized_package_name("foo__-bar"), "foo-bar");
        assert_eq!(normalized_package_name("npe2"), "npe2");
    }

    #[test]
    fn distribution_file_names_are_split() {
        assert_eq!(
            parse_distribution_file_name("napari-0.5.4.tar.gz").unwrap(),
            DistributionFile {
                name: "napari".into(),
                version: "0.5.4".into(),
                wheel: false
            }
        );
        assert_eq!(
            parse_distribution_file_name("napari-0.5.4-py3-none-any.whl").unwrap(),
            DistributionFile {
                name: "napari".into(),
                version: "0.5.4".into(),
                wheel: true
            }
        );
        assert_eq!(
            parse_distribution_file_name("napari-0.4.19rc1.zip").unwrap().version,
            "0.4.19rc1"
        );
        assert!(parse_distribution_file_name("napari.whl").is_err());
    }

    #[test]
    fn ci_releases_are_detected() {
        assert!(is_ci_install("5.15.0-1064-azure"));
        assert!(is_ci_install("6.1.0-18-cloud-amd64"));
        assert!(is_ci_install("4.14.336-257.562.amzn2.x86_64"));
        assert!(!is_ci_install("6.8.0-45-generic"));
        assert!(!is_ci_install(""));
    }

    #[test]
    fn byte_sizes_are_humanized() {
        assert_eq!(human_bytes(0), "0 Bytes");
        assert_eq!(human_bytes(999), "999 Bytes");
        assert_eq!(human_bytes(1500), "1.5 kB");
        assert_eq!(human_bytes(950 * 1000u64.pow(3)), "950.0 GB");
        assert_eq!(human_bytes(1000u64.pow(4)), "1.0 TB");
    }

    #[test]
    fn bots_and_automatic_titles() {
        assert!(is_bot("dependabot[bot]", DEFAULT_BOT_ACCOUNTS));
        assert!(!is_bot("jni", DEFAULT_BOT_ACCOUNTS));
        assert!(is_automatic_pr_title("test: [Automatic] Constraints upgrades"));
        assert_eq!(known_python_versions().len(), 14);
    }
}
