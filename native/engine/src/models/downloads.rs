use serde::Serialize;

/// A downloaded release in the local downloads directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadEntry {
    pub path: String,
    pub name: String,
    pub timestamp: u64,
    pub total_size: u64,
    pub package_name: Option<String>,
    pub version_code: Option<u64>,
}
