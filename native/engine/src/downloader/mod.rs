//! Remote catalog access through rclone: configuration, catalog refresh and transfers.

mod access;
mod catalog;
mod config;
mod metadata;
pub(crate) mod rclone;

pub use access::test_access;
pub use catalog::{CatalogSnapshot, CatalogSync, is_valid_release_name, parse_catalog};
pub use config::CONFIG_FILE;
pub use metadata::{
    DownloadInfo, has_download_metadata, read_download_metadata, write_download_metadata,
};
pub use rclone::{RcloneStorage, RcloneTransferStats};
