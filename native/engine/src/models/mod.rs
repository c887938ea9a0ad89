mod apk_info;
mod backup;
mod cloud_app;
pub mod device;
mod downloader_config;
mod downloads;
pub mod log;
mod settings;
mod task;

pub use apk_info::{ApkInfo, get_apk_info};
pub use backup::*;
pub use cloud_app::CatalogApp;
pub use device::{
    ConnectionType, ControllerHand, ControllerInfo, ControllerStatus, DeviceConnection,
    DeviceState, InstalledPackage,
};
pub use downloader_config::*;
pub use downloads::DownloadEntry;
pub use settings::{DownloadCleanupPolicy, Settings};
pub use task::*;
