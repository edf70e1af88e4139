//! Device object identity

use std::path::Path;

use serde::Serialize;

use crate::config::DeviceSettings;
use crate::point::PointIdentifier;

pub const PROTOCOL_VERSION: u8 = 1;
pub const PROTOCOL_REVISION: u8 = 14;

/// Device-level metadata published once at startup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub object_identifier: PointIdentifier,
    pub object_name: String,
    pub vendor_name: String,
    pub vendor_identifier: u16,
    pub model_name: String,
    pub application_software_version: String,
    pub firmware_revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub system_status: String,
    pub max_apdu_length_accepted: u16,
    pub segmentation_supported: String,
    pub protocol_version: u8,
    pub protocol_revision: u8,
    pub database_revision: u32,
}

impl DeviceInfo {
    pub fn new(settings: &DeviceSettings, version: &str) -> Self {
        Self {
            object_identifier: PointIdentifier::device(settings.instance),
            object_name: settings.name.clone(),
            vendor_name: settings.vendor_name.clone(),
            vendor_identifier: settings.vendor_id,
            model_name: settings.model_name.clone(),
            application_software_version: version.to_string(),
            firmware_revision: version.to_string(),
            description: settings.description.clone(),
            location: settings.location.clone(),
            system_status: "operational".to_string(),
            max_apdu_length_accepted: settings.max_apdu,
            segmentation_supported: settings.segmentation.clone(),
            protocol_version: PROTOCOL_VERSION,
            protocol_revision: PROTOCOL_REVISION,
            database_revision: settings.database_revision,
        }
    }
}

/// Read the version string surfaced as software and firmware revision.
///
/// The first non-empty line is used.
pub async fn read_version(path: impl AsRef<Path>) -> std::io::Result<String> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is empty", path.as_ref().display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::ObjectType;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("VERSION");
        tokio::fs::write(&path, "\n  1.2.0 \nignored\n").await.unwrap();
        assert_eq!(read_version(&path).await.unwrap(), "1.2.0");
    }

    #[tokio::test]
    async fn test_read_version_failures() {
        let dir = TempDir::new().unwrap();
        assert!(read_version(dir.path().join("missing")).await.is_err());

        let empty = dir.path().join("EMPTY");
        tokio::fs::write(&empty, "  \n").await.unwrap();
        let err = read_version(&empty).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_device_info_from_settings() {
        let info = DeviceInfo::new(&DeviceSettings::default(), "1.0.0");
        assert_eq!(info.object_identifier.object_type, ObjectType::Device);
        assert_eq!(info.object_identifier.instance, 110);
        assert_eq!(info.object_name, "GardenPi");
        assert_eq!(info.firmware_revision, "1.0.0");
        assert_eq!(info.application_software_version, "1.0.0");
        assert_eq!(info.segmentation_supported, "segmentedBoth");
        assert_eq!(info.database_revision, 0);
    }
}
