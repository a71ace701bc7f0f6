//! First-frame snapshots of each arrival.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::{Frame, JPEG_QUALITY};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotSettings {
    /// Write the first frame of every Absent -> Present transition.
    pub first_frame_write: bool,
    pub path: PathBuf,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            first_frame_write: false,
            path: PathBuf::from("motion_frames"),
        }
    }
}

impl SnapshotSettings {
    pub fn validate(&self) -> Result<()> {
        if self.first_frame_write && self.path.as_os_str().is_empty() {
            return Err(anyhow!("snapshots.path must be set when first_frame_write is on"));
        }
        Ok(())
    }
}

/// Writes timestamped JPEGs into a directory.
#[derive(Clone, Debug)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Encode and write `frame` now.
    pub fn write(&self, frame: &Frame) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create snapshot dir {}", self.dir.display()))?;
        let millis = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let path = self.dir.join(format!("first_frame_{}.jpg", millis));
        let jpeg = frame.encode_jpeg(JPEG_QUALITY)?;
        std::fs::write(&path, jpeg)
            .with_context(|| format!("write snapshot {}", path.display()))?;
        Ok(path)
    }

    /// Write on a background thread; the outcome is only logged.
    pub fn write_detached(&self, frame: Frame) {
        let writer = self.clone();
        let spawned = std::thread::Builder::new()
            .name("snapshot".to_string())
            .spawn(move || match writer.write(&frame) {
                Ok(path) => log::info!("first frame written to {}", path.display()),
                Err(err) => log::warn!("first frame write failed: {:#}", err),
            });
        if let Err(err) = spawned {
            log::warn!("could not start snapshot writer: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_jpeg_into_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("frames/room"));
        let path = writer.write(&Frame::filled(32, 24, [10, 200, 30], 1)).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("first_frame_") && name.ends_with(".jpg"));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn unwritable_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let writer = SnapshotWriter::new(blocker.join("sub"));
        assert!(writer.write(&Frame::filled(4, 4, [0, 0, 0], 1)).is_err());
    }

    #[test]
    fn enabled_without_path_is_invalid() {
        let settings = SnapshotSettings {
            first_frame_write: true,
            path: PathBuf::new(),
        };
        assert!(settings.validate().is_err());
        assert!(SnapshotSettings::default().validate().is_ok());
    }
}
