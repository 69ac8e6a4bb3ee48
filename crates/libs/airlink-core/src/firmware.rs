//! Firmware image and configuration file sources.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use log::debug;

use crate::error::WlanError;
use crate::subsystem::FirmwareImage;
use crate::sync::lock;

/// Receives the outcome of [`FirmwareSource::fetch_nowait`]; `None` when the
/// image could not be obtained.
pub type FirmwareCallback = Box<dyn FnOnce(Option<FirmwareImage>) + Send + 'static>;

/// Where firmware images, calibration data and init configs come from.
pub trait FirmwareSource: Send + Sync + 'static {
    /// Blocking fetch.
    fn fetch(&self, name: &str) -> Result<FirmwareImage, WlanError>;

    /// Callback-style fetch. The callback runs exactly once, on another
    /// thread, unless this returns an error.
    fn fetch_nowait(
        self: Arc<Self>,
        name: String,
        callback: FirmwareCallback,
    ) -> Result<(), WlanError> {
        let spawn_err = format!("spawn fetch for {name}");
        thread::Builder::new()
            .name("fw-fetch".to_string())
            .spawn(move || {
                let image = match self.fetch(&name) {
                    Ok(image) => Some(image),
                    Err(err) => {
                        debug!("firmware: fetch {name} failed: {err}");
                        None
                    }
                };
                callback(image);
            })
            .map(|_| ())
            .map_err(|err| WlanError::firmware(format!("{spawn_err}: {err}")))
    }
}

/// Serves files below a root directory. Names are relative paths such as
/// `mrvl/sd8787_uapsta.bin`.
#[derive(Debug, Clone)]
pub struct DirFirmwareSource {
    root: PathBuf,
}

impl DirFirmwareSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, WlanError> {
        let relative = Path::new(name);
        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if name.is_empty() || !confined {
            return Err(WlanError::config(format!(
                "firmware name {name:?} escapes the firmware root"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl FirmwareSource for DirFirmwareSource {
    fn fetch(&self, name: &str) -> Result<FirmwareImage, WlanError> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(FirmwareImage::new(name, data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(WlanError::not_found(format!("firmware {}", path.display())))
            }
            Err(err) => Err(WlanError::firmware(format!("read {}: {err}", path.display()))),
        }
    }
}

/// In-memory named images.
#[derive(Debug, Default)]
pub struct MemoryFirmwareSource {
    images: Mutex<HashMap<String, Arc<[u8]>>>,
}

impl MemoryFirmwareSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) {
        lock(&self.images).insert(name.into(), data.into());
    }

    pub fn remove(&self, name: &str) {
        lock(&self.images).remove(name);
    }
}

impl FirmwareSource for MemoryFirmwareSource {
    fn fetch(&self, name: &str) -> Result<FirmwareImage, WlanError> {
        lock(&self.images)
            .get(name)
            .map(|data| FirmwareImage::new(name, Arc::clone(data)))
            .ok_or_else(|| WlanError::not_found(format!("firmware {name}")))
    }
}
