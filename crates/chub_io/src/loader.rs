use anyhow::{Context, Result, ensure};
use chub_core::platform::{FirmwareError, FirmwareSource};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Reads a whole image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    ensure!(!buffer.is_empty(), "image {} is empty", path.display());
    Ok(buffer)
}

/// Bootloader and firmware images read from disk on every request, so a
/// reset with reload always picks up the current files.
pub struct FileFirmware {
    bootloader: PathBuf,
    os: PathBuf,
}

impl FileFirmware {
    pub fn new(bootloader: impl Into<PathBuf>, os: impl Into<PathBuf>) -> Self {
        Self {
            bootloader: bootloader.into(),
            os: os.into(),
        }
    }

    fn load(&self, image: &'static str, path: &Path) -> Result<Vec<u8>, FirmwareError> {
        log::info!("loading {} image from {}", image, path.display());
        load_image(path).map_err(|err| FirmwareError::Io {
            image,
            reason: format!("{err:#}"),
        })
    }
}

impl FirmwareSource for FileFirmware {
    fn bootloader(&self) -> Result<Vec<u8>, FirmwareError> {
        self.load("bootloader", &self.bootloader)
    }

    fn os_image(&self) -> Result<Vec<u8>, FirmwareError> {
        self.load("os", &self.os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("chub_io_{}_{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn loads_both_images() {
        let bl = temp_file("bl.bin", b"bootloader");
        let os = temp_file("os.bin", b"firmware");
        let source = FileFirmware::new(&bl, &os);
        assert_eq!(source.bootloader().unwrap(), b"bootloader");
        assert_eq!(source.os_image().unwrap(), b"firmware");
        std::fs::remove_file(bl).unwrap();
        std::fs::remove_file(os).unwrap();
    }

    #[test]
    fn missing_file_names_the_image() {
        let source = FileFirmware::new("/nonexistent/bl.bin", "/nonexistent/os.bin");
        match source.os_image() {
            Err(FirmwareError::Io { image, reason }) => {
                assert_eq!(image, "os");
                assert!(reason.contains("Failed to open image"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_image_is_rejected() {
        let path = temp_file("empty.bin", b"");
        assert!(load_image(&path).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
