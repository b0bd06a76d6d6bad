//! FITS output for delivered frames.

use anyhow::{Context, Result};
use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::images::{ImageDescription, ImageType, WriteImage};
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Header cards written after the primary image, in order
pub type FitsHeader = Vec<(&'static str, String)>;

/// Write a frame as the primary HDU of a new FITS file, replacing any
/// existing file at `filepath`.
///
/// Pixels are stored as 32-bit integers so the full unsigned 16-bit range
/// survives without BZERO scaling.
pub fn save_fits(pixels: &Array2<u16>, header: &FitsHeader, filepath: &Path) -> Result<()> {
    let (height, width) = pixels.dim();
    let image_description = ImageDescription {
        data_type: ImageType::Long,
        dimensions: vec![width, height],
    };

    if let Some(parent) = filepath.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let mut fptr = FitsFile::create(filepath)
        .overwrite()
        .open()
        .map_err(|e| anyhow::anyhow!("Failed to create FITS file {}: {}", filepath.display(), e))?;

    let hdu = fptr
        .create_image("PRIMARY", &image_description)
        .map_err(|e| anyhow::anyhow!("Failed to create image HDU {}: {}", filepath.display(), e))?;

    let data: Vec<i32> = pixels.iter().map(|&v| v as i32).collect();
    i32::write_image(&mut fptr, &hdu, &data)?;

    for (key, value) in header {
        hdu.write_key(&mut fptr, key, value)
            .map_err(|e| anyhow::anyhow!("Failed to write {key} to {}: {}", filepath.display(), e))?;
    }

    Ok(())
}

/// Write a frame as a gzip-compressed FITS file at exactly `filepath`.
///
/// The FITS image is built in a scratch file beside the target and removed
/// afterwards.
pub fn save_fits_gz(pixels: &Array2<u16>, header: &FitsHeader, filepath: &Path) -> Result<()> {
    let scratch = scratch_path(filepath);
    save_fits(pixels, header, &scratch)?;
    let result = gzip_file(&scratch, filepath);
    if let Err(e) = fs::remove_file(&scratch) {
        tracing::warn!("Failed to remove {}: {e}", scratch.display());
    }
    result
}

/// Gzip when the path ends in `.gz`, plain FITS otherwise
pub fn save_fits_auto(pixels: &Array2<u16>, header: &FitsHeader, filepath: &Path) -> Result<()> {
    match filepath.extension() {
        Some(ext) if ext == "gz" => save_fits_gz(pixels, header, filepath),
        _ => save_fits(pixels, header, filepath),
    }
}

fn scratch_path(filepath: &Path) -> PathBuf {
    let mut name = filepath
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    filepath.with_file_name(name)
}

fn gzip_file(source: &Path, dest: &Path) -> Result<()> {
    let mut input =
        File::open(source).with_context(|| format!("Failed to read {}", source.display()))?;
    let output =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("Failed to compress into {}", dest.display()))?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .with_context(|| format!("Failed to finish {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_save_fits_file() {
        let temp_dir = TempDir::new().unwrap();
        let filepath = temp_dir.path().join("nested/run-0001.fits");
        let frame = Array2::from_shape_fn((8, 16), |(r, c)| (r * 16 + c) as u16);
        let header: FitsHeader = vec![
            ("OBJECT", "ec20058".to_string()),
            ("UTC-BEG", "2012-01-01 00:00:01".to_string()),
        ];

        save_fits(&frame, &header, &filepath).unwrap();
        assert!(filepath.exists());
        assert!(std::fs::metadata(&filepath).unwrap().len() > 0);
    }

    #[test]
    fn test_save_fits_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let filepath = temp_dir.path().join("preview.fits");
        let frame = Array2::<u16>::zeros((4, 4));

        save_fits(&frame, &Vec::new(), &filepath).unwrap();
        save_fits(&frame, &Vec::new(), &filepath).unwrap();
        assert!(filepath.exists());
    }

    #[test]
    fn test_save_fits_gz_writes_requested_path() {
        let temp_dir = TempDir::new().unwrap();
        let filepath = temp_dir.path().join("run-0007.fits.gz");
        let frame = Array2::from_shape_fn((8, 16), |(r, c)| (r * 16 + c) as u16);

        save_fits_gz(&frame, &vec![("OBJECT", "ec20058".to_string())], &filepath).unwrap();

        let bytes = std::fs::read(&filepath).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let mut fits = Vec::new();
        flate2::read::GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut fits)
            .unwrap();
        assert!(fits.starts_with(b"SIMPLE"));

        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("run-0007.fits.gz")]);
    }
}
