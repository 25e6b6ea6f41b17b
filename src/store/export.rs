//! Point-cloud export. Files are written next to their destination and renamed into
//! place so a reader never sees a half-written cloud.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec3;

static EXPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);
const STAGING_PREFIX: &str = ".meshprobe.partial.";

/// Writes one `x y z` line per point.
pub fn write_point_cloud(path: &Path, points: &[Vec3]) -> io::Result<usize> {
    let mut text = String::with_capacity(points.len() * 32);
    for point in points {
        text.push_str(&format!("{} {} {}\n", point.x, point.y, point.z));
    }
    replace_file(path, text.as_bytes())?;
    Ok(points.len())
}

pub fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("`{}` names no file", path.display()),
            ));
        }
    };
    fs::create_dir_all(&directory)?;

    let staging = staging_path(&directory, path)?;
    let outcome = write_staged(&staging, bytes).and_then(|()| {
        fs::rename(&staging, path)?;
        sync_directory(&directory)
    });
    if outcome.is_err() {
        let _ = fs::remove_file(&staging);
    }
    outcome
}

fn write_staged(staging: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(staging)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_directory(directory: &Path) -> io::Result<()> {
    File::open(directory)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_directory: &Path) -> io::Result<()> {
    Ok(())
}

fn staging_path(directory: &Path, target: &Path) -> io::Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|value| value.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "export target needs a UTF-8 file name"))?;
    let sequence = EXPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Ok(directory.join(format!(
        "{STAGING_PREFIX}{name}.{}.{sequence}",
        std::process::id()
    )))
}
