//! Thin wrapper around the external `qemu-img` tool.
//!
//! The daemon never interprets image formats itself; inspection and
//! conversion tasks shell out to `qemu-img` and pass its JSON output
//! through.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

/// Errors from running `qemu-img`.
#[derive(Debug, Error)]
pub enum QemuImgError {
    /// Failed to spawn or talk to the process.
    #[error("failed to run qemu-img: {0}")]
    Io(#[from] std::io::Error),

    /// The tool exited with a failure status.
    #[error("qemu-img failed: {0}")]
    Failed(String),

    /// `compare` found differing contents.
    #[error("images differ: {0}")]
    ContentMismatch(String),

    /// `info --output json` produced something unparsable.
    #[error("bad qemu-img json output: {0}")]
    BadOutput(#[from] serde_json::Error),
}

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, QemuImgError>;

/// Creates an image of `size` bytes in the given format.
pub fn create(path: &Path, format: &str, size: Option<u64>, backing: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["create", "-f", format]);
    if let Some(backing) = backing {
        cmd.args(["-b", backing]);
    }
    cmd.arg(path);
    if let Some(size) = size {
        cmd.arg(size.to_string());
    }
    run(cmd)
}

/// Converts `src` to `dst`, rewriting between formats.
pub fn convert(src: &Path, dst: &Path, src_format: &str, dst_format: &str) -> Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["convert", "-f", src_format, "-O", dst_format]);
    cmd.arg(src).arg(dst);
    run(cmd)
}

/// Returns `qemu-img info` output as parsed JSON.
pub fn info(path: &Path) -> Result<serde_json::Value> {
    let output = Command::new("qemu-img")
        .args(["info", "--output", "json"])
        .arg(path)
        .output()?;
    if !output.status.success() {
        return Err(QemuImgError::Failed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Compares two images, failing with [`QemuImgError::ContentMismatch`] when
/// their contents differ.
pub fn compare(a: &Path, b: &Path) -> Result<()> {
    let output = Command::new("qemu-img")
        .arg("compare")
        .arg(a)
        .arg(b)
        .output()?;
    match output.status.code() {
        Some(0) => Ok(()),
        Some(1) => Err(QemuImgError::ContentMismatch(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        )),
        _ => Err(QemuImgError::Failed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )),
    }
}

fn run(mut cmd: Command) -> Result<()> {
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(QemuImgError::Failed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{compare, create, info};
    use std::process::Command;

    fn qemu_img_available() -> bool {
        Command::new("qemu-img")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    #[test]
    fn create_and_inspect_raw_image() {
        if !qemu_img_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        create(&path, "raw", Some(1024 * 1024), None).unwrap();

        let details = info(&path).unwrap();
        assert_eq!(details["format"], "raw");
        assert_eq!(details["virtual-size"], 1024 * 1024);
    }

    #[test]
    fn compare_detects_identical_images() {
        if !qemu_img_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.raw");
        let b = dir.path().join("b.raw");
        create(&a, "raw", Some(65536), None).unwrap();
        create(&b, "raw", Some(65536), None).unwrap();
        compare(&a, &b).unwrap();
    }
}
