use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::Path;

use anyhow::{bail, Context};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

fn add_dir_to_zip<W: Write + Seek>(
    zw: &mut ZipWriter<W>,
    base: &Path,
    prefix: &str,
) -> anyhow::Result<()> {
    let entries =
        std::fs::read_dir(base).with_context(|| format!("read dir {}", base.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        // Symlinks are skipped altogether; a dangling link would otherwise
        // abort the archive.
        if file_type.is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let in_zip = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        if file_type.is_dir() {
            add_dir_to_zip(zw, &path, &in_zip)
                .with_context(|| format!("archive dir {}", path.display()))?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let metadata = entry.metadata()?;
        let options = SimpleFileOptions::default().unix_permissions({
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        });
        zw.start_file(in_zip.as_str(), options)
            .with_context(|| format!("start zip entry {in_zip:?}"))?;
        let mut f =
            File::open(&path).with_context(|| format!("open {}", path.display()))?;
        io::copy(&mut f, zw).with_context(|| format!("copy {}", path.display()))?;
    }
    Ok(())
}

/// Packs the contents of `dir` (recursively, entry names relative to `dir`)
/// into a zip stream.
pub fn zip_dir<W: Write + Seek>(writer: W, dir: &Path) -> anyhow::Result<()> {
    let mut zw = ZipWriter::new(writer);
    add_dir_to_zip(&mut zw, dir, "")?;
    zw.finish().with_context(|| "finish zip")?;
    Ok(())
}

/// Extracts `zipfile` into `dir`. Entry names that would escape `dir` abort
/// the extraction.
pub fn unzip_to(zipfile: &Path, dir: &Path) -> anyhow::Result<()> {
    let f = File::open(zipfile).with_context(|| format!("open {}", zipfile.display()))?;
    let mut archive =
        ZipArchive::new(f).with_context(|| format!("read zip {}", zipfile.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = match entry.enclosed_name() {
            Some(p) => p,
            None => bail!("zip entry {:?} escapes the target directory", entry.name()),
        };
        let target = dir.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("mkdir {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }

        let mut out =
            File::create(&target).with_context(|| format!("create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("extract {}", target.display()))?;

        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", target.display()))?;
        }
    }
    Ok(())
}

/// Convenience for in-memory packing (deploy uploads).
pub fn zip_dir_to_vec(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let mut buf = io::Cursor::new(Vec::new());
    zip_dir(&mut buf, dir)?;
    Ok(buf.into_inner())
}
