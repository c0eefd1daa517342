use std::{
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;
use autohost_instance::InstanceId;

/// Regular files under `root`, relative to it. Symlinks and FIFOs are skipped.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, cur: &Path, out: &mut Vec<PathBuf>) {
        let rd = match std::fs::read_dir(cur) {
            Ok(v) => v,
            Err(_) => return,
        };
        for e in rd.flatten() {
            let path = e.path();
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                walk(root, &path, out);
                continue;
            }
            if meta.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// Newest `*.wzrp` under `<dir>/replay/multiplay`.
pub fn find_replay(dir: &Path) -> Option<PathBuf> {
    let rd = std::fs::read_dir(dir.join("replay").join("multiplay")).ok()?;
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for e in rd.flatten() {
        let path = e.path();
        if path.extension().and_then(|s| s.to_str()) != Some("wzrp") {
            continue;
        }
        let Ok(meta) = e.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(t, _)| modified > *t) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, p)| p)
}

pub fn archive_path(archive_dir: &Path, id: InstanceId) -> PathBuf {
    archive_dir
        .join(id.archive_week().to_string())
        .join(format!("{id}.zip"))
}

fn write_zip(dir: &Path, dest: &Path) -> anyhow::Result<usize> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create archive dir {}", parent.display()))?;
    }
    let tmp = dest.with_extension("zip.tmp");
    let f = std::fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    let mut zip = zip::ZipWriter::new(f);
    let opts = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let files = collect_files(dir);
    for rel in &files {
        let name = rel.to_string_lossy().replace('\\', "/");
        let data = std::fs::read(dir.join(rel)).with_context(|| format!("read {name}"))?;
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("add {name} to archive"))?;
        zip.write_all(&data)
            .with_context(|| format!("write {name} to archive"))?;
    }
    zip.finish().context("finish archive")?;
    std::fs::rename(&tmp, dest).with_context(|| format!("persist {}", dest.display()))?;
    Ok(files.len())
}

/// Zips the instance directory into `<archive_dir>/<week>/<id>.zip` and
/// removes the directory.
pub async fn archive_instance(dir: PathBuf, archive_dir: PathBuf, id: InstanceId) -> anyhow::Result<PathBuf> {
    let dest = archive_path(&archive_dir, id);
    let out = dest.clone();
    let count = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let count = write_zip(&dir, &out)?;
        std::fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        Ok(count)
    })
    .await
    .context("archive task panicked")??;
    tracing::info!(instance = %id, files = count, path = %dest.display(), "instance archived");
    Ok(dest)
}
