use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use kfund_core::DateRange;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub filename: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_present: bool,
}

/// Write-once hierarchical store addressed by
/// `{dateRange}/{page}/{announcementId}/{filename}`.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn announcement_dir(&self, range: &DateRange, page: u32, announcement_id: &str) -> PathBuf {
        PathBuf::from(range.folder_name())
            .join(page.to_string())
            .join(sanitize_filename(announcement_id))
    }

    pub fn absolute(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Store bytes under `relative_dir/filename` via temp file + atomic rename. An
    /// existing file is never overwritten.
    pub async fn write_once(
        &self,
        relative_dir: &Path,
        filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAttachment> {
        let filename = sanitize_filename(filename);
        let relative_path = relative_dir.join(&filename);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(relative_dir);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating attachment directory {}", parent.display()))?;

        let stored = |already_present| StoredAttachment {
            filename: filename.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            already_present,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking attachment path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp attachment file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp attachment file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp attachment file {}", temp_path.display()))?;
        drop(file);

        // rename(2) replaces silently on unix, so re-check right before moving.
        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            let _ = fs::remove_file(&temp_path).await;
            return Ok(stored(true));
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp attachment {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn list_files(&self, relative_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.root.join(relative_dir);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_file() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Sanitized names for one announcement's attachments, in link order. Repeated names
/// get a ` (2)`, ` (3)` suffix before the extension, so the same link list always maps
/// to the same files.
pub fn unique_filenames<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut taken = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let name = sanitize_filename(name);
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (name.clone(), String::new()),
        };
        let mut candidate = name;
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{stem} ({n}){ext}");
            n += 1;
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

/// Keep Hangul and other letters, replace path separators and control characters.
pub fn sanitize_filename(input: &str) -> String {
    let cleaned = input
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ').to_string();
    if cleaned.is_empty() {
        "attachment.bin".to_string()
    } else {
        cleaned
    }
}
