use std::path::Path;

use anyhow::{Context, Result, bail};
use reaper_core::models::BlogKind;
use serde::Deserialize;
use url::Url;

use crate::blog::is_valid_dir_name;

/// One line of the queue file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    pub kind: BlogKind,
    /// Overrides the URL derived from `kind` and `name`. Required for `generic`.
    #[serde(default)]
    pub url: Option<String>,
}

impl QueueEntry {
    pub fn resolve_url(&self) -> Result<Url> {
        let raw = match (&self.url, self.kind) {
            (Some(url), _) => url.clone(),
            (
                None,
                BlogKind::Tumblr
                | BlogKind::TumblrHidden
                | BlogKind::TumblrSearch
                | BlogKind::TumblrTagSearch,
            ) => format!("https://{}.tumblr.com/", self.name),
            (None, BlogKind::Twitter) => format!("https://twitter.com/{}/", self.name),
            (None, BlogKind::Bluesky) => format!("https://bsky.app/profile/{}/", self.name),
            (None, BlogKind::Generic) => bail!("Blog '{}' is generic and needs a url", self.name),
        };
        Url::parse(&raw).with_context(|| format!("Invalid url for blog '{}': {raw}", self.name))
    }
}

/// Reads a JSON array of [`QueueEntry`] from `path`.
pub fn load_queue(path: &Path) -> Result<Vec<QueueEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read queue file: {}", path.display()))?;
    let entries: Vec<QueueEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid queue file: {}", path.display()))?;
    for entry in &entries {
        if entry.name.trim().is_empty() {
            bail!("Queue file {} has an entry with an empty name", path.display());
        }
        if !is_valid_dir_name(&entry.name) {
            bail!(
                "Queue file {} has an entry with an unusable name: {:?}",
                path.display(),
                entry.name
            );
        }
    }
    Ok(entries)
}
