use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use reaper_core::error::AppError;
use reaper_core::models::{BlogIdentity, BlogKind};
use reaper_core::traits::Blog;
use serde::{Deserialize, Serialize};
use url::Url;

const STATE_FILE: &str = "blog.json";

/// Persisted per-blog state, stored as `<download dir>/blog.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlogState {
    pub pages_crawled: u32,
    pub last_crawled: Option<DateTime<Utc>>,
    pub online: bool,
}

/// Whether `name` can be used as a single directory below the download root.
pub fn is_valid_dir_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    !name.contains('\\')
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}

/// A blog backed by a directory on disk.
pub struct FileBlog {
    identity: BlogIdentity,
    url: Url,
    location: PathBuf,
    dirty: AtomicBool,
    online: AtomicBool,
    state: Mutex<BlogState>,
}

impl FileBlog {
    /// Opens the blog under `root/<kind>/<name>`, loading prior state if any.
    pub fn open(
        name: &str,
        kind: BlogKind,
        url: Url,
        root: &Path,
    ) -> Result<Self, AppError> {
        if !is_valid_dir_name(name) {
            return Err(AppError::InvalidArgument(format!(
                "Blog name {name:?} is not a plain directory name"
            )));
        }
        let location = root.join(kind.as_str()).join(name);
        let state = match std::fs::read_to_string(location.join(STATE_FILE)) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                AppError::StorageError(format!("Corrupt state for {name}: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BlogState {
                online: true,
                ..BlogState::default()
            },
            Err(e) => return Err(AppError::StorageError(e.to_string())),
        };

        Ok(Self {
            identity: BlogIdentity::new(name, kind),
            url,
            location,
            dirty: AtomicBool::new(false),
            online: AtomicBool::new(state.online),
            state: Mutex::new(state),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> BlogState {
        self.lock_state().clone()
    }

    pub fn record_page(&self) {
        self.lock_state().pages_crawled += 1;
        self.set_dirty(true);
    }

    pub fn mark_crawled(&self) {
        self.lock_state().last_crawled = Some(Utc::now());
        self.set_dirty(true);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BlogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Blog for FileBlog {
    fn identity(&self) -> BlogIdentity {
        self.identity.clone()
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        self.lock_state().online = online;
    }

    fn download_location(&self) -> PathBuf {
        self.location.clone()
    }

    fn save(&self) -> Result<(), AppError> {
        let state = self.state();
        std::fs::create_dir_all(&self.location)
            .map_err(|e| AppError::StorageError(format!("{}: {e}", self.location.display())))?;
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| AppError::StorageError(e.to_string()))?;
        std::fs::write(self.location.join(STATE_FILE), json)
            .map_err(|e| AppError::StorageError(e.to_string()))?;
        Ok(())
    }
}
