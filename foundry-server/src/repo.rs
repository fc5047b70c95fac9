//! Repository collaborator: the working tree reports are written into.
//!
//! Every path coming off the wire is checked with [`resolve_within`] before
//! it touches the filesystem. Writes go through [`VersionControl`]; reads
//! (file content, structure scan) are plain filesystem access under the root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use foundry_sdk::structure::{Node, ProjectStructure};
use git2::{ErrorCode, Repository, Signature};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("path escapes the repository root: {0}")]
    UnsafePath(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("path is a directory: {0}")]
    IsDirectory(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

/// Write-and-commit capability over a repository working tree.
///
/// Implementations are called from a blocking context, one write at a time.
pub trait VersionControl: Send + Sync {
    fn root(&self) -> &Path;

    /// Write `content` to `path` (relative to the root) and record it.
    /// Returns whether a new commit was created.
    fn write_and_commit(&self, path: &str, content: &str, message: &str) -> Result<bool, RepoError>;
}

// ── Git-backed repository ──────────────────────────────────────────────

pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    /// Open the repository at `root`, initializing one if none exists.
    pub fn open_or_init(root: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        match Repository::open(&root) {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {
                Repository::init(&root)?;
                tracing::info!("Initialized git repository at {}", root.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self { root })
    }
}

impl VersionControl for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn write_and_commit(&self, path: &str, content: &str, message: &str) -> Result<bool, RepoError> {
        let rel = safe_relative(path).ok_or_else(|| RepoError::UnsafePath(path.to_string()))?;
        write_file(&self.root, &rel, content)?;

        let repo = Repository::open(&self.root)?;
        let mut index = repo.index()?;
        index.add_path(&rel)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            tracing::info!("No changes staged for commit for: {path}");
            return Ok(false);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("foundry", "foundry@localhost"))?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!("Commit created: {commit_id}");
        Ok(true)
    }
}

// ── Plain directory (no version control) ───────────────────────────────

/// Writes files without committing them.
pub struct PlainDirectory {
    root: PathBuf,
}

impl PlainDirectory {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl VersionControl for PlainDirectory {
    fn root(&self) -> &Path {
        &self.root
    }

    fn write_and_commit(&self, path: &str, content: &str, _message: &str) -> Result<bool, RepoError> {
        let rel = safe_relative(path).ok_or_else(|| RepoError::UnsafePath(path.to_string()))?;
        write_file(&self.root, &rel, content)?;
        Ok(false)
    }
}

fn write_file(root: &Path, rel: &Path, content: &str) -> Result<(), RepoError> {
    let full = root.join(rel);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full, content)?;
    Ok(())
}

// ── Path safety ────────────────────────────────────────────────────────

/// Lexically normalize `path` into a relative path that stays under its base.
///
/// Absolute paths, drive prefixes, and `..` that climbs above the base are
/// rejected, as is a path that normalizes to nothing.
pub fn safe_relative(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Resolve `path` under `root`, or `None` if it would escape it.
///
/// Existing targets are also canonicalized so a symlink cannot lead outside.
pub fn resolve_within(root: &Path, path: &str) -> Option<PathBuf> {
    let full = root.join(safe_relative(path)?);
    if full.exists() {
        let base = root.canonicalize().ok()?;
        let target = full.canonicalize().ok()?;
        if !target.starts_with(&base) {
            return None;
        }
    }
    Some(full)
}

// ── Reads ──────────────────────────────────────────────────────────────

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "zip", "tar", "gz", "bz2", "xz", "7z",
    "rar", "exe", "dll", "so", "dylib", "bin", "o", "a", "class", "jar", "pyc", "woff", "woff2",
    "ttf", "otf", "eot", "pdf", "mp3", "mp4", "wav", "avi", "mov", "sqlite", "db",
];

/// Current text of a repository file.
///
/// Binary files yield a `[Binary file: <name>]` placeholder; text that is
/// not valid UTF-8 is decoded lossily.
pub fn read_text(root: &Path, path: &str) -> Result<String, RepoError> {
    let full = resolve_within(root, path).ok_or_else(|| RepoError::UnsafePath(path.to_string()))?;
    let meta = match fs::metadata(&full) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RepoError::NotFound(path.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        return Err(RepoError::IsDirectory(path.to_string()));
    }

    let is_binary = full
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    if is_binary {
        let name = full.file_name().and_then(|n| n.to_str()).unwrap_or(path);
        return Ok(format!("[Binary file: {name}]"));
    }

    let bytes = fs::read(&full)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Build a structure tree from the working tree on disk.
///
/// Dotfiles are skipped except `.gitignore`. Entries are sorted by name.
pub fn scan_structure(root: &Path) -> io::Result<ProjectStructure> {
    let mut structure = ProjectStructure::new();
    if !root.is_dir() {
        return Ok(structure);
    }
    let mut entries: Vec<_> = fs::read_dir(root)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') && name != ".gitignore" {
            continue;
        }
        if entry.file_type()?.is_dir() {
            structure.insert(name, Node::Dir(scan_structure(&entry.path())?));
        } else {
            structure.insert(name, Node::File(None));
        }
    }
    Ok(structure)
}
