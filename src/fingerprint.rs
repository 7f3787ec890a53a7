//! Order-normalized digests of task inputs and outputs.
//!
//! A [`Fingerprint`] is a sorted list of `(normalized path, kind, hash)`
//! entries plus an aggregate hash of the whole list. Files are hashed by
//! content, never by timestamp, so touching a file without changing its bytes
//! does not invalidate anything.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::FingerprintError;
use crate::task::{InputProperty, InputValue, OutputKind, TaskNode};

/// Which part of a file's identity contributes to its fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormalizationPolicy {
    /// The full absolute path matters.
    AbsolutePath,
    /// Only the path relative to the property's root matters.
    RelativePath,
    /// Only the file name matters.
    NameOnly,
    /// Only the content matters.
    IgnorePath,
}

/// Whether empty directories contribute to a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectorySensitivity {
    Default,
    IgnoreEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Missing,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FingerprintEntry {
    /// Normalized path; empty for scalars and under
    /// [`NormalizationPolicy::IgnorePath`].
    pub path: String,
    pub kind: EntryKind,
    pub hash: Hash32,
}

/// A deterministic digest of a set of files or of a value.
///
/// Two fingerprints are equal iff every entry and the aggregate hash match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    entries: Vec<FingerprintEntry>,
    hash: Hash32,
}

impl Fingerprint {
    /// Sorts `entries` and folds them into the aggregate hash.
    pub fn from_entries(mut entries: Vec<FingerprintEntry>) -> Self {
        entries.sort();

        let mut hasher = Blake3Hasher::with_domain("fingerprint");
        for entry in &entries {
            hasher
                .update_str(&entry.path)
                .update(&[entry.kind as u8])
                .update_hash(&entry.hash);
        }

        Self {
            entries,
            hash: hasher.into(),
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lists how `self` differs from `previous`, by normalized path.
    pub fn changes_since(&self, previous: &Fingerprint) -> Vec<Change> {
        if self.hash == previous.hash {
            return Vec::new();
        }

        let current = group_by_path(&self.entries);
        let before = group_by_path(&previous.entries);
        let mut changes = Vec::new();

        for (path, now) in &current {
            match before.get(path) {
                None => changes.push(Change::Added(path.to_string())),
                Some(then) if then != now => changes.push(Change::Modified(path.to_string())),
                Some(_) => {}
            }
        }

        for path in before.keys() {
            if !current.contains_key(path) {
                changes.push(Change::Removed(path.to_string()));
            }
        }

        // Same multiset of paths but the aggregate differs, e.g. reordering
        // under `IgnorePath`; still report something.
        if changes.is_empty() {
            changes.push(Change::Modified(String::new()));
        }

        changes
    }
}

fn group_by_path(entries: &[FingerprintEntry]) -> BTreeMap<&str, Vec<(EntryKind, Hash32)>> {
    let mut map: BTreeMap<&str, Vec<(EntryKind, Hash32)>> = BTreeMap::new();
    for entry in entries {
        map.entry(entry.path.as_str())
            .or_default()
            .push((entry.kind, entry.hash));
    }
    map
}

/// A single difference between two fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(String),
    Removed(String),
    Modified(String),
}

/// Fingerprints of every input property of a task, plus their aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFingerprints {
    pub properties: BTreeMap<String, Fingerprint>,
    pub hash: Hash32,
}

impl InputFingerprints {
    pub fn new(properties: BTreeMap<String, Fingerprint>) -> Self {
        let mut hasher = Blake3Hasher::with_domain("inputs");
        for (name, fingerprint) in &properties {
            hasher.update_str(name).update_hash(&fingerprint.hash);
        }

        Self {
            properties,
            hash: hasher.into(),
        }
    }
}

/// A location found while walking a property value.
#[derive(Debug)]
struct Visited {
    absolute: Utf8PathBuf,
    /// Relative to the property root; empty for the root itself.
    relative: Utf8PathBuf,
    kind: EntryKind,
}

fn absolutize(path: &Utf8Path) -> Result<Utf8PathBuf, FingerprintError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir().map_err(|e| FingerprintError::io(path, e))?;
    let cwd = Utf8PathBuf::try_from(cwd)?;
    Ok(cwd.join(path))
}

/// What is at `path`, following symlinks. Missing is not an error.
fn probe(path: &Utf8Path) -> Result<Option<fs::Metadata>, FingerprintError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FingerprintError::io(path, e)),
    }
}

fn walk_dir(
    root: &Utf8Path,
    dir: &Utf8Path,
    out: &mut Vec<Visited>,
) -> Result<(), FingerprintError> {
    let entries = fs::read_dir(dir).map_err(|e| FingerprintError::io(dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| FingerprintError::io(dir, e))?;
        let path = Utf8PathBuf::try_from(entry.path())?;
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let Some(meta) = probe(&path)? else {
            // dangling symlink
            out.push(Visited {
                absolute: path,
                relative,
                kind: EntryKind::Missing,
            });
            continue;
        };

        if meta.is_dir() {
            out.push(Visited {
                absolute: path.clone(),
                relative,
                kind: EntryKind::Directory,
            });
            walk_dir(root, &path, out)?;
        } else {
            out.push(Visited {
                absolute: path,
                relative,
                kind: EntryKind::File,
            });
        }
    }

    Ok(())
}

/// Visits a root that is expected to be a single file, falling back to a
/// directory walk when it turns out to be a directory.
fn visit_root(
    path: &Utf8Path,
    relative: Utf8PathBuf,
    out: &mut Vec<Visited>,
) -> Result<(), FingerprintError> {
    match probe(path)? {
        None => out.push(Visited {
            absolute: path.to_path_buf(),
            relative,
            kind: EntryKind::Missing,
        }),
        Some(meta) if meta.is_dir() => {
            out.push(Visited {
                absolute: path.to_path_buf(),
                relative,
                kind: EntryKind::Directory,
            });
            walk_dir(path, path, out)?;
        }
        Some(_) => out.push(Visited {
            absolute: path.to_path_buf(),
            relative,
            kind: EntryKind::File,
        }),
    }
    Ok(())
}

fn file_name(path: &Utf8Path) -> Utf8PathBuf {
    path.file_name().map(Utf8PathBuf::from).unwrap_or_default()
}

fn collect(value: &InputValue) -> Result<Vec<Visited>, FingerprintError> {
    let mut out = Vec::new();

    match value {
        InputValue::File(path) => visit_root(path, file_name(path), &mut out)?,
        InputValue::Directory(path) => match probe(path)? {
            Some(meta) if meta.is_dir() => {
                out.push(Visited {
                    absolute: path.clone(),
                    relative: Utf8PathBuf::new(),
                    kind: EntryKind::Directory,
                });
                walk_dir(path, path, &mut out)?;
            }
            Some(_) => out.push(Visited {
                absolute: path.clone(),
                relative: file_name(path),
                kind: EntryKind::File,
            }),
            None => out.push(Visited {
                absolute: path.clone(),
                relative: Utf8PathBuf::new(),
                kind: EntryKind::Missing,
            }),
        },
        InputValue::Files { base, paths } => {
            for path in paths {
                let path = base.join(path);
                let relative = match path.strip_prefix(base) {
                    Ok(relative) => relative.to_path_buf(),
                    Err(_) => file_name(&path),
                };
                visit_root(&path, relative, &mut out)?;
            }
        }
        InputValue::Glob { base, pattern } => {
            let full = Utf8PathBuf::from(glob::Pattern::escape(base.as_str())).join(pattern);
            for path in glob::glob(full.as_str())? {
                let path = Utf8PathBuf::try_from(path?)?;
                let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
                let kind = match probe(&path)? {
                    Some(meta) if meta.is_dir() => EntryKind::Directory,
                    Some(_) => EntryKind::File,
                    None => EntryKind::Missing,
                };
                out.push(Visited {
                    absolute: path,
                    relative,
                    kind,
                });
            }
        }
        InputValue::Scalar(_) => {}
    }

    Ok(out)
}

/// Joins path components with `/` regardless of platform.
fn portable(path: &Utf8Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Utf8Component::Normal(name) => Some(name),
            Utf8Component::ParentDir => Some(".."),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize(
    visited: &Visited,
    policy: NormalizationPolicy,
) -> Result<String, FingerprintError> {
    Ok(match policy {
        NormalizationPolicy::AbsolutePath => {
            let absolute = absolutize(&visited.absolute)?;
            let mut path = String::from("/");
            path.push_str(&portable(&absolute));
            path
        }
        NormalizationPolicy::RelativePath => portable(&visited.relative),
        NormalizationPolicy::NameOnly => visited
            .absolute
            .file_name()
            .unwrap_or_default()
            .to_string(),
        NormalizationPolicy::IgnorePath => String::new(),
    })
}

fn marker(kind: EntryKind) -> Hash32 {
    match kind {
        EntryKind::Directory => Hash32::hash(b"directory"),
        EntryKind::Missing => Hash32::hash(b"missing"),
        EntryKind::File | EntryKind::Value => Hash32::default(),
    }
}

/// Computes the fingerprint of a property value.
///
/// Regular files are hashed in parallel; the result does not depend on the
/// order in which the filesystem yields directory entries.
pub fn fingerprint(
    value: &InputValue,
    policy: NormalizationPolicy,
    sensitivity: DirectorySensitivity,
) -> Result<Fingerprint, FingerprintError> {
    if let InputValue::Scalar(bytes) = value {
        return Ok(Fingerprint::from_entries(vec![FingerprintEntry {
            path: String::new(),
            kind: EntryKind::Value,
            hash: Hash32::hash(bytes),
        }]));
    }

    let visited = collect(value)?;

    let entries = visited
        .into_par_iter()
        .filter(|visited| match visited.kind {
            EntryKind::Directory => {
                sensitivity == DirectorySensitivity::Default
                    && policy != NormalizationPolicy::IgnorePath
            }
            _ => true,
        })
        .map(|visited| -> Result<_, FingerprintError> {
            let hash = match visited.kind {
                EntryKind::File => Hash32::hash_file(&visited.absolute)
                    .map_err(|e| FingerprintError::io(&visited.absolute, e))?,
                kind => marker(kind),
            };

            Ok(FingerprintEntry {
                path: normalize(&visited, policy)?,
                kind: visited.kind,
                hash,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Fingerprint::from_entries(entries))
}

/// Fingerprints one declared input property.
pub fn fingerprint_property(property: &InputProperty) -> Result<Fingerprint, FingerprintError> {
    let Some(value) = &property.value else {
        return Ok(Fingerprint::empty());
    };

    let fingerprint = fingerprint(value, property.normalization, property.sensitivity)
        .map_err(|e| e.in_property(&property.name))?;

    if !property.optional
        && let InputValue::File(path) = value
        && fingerprint
            .entries()
            .iter()
            .any(|entry| entry.kind == EntryKind::Missing)
    {
        return Err(FingerprintError::MissingFile {
            property: property.name.clone(),
            path: path.clone(),
        });
    }

    Ok(fingerprint)
}

/// Fingerprints every input property of `task`.
pub fn fingerprint_inputs(task: &TaskNode) -> Result<InputFingerprints, FingerprintError> {
    let properties = task
        .inputs
        .iter()
        .map(|property| Ok((property.name.clone(), fingerprint_property(property)?)))
        .collect::<Result<BTreeMap<_, _>, FingerprintError>>()?;

    Ok(InputFingerprints::new(properties))
}

/// Snapshots the declared outputs of `task` by absolute path.
pub fn snapshot_outputs(task: &TaskNode) -> Result<BTreeMap<String, Fingerprint>, FingerprintError> {
    task.outputs
        .iter()
        .map(|output| {
            let value = match output.kind {
                OutputKind::File => InputValue::File(output.location.clone()),
                OutputKind::Directory => InputValue::Directory(output.location.clone()),
            };

            let fingerprint = fingerprint(
                &value,
                NormalizationPolicy::AbsolutePath,
                DirectorySensitivity::Default,
            )
            .map_err(|e| e.in_output(&output.name))?;

            Ok((output.name.clone(), fingerprint))
        })
        .collect()
}

/// Regular files currently matched by `value`, sorted by path.
pub(crate) fn resolve_files(value: &InputValue) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
    let mut files: Vec<_> = collect(value)?
        .into_iter()
        .filter(|visited| visited.kind == EntryKind::File)
        .map(|visited| visited.absolute)
        .collect();

    files.sort();
    Ok(files)
}
