use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::time::{Duration, SystemTime};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::{BuildId, TaskId, unix_millis};
use crate::error::CacheError;
use crate::task::{OutputKind, TaskNode};

/// Raw file contents, encoded as a CBOR byte string rather than an array of
/// integers.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({} bytes)", self.0.len())
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Bytes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bytes, E> {
                Ok(Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Bytes, E> {
                Ok(Bytes(v))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Bytes, A::Error> {
                let mut acc = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element()? {
                    acc.push(byte);
                }
                Ok(Bytes(acc))
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundledKind {
    File,
    Directory,
}

/// One file or directory below an output location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledEntry {
    /// Relative to the output location, `/` separated; empty for the
    /// location itself.
    pub path: String,
    pub kind: BundledKind,
    pub contents: Bytes,
}

/// The captured state of one declared output property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledOutput {
    pub name: String,
    pub kind: OutputKind,
    /// `false` when the output did not exist after the task ran.
    pub present: bool,
    pub entries: Vec<BundledEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub task: TaskId,
    pub build_id: BuildId,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub execution_time: Duration,
}

/// Every declared output of a task, serialized so it can be reconstructed at
/// the declared locations later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBundle {
    pub metadata: BundleMetadata,
    pub outputs: Vec<BundledOutput>,
}

fn read_tree(
    root: &Utf8Path,
    dir: &Utf8Path,
    out: &mut Vec<BundledEntry>,
) -> Result<(), CacheError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = Utf8PathBuf::try_from(entry.path())
            .map_err(|e| CacheError::InvalidPath(e.into_path_buf().display().to_string()))?;
        let relative = path
            .strip_prefix(root)
            .map_err(|_| CacheError::InvalidPath(path.to_string()))?;
        let relative = relative
            .components()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("/");

        if fs::metadata(&path)?.is_dir() {
            out.push(BundledEntry {
                path: relative,
                kind: BundledKind::Directory,
                contents: Bytes::default(),
            });
            read_tree(root, &path, out)?;
        } else {
            out.push(BundledEntry {
                path: relative,
                kind: BundledKind::File,
                contents: Bytes(fs::read(&path)?),
            });
        }
    }
    Ok(())
}

/// Rejects entry paths that would land outside the output location.
fn checked_join(location: &Utf8Path, relative: &str) -> Result<Utf8PathBuf, CacheError> {
    let relative = Utf8Path::new(relative);
    let safe = relative
        .components()
        .all(|component| matches!(component, Utf8Component::Normal(_)));

    if !safe {
        return Err(CacheError::InvalidPath(relative.to_string()));
    }

    Ok(location.join(relative))
}

fn remove_existing(location: &Utf8Path) -> Result<(), CacheError> {
    let result = match fs::symlink_metadata(location) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(location),
        Ok(_) => fs::remove_file(location),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    Ok(result?)
}

impl OutputBundle {
    /// Reads every declared output of `task` from disk.
    pub fn capture(
        task: &TaskNode,
        build_id: &BuildId,
        execution_time: Duration,
    ) -> Result<Self, CacheError> {
        let mut outputs = Vec::with_capacity(task.outputs.len());

        for output in &task.outputs {
            let location = &output.location;
            let mut entries = Vec::new();

            let present = match fs::metadata(location) {
                Ok(meta) if meta.is_dir() => {
                    read_tree(location, location, &mut entries)?;
                    entries.sort_by(|a, b| a.path.cmp(&b.path));
                    true
                }
                Ok(_) => {
                    entries.push(BundledEntry {
                        path: String::new(),
                        kind: BundledKind::File,
                        contents: Bytes(fs::read(location)?),
                    });
                    true
                }
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };

            outputs.push(BundledOutput {
                name: output.name.clone(),
                kind: output.kind,
                present,
                entries,
            });
        }

        Ok(Self {
            metadata: BundleMetadata {
                task: task.id.clone(),
                build_id: build_id.clone(),
                created_at: unix_millis(SystemTime::now()),
                execution_time,
            },
            outputs,
        })
    }

    /// Recreates every declared output of `task` from this bundle, replacing
    /// whatever currently exists at the output locations.
    pub fn restore(&self, task: &TaskNode) -> Result<(), CacheError> {
        for output in &task.outputs {
            let bundled = self
                .outputs
                .iter()
                .find(|bundled| bundled.name == output.name)
                .ok_or_else(|| CacheError::MissingProperty(output.name.clone()))?;

            let location = &output.location;
            remove_existing(location)?;

            if !bundled.present {
                continue;
            }

            if output.kind == OutputKind::Directory || bundled.kind == OutputKind::Directory {
                fs::create_dir_all(location)?;
            } else if let Some(parent) = location.parent() {
                fs::create_dir_all(parent)?;
            }

            for entry in &bundled.entries {
                let path = if entry.path.is_empty() {
                    location.clone()
                } else {
                    checked_join(location, &entry.path)?
                };

                match entry.kind {
                    BundledKind::Directory => fs::create_dir_all(&path)?,
                    BundledKind::File => {
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(&path, &entry.contents.0)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Total number of content bytes in the bundle.
    pub fn size(&self) -> u64 {
        self.outputs
            .iter()
            .flat_map(|output| &output.entries)
            .map(|entry| entry.contents.0.len() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(tmp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_capture_and_restore_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = root(&tmp);
        let classes = root.join("build/classes");
        fs::create_dir_all(classes.join("pkg/empty")).unwrap();
        fs::write(classes.join("A.class"), [0xCA, 0xFE, 0xBA, 0xBE]).unwrap();
        fs::write(classes.join("pkg/B.class"), b"b").unwrap();
        fs::write(root.join("report.txt"), b"ok").unwrap();

        let task = TaskNode::new(":compile")
            .output_dir("classes", &classes)
            .output_file("report", root.join("report.txt"))
            .output_file("absent", root.join("never.txt"));

        let bundle = OutputBundle::capture(&task, &BuildId::new("b"), Duration::ZERO).unwrap();
        assert_eq!(bundle.size(), 4 + 1 + 2);

        let mut encoded = Vec::new();
        ciborium::into_writer(&bundle, &mut encoded).unwrap();
        let decoded: OutputBundle = ciborium::from_reader(encoded.as_slice()).unwrap();
        assert_eq!(decoded, bundle);

        fs::remove_dir_all(root.join("build")).unwrap();
        fs::write(root.join("report.txt"), b"tampered").unwrap();
        fs::write(root.join("never.txt"), b"stale").unwrap();

        decoded.restore(&task).unwrap();

        assert_eq!(fs::read(classes.join("A.class")).unwrap(), [0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(fs::read(classes.join("pkg/B.class")).unwrap(), b"b");
        assert!(classes.join("pkg/empty").is_dir());
        assert_eq!(fs::read(root.join("report.txt")).unwrap(), b"ok");
        assert!(!root.join("never.txt").exists());
    }

    #[test]
    fn test_restore_rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = root(&tmp);
        let task = TaskNode::new(":x").output_dir("out", root.join("out"));

        let bundle = OutputBundle {
            metadata: BundleMetadata {
                task: TaskId::new(":x"),
                build_id: BuildId::new("b"),
                created_at: 0,
                execution_time: Duration::ZERO,
            },
            outputs: vec![BundledOutput {
                name: "out".into(),
                kind: OutputKind::Directory,
                present: true,
                entries: vec![BundledEntry {
                    path: "../evil".into(),
                    kind: BundledKind::File,
                    contents: Bytes(b"x".to_vec()),
                }],
            }],
        };

        assert!(matches!(
            bundle.restore(&task),
            Err(CacheError::InvalidPath(_))
        ));
        assert!(!root.join("evil").exists());
    }
}
