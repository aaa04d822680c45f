//! Aligns two hierarchies by path and reports per-path deltas. Mismatches
//! are data, not errors; only structural faults (unknown keywords, I/O)
//! error out.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::entry::EntryType;
use crate::hierarchy::DirectoryHierarchy;
use crate::keywords::{self, merge_set, KeyVal, Keyword};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaType {
    /// Present in the manifest, gone in reality.
    Missing,
    /// Present in reality, absent from the manifest.
    Extra,
    /// Present in both with diverging keywords.
    Modified,
}

/// One keyword's divergence inside a [`DeltaType::Modified`] path.
#[derive(Debug, Clone, Serialize)]
pub struct KeyDelta {
    #[serde(rename = "type")]
    pub delta: DeltaType,
    pub name: Keyword,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InodeDelta {
    #[serde(rename = "type")]
    pub delta: DeltaType,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyDelta>,
}

/// Replay `/set`/`/unset` state over the entries in position order and
/// produce each path's fully merged keyword list.
pub(crate) fn flatten(dh: &DirectoryHierarchy) -> BTreeMap<PathBuf, Vec<KeyVal>> {
    let mut out: BTreeMap<PathBuf, Vec<KeyVal>> = BTreeMap::new();
    let mut order: Vec<usize> = (0..dh.entries().len()).collect();
    order.sort_by_key(|&i| dh.entries()[i].pos);

    let mut cur_set: Vec<KeyVal> = Vec::new();
    for id in order {
        let e = &dh.entries()[id];
        match e.etype {
            EntryType::Special => {
                if e.name == "/set" {
                    cur_set = e.keywords.clone();
                } else if e.name == "/unset" {
                    if e.keywords.iter().any(|kv| kv.as_str() == "all") {
                        cur_set.clear();
                    } else {
                        cur_set.retain(|kv| {
                            !e.keywords.iter().any(|k| k.keyword() == kv.keyword())
                        });
                    }
                }
            }
            EntryType::Relative | EntryType::Full => {
                out.insert(dh.path(id), merge_set(&cur_set, &e.keywords));
            }
            _ => {}
        }
    }
    out
}

/// Compare two hierarchies, optionally narrowing to `keys`.
///
/// Deltas come out in lexicographic path order; within one, keys follow the
/// registry order. When either side is tar-derived (or the filter asks for
/// `tar_time`), `time` values are truncated to whole seconds first, and
/// directory sizes are not compared at all.
pub fn compare(
    old: &DirectoryHierarchy,
    new: &DirectoryHierarchy,
    keys: Option<&[Keyword]>,
) -> Result<Vec<InodeDelta>> {
    // A manifest parsed back from disk has lost its provenance, but only
    // tar-derived manifests ever record `tar_time`.
    let uses_tar_time = |dh: &DirectoryHierarchy| {
        dh.used_keywords().iter().any(|k| k.as_str() == "tar_time")
    };
    let tar_mode = old.tar_derived
        || new.tar_derived
        || keys.is_some_and(|ks| ks.iter().any(|k| k.as_str() == "tar_time"))
        || uses_tar_time(old)
        || uses_tar_time(new);

    let filter: Option<Vec<Keyword>> = keys.map(|ks| {
        ks.iter()
            .map(|k| {
                if tar_mode && k.as_str() == "time" {
                    Keyword::new("tar_time")
                } else {
                    k.clone()
                }
            })
            .collect()
    });

    let old_map = normalize(flatten(old), tar_mode);
    let new_map = normalize(flatten(new), tar_mode);

    let mut paths: Vec<&PathBuf> = old_map.keys().chain(new_map.keys()).collect();
    paths.sort();
    paths.dedup();

    let mut deltas = Vec::new();
    for path in paths {
        match (old_map.get(path), new_map.get(path)) {
            (Some(_), None) => deltas.push(InodeDelta {
                delta: DeltaType::Missing,
                path: path.display().to_string(),
                keys: Vec::new(),
            }),
            (None, Some(_)) => deltas.push(InodeDelta {
                delta: DeltaType::Extra,
                path: path.display().to_string(),
                keys: Vec::new(),
            }),
            (Some(old_kvs), Some(new_kvs)) => {
                let keys = diff_keys(old_kvs, new_kvs, filter.as_deref(), tar_mode);
                if !keys.is_empty() {
                    deltas.push(InodeDelta {
                        delta: DeltaType::Modified,
                        path: path.display().to_string(),
                        keys,
                    });
                }
            }
            (None, None) => unreachable!(),
        }
    }
    Ok(deltas)
}

/// In tar mode every `time` keyval collapses to `tar_time` with zeroed
/// nanoseconds, so second-precision sources compare cleanly.
fn normalize(
    map: BTreeMap<PathBuf, Vec<KeyVal>>,
    tar_mode: bool,
) -> BTreeMap<PathBuf, Vec<KeyVal>> {
    if !tar_mode {
        return map;
    }
    map.into_iter()
        .map(|(path, kvs)| {
            let kvs = kvs
                .into_iter()
                .map(|kv| {
                    if kv.keyword().as_str() == "time" {
                        let secs = kv.value().split('.').next().unwrap_or("0").to_string();
                        KeyVal::new("tar_time", &format!("{secs}.000000000"))
                    } else {
                        kv
                    }
                })
                .collect();
            (path, kvs)
        })
        .collect()
}

fn diff_keys(
    old: &[KeyVal],
    new: &[KeyVal],
    filter: Option<&[Keyword]>,
    tar_mode: bool,
) -> Vec<KeyDelta> {
    let is_dir = |kvs: &[KeyVal]| kvs.iter().any(|kv| kv.as_str() == "type=dir");
    let skip_dir_size = tar_mode && (is_dir(old) || is_dir(new));

    let mut names: Vec<Keyword> = old
        .iter()
        .chain(new.iter())
        .map(|kv| kv.keyword())
        .collect();
    names.sort_by_key(|k| (keywords::registry_order(k), k.clone()));
    names.dedup();

    let value_of = |kvs: &[KeyVal], name: &Keyword| -> Option<String> {
        kvs.iter()
            .find(|kv| kv.keyword() == *name)
            .map(|kv| kv.value().to_string())
    };

    let mut out = Vec::new();
    for name in names {
        if let Some(filter) = filter {
            if !filter.contains(&name) {
                continue;
            }
        }
        if skip_dir_size && name.as_str() == "size" {
            continue;
        }
        let old_val = value_of(old, &name);
        let new_val = value_of(new, &name);
        let delta = match (&old_val, &new_val) {
            (Some(o), Some(n)) if o == n => continue,
            (Some(_), Some(_)) => DeltaType::Modified,
            (Some(_), None) => DeltaType::Missing,
            (None, Some(_)) => DeltaType::Extra,
            (None, None) => continue,
        };
        out.push(KeyDelta {
            delta,
            name,
            old: old_val,
            new: new_val,
        });
    }
    out
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Reject manifests that use keywords the registry does not know, naming the
/// offending path.
fn check_known_keywords(dh: &DirectoryHierarchy) -> Result<()> {
    for (id, e) in dh.entries().iter().enumerate() {
        let relevant = match e.etype {
            EntryType::Relative | EntryType::Full => true,
            EntryType::Special => e.name == "/set",
            _ => false,
        };
        if !relevant {
            continue;
        }
        for kv in &e.keywords {
            let k = kv.keyword();
            if keywords::lookup(&k).is_none() {
                let path = if e.etype == EntryType::Special {
                    "/set".to_string()
                } else {
                    dh.path(id).display().to_string()
                };
                return Err(Error::UnknownKeyword {
                    name: k.as_str().to_string(),
                    path,
                });
            }
        }
    }
    Ok(())
}

/// The keywords to re-evaluate when validating: everything the manifest
/// uses, with the `xattr.*` family collapsed to one evaluation.
fn evaluation_keywords(dh: &DirectoryHierarchy) -> Vec<Keyword> {
    let mut out: Vec<Keyword> = Vec::new();
    for k in dh.used_keywords() {
        let k = Keyword::new(k.prefix());
        if !out.contains(&k) {
            out.push(k);
        }
    }
    out
}

/// Validate a directory tree against a manifest. Returns the deltas, oldest
/// side being the manifest.
pub fn check(
    root: &Path,
    dh: &DirectoryHierarchy,
    keys: Option<&[Keyword]>,
) -> Result<Vec<InodeDelta>> {
    check_known_keywords(dh)?;
    let state = crate::walk::walk(root, &[], &evaluation_keywords(dh))?;
    compare(dh, &state, keys)
}

/// Validate a tar archive against a manifest.
pub fn check_tar<R: Read>(
    input: R,
    dh: &DirectoryHierarchy,
    keys: Option<&[Keyword]>,
) -> Result<Vec<InodeDelta>> {
    check_known_keywords(dh)?;
    let stream = crate::tar::ingest_tar(input, &evaluation_keywords(dh))?;
    let state = stream.hierarchy()?;
    compare(dh, &state, keys)
}
