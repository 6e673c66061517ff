//! Loading named weights described by a JSON manifest.
//!
//! A manifest is a list of groups. Each group lists the files holding its
//! bytes (read in order and concatenated) and the weights packed into those
//! bytes back to back, little-endian.

use std::ops::Range;
use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_tensor::prelude::*;

pub type WeightsManifest = Vec<WeightsManifestGroup>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsManifestGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightsManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsManifestEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: WeightDType,
}

/// Element types a manifest can store. Booleans are never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightDType {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "int32")]
    Int32,
}

impl WeightDType {
    pub fn dtype(self) -> DType {
        match self {
            WeightDType::Float32 => DType::F32,
            WeightDType::Int32 => DType::I32,
        }
    }
}

impl WeightsManifestEntry {
    pub fn size_in_bytes(&self) -> usize {
        self.dtype.dtype().size_of() * self.shape.iter().product::<usize>()
    }
}

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid weights manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("could not find weights in manifest with names: {}; manifest has: {}", missing.join(", "), available.join(", "))]
    NotFound {
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("duplicate weight with name {0:?}; weight names must be unique in the manifest")]
    Duplicate(String),

    #[error("group {group} holds {found} bytes, but its weights need {expected}")]
    ShortData {
        group: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Engine(#[from] Error),
}

pub fn parse_manifest(json: &str) -> Result<WeightsManifest, WeightsError> {
    Ok(serde_json::from_str(json)?)
}

/// Byte range of each entry within its group's concatenated data.
pub fn group_offsets(group: &WeightsManifestGroup) -> Vec<Range<usize>> {
    let mut offset = 0;
    group
        .weights
        .iter()
        .map(|entry| {
            let start = offset;
            offset += entry.size_in_bytes();
            start..offset
        })
        .collect()
}

/// Load weights from the files under `dir`.
///
/// With `names` set only those weights are loaded, and only the groups
/// holding them are read. Every requested name must be in the manifest.
pub fn load_weights<B: Backend>(
    engine: &Engine<B>,
    manifest: &WeightsManifest,
    dir: impl AsRef<Path>,
    names: Option<&[&str]>,
) -> Result<FxHashMap<String, Tensor>, WeightsError> {
    let dir = dir.as_ref();
    load_weights_with(engine, manifest, names, |path| {
        let full = dir.join(path);
        log::debug!("reading weights file {}", full.display());
        std::fs::read(&full).map_err(|source| WeightsError::Io { path: full, source })
    })
}

/// Like [`load_weights`], getting each file's bytes from `fetch`.
pub fn load_weights_with<B, F>(
    engine: &Engine<B>,
    manifest: &WeightsManifest,
    names: Option<&[&str]>,
    fetch: F,
) -> Result<FxHashMap<String, Tensor>, WeightsError>
where
    B: Backend,
    F: FnMut(&str) -> Result<Vec<u8>, WeightsError>,
{
    let mut loaded = FxHashMap::default();
    match decode_groups(engine, manifest, names, fetch, &mut loaded) {
        Ok(()) => Ok(loaded),
        Err(err) => {
            let created: Vec<Tensor> = loaded.into_values().collect();
            engine.dispose_all(&created)?;
            Err(err)
        }
    }
}

fn decode_groups<B, F>(
    engine: &Engine<B>,
    manifest: &WeightsManifest,
    names: Option<&[&str]>,
    mut fetch: F,
    loaded: &mut FxHashMap<String, Tensor>,
) -> Result<(), WeightsError>
where
    B: Backend,
    F: FnMut(&str) -> Result<Vec<u8>, WeightsError>,
{
    let wanted = |entry: &WeightsManifestEntry| names.is_none_or(|names| names.contains(&entry.name.as_str()));

    if let Some(names) = names {
        let present: FxHashSet<&str> = manifest
            .iter()
            .flat_map(|group| group.weights.iter().map(|e| e.name.as_str()))
            .collect();
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !present.contains(*name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(WeightsError::NotFound {
                missing,
                available: manifest
                    .iter()
                    .flat_map(|group| group.weights.iter().map(|e| e.name.clone()))
                    .collect(),
            });
        }
    }

    for (index, group) in manifest.iter().enumerate() {
        let selected: Vec<(&WeightsManifestEntry, Range<usize>)> = group
            .weights
            .iter()
            .zip(group_offsets(group))
            .filter(|(entry, _)| wanted(entry))
            .collect();
        if selected.is_empty() {
            continue;
        }

        let mut bytes = Vec::new();
        for path in &group.paths {
            bytes.extend(fetch(path)?);
        }
        log::debug!("weights group {index}: {} bytes, {} entries", bytes.len(), selected.len());

        for (entry, range) in selected {
            let data = bytes.get(range.clone()).ok_or(WeightsError::ShortData {
                group: index,
                expected: range.end,
                found: bytes.len(),
            })?;
            if loaded.contains_key(&entry.name) {
                return Err(WeightsError::Duplicate(entry.name.clone()));
            }
            let tensor = engine.tensor_from_bytes(data, entry.shape.clone(), entry.dtype.dtype())?;
            loaded.insert(entry.name.clone(), tensor);
        }
    }
    Ok(())
}
