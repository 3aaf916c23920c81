use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::info;
use uuid::Uuid;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Glb,
    Png,
}

impl AssetKind {
    pub fn extension(self) -> &'static str {
        match self {
            AssetKind::Glb => "glb",
            AssetKind::Png => "png",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            AssetKind::Glb => "model/gltf-binary",
            AssetKind::Png => "image/png",
        }
    }
}

/// A slot in the asset directory. The file exists only once something has
/// been written to [`StoredAsset::path`].
#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub id: Uuid,
    pub kind: AssetKind,
    pub path: PathBuf,
}

impl StoredAsset {
    pub fn filename(&self) -> String {
        format!("{}.{}", self.id, self.kind.extension())
    }
}

/// Flat directory of generated files. Nothing is ever deleted.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(dir = %root.display(), "asset directory ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allocate(&self, kind: AssetKind) -> StoredAsset {
        let id = Uuid::new_v4();
        let path = self.root.join(format!("{id}.{}", kind.extension()));
        StoredAsset { id, kind, path }
    }

    pub fn read(&self, asset: &StoredAsset) -> Result<Vec<u8>, ServiceError> {
        Ok(fs::read(&asset.path)?)
    }
}
