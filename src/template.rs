//! Template selection and retrieval.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use crate::error::SynthesisError;
use crate::record::{Region, TemplateClass};

/// Identifies one template asset. The id is the asset's file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TemplateAsset(&'static str);

impl TemplateAsset {
    pub fn id(self) -> &'static str {
        self.0
    }
}

/// Maps a template class (and region, for Regional) to its asset.
pub fn resolve(class: TemplateClass, region: Option<Region>) -> Result<TemplateAsset, SynthesisError> {
    let file = match class {
        TemplateClass::Global => "global_template.docx",
        TemplateClass::Country => "country_template.docx",
        TemplateClass::Regional => {
            match region.ok_or_else(|| SynthesisError::InvalidRegion(String::new()))? {
                Region::NorthAmerica => "north_america_region_template.docx",
                Region::Europe => "europe_region_template.docx",
                Region::AsiaPacific => "asia_pacific_region_template.docx",
                Region::MiddleEastAfrica => "middle_east_africa_region_template.docx",
                Region::LatinAmerica => "latin_america_region_template.docx",
            }
        }
    };
    Ok(TemplateAsset(file))
}

/// Read-only source of template bytes.
pub trait TemplateStore: Send + Sync {
    fn fetch(&self, asset: TemplateAsset) -> Result<Vec<u8>, SynthesisError>;
}

/// Templates stored as files in one directory.
#[derive(Clone, Debug)]
pub struct DirTemplateStore {
    dir: PathBuf,
}

impl DirTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_of(&self, asset: TemplateAsset) -> PathBuf {
        self.dir.join(asset.id())
    }
}

impl TemplateStore for DirTemplateStore {
    fn fetch(&self, asset: TemplateAsset) -> Result<Vec<u8>, SynthesisError> {
        let path = self.path_of(asset);
        debug!(path = %path.display(), "loading template");
        std::fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SynthesisError::TemplateNotFound {
                asset: asset.id().to_string(),
                path,
            },
            _ => SynthesisError::TemplateUnreadable {
                asset: asset.id().to_string(),
                path,
                source: e,
            },
        })
    }
}

/// Templates held in memory, keyed by asset id.
#[derive(Clone, Debug, Default)]
pub struct MemoryTemplateStore {
    assets: HashMap<&'static str, Vec<u8>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: TemplateAsset, bytes: Vec<u8>) {
        self.assets.insert(asset.id(), bytes);
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn fetch(&self, asset: TemplateAsset) -> Result<Vec<u8>, SynthesisError> {
        self.assets
            .get(asset.id())
            .cloned()
            .ok_or_else(|| SynthesisError::TemplateNotFound {
                asset: asset.id().to_string(),
                path: PathBuf::from(asset.id()),
            })
    }
}
