//! Image and manifest-index data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cimage_core::digest::Digest;
use cimage_core::error::{CimageError, Result};
use cimage_core::platform::Platform;

/// Content digest of a layer's uncompressed tar stream.
pub type LayerId = Digest;

/// Media type recorded for registered layers.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Kind of build step that produced an image layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepKind {
    From,
    Base,
    Copy,
    Run,
    Cmd,
    Env,
    Arg,
    Label,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::From => "FROM",
            StepKind::Base => "BASE",
            StepKind::Copy => "COPY",
            StepKind::Run => "RUN",
            StepKind::Cmd => "CMD",
            StepKind::Env => "ENV",
            StepKind::Arg => "ARG",
            StepKind::Label => "LABEL",
        }
    }

    /// Whether executing this step can produce file content.
    pub fn produces_content(&self) -> bool {
        matches!(self, StepKind::Copy | StepKind::Run | StepKind::Base)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = CimageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FROM" => Ok(StepKind::From),
            "BASE" => Ok(StepKind::Base),
            "COPY" => Ok(StepKind::Copy),
            "RUN" => Ok(StepKind::Run),
            "CMD" => Ok(StepKind::Cmd),
            "ENV" => Ok(StepKind::Env),
            "ARG" => Ok(StepKind::Arg),
            "LABEL" => Ok(StepKind::Label),
            _ => Err(CimageError::BuildError(format!("unknown step kind '{}'", s))),
        }
    }
}

/// One ordered entry of an image: the step that produced it and, if the
/// step produced files, the resulting layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LayerId>,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub value: String,
}

impl ImageLayer {
    pub fn new(kind: StepKind, value: impl Into<String>, id: Option<LayerId>) -> Self {
        Self {
            id,
            kind,
            value: value.into(),
        }
    }
}

/// A list value split into what was inherited and what this image adds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InheritedList {
    pub parent: Vec<String>,
    pub current: Vec<String>,
}

impl InheritedList {
    /// `current` overrides `parent` when set.
    pub fn effective(&self) -> &[String] {
        if self.current.is_empty() {
            &self.parent
        } else {
            &self.current
        }
    }
}

/// A map value split into what was inherited and what this image adds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InheritedMap {
    pub parent: BTreeMap<String, String>,
    pub current: BTreeMap<String, String>,
}

impl InheritedMap {
    /// `current` entries win over `parent` entries with the same key.
    pub fn merged(&self) -> BTreeMap<String, String> {
        let mut merged = self.parent.clone();
        merged.extend(self.current.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub cmd: InheritedList,
    pub args: InheritedMap,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(default)]
    pub id: String,
    pub platform: Platform,
    #[serde(default)]
    pub layers: Vec<ImageLayer>,
    #[serde(default)]
    pub image_config: ImageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A named, single-platform image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub spec: ImageSpec,
}

impl Image {
    pub fn new(name: impl Into<String>, platform: Platform, layers: Vec<ImageLayer>) -> Self {
        Self {
            name: name.into(),
            spec: ImageSpec {
                id: String::new(),
                platform,
                layers,
                image_config: ImageConfig::default(),
                created_at: None,
            },
        }
    }

    /// Hex digest of the serialized image with its own id blanked.
    pub fn compute_id(&self) -> Result<String> {
        let mut unnamed = self.clone();
        unnamed.spec.id = String::new();
        let data = serde_yaml::to_string(&unnamed)?;
        Ok(Digest::from_bytes(data.as_bytes()).hex().to_string())
    }

    /// Layer IDs of the entries that produced files, in image order.
    pub fn layer_ids(&self) -> impl Iterator<Item = &LayerId> {
        self.spec.layers.iter().filter_map(|l| l.id.as_ref())
    }
}

/// Index entry for one platform variant of a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    pub id: String,
    pub size: u64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub platform: Platform,
}

/// All platform variants stored under one name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(default)]
    pub manifests: Vec<ManifestDescriptor>,
}

impl ManifestList {
    /// The descriptor matching `platform`, compared by normalized value.
    pub fn find(&self, platform: &Platform) -> Option<&ManifestDescriptor> {
        self.manifests.iter().find(|m| m.platform.matches(platform))
    }

    /// Replace the descriptor for the same platform in place, or append.
    pub fn upsert(&mut self, descriptor: ManifestDescriptor) {
        match self
            .manifests
            .iter_mut()
            .find(|m| m.platform.matches(&descriptor.platform))
        {
            Some(existing) => *existing = descriptor,
            None => self.manifests.push(descriptor),
        }
    }

    /// Remove the descriptor for `platform`; returns whether one was removed.
    pub fn remove(&mut self, platform: &Platform) -> bool {
        let before = self.manifests.len();
        self.manifests.retain(|m| !m.platform.matches(platform));
        self.manifests.len() != before
    }
}

/// The whole name → manifest list index.
pub type ImageMetadataMap = BTreeMap<String, ManifestList>;

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_id(content: &[u8]) -> LayerId {
        Digest::from_bytes(content)
    }

    fn descriptor(id: &str, platform: Platform) -> ManifestDescriptor {
        ManifestDescriptor {
            id: id.to_string(),
            size: 1,
            created_at: Utc::now(),
            platform,
        }
    }

    #[test]
    fn test_step_kind_serde_uppercase() {
        let layer = ImageLayer::new(StepKind::Copy, "a b", None);
        let yaml = serde_yaml::to_string(&layer).unwrap();
        assert!(yaml.contains("type: COPY"));
        assert!(!yaml.contains("id:"));

        let parsed: ImageLayer = serde_yaml::from_str("type: CMD\nvalue: echo hi\n").unwrap();
        assert_eq!(parsed.kind, StepKind::Cmd);
        assert!(serde_yaml::from_str::<ImageLayer>("type: BOGUS\nvalue: x\n").is_err());
    }

    #[test]
    fn test_step_kind_from_str() {
        assert_eq!("run".parse::<StepKind>().unwrap(), StepKind::Run);
        assert!("nope".parse::<StepKind>().is_err());
    }

    #[test]
    fn test_compute_id_ignores_existing_id() {
        let mut image = Image::new(
            "demo:v1",
            Platform::new("linux", "amd64", ""),
            vec![ImageLayer::new(StepKind::Copy, "a b", Some(layer_id(b"x")))],
        );
        let id = image.compute_id().unwrap();
        assert_eq!(id.len(), 64);

        image.spec.id = id.clone();
        assert_eq!(image.compute_id().unwrap(), id);

        image.spec.layers[0].value = "a c".to_string();
        assert_ne!(image.compute_id().unwrap(), id);
    }

    #[test]
    fn test_layer_ids_skip_empty_entries() {
        let image = Image::new(
            "demo:v1",
            Platform::new("linux", "amd64", ""),
            vec![
                ImageLayer::new(StepKind::Copy, "a b", Some(layer_id(b"1"))),
                ImageLayer::new(StepKind::Cmd, "echo hi", None),
                ImageLayer::new(StepKind::Run, "make", Some(layer_id(b"2"))),
            ],
        );
        let ids: Vec<_> = image.layer_ids().cloned().collect();
        assert_eq!(ids, vec![layer_id(b"1"), layer_id(b"2")]);
    }

    #[test]
    fn test_manifest_list_upsert_replaces_same_platform() {
        let mut list = ManifestList::default();
        list.upsert(descriptor("one", Platform::new("linux", "amd64", "")));
        list.upsert(descriptor("two", Platform::new("linux", "x86_64", "")));
        list.upsert(descriptor("three", Platform::new("linux", "arm64", "")));

        assert_eq!(list.manifests.len(), 2);
        assert_eq!(list.manifests[0].id, "two");
        assert_eq!(
            list.find(&Platform::new("linux", "aarch64", "")).unwrap().id,
            "three"
        );
        assert!(list.remove(&Platform::new("linux", "amd64", "")));
        assert!(!list.remove(&Platform::new("linux", "amd64", "")));
        assert_eq!(list.manifests.len(), 1);
    }

    #[test]
    fn test_inherited_values() {
        let cmd = InheritedList {
            parent: vec!["a".to_string()],
            current: vec![],
        };
        assert_eq!(cmd.effective(), &["a".to_string()]);

        let mut args = InheritedMap::default();
        args.parent.insert("K".to_string(), "old".to_string());
        args.current.insert("K".to_string(), "new".to_string());
        assert_eq!(args.merged()["K"], "new");
    }
}
