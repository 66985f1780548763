//! Registry wire types: schema2 manifests, manifest lists and the config blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cimage_core::digest::Digest;
use cimage_core::error::{CimageError, Result};
use cimage_core::platform::Platform;

use crate::model::{Image, LayerId};

pub use crate::model::LAYER_MEDIA_TYPE;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Reference to a blob or manifest held by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, size: u64, digest: Digest) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            digest,
            platform: None,
        }
    }
}

/// Single-platform schema2 manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config,
            layers,
        }
    }
}

/// Multi-platform manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
            manifests,
        }
    }

    /// Entries whose platform matches `platform` after normalization.
    pub fn matching<'a>(&'a self, platform: &'a Platform) -> impl Iterator<Item = &'a Descriptor> + 'a {
        self.manifests
            .iter()
            .filter(move |d| d.platform.as_ref().is_some_and(|p| p.matches(platform)))
    }
}

/// A manifest body as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    pub body: Vec<u8>,
}

impl RawManifest {
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&self.body)
    }
}

/// Either kind of manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    Manifest(ImageManifest),
    List(ManifestList),
}

impl ManifestDocument {
    /// Decode a manifest body, dispatching on its media type.
    ///
    /// The `mediaType` field inside the body wins over the transport
    /// content type, which some registries report as plain JSON.
    pub fn parse(raw: &RawManifest) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Probe {
            #[serde(default)]
            media_type: Option<String>,
            #[serde(default)]
            manifests: Option<serde_json::Value>,
        }

        let probe: Probe = serde_json::from_slice(&raw.body)?;
        let media_type = probe.media_type.unwrap_or_else(|| raw.media_type.clone());
        let is_list = match media_type.as_str() {
            MEDIA_TYPE_MANIFEST_LIST | OCI_INDEX => true,
            MEDIA_TYPE_MANIFEST | OCI_MANIFEST => false,
            _ => probe.manifests.is_some(),
        };

        if is_list {
            Ok(ManifestDocument::List(serde_json::from_slice(&raw.body)?))
        } else {
            Ok(ManifestDocument::Manifest(serde_json::from_slice(&raw.body)?))
        }
    }
}

/// One entry of the config blob history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<LayerId>,
}

/// Container config blob wrapping the full image spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBlob {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<History>,
    pub rootfs: RootFs,
    pub image: Image,
}

impl ConfigBlob {
    pub fn from_image(image: &Image) -> Self {
        let platform = &image.spec.platform;
        let history = image
            .spec
            .layers
            .iter()
            .map(|layer| History {
                created: image.spec.created_at,
                created_by: format!("{} {}", layer.kind, layer.value),
                empty_layer: layer.id.is_none(),
            })
            .collect();

        Self {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            created: image.spec.created_at,
            history,
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: image.layer_ids().cloned().collect(),
            },
            image: image.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a config blob and check that its rootfs agrees with the image spec.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let blob: ConfigBlob = serde_json::from_slice(data)?;
        let ids: Vec<&LayerId> = blob.image.layer_ids().collect();
        if !blob.rootfs.diff_ids.is_empty() && blob.rootfs.diff_ids.iter().collect::<Vec<_>>() != ids {
            return Err(CimageError::CardinalityMismatch {
                context: "config rootfs diff_ids".to_string(),
                expected: ids.len(),
                actual: blob.rootfs.diff_ids.len(),
            });
        }
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageLayer, StepKind};

    fn image() -> Image {
        Image::new(
            "demo:v1",
            Platform::new("linux", "arm64", "v8"),
            vec![
                ImageLayer::new(StepKind::Copy, "a b", Some(Digest::from_bytes(b"d1"))),
                ImageLayer::new(StepKind::Cmd, "echo hi", None),
            ],
        )
    }

    #[test]
    fn test_config_blob_decorations() {
        let blob = ConfigBlob::from_image(&image());
        assert_eq!(blob.os, "linux");
        assert_eq!(blob.architecture, "arm64");
        assert_eq!(blob.rootfs.diff_ids, vec![Digest::from_bytes(b"d1")]);
        assert_eq!(blob.history.len(), 2);
        assert!(blob.history[1].empty_layer);
        assert_eq!(blob.history[0].created_by, "COPY a b");

        let decoded = ConfigBlob::decode(&blob.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.image, image());
    }

    #[test]
    fn test_config_blob_rejects_inconsistent_rootfs() {
        let mut blob = ConfigBlob::from_image(&image());
        blob.rootfs.diff_ids.push(Digest::from_bytes(b"extra"));
        let err = ConfigBlob::decode(&blob.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, CimageError::CardinalityMismatch { .. }));
    }

    #[test]
    fn test_parse_manifest_document() {
        let manifest = ImageManifest::new(
            Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, 10, Digest::from_bytes(b"config")),
            vec![Descriptor::new(LAYER_MEDIA_TYPE, 20, Digest::from_bytes(b"layer"))],
        );
        let raw = RawManifest {
            media_type: "application/json".to_string(),
            body: serde_json::to_vec(&manifest).unwrap(),
        };
        assert_eq!(ManifestDocument::parse(&raw).unwrap(), ManifestDocument::Manifest(manifest));

        let mut entry = Descriptor::new(MEDIA_TYPE_MANIFEST, 30, raw.digest());
        entry.platform = Some(Platform::new("linux", "amd64", ""));
        let list = ManifestList::new(vec![entry]);
        let raw = RawManifest {
            media_type: String::new(),
            body: serde_json::to_vec(&list).unwrap(),
        };
        assert_eq!(ManifestDocument::parse(&raw).unwrap(), ManifestDocument::List(list));
    }

    #[test]
    fn test_manifest_list_matching_normalizes() {
        let mut amd = Descriptor::new(MEDIA_TYPE_MANIFEST, 1, Digest::from_bytes(b"amd"));
        amd.platform = Some(Platform::new("linux", "amd64", ""));
        let mut arm = Descriptor::new(MEDIA_TYPE_MANIFEST, 1, Digest::from_bytes(b"arm"));
        arm.platform = Some(Platform::new("linux", "arm64", ""));
        let list = ManifestList::new(vec![amd, arm.clone()]);

        let wanted = Platform::new("linux", "aarch64", "");
        let found: Vec<_> = list.matching(&wanted).collect();
        assert_eq!(found, vec![&arm]);
    }

    #[test]
    fn test_descriptor_wire_format() {
        let d = Descriptor::new(LAYER_MEDIA_TYPE, 5, Digest::from_bytes(b"x"));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["mediaType"], LAYER_MEDIA_TYPE);
        assert!(json.get("platform").is_none());
    }
}
