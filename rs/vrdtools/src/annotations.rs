//! Relation annotation format.
//!
//! One JSON file per split holds a list of images. Each image lists its entities
//! (`annotations`) and the relations between them (`hoi_annotation`), where a
//! relation points at a subject and an object entity by index.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, VrdError};

/// Entity box, pixel coordinates in [x1, y1, x2, y2] format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAnnotation {
    pub bbox: [f32; 4],
    pub category_id: usize,
}

/// Relation between two entities of the same image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationAnnotation {
    pub subject_id: usize,
    pub object_id: usize,
    /// Relative distance label (index into the distance names).
    pub distance: usize,
    /// Occlusion label (index into the occlusion names).
    pub occlusion: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnnotation {
    pub file_name: String,
    /// Ids are kept as strings, matching the prediction table.
    #[serde(deserialize_with = "string_or_number")]
    pub image_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub annotations: Vec<EntityAnnotation>,
    #[serde(default)]
    pub hoi_annotation: Vec<RelationAnnotation>,
}

impl ImageAnnotation {
    /// Check that every relation points at an existing entity.
    pub fn validate(&self) -> Result<()> {
        for (i, rel) in self.hoi_annotation.iter().enumerate() {
            for entity in [rel.subject_id, rel.object_id] {
                if entity >= self.annotations.len() {
                    return Err(VrdError::MissingEntity {
                        image_id: self.image_id.clone(),
                        relation: i,
                        entity,
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve relations into (subject, object, relation) triples.
    pub fn relations(
        &self,
    ) -> impl Iterator<Item = (&EntityAnnotation, &EntityAnnotation, &RelationAnnotation)> {
        self.hoi_annotation.iter().filter_map(|rel| {
            let sub = self.annotations.get(rel.subject_id)?;
            let obj = self.annotations.get(rel.object_id)?;
            Some((sub, obj, rel))
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Int(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Int(i) => i.to_string(),
    })
}

/// Load and validate an annotation file.
pub fn load_annotations(path: &Path) -> Result<Vec<ImageAnnotation>> {
    let text = std::fs::read_to_string(path).map_err(|source| VrdError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let images: Vec<ImageAnnotation> =
        serde_json::from_str(&text).map_err(|source| VrdError::Json {
            path: path.display().to_string(),
            source,
        })?;
    for image in &images {
        image.validate()?;
    }
    tracing::debug!(path = %path.display(), images = images.len(), "loaded annotations");
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "file_name": "a.jpg",
            "image_id": 7,
            "width": 640,
            "height": 480,
            "annotations": [
                {"bbox": [0, 0, 10, 10], "category_id": 1},
                {"bbox": [5, 5, 20, 20], "category_id": 3}
            ],
            "hoi_annotation": [
                {"subject_id": 0, "object_id": 1, "distance": 2, "occlusion": 1}
            ]
        },
        {"file_name": "b.jpg", "image_id": "img_b"}
    ]"#;

    #[test]
    fn test_parse_annotations() {
        let images: Vec<ImageAnnotation> = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].image_id, "7");
        assert_eq!(images[1].image_id, "img_b");
        assert!(images[1].hoi_annotation.is_empty());

        let triples: Vec<_> = images[0].relations().collect();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].0.category_id, 1);
        assert_eq!(triples[0].1.category_id, 3);
        assert_eq!(triples[0].2.distance, 2);
    }

    #[test]
    fn test_missing_entity_is_rejected() {
        let image = ImageAnnotation {
            file_name: "c.jpg".into(),
            image_id: "c".into(),
            width: 1,
            height: 1,
            annotations: vec![],
            hoi_annotation: vec![RelationAnnotation {
                subject_id: 0,
                object_id: 0,
                distance: 0,
                occlusion: 0,
            }],
        };
        assert!(matches!(
            image.validate(),
            Err(VrdError::MissingEntity { entity: 0, .. })
        ));
    }

    #[test]
    fn test_load_annotations_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let images = load_annotations(&path).unwrap();
        assert_eq!(images[0].annotations.len(), 2);
    }
}
