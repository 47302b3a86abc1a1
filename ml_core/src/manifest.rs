use std::{collections::HashMap, fs, path::Path};

use log::info;
use serde::Deserialize;

use crate::{DataError, Dataset, ImageInfo, Sample};

#[derive(Debug, Deserialize)]
struct RawManifest {
    images: Vec<RawImage>,
    #[serde(default)]
    annotations: Vec<RawAnnotation>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    id: u64,
    height: u32,
    width: u32,
}

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    image_id: u64,
    /// `[x, y, width, height]`.
    bbox: [f32; 4],
    category_id: u32,
    #[serde(default)]
    iscrowd: u8,
}

/// A detection dataset described by a COCO-style annotation file.
///
/// Only the metadata is held in memory: image sizes and boxes. Pixel
/// decoding belongs to the image pipeline of the model collaborator.
#[derive(Debug, Clone)]
pub struct ManifestDataset {
    samples: Vec<Sample>,
}

impl ManifestDataset {
    /// Loads `ann_file`, keeping images in file order.
    ///
    /// Crowd annotations and degenerate boxes are skipped.
    ///
    /// # Errors
    /// Returns `DataError` if the file cannot be read or parsed, or if an
    /// image declares a zero-sized edge.
    pub fn load<P: AsRef<Path>>(ann_file: P) -> Result<Self, DataError> {
        let ann_file = ann_file.as_ref();
        let content = fs::read_to_string(ann_file)?;
        let raw: RawManifest = serde_json::from_str(&content)?;

        let mut boxes_of: HashMap<u64, Vec<&RawAnnotation>> = HashMap::new();
        for ann in &raw.annotations {
            if ann.iscrowd != 0 || ann.bbox[2] <= 0.0 || ann.bbox[3] <= 0.0 {
                continue;
            }
            boxes_of.entry(ann.image_id).or_default().push(ann);
        }

        let samples = raw
            .images
            .iter()
            .map(|img| {
                if img.height == 0 || img.width == 0 {
                    return Err(DataError::InvalidSample(format!(
                        "image {} has a zero-sized edge",
                        img.id
                    )));
                }

                let anns = boxes_of.get(&img.id).map(Vec::as_slice).unwrap_or_default();
                Ok(Sample {
                    info: ImageInfo {
                        height: img.height,
                        width: img.width,
                    },
                    boxes: anns
                        .iter()
                        .map(|a| {
                            let [x, y, w, h] = a.bbox;
                            [x, y, x + w, y + h]
                        })
                        .collect(),
                    categories: anns.iter().map(|a| a.category_id).collect(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            images = samples.len(),
            annotations = raw.annotations.len();
            "loaded annotation manifest {}",
            ann_file.display()
        );

        Ok(Self { samples })
    }

    /// Builds a dataset from samples already in memory.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    fn get(&self, index: usize) -> Result<&Sample, DataError> {
        self.samples
            .get(index)
            .ok_or(DataError::OutOfBounds { index })
    }
}

impl Dataset for ManifestDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn image_info(&self, index: usize) -> Result<ImageInfo, DataError> {
        self.get(index).map(|s| s.info)
    }

    fn sample(&self, index: usize) -> Result<Sample, DataError> {
        self.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_images_and_boxes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "images": [
                    {{"id": 10, "height": 480, "width": 640, "file_name": "a.jpg"}},
                    {{"id": 11, "height": 640, "width": 480, "file_name": "b.jpg"}}
                ],
                "annotations": [
                    {{"image_id": 10, "bbox": [1, 2, 3, 4], "category_id": 7}},
                    {{"image_id": 10, "bbox": [0, 0, 5, 5], "category_id": 2, "iscrowd": 1}},
                    {{"image_id": 11, "bbox": [0, 0, 0, 5], "category_id": 2}}
                ]
            }}"#
        )
        .unwrap();

        let ds = ManifestDataset::load(file.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(
            ds.image_info(1).unwrap(),
            ImageInfo {
                height: 640,
                width: 480
            }
        );

        let first = ds.sample(0).unwrap();
        assert_eq!(first.boxes, vec![[1.0, 2.0, 4.0, 6.0]]);
        assert_eq!(first.categories, vec![7]);
        assert!(ds.sample(1).unwrap().boxes.is_empty());
        assert!(matches!(
            ds.sample(2),
            Err(DataError::OutOfBounds { index: 2 })
        ));
    }

    #[test]
    fn malformed_manifest_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"images\": 3}}").unwrap();
        assert!(matches!(
            ManifestDataset::load(file.path()),
            Err(DataError::Parse(_))
        ));
    }
}
