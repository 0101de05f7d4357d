use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{Layer, LayerKind, StoredClassifierGraph};
use crate::error::{Result, malformed};

const FORMAT_TAG: &str = "pose-scroll/classifier-graph";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct GraphDocument {
    format: String,
    version: u32,
    embedding_dim: usize,
    layers: Vec<LayerRecord>,
    weights_path: String,
    weights_manifest: Vec<WeightSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "class_name")]
enum LayerRecord {
    InputLayer {
        name: String,
        width: usize,
    },
    Dense {
        name: String,
        units: usize,
        #[serde(default)]
        occupied: usize,
    },
    Concatenate {
        name: String,
        axis: usize,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WeightSpec {
    name: String,
    shape: Vec<usize>,
}

impl WeightSpec {
    fn len(&self) -> Result<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| malformed(format!("weight {:?} has an oversized shape", self.name)))
    }
}

/// `model.json` stores its weights in `model.weights.bin` alongside it.
pub fn weights_path_for(json_path: &Path) -> PathBuf {
    let stem = json_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "classifier".to_string());
    json_path.with_file_name(format!("{stem}.weights.bin"))
}

pub fn save_graph(graph: &StoredClassifierGraph, json_path: &Path) -> Result<()> {
    let weights_path = weights_path_for(json_path);
    let mut layers = Vec::with_capacity(graph.layers.len());
    let mut manifest = Vec::new();
    let mut blob = Vec::new();

    for layer in &graph.layers {
        let name = layer.name.clone();
        match &layer.kind {
            LayerKind::Input { width } => layers.push(LayerRecord::InputLayer {
                name,
                width: *width,
            }),
            LayerKind::Concatenate { axis } => {
                layers.push(LayerRecord::Concatenate { name, axis: *axis })
            }
            LayerKind::Dense {
                units,
                kernel,
                bias,
                occupied,
            } => {
                manifest.push(WeightSpec {
                    name: format!("{name}/kernel"),
                    shape: vec![kernel.len() / (*units).max(1), *units],
                });
                manifest.push(WeightSpec {
                    name: format!("{name}/bias"),
                    shape: vec![bias.len()],
                });
                encode_f32_le(kernel, &mut blob);
                encode_f32_le(bias, &mut blob);
                layers.push(LayerRecord::Dense {
                    name,
                    units: *units,
                    occupied: *occupied,
                });
            }
        }
    }

    let document = GraphDocument {
        format: FORMAT_TAG.to_string(),
        version: FORMAT_VERSION,
        embedding_dim: graph.embedding_dim,
        layers,
        weights_path: weights_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        weights_manifest: manifest,
    };

    if let Some(parent) = json_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&weights_path, &blob)?;
    let mut writer = BufWriter::new(File::create(json_path)?);
    serde_json::to_writer_pretty(&mut writer, &document)?;
    writer.flush()?;

    log::info!(
        "saved classifier graph ({} layers, {} weight bytes) to {}",
        graph.layers.len(),
        blob.len(),
        json_path.display()
    );
    Ok(())
}

pub fn load_graph(json_path: &Path) -> Result<StoredClassifierGraph> {
    let document: GraphDocument = serde_json::from_reader(BufReader::new(File::open(json_path)?))?;
    if document.format != FORMAT_TAG || document.version != FORMAT_VERSION {
        return Err(malformed(format!(
            "unsupported document format {} v{}",
            document.format, document.version
        )));
    }

    let weights_path = json_path.with_file_name(sibling_file_name(&document.weights_path)?);
    let values = decode_f32_le_blob(&fs::read(&weights_path)?)?;
    let expected = document
        .weights_manifest
        .iter()
        .try_fold(0usize, |total, spec| {
            total
                .checked_add(spec.len()?)
                .ok_or_else(|| malformed("weights manifest total overflows"))
        })?;
    if values.len() != expected {
        return Err(malformed(format!(
            "weight blob holds {} values, manifest lists {expected}",
            values.len()
        )));
    }

    let mut weights: HashMap<String, Vec<f32>> = HashMap::new();
    let mut offset = 0;
    for spec in &document.weights_manifest {
        let len = spec.len()?;
        weights.insert(spec.name.clone(), values[offset..offset + len].to_vec());
        offset += len;
    }

    let mut layers = Vec::with_capacity(document.layers.len());
    for record in document.layers {
        let layer = match record {
            LayerRecord::InputLayer { name, width } => Layer {
                name,
                kind: LayerKind::Input { width },
            },
            LayerRecord::Concatenate { name, axis } => Layer {
                name,
                kind: LayerKind::Concatenate { axis },
            },
            LayerRecord::Dense {
                name,
                units,
                occupied,
            } => {
                let kernel = take_weight(&mut weights, &name, "kernel")?;
                let bias = take_weight(&mut weights, &name, "bias")?;
                Layer {
                    name,
                    kind: LayerKind::Dense {
                        units,
                        kernel,
                        bias,
                        occupied,
                    },
                }
            }
        };
        layers.push(layer);
    }

    Ok(StoredClassifierGraph {
        embedding_dim: document.embedding_dim,
        layers,
    })
}

// The weight blob must sit next to the document.
fn sibling_file_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(malformed(format!("weights path {name:?} is not a plain file name"))),
    }
}

fn take_weight(
    weights: &mut HashMap<String, Vec<f32>>,
    layer: &str,
    slot: &str,
) -> Result<Vec<f32>> {
    weights
        .remove(&format!("{layer}/{slot}"))
        .ok_or_else(|| malformed(format!("layer {layer:?} has no {slot} weights")))
}

fn encode_f32_le(values: &[f32], out: &mut Vec<u8>) {
    out.reserve(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn decode_f32_le_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(malformed("weight blob length is not a multiple of 4 bytes"));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifier::ExampleClassifier,
        codec::{decode, encode, restore},
        error::ClassifierError,
        types::Embedding,
    };
    use tempfile::tempdir;

    fn sample_classifier() -> ExampleClassifier {
        let mut knn = ExampleClassifier::new(4, 4);
        for i in 0..3 {
            knn.add_example(Embedding::new(vec![i as f32, 0.5, -1.0, 2.0]), 1)
                .unwrap();
        }
        knn.add_example(Embedding::new(vec![0.25, 0.75, 0.0, -0.5]), 3)
            .unwrap();
        knn
    }

    #[test]
    fn weights_file_sits_next_to_document() {
        assert_eq!(
            weights_path_for(Path::new("model/classifiermodel.json")),
            PathBuf::from("model/classifiermodel.weights.bin")
        );
    }

    #[test]
    fn saved_graph_loads_back_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("classifiermodel.json");
        let graph = encode(&sample_classifier()).unwrap();

        save_graph(&graph, &path).unwrap();
        assert!(weights_path_for(&path).exists());

        let loaded = load_graph(&path).unwrap();
        assert_eq!(loaded, graph);

        let mut restored = ExampleClassifier::new(4, 4);
        restore(&mut restored, &loaded).unwrap();
        assert_eq!(restored.example_count(1), 3);
        assert_eq!(restored.example_count(3), 1);
        assert_eq!(decode(&loaded).unwrap(), sample_classifier().export_sets());
    }

    #[test]
    fn truncated_blob_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("classifiermodel.json");
        save_graph(&encode(&sample_classifier()).unwrap(), &path).unwrap();

        let weights = weights_path_for(&path);
        let mut blob = fs::read(&weights).unwrap();
        blob.truncate(blob.len() - 8);
        fs::write(&weights, blob).unwrap();

        assert!(matches!(
            load_graph(&path),
            Err(ClassifierError::MalformedGraph(_))
        ));
    }

    #[test]
    fn missing_weight_entry_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("classifiermodel.json");
        save_graph(&encode(&sample_classifier()).unwrap(), &path).unwrap();

        let mut document: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        document["weights_manifest"][1]["name"] = "class_1/renamed".into();
        fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

        assert!(matches!(
            load_graph(&path),
            Err(ClassifierError::MalformedGraph(_))
        ));
    }

    fn rewrite_document(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut document: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        edit(&mut document);
        fs::write(path, serde_json::to_string(&document).unwrap()).unwrap();
    }

    #[test]
    fn oversized_manifest_shape_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("classifiermodel.json");
        save_graph(&encode(&sample_classifier()).unwrap(), &path).unwrap();
        fs::write(weights_path_for(&path), [0u8; 8]).unwrap();

        let huge = u64::from(u32::MAX) + 1;
        rewrite_document(&path, |document| {
            document["weights_manifest"] = serde_json::json!([
                { "name": "class_1/kernel", "shape": [huge, huge] },
            ]);
        });
        assert!(matches!(
            load_graph(&path),
            Err(ClassifierError::MalformedGraph(_))
        ));

        rewrite_document(&path, |document| {
            document["weights_manifest"] = serde_json::json!([
                { "name": "class_1/kernel", "shape": [usize::MAX] },
                { "name": "class_1/bias", "shape": [2] },
            ]);
        });
        assert!(matches!(
            load_graph(&path),
            Err(ClassifierError::MalformedGraph(_))
        ));
    }

    #[test]
    fn weights_path_outside_the_document_folder_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("classifiermodel.json");
        save_graph(&encode(&sample_classifier()).unwrap(), &path).unwrap();

        for escape in ["../classifiermodel.weights.bin", "/etc/passwd", "nested/x.bin", ""] {
            rewrite_document(&path, |document| document["weights_path"] = escape.into());
            assert!(
                matches!(load_graph(&path), Err(ClassifierError::MalformedGraph(_))),
                "{escape:?} was accepted"
            );
        }
    }

    #[test]
    fn missing_document_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_graph(&dir.path().join("absent.json")),
            Err(ClassifierError::Io(_))
        ));
    }
}
