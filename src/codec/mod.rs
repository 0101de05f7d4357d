mod storage;

use std::collections::BTreeMap;

pub use self::storage::{load_graph, save_graph, weights_path_for};

use crate::{
    classifier::{ExampleClassifier, ExampleSet},
    error::{ClassifierError, Result, malformed},
    types::Label,
};

/// Columns in each branch kernel; also the most examples a label can persist.
pub const BRANCH_CAPACITY: usize = 1000;
/// Every label contributes one input layer and one dense branch.
pub const LAYERS_PER_BRANCH: usize = 2;
/// The concatenate layer and the final reduction follow the branches.
pub const TRAILING_LAYERS: usize = 2;

const BRANCH_PREFIX: &str = "class_";
const INPUT_PREFIX: &str = "input_";
pub(crate) const CONCAT_NAME: &str = "concatenate";
pub(crate) const REDUCTION_NAME: &str = "reduction";

#[derive(Clone, Debug, PartialEq)]
pub enum LayerKind {
    Input {
        width: usize,
    },
    /// `kernel` is `[kernel.len() / units, units]`, row-major.
    Dense {
        units: usize,
        kernel: Vec<f32>,
        bias: Vec<f32>,
        occupied: usize,
    },
    Concatenate {
        axis: usize,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
}

/// Dense-graph form of an [`ExampleClassifier`]: inputs, then branches, then
/// the concatenate and reduction layers.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredClassifierGraph {
    pub embedding_dim: usize,
    pub layers: Vec<Layer>,
}

pub const fn layer_count_for(branches: usize) -> usize {
    branches * LAYERS_PER_BRANCH + TRAILING_LAYERS
}

pub fn branch_count_for(total_layers: usize) -> Result<usize> {
    let branch_layers = total_layers
        .checked_sub(TRAILING_LAYERS)
        .ok_or_else(|| {
            malformed(format!(
                "{total_layers} layers cannot hold the trailing layers"
            ))
        })?;
    if branch_layers % LAYERS_PER_BRANCH != 0 {
        return Err(malformed(format!(
            "{total_layers} layers do not split into input/branch pairs"
        )));
    }
    Ok(branch_layers / LAYERS_PER_BRANCH)
}

pub fn branch_name(label: Label) -> String {
    format!("{BRANCH_PREFIX}{label}")
}

fn label_from_branch_name(name: &str) -> Option<Label> {
    name.strip_prefix(BRANCH_PREFIX)?.parse().ok()
}

impl StoredClassifierGraph {
    pub fn branch_count(&self) -> Result<usize> {
        branch_count_for(self.layers.len())
    }

    pub fn branch_labels(&self) -> Result<Vec<Label>> {
        let branches = self.branch_count()?;
        self.layers[branches..2 * branches]
            .iter()
            .map(|layer| {
                label_from_branch_name(&layer.name).ok_or_else(|| {
                    malformed(format!("branch name {:?} carries no label", layer.name))
                })
            })
            .collect()
    }
}

pub fn encode(classifier: &ExampleClassifier) -> Result<StoredClassifierGraph> {
    let dim = classifier.embedding_dim();
    let sets = classifier.export_sets();
    if sets.is_empty() {
        return Err(ClassifierError::EmptyClassifier);
    }
    for (&label, set) in &sets {
        if set.len() > BRANCH_CAPACITY {
            return Err(ClassifierError::CapacityExceeded {
                label,
                count: set.len(),
                capacity: BRANCH_CAPACITY,
            });
        }
    }

    let mut layers = Vec::with_capacity(layer_count_for(sets.len()));
    layers.extend(sets.keys().map(|label| Layer {
        name: format!("{INPUT_PREFIX}{label}"),
        kind: LayerKind::Input { width: dim },
    }));
    layers.extend(sets.iter().map(|(&label, set)| Layer {
        name: branch_name(label),
        kind: LayerKind::Dense {
            units: BRANCH_CAPACITY,
            kernel: columns_from_set(set),
            bias: vec![1.0; BRANCH_CAPACITY],
            occupied: set.len(),
        },
    }));
    layers.push(Layer {
        name: CONCAT_NAME.to_string(),
        kind: LayerKind::Concatenate { axis: 1 },
    });
    layers.push(Layer {
        name: REDUCTION_NAME.to_string(),
        kind: LayerKind::Dense {
            units: 1,
            kernel: vec![0.0; sets.len() * BRANCH_CAPACITY],
            bias: vec![0.0],
            occupied: 0,
        },
    });

    Ok(StoredClassifierGraph {
        embedding_dim: dim,
        layers,
    })
}

pub fn decode(graph: &StoredClassifierGraph) -> Result<BTreeMap<Label, ExampleSet>> {
    let dim = graph.embedding_dim;
    if dim == 0 {
        return Err(malformed("embedding dimension is zero"));
    }
    let branches = graph.branch_count()?;
    let branch_start = branches;
    let branch_end = branches * LAYERS_PER_BRANCH;

    for layer in &graph.layers[..branch_start] {
        match layer.kind {
            LayerKind::Input { width } if width == dim => {}
            _ => {
                return Err(malformed(format!(
                    "layer {:?} is not a {dim}-wide input",
                    layer.name
                )));
            }
        }
    }
    check_trailing(graph, branches)?;

    let labels = graph.branch_labels()?;
    let mut sets = BTreeMap::new();
    for (layer, label) in graph.layers[branch_start..branch_end].iter().zip(labels) {
        let LayerKind::Dense {
            units,
            kernel,
            occupied,
            ..
        } = &layer.kind
        else {
            return Err(malformed(format!("branch {:?} is not a dense layer", layer.name)));
        };
        if *units != BRANCH_CAPACITY {
            return Err(malformed(format!(
                "branch {:?} has {units} units, expected {BRANCH_CAPACITY}",
                layer.name
            )));
        }
        if kernel.len() != dim * BRANCH_CAPACITY {
            return Err(malformed(format!(
                "branch {:?} kernel has {} weights, expected {}",
                layer.name,
                kernel.len(),
                dim * BRANCH_CAPACITY
            )));
        }
        if *occupied > BRANCH_CAPACITY {
            return Err(malformed(format!(
                "branch {:?} claims {occupied} examples",
                layer.name
            )));
        }
        let set = set_from_columns(dim, kernel, *occupied)?;
        if sets.insert(label, set).is_some() {
            return Err(malformed(format!("label {label} appears in two branches")));
        }
    }
    Ok(sets)
}

/// Decodes `graph` into a fresh classifier and swaps it in; on any error the
/// existing examples are left as they were.
pub fn restore(classifier: &mut ExampleClassifier, graph: &StoredClassifierGraph) -> Result<()> {
    let sets = decode(graph)?;
    let mut fresh = ExampleClassifier::new(classifier.embedding_dim(), classifier.num_classes());
    fresh.import_sets(sets)?;
    *classifier = fresh;
    Ok(())
}

fn check_trailing(graph: &StoredClassifierGraph, branches: usize) -> Result<()> {
    let concat = &graph.layers[branches * LAYERS_PER_BRANCH];
    if !matches!(concat.kind, LayerKind::Concatenate { .. }) {
        return Err(malformed(format!("layer {:?} should concatenate the branches", concat.name)));
    }
    let reduction = &graph.layers[branches * LAYERS_PER_BRANCH + 1];
    match &reduction.kind {
        LayerKind::Dense { units: 1, kernel, bias, .. }
            if kernel.len() == branches * BRANCH_CAPACITY && bias.len() == 1 =>
        {
            Ok(())
        }
        _ => Err(malformed(format!(
            "layer {:?} should reduce {} features to one output",
            reduction.name,
            branches * BRANCH_CAPACITY
        ))),
    }
}

fn columns_from_set(set: &ExampleSet) -> Vec<f32> {
    let dim = set.dim();
    let mut kernel = vec![0.0; dim * BRANCH_CAPACITY];
    for (col, row) in set.rows().enumerate() {
        for (r, value) in row.iter().enumerate() {
            kernel[r * BRANCH_CAPACITY + col] = *value;
        }
    }
    kernel
}

fn set_from_columns(dim: usize, kernel: &[f32], occupied: usize) -> Result<ExampleSet> {
    let mut values = Vec::with_capacity(dim * occupied);
    for col in 0..occupied {
        values.extend((0..dim).map(|r| kernel[r * BRANCH_CAPACITY + col]));
    }
    ExampleSet::from_rows(dim, values)
}
