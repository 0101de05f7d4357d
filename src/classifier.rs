use std::collections::BTreeMap;

use crate::{
    error::{ClassifierError, Result},
    types::{Embedding, Label, Prediction},
};

/// Examples recorded for one label, stored row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct ExampleSet {
    dim: usize,
    values: Vec<f32>,
}

impl ExampleSet {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            values: Vec::new(),
        }
    }

    pub fn from_rows(dim: usize, values: Vec<f32>) -> Result<Self> {
        if dim == 0 || values.len() % dim != 0 {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                actual: values.len(),
            });
        }
        Ok(Self { dim, values })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.values.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(self.dim.max(1))
    }

    fn push(&mut self, row: &[f32]) {
        self.values.extend_from_slice(row);
    }
}

#[derive(Clone, Debug)]
pub struct ExampleClassifier {
    embedding_dim: usize,
    num_classes: usize,
    sets: BTreeMap<Label, ExampleSet>,
}

impl ExampleClassifier {
    pub fn new(embedding_dim: usize, num_classes: usize) -> Self {
        Self {
            embedding_dim,
            num_classes,
            sets: BTreeMap::new(),
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn add_example(&mut self, embedding: Embedding, label: Label) -> Result<()> {
        self.check_label(label)?;
        self.check_dim(embedding.len())?;
        self.sets
            .entry(label)
            .or_insert_with(|| ExampleSet::new(self.embedding_dim))
            .push(embedding.as_slice());
        Ok(())
    }

    pub fn class_count(&self) -> usize {
        self.sets.values().filter(|set| !set.is_empty()).count()
    }

    pub fn example_count(&self, label: Label) -> usize {
        self.sets.get(&label).map_or(0, ExampleSet::len)
    }

    pub fn example_counts(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|label| self.example_count(label))
            .collect()
    }

    pub fn total_examples(&self) -> usize {
        self.sets.values().map(ExampleSet::len).sum()
    }

    /// k-nearest-neighbour vote over every stored example using cosine distance.
    pub fn predict(&self, embedding: &Embedding, k: usize) -> Result<Prediction> {
        self.check_dim(embedding.len())?;
        let total = self.total_examples();
        if total == 0 {
            return Err(ClassifierError::EmptyClassifier);
        }

        let query = embedding.as_slice();
        let query_norm = norm(query);
        let mut neighbours: Vec<(f32, Label, usize)> = Vec::with_capacity(total);
        for (&label, set) in &self.sets {
            for (index, row) in set.rows().enumerate() {
                neighbours.push((cosine_distance(query, query_norm, row), label, index));
            }
        }
        neighbours.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let k = k.clamp(1, total);
        let mut votes: BTreeMap<Label, usize> = self
            .sets
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(&label, _)| (label, 0))
            .collect();
        for &(_, label, _) in &neighbours[..k] {
            *votes.entry(label).or_default() += 1;
        }

        // BTreeMap iterates labels ascending, so keeping strictly greater
        // counts leaves ties on the lowest label.
        let mut best = (0, 0);
        for (&label, &count) in &votes {
            if count > best.1 {
                best = (label, count);
            }
        }

        let confidences = votes
            .into_iter()
            .map(|(label, count)| (label, count as f32 / k as f32))
            .collect();
        Ok(Prediction {
            label: best.0,
            confidences,
        })
    }

    pub fn reset(&mut self) {
        self.sets.clear();
    }

    pub fn export_sets(&self) -> BTreeMap<Label, ExampleSet> {
        self.sets
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(&label, set)| (label, set.clone()))
            .collect()
    }

    /// Replaces every example set; nothing changes unless all sets are valid.
    pub fn import_sets(&mut self, sets: BTreeMap<Label, ExampleSet>) -> Result<()> {
        for (&label, set) in &sets {
            self.check_label(label)?;
            self.check_dim(set.dim())?;
        }
        self.sets = sets;
        Ok(())
    }

    fn check_label(&self, label: Label) -> Result<()> {
        if label >= self.num_classes {
            return Err(ClassifierError::UnknownLabel {
                label,
                num_classes: self.num_classes,
            });
        }
        Ok(())
    }

    fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.embedding_dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.embedding_dim,
                actual,
            });
        }
        Ok(())
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_distance(query: &[f32], query_norm: f32, example: &[f32]) -> f32 {
    let denom = query_norm * norm(example);
    if denom <= f32::EPSILON {
        return 1.0;
    }
    let dot: f32 = query.iter().zip(example).map(|(a, b)| a * b).sum();
    1.0 - dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn counts_follow_accepted_examples() {
        let mut knn = ExampleClassifier::new(3, 4);
        for _ in 0..5 {
            knn.add_example(emb(&[1.0, 0.0, 0.0]), 0).unwrap();
        }
        knn.add_example(emb(&[0.0, 1.0, 0.0]), 2).unwrap();

        assert_eq!(knn.example_count(0), 5);
        assert_eq!(knn.example_count(1), 0);
        assert_eq!(knn.example_count(2), 1);
        assert_eq!(knn.class_count(), 2);
        assert_eq!(knn.example_counts(), vec![5, 0, 1, 0]);
    }

    #[test]
    fn wrong_dimension_is_rejected_without_mutation() {
        let mut knn = ExampleClassifier::new(10, 4);
        knn.add_example(emb(&[0.5; 10]), 1).unwrap();

        let err = knn.add_example(emb(&[0.5; 5]), 1).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::DimensionMismatch {
                expected: 10,
                actual: 5
            }
        ));
        assert_eq!(knn.example_count(1), 1);
    }

    #[test]
    fn label_outside_class_range_is_rejected() {
        let mut knn = ExampleClassifier::new(2, 4);
        let err = knn.add_example(emb(&[1.0, 0.0]), 4).unwrap_err();
        assert!(matches!(err, ClassifierError::UnknownLabel { label: 4, .. }));
        assert_eq!(knn.class_count(), 0);
    }

    #[test]
    fn empty_classifier_cannot_predict() {
        let knn = ExampleClassifier::new(2, 4);
        assert!(matches!(
            knn.predict(&emb(&[1.0, 0.0]), 10),
            Err(ClassifierError::EmptyClassifier)
        ));
    }

    #[test]
    fn single_example_wins_with_full_confidence() {
        let mut knn = ExampleClassifier::new(3, 7);
        knn.add_example(emb(&[0.2, 0.4, 0.1]), 5).unwrap();

        for query in [[1.0, 0.0, 0.0], [-3.0, 2.0, 9.0], [0.0, 0.0, 0.0]] {
            let prediction = knn.predict(&emb(&query), 10).unwrap();
            assert_eq!(prediction.label, 5);
            assert_eq!(prediction.confidence(), 1.0);
        }
    }

    #[test]
    fn votes_are_shared_across_labels() {
        let mut knn = ExampleClassifier::new(2, 4);
        let e1 = [1.0, 0.0];
        let e2 = [0.9, 0.2];
        let e3 = [0.6, 0.8];
        knn.add_example(emb(&e1), 0).unwrap();
        knn.add_example(emb(&e2), 0).unwrap();
        knn.add_example(emb(&e3), 1).unwrap();

        let prediction = knn.predict(&emb(&[1.0, 0.01]), 3).unwrap();
        assert_eq!(prediction.label, 0);
        assert!((prediction.confidences[&0] - 0.667).abs() < 1e-3);
        assert!((prediction.confidences[&1] - 0.333).abs() < 1e-3);
    }

    #[test]
    fn nearest_example_decides_when_k_is_one() {
        let mut knn = ExampleClassifier::new(2, 4);
        knn.add_example(emb(&[1.0, 0.0]), 0).unwrap();
        knn.add_example(emb(&[0.0, 1.0]), 3).unwrap();

        let prediction = knn.predict(&emb(&[0.1, 0.9]), 1).unwrap();
        assert_eq!(prediction.label, 3);
        assert_eq!(prediction.confidences[&0], 0.0);
        assert_eq!(prediction.confidences[&3], 1.0);
    }

    #[test]
    fn tied_votes_pick_the_lowest_label() {
        let mut knn = ExampleClassifier::new(2, 4);
        knn.add_example(emb(&[0.0, 1.0]), 2).unwrap();
        knn.add_example(emb(&[1.0, 0.0]), 1).unwrap();

        let prediction = knn.predict(&emb(&[1.0, 1.0]), 2).unwrap();
        assert_eq!(prediction.label, 1);
        assert_eq!(prediction.confidences[&1], 0.5);
        assert_eq!(prediction.confidences[&2], 0.5);
    }

    #[test]
    fn import_replaces_instead_of_merging() {
        let mut knn = ExampleClassifier::new(2, 4);
        knn.add_example(emb(&[1.0, 0.0]), 0).unwrap();

        let mut sets = BTreeMap::new();
        sets.insert(3, ExampleSet::from_rows(2, vec![0.0, 1.0, 0.5, 0.5]).unwrap());
        knn.import_sets(sets).unwrap();

        assert_eq!(knn.example_count(0), 0);
        assert_eq!(knn.example_count(3), 2);
        assert_eq!(knn.class_count(), 1);
    }

    #[test]
    fn invalid_import_keeps_existing_sets() {
        let mut knn = ExampleClassifier::new(2, 4);
        knn.add_example(emb(&[1.0, 0.0]), 0).unwrap();

        let mut sets = BTreeMap::new();
        sets.insert(1, ExampleSet::from_rows(3, vec![0.0, 1.0, 0.0]).unwrap());
        assert!(knn.import_sets(sets).is_err());
        assert_eq!(knn.example_count(0), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut knn = ExampleClassifier::new(2, 4);
        knn.add_example(emb(&[1.0, 0.0]), 0).unwrap();
        knn.reset();
        assert_eq!(knn.class_count(), 0);
        assert!(knn.export_sets().is_empty());
    }
}
