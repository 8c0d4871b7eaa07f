use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

/// Feature type tag of gene expression rows in a 10x feature list
pub const GENE_EXPRESSION: &str = "Gene Expression";

/// Feature indices grouped by feature type, in order of first appearance.
///
/// `indices[offsets[i]..offsets[i + 1]]` are the feature rows tagged with `labels[i]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTypes {
    labels: Vec<String>,
    offsets: Vec<usize>,
    indices: Vec<usize>,
}

impl FeatureTypes {
    /// Group a per-feature vector of type tags. Tags need not be contiguous.
    pub fn from_feature_types(feature_types: &[String]) -> Result<FeatureTypes, Error> {
        if feature_types.is_empty() {
            return Err(format_err!("no features found!"));
        }
        let mut labels: Vec<String> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, feature_type) in feature_types.iter().enumerate() {
            match labels.iter().position(|l| l == feature_type) {
                Some(idx) => groups[idx].push(i),
                None => {
                    labels.push(feature_type.clone());
                    groups.push(vec![i]);
                }
            }
        }
        let mut offsets = Vec::with_capacity(labels.len());
        let mut indices = Vec::with_capacity(feature_types.len());
        for group in groups {
            offsets.push(indices.len());
            indices.extend(group);
        }
        Ok(FeatureTypes {
            labels,
            offsets,
            indices,
        })
    }

    /// Every feature shares a single type tag.
    pub fn uniform(label: &str, num_features: usize) -> FeatureTypes {
        FeatureTypes {
            labels: vec![label.to_string()],
            offsets: vec![0],
            indices: (0..num_features).collect(),
        }
    }

    pub fn num_features(&self) -> usize {
        self.indices.len()
    }

    /// Returns the feature rows tagged with `label`, or None if the label is not present.
    pub fn get_indices(&self, label: &str) -> Option<&[usize]> {
        self.labels.iter().position(|x| x == label).map(|idx| {
            let start = self.offsets[idx];
            let end = self.offsets.get(idx + 1).copied().unwrap_or(self.indices.len());
            &self.indices[start..end]
        })
    }

    /// Restrict to the given feature rows (in their new order), renumbering them `0..rows.len()`.
    pub fn select(&self, rows: &[usize]) -> FeatureTypes {
        // group of each original feature row
        let mut group_of = vec![0; self.indices.len()];
        for (g, &start) in self.offsets.iter().enumerate() {
            let end = self.offsets.get(g + 1).copied().unwrap_or(self.indices.len());
            for &i in &self.indices[start..end] {
                if let Some(slot) = group_of.get_mut(i) {
                    *slot = g;
                }
            }
        }
        let tags = rows
            .iter()
            .map(|&r| match group_of.get(r) {
                Some(&g) => self.labels[g].clone(),
                None => String::new(),
            })
            .collect::<Vec<_>>();
        FeatureTypes::from_feature_types(&tags).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tags(v: &[&str]) -> Vec<String> {
        v.iter().map(std::string::ToString::to_string).collect()
    }

    #[test]
    fn test_grouping() {
        let ft = FeatureTypes::from_feature_types(&tags(&[
            GENE_EXPRESSION,
            GENE_EXPRESSION,
            "Antibody Capture",
            GENE_EXPRESSION,
            "CRISPR Guide Capture",
        ]))
        .unwrap();
        assert_eq!(ft.get_indices(GENE_EXPRESSION), Some(&[0, 1, 3][..]));
        assert_eq!(ft.get_indices("Antibody Capture"), Some(&[2][..]));
        assert_eq!(ft.get_indices("Peaks"), None);
        assert_eq!(ft.get_indices("CRISPR Guide Capture"), Some(&[4][..]));
        assert_eq!(ft.num_features(), 5);
    }

    #[test]
    fn test_select() {
        let ft = FeatureTypes::from_feature_types(&tags(&["a", "b", "a", "b"])).unwrap();
        let sub = ft.select(&[1, 2]);
        assert_eq!(sub.get_indices("b"), Some(&[0][..]));
        assert_eq!(sub.get_indices("a"), Some(&[1][..]));
        assert_eq!(sub.num_features(), 2);
    }

    #[test]
    fn test_select_many_rows() {
        let n = 200_000;
        let raw = (0..n)
            .map(|i| if i % 50 == 0 { "Peaks" } else { GENE_EXPRESSION }.to_string())
            .collect::<Vec<_>>();
        let ft = FeatureTypes::from_feature_types(&raw).unwrap();
        let rows = (0..n).rev().collect::<Vec<_>>();
        let sub = ft.select(&rows);
        assert_eq!(sub.num_features(), n);
        assert_eq!(sub.get_indices("Peaks").map(<[usize]>::len), Some(n / 50));
        // row n - 1 - 0 in the selection is original row 0
        assert_eq!(sub.get_indices("Peaks").and_then(|p| p.last()), Some(&(n - 1)));
    }

    #[test]
    fn test_empty() {
        assert!(FeatureTypes::from_feature_types(&[]).is_err());
        assert_eq!(FeatureTypes::uniform(GENE_EXPRESSION, 3).get_indices(GENE_EXPRESSION), Some(&[0, 1, 2][..]));
    }
}
