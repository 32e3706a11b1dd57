use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the five embedding spaces every item is embedded in.
///
/// `Full` embeds the whole garment image; the four mask spaces each embed one
/// body-region mask of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpaceId {
    Full,
    Mask1,
    Mask2,
    Mask3,
    Mask4,
}

impl SpaceId {
    pub const COUNT: usize = 5;

    pub const ALL: [SpaceId; Self::COUNT] = [
        SpaceId::Full,
        SpaceId::Mask1,
        SpaceId::Mask2,
        SpaceId::Mask3,
        SpaceId::Mask4,
    ];

    /// Spaces eligible for the ensemble pick.
    pub const MASKS: [SpaceId; 4] = [SpaceId::Mask1, SpaceId::Mask2, SpaceId::Mask3, SpaceId::Mask4];

    /// Position in [`SpaceId::ALL`], used for per-space arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpaceId::Full => "full",
            SpaceId::Mask1 => "mask-1",
            SpaceId::Mask2 => "mask-2",
            SpaceId::Mask3 => "mask-3",
            SpaceId::Mask4 => "mask-4",
        }
    }

    /// Key naming the persisted artifact of this space's primary index.
    pub fn artifact_key(self) -> &'static str {
        match self {
            SpaceId::Full => "full_index",
            SpaceId::Mask1 => "mask_1_index",
            SpaceId::Mask2 => "mask_2_index",
            SpaceId::Mask3 => "mask_3_index",
            SpaceId::Mask4 => "mask_4_index",
        }
    }

    /// Default file name of this space's embedding export.
    pub fn export_file_name(self) -> &'static str {
        match self {
            SpaceId::Full => "full_embeddings.csv",
            SpaceId::Mask1 => "mask_1_embeddings.csv",
            SpaceId::Mask2 => "mask_2_embeddings.csv",
            SpaceId::Mask3 => "mask_3_embeddings.csv",
            SpaceId::Mask4 => "mask_4_embeddings.csv",
        }
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(SpaceId::Full),
            "mask-1" | "mask1" | "mask_1" => Ok(SpaceId::Mask1),
            "mask-2" | "mask2" | "mask_2" => Ok(SpaceId::Mask2),
            "mask-3" | "mask3" | "mask_3" => Ok(SpaceId::Mask3),
            "mask-4" | "mask4" | "mask_4" => Ok(SpaceId::Mask4),
            other => Err(Error::UnknownSpace(other.to_string())),
        }
    }
}

/// Distance metric of a space. Fixed per space for both build and query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    /// Euclidean distance between unit-normalized vectors, `sqrt(2 - 2cos)`.
    #[default]
    Angular,
}

impl Metric {
    /// Distance between two vectors already prepared with [`Metric::prepare`].
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => crate::simd::squared_l2_simd(a, b).sqrt(),
            Metric::Angular => {
                let cos = crate::simd::dot_product_simd(a, b);
                (2.0 - 2.0 * cos).max(0.0).sqrt()
            }
        }
    }

    /// Angular spaces store and query unit vectors.
    #[inline]
    pub fn prepare(self, data: &mut [f32]) {
        if self == Metric::Angular {
            let norm = crate::simd::norm_simd(data);
            if norm > f32::EPSILON {
                let inv = 1.0 / norm;
                data.iter_mut().for_each(|x| *x *= inv);
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Angular => f.write_str("angular"),
        }
    }
}

/// An embedding space: identifier, dimensionality and metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub id: SpaceId,
    pub dim: usize,
    pub metric: Metric,
}

impl EmbeddingSpace {
    pub fn new(id: SpaceId, dim: usize, metric: Metric) -> Self {
        Self { id, dim, metric }
    }

    pub fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.dim {
            return Err(Error::InvalidDimension {
                expected: self.dim,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_round_trip_names() {
        for space in SpaceId::ALL {
            assert_eq!(space.as_str().parse::<SpaceId>().unwrap(), space);
            assert_eq!(SpaceId::ALL[space.index()], space);
        }
        assert!("mask-5".parse::<SpaceId>().is_err());
        assert!(!SpaceId::MASKS.contains(&SpaceId::Full));
    }

    #[test]
    fn test_angular_distance() {
        let metric = Metric::Angular;
        let mut a = vec![2.0, 0.0];
        let mut b = vec![0.0, 5.0];
        metric.prepare(&mut a);
        metric.prepare(&mut b);
        assert!((metric.distance(&a, &a)).abs() < 1e-3);
        assert!((metric.distance(&a, &b) - 2.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_euclidean_distance() {
        let metric = Metric::Euclidean;
        let mut a = vec![0.0, 0.0];
        metric.prepare(&mut a);
        assert_eq!(a, vec![0.0, 0.0]);
        assert!((metric.distance(&a, &[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_dim() {
        let space = EmbeddingSpace::new(SpaceId::Mask2, 64, Metric::Angular);
        assert!(space.check_dim(64).is_ok());
        assert!(matches!(
            space.check_dim(3),
            Err(Error::InvalidDimension { expected: 64, actual: 3 })
        ));
    }
}
