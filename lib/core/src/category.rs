use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical clothing bucket a recommendation is balanced across.
///
/// Declaration order is the display order of result buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergedCategory {
    Hats,
    AllBody,
    Tops,
    Bottoms,
    Shoes,
    Bags,
    Accessories,
}

impl MergedCategory {
    pub const COUNT: usize = 7;

    pub const ALL: [MergedCategory; Self::COUNT] = [
        MergedCategory::Hats,
        MergedCategory::AllBody,
        MergedCategory::Tops,
        MergedCategory::Bottoms,
        MergedCategory::Shoes,
        MergedCategory::Bags,
        MergedCategory::Accessories,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergedCategory::Hats => "hats",
            MergedCategory::AllBody => "all-body",
            MergedCategory::Tops => "tops",
            MergedCategory::Bottoms => "bottoms",
            MergedCategory::Shoes => "shoes",
            MergedCategory::Bags => "bags",
            MergedCategory::Accessories => "accessories",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            MergedCategory::Hats => "Hats",
            MergedCategory::AllBody => "Full-Body",
            MergedCategory::Tops => "Tops",
            MergedCategory::Bottoms => "Bottoms",
            MergedCategory::Shoes => "Shoes",
            MergedCategory::Bags => "Bags",
            MergedCategory::Accessories => "Accessories",
        }
    }

    /// Merge a semantic category label into its bucket.
    ///
    /// Returns `None` when the merged label is not one of the seven buckets.
    pub fn from_label(label: &str) -> Option<Self> {
        match merge_label(label) {
            "hats" => Some(MergedCategory::Hats),
            "all-body" => Some(MergedCategory::AllBody),
            "tops" => Some(MergedCategory::Tops),
            "bottoms" => Some(MergedCategory::Bottoms),
            "shoes" => Some(MergedCategory::Shoes),
            "bags" => Some(MergedCategory::Bags),
            "accessories" => Some(MergedCategory::Accessories),
            _ => None,
        }
    }
}

/// The merge table: finer labels folded into a canonical one, everything
/// else passes through unchanged.
pub fn merge_label(label: &str) -> &str {
    match label {
        "scarves" | "sunglasses" | "jewellery" => "accessories",
        "outerwear" => "tops",
        other => other,
    }
}

impl fmt::Display for MergedCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergedCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MergedCategory::from_label(s).ok_or_else(|| Error::UnknownCategory(s.to_string()))
    }
}
