use crate::category::MergedCategory;
use crate::space::SpaceId;
use crate::vector::Vector;
use crate::{Error, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable integer identifier of a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A garment with its labels and one embedding per space.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    /// Image name without extension, as keyed in the embedding exports.
    pub name: String,
    pub raw_category: String,
    pub semantic_category: String,
    category: MergedCategory,
    embeddings: [Vector; SpaceId::COUNT],
}

impl Item {
    /// The merged category is derived here, once, from `semantic_category`.
    pub fn new(
        id: ItemId,
        name: impl Into<String>,
        raw_category: impl Into<String>,
        semantic_category: impl Into<String>,
        embeddings: [Vector; SpaceId::COUNT],
    ) -> Result<Self> {
        let semantic_category = semantic_category.into();
        let category = MergedCategory::from_label(&semantic_category)
            .ok_or_else(|| Error::UnknownCategory(semantic_category.clone()))?;
        Ok(Self {
            id,
            name: name.into(),
            raw_category: raw_category.into(),
            semantic_category,
            category,
            embeddings,
        })
    }

    #[inline]
    pub fn category(&self) -> MergedCategory {
        self.category
    }

    #[inline]
    pub fn embedding(&self, space: SpaceId) -> &Vector {
        &self.embeddings[space.index()]
    }

    pub fn image_path(&self) -> String {
        format!("images/{}.jpg", self.name)
    }
}

/// The in-memory catalog: every ingested item, ordered by id.
#[derive(Debug, Default)]
pub struct Corpus {
    items: Vec<Item>,
    by_id: AHashMap<ItemId, usize>,
}

impl Corpus {
    pub fn new(mut items: Vec<Item>) -> Result<Self> {
        items.sort_unstable_by_key(|item| item.id);
        let mut by_id = AHashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            if by_id.insert(item.id, pos).is_some() {
                return Err(Error::DuplicateItem(item.id));
            }
        }
        Ok(Self { items, by_id })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.by_id.get(&id).map(|&pos| &self.items[pos])
    }

    #[inline]
    pub fn contains(&self, id: ItemId) -> bool {
        self.by_id.contains_key(&id)
    }

    #[inline]
    pub fn category(&self, id: ItemId) -> Option<MergedCategory> {
        self.get(id).map(Item::category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    /// `(id, vector)` pairs of one space in ascending id order.
    pub fn entries(&self, space: SpaceId) -> impl Iterator<Item = (ItemId, &[f32])> + '_ {
        self.items
            .iter()
            .map(move |item| (item.id, item.embedding(space).as_slice()))
    }

    pub fn category_counts(&self) -> [usize; MergedCategory::COUNT] {
        let mut counts = [0; MergedCategory::COUNT];
        for item in &self.items {
            counts[item.category().index()] += 1;
        }
        counts
    }
}
