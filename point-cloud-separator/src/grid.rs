/// Bucketed spatial grid over planar extents.
use std::collections::HashMap;

use crate::bounds::Extent;

/// Integer bucket coordinate, `floor(coord / bucket_size)` per axis.
pub type BucketKey = (i64, i64);

/// Immutable spatial grid. Safe to share across threads for reads.
///
/// Items are registered in every bucket their extent overlaps, so a point
/// query only has to look at one bucket. Queries return candidates: exact
/// containment is left to the caller, radius queries apply an exact distance
/// filter against the item extent.
#[derive(Debug)]
pub struct SpatialGrid<T> {
    bucket_size: f64,
    items: Vec<T>,
    extents: Vec<Extent>,
    buckets: HashMap<BucketKey, Vec<usize>>,
}

impl<T> SpatialGrid<T> {
    /// Build the grid from items and a function returning each item's extent.
    ///
    /// Items with an empty or non-finite extent are kept in `items()` but are
    /// never returned by a query.
    pub fn build<I, F>(items: I, extent_fn: F, bucket_size: f64) -> Self
    where
        I: IntoIterator<Item = T>,
        F: Fn(&T) -> Extent,
    {
        assert!(
            bucket_size.is_finite() && bucket_size > 0.0,
            "bucket size must be positive"
        );

        let items: Vec<T> = items.into_iter().collect();
        let extents: Vec<Extent> = items.iter().map(&extent_fn).collect();
        let mut buckets: HashMap<BucketKey, Vec<usize>> = HashMap::new();

        for (index, extent) in extents.iter().enumerate() {
            if extent.is_empty() || !is_finite(extent) {
                continue;
            }
            let (min_bx, min_by) = bucket_key(extent.min_x, extent.min_y, bucket_size);
            let (max_bx, max_by) = bucket_key(extent.max_x, extent.max_y, bucket_size);
            for bx in min_bx..=max_bx {
                for by in min_by..=max_by {
                    buckets.entry((bx, by)).or_default().push(index);
                }
            }
        }

        Self {
            bucket_size,
            items,
            extents,
            buckets,
        }
    }

    /// Bucket containing a coordinate.
    pub fn bucket_of(&self, x: f64, y: f64) -> BucketKey {
        bucket_key(x, y, self.bucket_size)
    }

    /// Items whose extent overlaps the bucket containing the coordinate.
    pub fn query_point(&self, x: f64, y: f64) -> impl Iterator<Item = &T> + '_ {
        self.buckets
            .get(&self.bucket_of(x, y))
            .into_iter()
            .flatten()
            .map(move |&index| &self.items[index])
    }

    /// Items whose extent lies within `radius` of the coordinate.
    ///
    /// Scans every bucket within `ceil(radius / bucket_size)` of the query
    /// bucket, then filters by Euclidean distance to the item extent.
    pub fn query_range(&self, x: f64, y: f64, radius: f64) -> impl Iterator<Item = &T> + '_ {
        let mut hits: Vec<usize> = Vec::new();

        if radius >= 0.0 && radius.is_finite() {
            let (qx, qy) = self.bucket_of(x, y);
            let reach = (radius / self.bucket_size).ceil() as i64;
            let radius_squared = radius * radius;

            let within = |index: &usize| {
                distance_squared(&self.extents[*index], x, y) <= radius_squared
            };

            // A window wider than the populated grid is cheaper to replace by
            // a scan over the occupied buckets.
            let window = (2 * reach as u128 + 1).saturating_pow(2);
            if window > self.buckets.len() as u128 {
                for indices in self.buckets.values() {
                    hits.extend(indices.iter().copied().filter(within));
                }
            } else {
                for bx in qx.saturating_sub(reach)..=qx.saturating_add(reach) {
                    for by in qy.saturating_sub(reach)..=qy.saturating_add(reach) {
                        let Some(indices) = self.buckets.get(&(bx, by)) else {
                            continue;
                        };
                        hits.extend(indices.iter().copied().filter(within));
                    }
                }
            }

            // Multi-bucket items show up once per overlapped bucket.
            hits.sort_unstable();
            hits.dedup();
        }

        hits.into_iter().map(move |index| &self.items[index])
    }

    /// All indexed items in insertion order.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of non-empty buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_size(&self) -> f64 {
        self.bucket_size
    }
}

fn bucket_key(x: f64, y: f64, bucket_size: f64) -> BucketKey {
    (
        (x / bucket_size).floor() as i64,
        (y / bucket_size).floor() as i64,
    )
}

fn is_finite(extent: &Extent) -> bool {
    extent.min_x.is_finite()
        && extent.max_x.is_finite()
        && extent.min_y.is_finite()
        && extent.max_y.is_finite()
}

/// Squared planar distance from a coordinate to the nearest point of an extent.
fn distance_squared(extent: &Extent, x: f64, y: f64) -> f64 {
    let dx = (extent.min_x - x).max(0.0).max(x - extent.max_x);
    let dy = (extent.min_y - y).max(0.0).max(y - extent.max_y);
    dx * dx + dy * dy
}
