//! Bulk ranges of tags.
//!
//! A range is either a *container* (each element is a tag and the step runs
//! once per element) or *self-dividing* (the leaf piece itself is the tag, see
//! [`Blocked`]).

use std::fmt::Debug;
use std::ops::Range;

use crate::types::Tag;

pub trait TagRange: Clone + Debug + Send + Sync + 'static {
    type Tag: Tag;

    /// Number of splittable units.
    fn size(&self) -> usize;

    /// Splits into `[0, mid)` and `[mid, size)`.
    fn split_at(&self, mid: usize) -> (Self, Self);

    /// Number of tags a leaf piece expands to.
    fn element_count(&self) -> usize {
        self.size()
    }

    /// The `i`-th tag of a leaf piece, `i < element_count()`.
    fn element(&self, i: usize) -> Self::Tag;
}

macro_rules! int_range {
    ($($t:ty),* $(,)?) => {$(
        impl TagRange for Range<$t> {
            type Tag = $t;

            #[inline]
            fn size(&self) -> usize {
                (self.end as i128 - self.start as i128).max(0) as usize
            }

            fn split_at(&self, mid: usize) -> (Self, Self) {
                let mid = mid.min(self.size());
                let pivot = (self.start as i128 + mid as i128) as $t;
                (self.start..pivot, pivot..self.end)
            }

            #[inline]
            fn element(&self, i: usize) -> $t {
                (self.start as i128 + i as i128) as $t
            }
        }
    )*};
}

int_range!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// A self-dividing range: the step receives whole leaf pieces as its tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Blocked<R>(pub R);

impl<R> Blocked<R> {
    pub fn into_inner(self) -> R {
        self.0
    }
}

impl<R> TagRange for Blocked<R>
where
    R: TagRange + Tag,
{
    type Tag = Blocked<R>;

    fn size(&self) -> usize {
        self.0.size()
    }

    fn split_at(&self, mid: usize) -> (Self, Self) {
        let (a, b) = self.0.split_at(mid);
        (Blocked(a), Blocked(b))
    }

    fn element_count(&self) -> usize {
        1
    }

    fn element(&self, _i: usize) -> Self::Tag {
        self.clone()
    }
}
