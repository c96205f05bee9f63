//! Axis-aligned rectangles and their string codec.
//!
//! A rectangle is written `[a b c]` for a point (min == max) or
//! `[a b],[c d]` for a box. [`Rect::parse`] is the reverse of
//! [`Rect::format`] and is the default extractor for spatial indexes.

use std::sync::Arc;

/// Maximum number of dimensions a rectangle may have.
pub const MAX_DIMS: usize = 20;

/// Extracts a rectangle from an item value for a spatial index.
///
/// Returning `None` excludes the item from the index.
pub type RectFn = Arc<dyn Fn(&[u8]) -> Option<Rect> + Send + Sync>;

/// An axis-aligned hyper-rectangle with 1 to 20 dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Rect {
    /// Lower corner, one value per dimension.
    pub min: Vec<f64>,
    /// Upper corner, same number of dimensions as `min`.
    pub max: Vec<f64>,
}

impl Rect {
    /// Creates a rectangle, or `None` when the corners disagree on
    /// dimensionality or the dimension count is out of range.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Option<Self> {
        if min.len() != max.len() || min.is_empty() || min.len() > MAX_DIMS {
            return None;
        }
        Some(Self { min, max })
    }

    /// A degenerate rectangle where min == max.
    pub fn point(coords: Vec<f64>) -> Option<Self> {
        let max = coords.clone();
        Self::new(coords, max)
    }

    /// Parses the string form: `[a b c]` or `[a b],[c d]`.
    pub fn parse(value: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(value).ok()?;
        let mut corners: Vec<Vec<f64>> = Vec::with_capacity(2);
        for part in text.split(',').take(2) {
            let inner = part.strip_prefix('[')?.strip_suffix(']')?;
            let mut coords = Vec::new();
            for piece in inner.split(' ') {
                if piece.is_empty() {
                    continue;
                }
                coords.push(piece.parse::<f64>().ok()?);
            }
            corners.push(coords);
        }
        let mut corners = corners.into_iter();
        let min = corners.next()?;
        let max = corners.next().unwrap_or_else(|| min.clone());
        Self::new(min, max)
    }

    /// The default [`RectFn`] for spatial indexes: [`Rect::parse`].
    pub fn parser() -> RectFn {
        Arc::new(|value| Rect::parse(value))
    }

    /// Formats the rectangle back into its string form.
    ///
    /// Emits the single-corner point form when min == max.
    #[must_use]
    pub fn format(&self) -> String {
        let corner = |coords: &[f64]| {
            let mut out = String::from("[");
            for (i, v) in coords.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&format_coord(*v));
            }
            out.push(']');
            out
        };
        if self.min == self.max {
            corner(&self.min)
        } else {
            format!("{},{}", corner(&self.min), corner(&self.max))
        }
    }

    /// Inclusive intersection test over the shared dimensions.
    pub(crate) fn intersects(&self, other: &Rect) -> bool {
        let dims = self.min.len().min(other.min.len());
        if dims == 0 {
            return false;
        }
        for i in 0..dims {
            if self.min[i] > other.max[i] || self.max[i] < other.min[i] {
                return false;
            }
        }
        true
    }

    /// Smallest rectangle covering both.
    pub(crate) fn union(&self, other: &Rect) -> Rect {
        let dims = self.min.len().max(other.min.len());
        let mut min = Vec::with_capacity(dims);
        let mut max = Vec::with_capacity(dims);
        for i in 0..dims {
            min.push(match (self.min.get(i), other.min.get(i)) {
                (Some(a), Some(b)) => a.min(*b),
                (Some(a), None) => *a,
                (None, Some(b)) => *b,
                (None, None) => unreachable!(),
            });
            max.push(match (self.max.get(i), other.max.get(i)) {
                (Some(a), Some(b)) => a.max(*b),
                (Some(a), None) => *a,
                (None, Some(b)) => *b,
                (None, None) => unreachable!(),
            });
        }
        Rect { min, max }
    }

    pub(crate) fn area(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| (hi - lo).max(0.0))
            .product()
    }

    /// How much the area grows when `other` is folded in.
    pub(crate) fn enlargement(&self, other: &Rect) -> f64 {
        self.union(other).area() - self.area()
    }
}

fn format_coord(v: f64) -> String {
    // Integral coordinates print without a trailing ".0" so the output
    // round-trips through `parse` byte-for-byte.
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_point() {
        let r = Rect::parse(b"[1 2 3]").unwrap();
        assert_eq!(r.min, vec![1.0, 2.0, 3.0]);
        assert_eq!(r.max, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn parse_box() {
        let r = Rect::parse(b"[-117 30],[-112 36]").unwrap();
        assert_eq!(r.min, vec![-117.0, 30.0]);
        assert_eq!(r.max, vec![-112.0, 36.0]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Rect::parse(b"").is_none());
        assert!(Rect::parse(b"not a rect").is_none());
        assert!(Rect::parse(b"[a b]").is_none());
        assert!(Rect::parse(b"[]").is_none());
        assert!(Rect::parse(b"[1 2],[3]").is_none());
    }

    #[test]
    fn parse_rejects_too_many_dims() {
        let coords = vec!["1"; MAX_DIMS + 1].join(" ");
        let text = format!("[{coords}]");
        assert!(Rect::parse(text.as_bytes()).is_none());
    }

    #[test]
    fn format_round_trips() {
        for text in ["[1 2 3]", "[-117 30],[-112 36]", "[1.5 -2.25]"] {
            let r = Rect::parse(text.as_bytes()).unwrap();
            assert_eq!(r.format(), text);
        }
    }

    #[test]
    fn point_helper() {
        let p = Rect::point(vec![10.0, 20.0]).unwrap();
        assert_eq!(p.format(), "[10 20]");
    }

    #[test]
    fn intersection() {
        let a = Rect::parse(b"[0 0],[10 10]").unwrap();
        let b = Rect::parse(b"[5 5],[15 15]").unwrap();
        let c = Rect::parse(b"[11 11],[12 12]").unwrap();
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));

        // Touching edges intersect.
        let d = Rect::parse(b"[10 0],[20 10]").unwrap();
        assert!(a.intersects(&d));
    }

    #[test]
    fn union_and_enlargement() {
        let a = Rect::parse(b"[0 0],[2 2]").unwrap();
        let b = Rect::parse(b"[4 4]").unwrap();
        let u = a.union(&b);
        assert_eq!(u.min, vec![0.0, 0.0]);
        assert_eq!(u.max, vec![4.0, 4.0]);
        assert_eq!(a.enlargement(&b), 12.0);
    }
}
