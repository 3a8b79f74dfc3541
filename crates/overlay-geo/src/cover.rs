//! Rectangle covers and the fast candidate classifier built from them.
//!
//! A cover is a set of axis-aligned rectangles known to lie entirely inside
//! a polygon plus a set known to lie entirely outside it. Rectangles are
//! classified with exact predicates, so a candidate whose bounding box fits
//! inside one cover rectangle can skip the exact boolean operation.

use geo::{BoundingRect, Contains, Coord, Intersects, MultiPolygon, Rect};
use rstar::{Envelope, RTree, RTreeObject, AABB};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Options controlling cover construction
#[derive(Debug, Clone, Copy)]
pub struct CoverOptions {
    /// Stop once this many inside rectangles have been found
    pub target: usize,
    /// Rectangles narrower than this are dropped unresolved
    pub min_width: f64,
    /// Rectangles shorter than this are dropped unresolved
    pub min_height: f64,
    /// Starting rectangle. Defaults to the polygon's bounding box.
    pub bbox: Option<Rect<f64>>,
}

impl Default for CoverOptions {
    fn default() -> Self {
        Self { target: 100, min_width: 1e-4, min_height: 1e-4, bbox: None }
    }
}

impl CoverOptions {
    pub fn with_target(target: usize) -> Self {
        Self { target, ..Default::default() }
    }
}

/// Result of covering a polygon
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RectangleCover {
    pub inside: Vec<Rect<f64>>,
    pub outside: Vec<Rect<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RectClass {
    Inside,
    Outside,
    Mixed,
}

fn classify_rect(rect: &Rect<f64>, polygon: &MultiPolygon<f64>) -> RectClass {
    let rect_polygon = rect.to_polygon();
    if polygon.contains(&rect_polygon) {
        RectClass::Inside
    } else if !polygon.intersects(&rect_polygon) {
        RectClass::Outside
    } else {
        RectClass::Mixed
    }
}

fn rect_area(rect: &Rect<f64>) -> f64 {
    rect.width() * rect.height()
}

fn split_rect(rect: &Rect<f64>, along_x: bool) -> (Rect<f64>, Rect<f64>) {
    let (min, max) = (rect.min(), rect.max());
    if along_x {
        let mid = (min.x + max.x) / 2.0;
        (Rect::new(min, Coord { x: mid, y: max.y }), Rect::new(Coord { x: mid, y: min.y }, max))
    } else {
        let mid = (min.y + max.y) / 2.0;
        (Rect::new(min, Coord { x: max.x, y: mid }), Rect::new(Coord { x: min.x, y: mid }, max))
    }
}

/// Pending rectangle ordered by area, largest first
struct Pending {
    rect: Rect<f64>,
    class: Option<RectClass>,
    area: f64,
}

impl Pending {
    fn new(rect: Rect<f64>, class: Option<RectClass>) -> Self {
        Self { area: rect_area(&rect), rect, class }
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.area.total_cmp(&other.area) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.area.total_cmp(&other.area)
    }
}

/// Cover a polygon with inside and outside rectangles.
///
/// Straddling rectangles are split at their midpoint along whichever axis
/// yields more fully-inside area. Rectangles still straddling when the target
/// is reached, or that fall below the minimum cell size, are omitted, so the
/// cover is sound but not complete.
pub fn cover_with_rectangles(polygon: &MultiPolygon<f64>, options: CoverOptions) -> RectangleCover {
    let mut cover = RectangleCover::default();

    let start = match options.bbox.or_else(|| polygon.bounding_rect()) {
        Some(rect) => rect,
        None => return cover,
    };

    let mut queue = BinaryHeap::new();
    queue.push(Pending::new(start, None));

    while cover.inside.len() < options.target {
        let Some(pending) = queue.pop() else { break };
        let rect = pending.rect;

        if rect.width() < options.min_width || rect.height() < options.min_height {
            continue;
        }

        match pending.class.unwrap_or_else(|| classify_rect(&rect, polygon)) {
            RectClass::Inside => cover.inside.push(rect),
            RectClass::Outside => cover.outside.push(rect),
            RectClass::Mixed => {
                let (ax, bx) = split_rect(&rect, true);
                let (ay, by) = split_rect(&rect, false);
                let classes_x = (classify_rect(&ax, polygon), classify_rect(&bx, polygon));
                let classes_y = (classify_rect(&ay, polygon), classify_rect(&by, polygon));

                // Resolved area per split: fully-inside first, fully-outside
                // breaks ties, then the longer side is halved.
                let score = |a: &Rect<f64>, b: &Rect<f64>, classes: (RectClass, RectClass)| {
                    let mut inside = 0.0;
                    let mut outside = 0.0;
                    for (r, c) in [(a, classes.0), (b, classes.1)] {
                        match c {
                            RectClass::Inside => inside += rect_area(r),
                            RectClass::Outside => outside += rect_area(r),
                            RectClass::Mixed => {}
                        }
                    }
                    (inside, outside)
                };

                let sx = score(&ax, &bx, classes_x);
                let sy = score(&ay, &by, classes_y);
                let split_x = match sx.0.total_cmp(&sy.0).then(sx.1.total_cmp(&sy.1)) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => rect.width() >= rect.height(),
                };

                if split_x {
                    queue.push(Pending::new(ax, Some(classes_x.0)));
                    queue.push(Pending::new(bx, Some(classes_x.1)));
                } else {
                    queue.push(Pending::new(ay, Some(classes_y.0)));
                    queue.push(Pending::new(by, Some(classes_y.1)));
                }
            }
        }
    }

    tracing::trace!(
        inside = cover.inside.len(),
        outside = cover.outside.len(),
        "built rectangle cover"
    );
    cover
}

/// Cover rectangle stored in the R-tree
#[derive(Debug, Clone, PartialEq)]
struct CoverRect {
    envelope: AABB<[f64; 2]>,
}

impl CoverRect {
    fn new(rect: &Rect<f64>) -> Self {
        let (min, max) = (rect.min(), rect.max());
        Self { envelope: AABB::from_corners([min.x, min.y], [max.x, max.y]) }
    }
}

impl RTreeObject for CoverRect {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// How a candidate relates to the covered polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Candidate lies entirely within the polygon
    InsideFast,
    /// Candidate is disjoint from the polygon
    OutsideFast,
    /// The cover cannot decide; an exact operation is required
    Uncertain,
}

/// Spatial index over a rectangle cover
#[derive(Debug, Clone, Default)]
pub struct CoverIndex {
    inside: RTree<CoverRect>,
    outside: RTree<CoverRect>,
}

/// Build R-tree indexes over inside and outside rectangles
pub fn build_indexes(inside: &[Rect<f64>], outside: &[Rect<f64>]) -> CoverIndex {
    CoverIndex {
        inside: RTree::bulk_load(inside.iter().map(CoverRect::new).collect()),
        outside: RTree::bulk_load(outside.iter().map(CoverRect::new).collect()),
    }
}

impl CoverIndex {
    pub fn from_cover(cover: &RectangleCover) -> Self {
        build_indexes(&cover.inside, &cover.outside)
    }

    /// Classify a candidate by its bounding box
    pub fn classify(&self, candidate: &Rect<f64>) -> Classification {
        let (min, max) = (candidate.min(), candidate.max());
        let query = AABB::from_corners([min.x, min.y], [max.x, max.y]);

        let within = |tree: &RTree<CoverRect>| {
            tree.locate_in_envelope_intersecting(&query)
                .any(|r| r.envelope.contains_envelope(&query))
        };

        if within(&self.inside) {
            Classification::InsideFast
        } else if within(&self.outside) {
            Classification::OutsideFast
        } else {
            Classification::Uncertain
        }
    }

    /// Classify a candidate geometry
    pub fn classify_geometry(&self, candidate: &MultiPolygon<f64>) -> Classification {
        match candidate.bounding_rect() {
            Some(rect) => self.classify(&rect),
            None => Classification::OutsideFast,
        }
    }

    pub fn inside_len(&self) -> usize {
        self.inside.size()
    }

    pub fn outside_len(&self) -> usize {
        self.outside.size()
    }
}
