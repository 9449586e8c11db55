//! Alignment guides between a moving widget, its siblings, and the container.
//!
//! [`compute_guides`] reports every candidate within the snap threshold. It
//! does not choose between them; callers use [`nearest_guide`] to pick the
//! one that gets applied.

use crate::geometry::{Axis, Bounds, WidgetBounds, WidgetId};

/// Orientation of the rendered guide line.
///
/// A vertical guide has a fixed x coordinate and aligns horizontal positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Orientation {
    Vertical,
    Horizontal,
}

impl Orientation {
    /// The axis whose coordinate this guide fixes.
    pub fn axis(self) -> Axis {
        match self {
            Orientation::Vertical => Axis::X,
            Orientation::Horizontal => Axis::Y,
        }
    }

    pub fn for_axis(axis: Axis) -> Self {
        match axis {
            Axis::X => Orientation::Vertical,
            Axis::Y => Orientation::Horizontal,
        }
    }
}

/// An edge of a rectangle along one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Edge {
    Start,
    Center,
    End,
}

impl Edge {
    pub fn of(self, bounds: &Bounds, axis: Axis) -> f32 {
        match self {
            Edge::Start => bounds.start(axis),
            Edge::Center => bounds.center(axis),
            Edge::End => bounds.end(axis),
        }
    }

    /// Origin coordinate that puts this edge of a span of `extent` at `position`.
    pub fn origin_for(self, position: f32, extent: f32) -> f32 {
        match self {
            Edge::Start => position,
            Edge::Center => position - extent / 2.0,
            Edge::End => position - extent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuideSource {
    Container,
    Sibling(WidgetId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GuideLine {
    pub orientation: Orientation,
    /// Coordinate of the line along `orientation.axis()`.
    pub position: f32,
    /// Where the line begins along the cross axis.
    pub start: f32,
    pub length: f32,
    pub source: GuideSource,
    /// Which edge of the moving rectangle lines up with `position`.
    pub moving_edge: Edge,
    /// `position` minus the moving edge's coordinate.
    pub distance: f32,
}

const CONTAINER_RELATIONS: [Edge; 2] = [Edge::Start, Edge::End];

/// `(moving edge, sibling edge)` pairs tested along each axis.
const SIBLING_RELATIONS: [(Edge, Edge); 5] = [
    (Edge::Start, Edge::Start),
    (Edge::End, Edge::End),
    (Edge::Start, Edge::End),
    (Edge::End, Edge::Start),
    (Edge::Center, Edge::Center),
];

const ORIENTATIONS: [Orientation; 2] = [Orientation::Vertical, Orientation::Horizontal];

// NaN extents count as empty.
fn has_extent(bounds: &Bounds, axis: Axis) -> bool {
    bounds.extent(axis) > 0.0
}

/// Collect every alignment guide within `threshold` of `current`.
///
/// Container guides come first (left, right, top, bottom), followed by sibling
/// guides in sibling order. Siblings sharing `current.id` are skipped. Axes on
/// which `current` or a sibling has no extent produce no guides.
pub fn compute_guides(
    current: &WidgetBounds,
    siblings: &[WidgetBounds],
    container: &Bounds,
    threshold: f32,
) -> Vec<GuideLine> {
    let mut guides = Vec::with_capacity(4 + siblings.len() * 2);
    let moving = &current.bounds;

    for orientation in ORIENTATIONS {
        let axis = orientation.axis();
        if !has_extent(moving, axis) || !has_extent(container, axis) {
            continue;
        }
        let cross = axis.cross();
        for edge in CONTAINER_RELATIONS {
            let position = edge.of(container, axis);
            let distance = position - edge.of(moving, axis);
            if distance.abs() <= threshold {
                guides.push(GuideLine {
                    orientation,
                    position,
                    start: container.start(cross),
                    length: container.extent(cross),
                    source: GuideSource::Container,
                    moving_edge: edge,
                    distance,
                });
            }
        }
    }

    for sibling in siblings {
        if sibling.id == current.id {
            continue;
        }
        let other = &sibling.bounds;
        for orientation in ORIENTATIONS {
            let axis = orientation.axis();
            if !has_extent(moving, axis) || !has_extent(other, axis) {
                continue;
            }
            let cross = axis.cross();
            let start = moving.start(cross).min(other.start(cross));
            let end = moving.end(cross).max(other.end(cross));
            for (moving_edge, sibling_edge) in SIBLING_RELATIONS {
                let position = sibling_edge.of(other, axis);
                let distance = position - moving_edge.of(moving, axis);
                if distance.abs() <= threshold {
                    guides.push(GuideLine {
                        orientation,
                        position,
                        start,
                        length: end - start,
                        source: GuideSource::Sibling(sibling.id),
                        moving_edge,
                        distance,
                    });
                }
            }
        }
    }

    guides
}

/// The guide of `orientation` closest to the moving edge it matched.
///
/// Only guides accepted by `filter` are considered. When two guides are
/// equally close, the one emitted first wins.
pub fn nearest_guide<'a>(
    guides: &'a [GuideLine],
    orientation: Orientation,
    filter: impl Fn(&GuideLine) -> bool,
) -> Option<&'a GuideLine> {
    let mut nearest: Option<&GuideLine> = None;
    for guide in guides {
        if guide.orientation != orientation || !filter(guide) {
            continue;
        }
        match nearest {
            Some(best) if best.distance.abs() <= guide.distance.abs() => {}
            _ => nearest = Some(guide),
        }
    }
    nearest
}
