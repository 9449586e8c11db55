//! Per-widget drag and resize state machine.
//!
//! A [`GestureController`] turns pointer samples into committed positions and
//! sizes. Everything it needs from the outside world (container bounds, guide
//! queries, where to write results) goes through a [`GestureDelegate`].

use crate::geometry::{Axis, Bounds, Point, Size, WidgetBounds, WidgetId};
use crate::guides::{Edge, GuideLine, Orientation, nearest_guide};

const AXES: [Axis; 2] = [Axis::X, Axis::Y];

/// Which edges a resize gesture moves. The top-left corner always stays put.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResizeHandle {
    Right,
    Bottom,
    BottomRight,
}

impl ResizeHandle {
    pub fn moves(self, axis: Axis) -> bool {
        match (self, axis) {
            (ResizeHandle::BottomRight, _) => true,
            (ResizeHandle::Right, Axis::X) => true,
            (ResizeHandle::Bottom, Axis::Y) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GestureKind {
    Drag,
    Resize(ResizeHandle),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GestureConfig {
    pub snap_enabled: bool,
    pub min_size: Size,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            snap_enabled: true,
            min_size: Size {
                width: 250.0,
                height: 150.0,
            },
        }
    }
}

/// One pointer-move event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointerSample {
    pub position: Point,
    /// Set while the snap-suppression modifier is held. Only affects this sample.
    pub snap_suppressed: bool,
}

impl PointerSample {
    pub fn new(position: Point) -> Self {
        Self {
            position,
            snap_suppressed: false,
        }
    }

    pub fn suppressed(position: Point) -> Self {
        Self {
            position,
            snap_suppressed: true,
        }
    }
}

/// Result of a pointer-move sample that committed geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct GestureFrame {
    pub bounds: Bounds,
    /// Guides that were applied, one per snapped axis.
    pub guides: Vec<GuideLine>,
}

pub trait GestureDelegate {
    fn container_bounds(&self) -> Bounds;

    /// Candidate guides for `candidate`, or `None` when no guide query is
    /// available.
    fn guides_for(&self, candidate: &WidgetBounds) -> Option<Vec<GuideLine>>;

    fn commit_position(&mut self, widget_id: WidgetId, position: Point);

    fn commit_size(&mut self, widget_id: WidgetId, size: Size);

    fn gesture_ended(&mut self, widget_id: WidgetId, kind: GestureKind);
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum GestureState {
    Idle,
    Dragging {
        origin: Point,
        baseline: Bounds,
    },
    Resizing {
        origin: Point,
        baseline: Bounds,
        handle: ResizeHandle,
    },
}

#[derive(Debug)]
pub struct GestureController {
    widget_id: WidgetId,
    config: GestureConfig,
    state: GestureState,
}

impl GestureController {
    pub fn new(widget_id: WidgetId, config: GestureConfig) -> Self {
        Self {
            widget_id,
            config,
            state: GestureState::Idle,
        }
    }

    pub fn active_gesture(&self) -> Option<GestureKind> {
        match self.state {
            GestureState::Idle => None,
            GestureState::Dragging { .. } => Some(GestureKind::Drag),
            GestureState::Resizing { handle, .. } => Some(GestureKind::Resize(handle)),
        }
    }

    /// Start dragging from `pointer`. Returns false if a gesture is already active.
    pub fn begin_drag(&mut self, pointer: Point, current: Bounds) -> bool {
        if let Some(active) = self.active_gesture() {
            log::warn!(
                "ignoring drag on widget {}: {:?} already in progress",
                self.widget_id,
                active
            );
            return false;
        }
        self.state = GestureState::Dragging {
            origin: pointer,
            baseline: current,
        };
        true
    }

    /// Start resizing from `pointer`. Returns false if a gesture is already active.
    pub fn begin_resize(&mut self, pointer: Point, current: Bounds, handle: ResizeHandle) -> bool {
        if let Some(active) = self.active_gesture() {
            log::warn!(
                "ignoring resize on widget {}: {:?} already in progress",
                self.widget_id,
                active
            );
            return false;
        }
        self.state = GestureState::Resizing {
            origin: pointer,
            baseline: current,
            handle,
        };
        true
    }

    /// Apply one pointer sample. Commits through `delegate` exactly once unless idle.
    pub fn on_pointer_move(
        &mut self,
        sample: PointerSample,
        delegate: &mut impl GestureDelegate,
    ) -> Option<GestureFrame> {
        match self.state {
            GestureState::Idle => None,
            GestureState::Dragging { origin, baseline } => {
                Some(self.drag_to(sample, origin, baseline, delegate))
            }
            GestureState::Resizing {
                origin,
                baseline,
                handle,
            } => Some(self.resize_to(sample, origin, baseline, handle, delegate)),
        }
    }

    /// Finish the active gesture, keeping the last committed geometry.
    pub fn end_gesture(&mut self, delegate: &mut impl GestureDelegate) -> bool {
        let Some(kind) = self.active_gesture() else {
            return false;
        };
        self.state = GestureState::Idle;
        delegate.gesture_ended(self.widget_id, kind);
        true
    }

    /// Abort the active gesture and restore the geometry it started from.
    pub fn cancel_gesture(&mut self, delegate: &mut impl GestureDelegate) -> bool {
        match self.state {
            GestureState::Idle => return false,
            GestureState::Dragging { baseline, .. } => {
                delegate.commit_position(self.widget_id, baseline.origin);
            }
            GestureState::Resizing { baseline, .. } => {
                delegate.commit_size(self.widget_id, baseline.size);
            }
        }
        self.end_gesture(delegate)
    }

    fn snapping_guides(
        &self,
        sample: &PointerSample,
        candidate: Bounds,
        delegate: &impl GestureDelegate,
    ) -> Option<Vec<GuideLine>> {
        if !self.config.snap_enabled || sample.snap_suppressed {
            return None;
        }
        delegate.guides_for(&WidgetBounds {
            id: self.widget_id,
            bounds: candidate,
        })
    }

    fn drag_to(
        &self,
        sample: PointerSample,
        origin: Point,
        baseline: Bounds,
        delegate: &mut impl GestureDelegate,
    ) -> GestureFrame {
        let size = baseline.size;
        let mut position = baseline.origin + (sample.position - origin);
        let mut applied = Vec::new();

        let raw = Bounds {
            origin: position,
            size,
        };
        if let Some(guides) = self.snapping_guides(&sample, raw, &*delegate) {
            for axis in AXES {
                if let Some(guide) = nearest_guide(&guides, Orientation::for_axis(axis), |_| true) {
                    let snapped = guide
                        .moving_edge
                        .origin_for(guide.position, size.along(axis));
                    position.set_along(axis, snapped);
                    applied.push(guide.clone());
                }
            }
        }

        let container = delegate.container_bounds();
        let snapped = position;
        for axis in AXES {
            let min = container.start(axis);
            let max = (container.end(axis) - size.along(axis)).max(min);
            position.set_along(axis, position.along(axis).max(min).min(max));
        }
        applied.retain(|guide| {
            let axis = guide.orientation.axis();
            position.along(axis) == snapped.along(axis)
        });

        delegate.commit_position(self.widget_id, position);
        GestureFrame {
            bounds: Bounds { origin: position, size },
            guides: applied,
        }
    }

    fn resize_to(
        &self,
        sample: PointerSample,
        origin: Point,
        baseline: Bounds,
        handle: ResizeHandle,
        delegate: &mut impl GestureDelegate,
    ) -> GestureFrame {
        let anchor = baseline.origin;
        let min = self.config.min_size;
        let delta = sample.position - origin;
        let mut size = baseline.size;
        for axis in AXES {
            if handle.moves(axis) {
                size.set_along(axis, baseline.size.along(axis) + delta.along(axis));
            }
        }
        size = size.max(&min);

        let mut applied = Vec::new();
        let raw = Bounds { origin: anchor, size };
        if let Some(guides) = self.snapping_guides(&sample, raw, &*delegate) {
            for axis in AXES.into_iter().filter(|axis| handle.moves(*axis)) {
                let nearest = nearest_guide(&guides, Orientation::for_axis(axis), |guide| {
                    guide.moving_edge == Edge::End
                        && guide.position - anchor.along(axis) >= min.along(axis)
                });
                if let Some(guide) = nearest {
                    size.set_along(axis, guide.position - anchor.along(axis));
                    applied.push(guide.clone());
                }
            }
        }

        let container = delegate.container_bounds();
        for axis in AXES.into_iter().filter(|axis| handle.moves(*axis)) {
            let available = (container.end(axis) - anchor.along(axis)).max(min.along(axis));
            if size.along(axis) > available {
                size.set_along(axis, available);
                applied.retain(|guide| guide.orientation.axis() != axis);
            }
        }

        delegate.commit_size(self.widget_id, size);
        GestureFrame {
            bounds: Bounds {
                origin: anchor,
                size,
            },
            guides: applied,
        }
    }
}
