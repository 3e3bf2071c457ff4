//! Queue of road-network changes waiting to be applied.
//!
//! The host pushes a [`TopologyEvent`] whenever a junction's segments change
//! or a junction is demolished. The registry drains the queue at the start
//! of its next pass, so geometry edits never interleave with a controller
//! tick.

use crate::id::JunctionId;

// ---------------------------------------------------------------------------
// Event enum
// ---------------------------------------------------------------------------

/// A change to the road network that affects signalized junctions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    /// Segments were added to or removed from the junction, or their lanes changed.
    SegmentsChanged(JunctionId),
    /// The junction no longer exists.
    JunctionRemoved(JunctionId),
}

impl TopologyEvent {
    pub fn junction(&self) -> JunctionId {
        match *self {
            TopologyEvent::SegmentsChanged(j) | TopologyEvent::JunctionRemoved(j) => j,
        }
    }
}

// ---------------------------------------------------------------------------
// TopologyQueue
// ---------------------------------------------------------------------------

/// Topology events waiting for the next registry pass.
#[derive(Debug, Default)]
pub struct TopologyQueue {
    pending: Vec<TopologyEvent>,
}

impl TopologyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TopologyEvent) {
        self.pending.push(event);
    }

    /// Drain all pending events in submission order. Repeated events are
    /// collapsed to their first occurrence.
    pub fn drain(&mut self) -> Vec<TopologyEvent> {
        let mut events: Vec<TopologyEvent> = Vec::with_capacity(self.pending.len());
        for event in self.pending.drain(..) {
            if !events.contains(&event) {
                events.push(event);
            }
        }
        events
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_queue_is_empty() {
        let mut queue = TopologyQueue::new();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut queue = TopologyQueue::new();
        queue.push(TopologyEvent::SegmentsChanged(JunctionId(2)));
        queue.push(TopologyEvent::JunctionRemoved(JunctionId(1)));
        let events = queue.drain();
        assert_eq!(
            events,
            vec![
                TopologyEvent::SegmentsChanged(JunctionId(2)),
                TopologyEvent::JunctionRemoved(JunctionId(1)),
            ]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn duplicate_events_collapse() {
        let mut queue = TopologyQueue::new();
        queue.push(TopologyEvent::SegmentsChanged(JunctionId(3)));
        queue.push(TopologyEvent::SegmentsChanged(JunctionId(3)));
        assert_eq!(queue.drain(), vec![TopologyEvent::SegmentsChanged(JunctionId(3))]);
    }

    #[test]
    fn clear_discards_pending() {
        let mut queue = TopologyQueue::new();
        queue.push(TopologyEvent::JunctionRemoved(JunctionId(1)));
        queue.clear();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn event_names_its_junction() {
        assert_eq!(TopologyEvent::JunctionRemoved(JunctionId(7)).junction(), JunctionId(7));
    }
}
