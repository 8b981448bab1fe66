// =============================================================================
// Bidirectional pan synchronisation between two time scales
// =============================================================================
//
// Each side subscribes to the other's range changes and forwards them.  A
// shared `syncing` flag stops the echo: while one forward is in flight, the
// change it causes on the other side is not forwarded back.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::chart::{LogicalRange, RangeHandler, TimeScale};

pub struct TimeScaleSync {
    main: Arc<dyn TimeScale>,
    pane: Arc<dyn TimeScale>,
    main_sub: u64,
    pane_sub: u64,
    linked: bool,
}

impl TimeScaleSync {
    /// Link `main` and `pane` so that panning either moves both.
    pub fn link(main: Arc<dyn TimeScale>, pane: Arc<dyn TimeScale>) -> Self {
        let syncing = Arc::new(AtomicBool::new(false));

        let main_sub = main.subscribe_range_change(forward(Arc::downgrade(&pane), syncing.clone()));
        let pane_sub = pane.subscribe_range_change(forward(Arc::downgrade(&main), syncing));

        Self {
            main,
            pane,
            main_sub,
            pane_sub,
            linked: true,
        }
    }

    #[cfg(test)]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Idempotent.
    pub fn unlink(&mut self) {
        if !self.linked {
            return;
        }
        self.linked = false;
        self.main.unsubscribe_range_change(self.main_sub);
        self.pane.unsubscribe_range_change(self.pane_sub);
    }
}

impl Drop for TimeScaleSync {
    fn drop(&mut self) {
        self.unlink();
    }
}

fn forward(target: Weak<dyn TimeScale>, syncing: Arc<AtomicBool>) -> RangeHandler {
    Arc::new(move |range: LogicalRange| {
        if syncing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(target) = target.upgrade() {
            target.set_visible_range(range);
        }
        syncing.store(false, Ordering::SeqCst);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::memory::MemoryTimeScale;

    #[test]
    fn panning_either_side_moves_both_without_echo() {
        let main = Arc::new(MemoryTimeScale::new());
        let pane = Arc::new(MemoryTimeScale::new());
        let _sync = TimeScaleSync::link(main.clone(), pane.clone());

        let r = LogicalRange { from: 5.0, to: 50.0 };
        main.set_visible_range(r);
        assert_eq!(pane.visible_range(), Some(r));
        // main's handler ran once, pane's handler ran once and was suppressed.
        assert_eq!(main.notifications(), 1);
        assert_eq!(pane.notifications(), 1);

        let r2 = LogicalRange { from: 10.0, to: 60.0 };
        pane.set_visible_range(r2);
        assert_eq!(main.visible_range(), Some(r2));
        assert_eq!(main.notifications(), 2);
        assert_eq!(pane.notifications(), 2);
    }

    #[test]
    fn unlink_is_idempotent_and_stops_forwarding() {
        let main = Arc::new(MemoryTimeScale::new());
        let pane = Arc::new(MemoryTimeScale::new());
        let mut sync = TimeScaleSync::link(main.clone(), pane.clone());
        sync.unlink();
        sync.unlink();
        assert!(!sync.is_linked());
        assert_eq!(main.handler_count(), 0);
        assert_eq!(pane.handler_count(), 0);

        main.set_visible_range(LogicalRange { from: 0.0, to: 1.0 });
        assert_eq!(pane.visible_range(), None);
    }

    #[test]
    fn drop_unlinks() {
        let main = Arc::new(MemoryTimeScale::new());
        let pane = Arc::new(MemoryTimeScale::new());
        drop(TimeScaleSync::link(main.clone(), pane.clone()));
        assert_eq!(main.handler_count(), 0);
        assert_eq!(pane.handler_count(), 0);
    }
}
