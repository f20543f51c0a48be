//! Disabling the interactive surface while a long operation runs.

use std::ops::{Deref, DerefMut};

use tracing::debug;

/// Progress bound set by every `block`.
pub const DEFAULT_MAXIMUM_STATE: usize = 100;

/// The pieces of a UI that `block`/`unblock` drive.
pub trait BusySurface {
    fn set_controls_enabled(&mut self, enabled: bool);
    fn show_busy(&mut self, reason: &str);
    fn set_progress(&mut self, current: usize, maximum: usize);
    fn hide_busy(&mut self);
}

pub struct Busy<S> {
    surface: S,
    reason: Option<String>,
    maximum: usize,
    current: usize,
}

impl<S: BusySurface> Busy<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            reason: None,
            maximum: DEFAULT_MAXIMUM_STATE,
            current: 0,
        }
    }

    /// Returns `false` if already blocked, in which case nothing changes.
    pub fn block(&mut self, reason: &str) -> bool {
        if self.reason.is_some() {
            return false;
        }
        debug!(reason, "interactive surface blocked");
        self.surface.set_controls_enabled(false);
        self.surface.show_busy(reason);
        self.reason = Some(reason.to_string());
        self.maximum = DEFAULT_MAXIMUM_STATE;
        self.current = 0;
        self.surface.set_progress(0, self.maximum);
        true
    }

    /// Returns `false` if not blocked.
    pub fn unblock(&mut self) -> bool {
        if self.reason.take().is_none() {
            return false;
        }
        debug!("interactive surface unblocked");
        self.surface.set_controls_enabled(true);
        self.surface.hide_busy();
        true
    }

    pub fn is_blocked(&self) -> bool {
        self.reason.is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_maximum_state(&mut self, maximum: usize) {
        self.maximum = maximum;
        if self.is_blocked() {
            self.surface.set_progress(self.current, self.maximum);
        }
    }

    pub fn set_current_state(&mut self, current: usize) {
        self.current = current.min(self.maximum);
        if self.is_blocked() {
            self.surface.set_progress(self.current, self.maximum);
        }
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.current, self.maximum)
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Blocks for the lifetime of the returned guard. If the surface was
    /// already blocked the guard leaves it blocked when dropped.
    pub fn scoped(&mut self, reason: &str) -> BlockScope<'_, S> {
        let owns = self.block(reason);
        BlockScope { busy: self, owns }
    }
}

pub struct BlockScope<'a, S: BusySurface> {
    busy: &'a mut Busy<S>,
    owns: bool,
}

impl<S: BusySurface> Deref for BlockScope<'_, S> {
    type Target = Busy<S>;

    fn deref(&self) -> &Busy<S> {
        self.busy
    }
}

impl<S: BusySurface> DerefMut for BlockScope<'_, S> {
    fn deref_mut(&mut self) -> &mut Busy<S> {
        self.busy
    }
}

impl<S: BusySurface> Drop for BlockScope<'_, S> {
    fn drop(&mut self) {
        if self.owns {
            self.busy.unblock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl BusySurface for Recorder {
        fn set_controls_enabled(&mut self, enabled: bool) {
            self.calls.push(format!("enabled={enabled}"));
        }

        fn show_busy(&mut self, reason: &str) {
            self.calls.push(format!("show {reason}"));
        }

        fn set_progress(&mut self, current: usize, maximum: usize) {
            self.calls.push(format!("{current}/{maximum}"));
        }

        fn hide_busy(&mut self) {
            self.calls.push("hide".into());
        }
    }

    #[test]
    fn second_block_is_a_no_op() {
        let mut busy = Busy::new(Recorder::default());
        assert!(busy.block("Save"));
        assert!(!busy.block("Export"));
        assert_eq!(busy.reason(), Some("Save"));
        assert!(busy.unblock());
        assert!(!busy.unblock());
        assert_eq!(
            busy.surface().calls,
            vec!["enabled=false", "show Save", "0/100", "enabled=true", "hide"]
        );
    }

    #[test]
    fn progress_is_clamped_and_only_shown_while_blocked() {
        let mut busy = Busy::new(Recorder::default());
        busy.set_current_state(5);
        assert!(busy.surface().calls.is_empty());

        busy.block("Export");
        busy.set_maximum_state(4);
        busy.set_current_state(9);
        assert_eq!(busy.progress(), (4, 4));
    }

    #[test]
    fn scope_unblocks_on_every_exit_path() {
        fn fallible(busy: &mut Busy<Recorder>) -> Result<(), String> {
            let scope = busy.scoped("Save");
            assert!(scope.is_blocked());
            Err("write failed".into())
        }

        let mut busy = Busy::new(Recorder::default());
        assert!(fallible(&mut busy).is_err());
        assert!(!busy.is_blocked());

        busy.block("Outer");
        drop(busy.scoped("Inner"));
        assert_eq!(busy.reason(), Some("Outer"));
    }
}
