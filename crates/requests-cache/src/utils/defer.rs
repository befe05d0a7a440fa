/// Guard that runs a closure when dropped, unless it was disarmed first.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct CallOnDrop<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> CallOnDrop<F> {
    /// Creates a new guard that will run `f` on drop.
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    /// Consumes the guard without running the closure.
    pub fn disarm(mut self) {
        self.f.take();
    }
}

impl<F: FnOnce()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let called = Cell::new(false);
        {
            let _guard = CallOnDrop::new(|| called.set(true));
        }
        assert!(called.get());
    }

    #[test]
    fn test_disarm() {
        let called = Cell::new(false);
        let guard = CallOnDrop::new(|| called.set(true));
        guard.disarm();
        assert!(!called.get());
    }
}
