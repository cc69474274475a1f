//! Guaranteed-release stack.
//!
//! Resources are registered as they are acquired; `unwind` releases them in
//! reverse order, running every action even when earlier ones fail. A stack
//! that is dropped without being unwound or dismissed unwinds itself, so an
//! early `?` return still releases everything acquired so far.

use crate::error::{Result, RigError};

type Action<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// LIFO stack of release actions.
pub struct CleanupStack<'a> {
    actions: Vec<(String, Action<'a>)>,
}

impl<'a> CleanupStack<'a> {
    pub fn new() -> Self {
        CleanupStack {
            actions: Vec::new(),
        }
    }

    /// Register a release action; it runs before everything pushed earlier.
    pub fn push<F>(&mut self, label: &str, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'a,
    {
        self.actions.push((label.to_string(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, newest first. Failures are logged and returned; they
    /// never stop the remaining actions.
    pub fn unwind(&mut self) -> Vec<RigError> {
        let mut errors = Vec::new();
        while let Some((label, action)) = self.actions.pop() {
            if let Err(e) = action() {
                log::warn!("cleanup '{}' failed: {}", label, e);
                errors.push(e);
            }
        }
        errors
    }

    /// Forget every action without running it (the resources were handed off).
    pub fn dismiss(mut self) {
        self.actions.clear();
    }
}

impl Default for CleanupStack<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CleanupStack<'_> {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            self.unwind();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnOnce() -> Result<()> + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &str| -> Box<dyn FnOnce() -> Result<()> + Send> {
            let log = log2.clone();
            let name = name.to_string();
            Box::new(move || {
                log.lock().unwrap().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn unwinds_in_reverse_order() {
        let (log, make) = recorder();
        let mut stack = CleanupStack::new();
        stack.push("a", make("a"));
        stack.push("b", make("b"));
        stack.push("c", make("c"));
        assert_eq!(stack.len(), 3);
        assert!(stack.unwind().is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn failures_do_not_stop_unwinding() {
        let (log, make) = recorder();
        let mut stack = CleanupStack::new();
        stack.push("a", make("a"));
        stack.push("broken", || Err(RigError::remote("n1", "rmdir failed")));
        stack.push("c", make("c"));
        let errors = stack.unwind();
        assert_eq!(errors.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["c", "a"]);
    }

    #[test]
    fn drop_unwinds_on_early_return() {
        let (log, make) = recorder();
        fn setup(make: &dyn Fn(&str) -> Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
            let mut stack = CleanupStack::new();
            stack.push("first", make("first"));
            stack.push("second", make("second"));
            Err(RigError::Tunnel("bind failed".into()))?;
            stack.dismiss();
            Ok(())
        }
        assert!(setup(&make).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn dismiss_skips_actions() {
        let (log, make) = recorder();
        let mut stack = CleanupStack::new();
        stack.push("a", make("a"));
        stack.dismiss();
        assert!(log.lock().unwrap().is_empty());
    }
}
