//! Values declared at assembly time and computed when a pipeline runs.

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

type Compute<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

/// A lazily computed value. The computation runs at most once on success;
/// a failed attempt is retried by the next `get`.
pub struct Deferred<T> {
    label: String,
    cell: OnceCell<T>,
    compute: Option<Compute<T>>,
}

impl<T> Deferred<T> {
    pub fn new<F>(label: impl Into<String>, compute: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            cell: OnceCell::new(),
            compute: Some(Arc::new(compute)),
        }
    }

    pub fn ready(label: impl Into<String>, value: T) -> Self {
        Self {
            label: label.into(),
            cell: OnceCell::with_value(value),
            compute: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self) -> Result<&T> {
        self.cell.get_or_try_init(|| match &self.compute {
            Some(compute) => compute(),
            None => anyhow::bail!("deferred value '{}' has no computation", self.label),
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("label", &self.label)
            .field("value", &self.cell.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn computes_lazily_and_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = Deferred::new("tool jar", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!value.is_resolved());
        assert_eq!(*value.get().unwrap(), 42);
        assert_eq!(*value.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = Deferred::new("flaky", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("not yet")
            }
            Ok("ok")
        });
        assert!(value.get().is_err());
        assert_eq!(*value.get().unwrap(), "ok");
    }

    #[test]
    fn ready_values_need_no_computation() {
        let value = Deferred::ready("mappings", 7u32);
        assert!(value.is_resolved());
        assert_eq!(*value.get().unwrap(), 7);
    }
}
