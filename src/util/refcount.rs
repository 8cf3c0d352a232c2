//! Reference counting split by category.
//!
//! Long-lived async objects (the async cache adapter, for instance) hold a
//! reference for every operation in flight. Counting per category makes a
//! leak diagnosable ("3 outstanding Puts") instead of an opaque total, and
//! the owner's last-reference hook fires exactly once when the total drops
//! to zero.

use std::fmt::Debug;

use parking_lot::Mutex;

/// A closed set of reference categories
pub trait RefCategory: Copy + Debug + Send + Sync + 'static {
    /// Every category, in index order
    const ALL: &'static [Self];

    fn index(self) -> usize;

    fn name(self) -> &'static str;
}

type LastRefHook = Box<dyn FnOnce() + Send>;

struct RefState {
    counts: Vec<usize>,
    total: usize,
    hook: Option<LastRefHook>,
}

/// Mutex-protected per-category reference counts
pub struct CategorizedRefcount<C: RefCategory> {
    state: Mutex<RefState>,
    _category: std::marker::PhantomData<C>,
}

impl<C: RefCategory> CategorizedRefcount<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefState {
                counts: vec![0; C::ALL.len()],
                total: 0,
                hook: None,
            }),
            _category: std::marker::PhantomData,
        }
    }

    /// Install the hook run when the total reaches zero. The hook runs at
    /// most once, outside the internal mutex.
    pub fn set_last_ref_removed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.lock().hook = Some(Box::new(hook));
    }

    pub fn add_ref(&self, category: C) {
        let mut state = self.state.lock();
        state.counts[category.index()] += 1;
        state.total += 1;
    }

    /// Drop one reference; returns the new total
    pub fn release_ref(&self, category: C) -> usize {
        let (total, hook) = {
            let mut state = self.state.lock();
            let index = category.index();
            if state.counts[index] == 0 {
                tracing::error!(category = category.name(), "Refcount released below zero");
                return state.total;
            }
            state.counts[index] -= 1;
            state.total -= 1;
            let hook = if state.total == 0 {
                state.hook.take()
            } else {
                None
            };
            (state.total, hook)
        };
        if let Some(hook) = hook {
            hook();
        }
        total
    }

    pub fn query_count(&self, category: C) -> usize {
        self.state.lock().counts[category.index()]
    }

    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    /// e.g. `total: 3 (Owner: 1, Get: 2)`; zero categories are omitted
    pub fn debug_string(&self) -> String {
        let state = self.state.lock();
        let parts: Vec<String> = C::ALL
            .iter()
            .filter(|c| state.counts[c.index()] > 0)
            .map(|c| format!("{}: {}", c.name(), state.counts[c.index()]))
            .collect();
        format!("total: {} ({})", state.total, parts.join(", "))
    }
}

impl<C: RefCategory> Default for CategorizedRefcount<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestCategory {
        Owner,
        Work,
    }

    impl RefCategory for TestCategory {
        const ALL: &'static [Self] = &[TestCategory::Owner, TestCategory::Work];

        fn index(self) -> usize {
            self as usize
        }

        fn name(self) -> &'static str {
            match self {
                TestCategory::Owner => "Owner",
                TestCategory::Work => "Work",
            }
        }
    }

    #[test]
    fn test_counts_per_category() {
        let refs = CategorizedRefcount::<TestCategory>::new();
        refs.add_ref(TestCategory::Owner);
        refs.add_ref(TestCategory::Work);
        refs.add_ref(TestCategory::Work);

        assert_eq!(refs.total(), 3);
        assert_eq!(refs.query_count(TestCategory::Work), 2);
        assert_eq!(refs.debug_string(), "total: 3 (Owner: 1, Work: 2)");

        assert_eq!(refs.release_ref(TestCategory::Work), 2);
        assert_eq!(refs.debug_string(), "total: 2 (Owner: 1, Work: 1)");
    }

    #[test]
    fn test_last_ref_hook_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let refs = CategorizedRefcount::<TestCategory>::new();
        let f = fired.clone();
        refs.set_last_ref_removed(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        refs.add_ref(TestCategory::Owner);
        refs.add_ref(TestCategory::Work);
        refs.release_ref(TestCategory::Work);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        refs.release_ref(TestCategory::Owner);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        refs.add_ref(TestCategory::Work);
        refs.release_ref(TestCategory::Work);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_below_zero_is_ignored() {
        let refs = CategorizedRefcount::<TestCategory>::new();
        refs.add_ref(TestCategory::Owner);
        assert_eq!(refs.release_ref(TestCategory::Work), 1);
        assert_eq!(refs.total(), 1);
    }
}
