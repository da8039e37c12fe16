use crate::diagram::{DiagramKey, PersistenceDiagram};

/// A symmetric, non-negative dissimilarity between two persistence diagrams.
///
/// Implementations must return `0.0` for identical inputs. The triangle
/// inequality is not required to hold exactly.
pub trait DiagramMetric: Sync {
    fn distance(&self, a: &PersistenceDiagram, b: &PersistenceDiagram) -> f64;
}

/// Selects which diagrams take part in a stage, by key only.
pub trait DiagramFilter {
    fn accepts(&self, key: &DiagramKey) -> bool;
}

impl<F> DiagramFilter for F
where
    F: Fn(&DiagramKey) -> bool,
{
    fn accepts(&self, key: &DiagramKey) -> bool {
        self(key)
    }
}

/// Monotonic time source for budgeted stages, in seconds from an arbitrary
/// origin.
pub trait Clock {
    fn now_secs(&self) -> f64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_secs(&self) -> f64 {
        (**self).now_secs()
    }
}

/// [`Clock`] backed by `std::time::Instant`. Not usable on
/// `wasm32-unknown-unknown`, where callers supply their own clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}
