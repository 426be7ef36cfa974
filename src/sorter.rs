/// Reorders an inbound batch in place before per-element dispatch.
///
/// Sorting batches can improve locality in the user handler; the default
/// [`NoopSorter`] leaves the transmitted order intact.
pub trait BufferSorter<T>: Send + Sync + 'static {
    fn sort(&self, batch: &mut [T]);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSorter;

impl<T> BufferSorter<T> for NoopSorter {
    #[inline]
    fn sort(&self, _batch: &mut [T]) {}
}
