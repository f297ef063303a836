#![allow(unsafe_op_in_unsafe_fn)]

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{RawWaker, RawWakerVTable, Waker};

#[derive(Debug, Default)]
pub(crate) struct WakerData {
    wake_count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn wake_count(&self) -> usize {
        self.wake_count.load(Ordering::Relaxed)
    }
}

unsafe fn mock_wake(data: *const ()) {
    // Need to consume 1 Arc reference
    let data = Arc::<WakerData>::from_raw(data.cast());
    data.wake_count.fetch_add(1, Ordering::Relaxed);
}

unsafe fn mock_wake_by_ref(data: *const ()) {
    // Not consuming any Arc ref
    let data = ManuallyDrop::new(Arc::<WakerData>::from_raw(data.cast()));
    data.wake_count.fetch_add(1, Ordering::Relaxed);
}

// Drop the Waker Arc reference.
unsafe fn mock_drop(data: *const ()) {
    if !data.is_null() {
        drop(Arc::<WakerData>::from_raw(data.cast()));
    }
}

unsafe fn mock_clone(data: *const ()) -> RawWaker {
    Arc::<WakerData>::increment_strong_count(data.cast());
    RawWaker::new(data, &MOCK_VTABLE)
}

static MOCK_VTABLE: RawWakerVTable =
    RawWakerVTable::new(mock_clone, mock_wake, mock_wake_by_ref, mock_drop);

/// A waker counting how many times it was woken. Clones share the count and
/// `will_wake` each other.
pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    let raw_data = Arc::into_raw(Arc::clone(&data));

    let raw_waker = RawWaker::new(raw_data as *const (), &MOCK_VTABLE);

    unsafe { (Waker::from_raw(raw_waker), data) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_raw_waker() {
        let (waker1, waker_data) = mock_waker();
        waker1.wake_by_ref();
        assert_eq!(waker_data.wake_count(), 1);

        let waker2 = waker1.clone();
        assert!(waker2.will_wake(&waker1));
        waker2.wake();
        assert_eq!(waker_data.wake_count(), 2);

        drop(waker1);
        assert_eq!(waker_data.wake_count(), 2);
        assert_eq!(Arc::strong_count(&waker_data), 1);
    }
}
