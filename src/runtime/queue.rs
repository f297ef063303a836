use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Lock-free multi-producer queue with batch consumption.
///
/// Producers push with a CAS onto the head of a singly linked stack. A
/// consumer takes the entire chain with one atomic swap and reverses it, so a
/// drained batch yields items in the order they were pushed (per producer).
///
/// Reclamation: nodes are uniquely owned. Consumers never pop a single node
/// from the shared head, they only swap the head with null, so no node can be
/// freed while another thread still reads it and there is no ABA window. The
/// consumer that won the swap owns the detached chain and frees every node as
/// it is yielded (or when the [`Drain`] is dropped).
///
/// Several consumers may race on [`ReadyQueue::drain`]; each detached chain
/// goes to exactly one of them.
pub(crate) struct ReadyQueue<T> {
    head: AtomicPtr<Node<T>>,
    _p: PhantomData<Box<Node<T>>>,
}

// Safety: values move between threads through the queue, nodes are only
// touched by the thread owning them (producer before publish, consumer after
// the swap).
unsafe impl<T: Send> Send for ReadyQueue<T> {}
unsafe impl<T: Send> Sync for ReadyQueue<T> {}

impl<T> ReadyQueue<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _p: PhantomData,
        }
    }

    /// Pushes a value, never blocks and never fails. Returns `true` if the
    /// queue was empty before this push.
    pub(crate) fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: `node` is not published yet, we are its only owner.
            unsafe { (*node).next = head };

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return head.is_null(),
                Err(actual) => head = actual,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Detaches everything pushed so far and returns it in push order.
    pub(crate) fn drain(&self) -> Drain<T> {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut reversed: *mut Node<T> = ptr::null_mut();

        while !cur.is_null() {
            // Safety: the chain was detached by the swap above and is owned by
            // this thread.
            unsafe {
                let next = (*cur).next;
                (*cur).next = reversed;
                reversed = cur;
                cur = next;
            }
        }

        Drain {
            head: reversed,
            _p: PhantomData,
        }
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ReadyQueue<T> {
    fn drop(&mut self) {
        drop(self.drain());
    }
}

impl<T> std::fmt::Debug for ReadyQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

/// An owned, detached batch taken from a [`ReadyQueue`].
pub(crate) struct Drain<T> {
    head: *mut Node<T>,
    _p: PhantomData<Box<Node<T>>>,
}

unsafe impl<T: Send> Send for Drain<T> {}

impl<T> Iterator for Drain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }

        // Safety: every node in a detached chain came from `Box::into_raw` and
        // is visited exactly once.
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        Some(node.value)
    }
}

impl<T> Drop for Drain<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    assert_impl_all!(ReadyQueue<Box<u32>>: Send, Sync);

    #[test]
    fn test_drain_yields_push_order() {
        let q = ReadyQueue::new();
        assert!(q.push(1));
        assert!(!q.push(2));
        assert!(!q.push(3));

        assert_eq!(q.drain().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(q.is_empty());
        assert_eq!(q.drain().count(), 0);
    }

    #[test]
    fn test_pushes_after_drain_start_new_batch() {
        let q = ReadyQueue::new();
        q.push("a");
        let first = q.drain();
        q.push("b");

        assert_eq!(first.collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(q.drain().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_dropping_queue_and_partial_drain_releases_values() {
        let value = Arc::new(());
        let q = ReadyQueue::new();
        for _ in 0..8 {
            q.push(Arc::clone(&value));
        }

        let mut drain = q.drain();
        drain.next();
        drop(drain);
        assert_eq!(Arc::strong_count(&value), 1);

        q.push(Arc::clone(&value));
        drop(q);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[rstest]
    #[case::two_producers(2, 1_000)]
    #[case::eight_producers(8, 5_000)]
    fn test_concurrent_producers_keep_per_producer_order(
        #[case] producers: usize,
        #[case] per_producer: usize,
    ) -> Result<()> {
        let q = Arc::new(ReadyQueue::new());
        let barrier = Arc::new(Barrier::new(producers + 1));

        let handles = (0..producers)
            .map(|p| {
                let q = Arc::clone(&q);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_producer {
                        q.push((p, i));
                    }
                })
            })
            .collect::<Vec<_>>();

        barrier.wait();

        let mut seen = HashSet::new();
        let mut last = vec![None::<usize>; producers];
        let total = producers * per_producer;

        while seen.len() < total {
            for (p, i) in q.drain() {
                if let Some(prev) = last[p] {
                    assert!(i > prev, "producer {p} out of order: {i} after {prev}");
                }
                last[p] = Some(i);
                assert!(seen.insert((p, i)), "duplicate item {:?}", (p, i));
            }
        }

        for h in handles {
            h.join().map_err(|_| anyhow::anyhow!("producer panicked"))?;
        }

        assert!(q.is_empty());
        Ok(())
    }
}
