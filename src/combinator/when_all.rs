use crate::runtime::Schedule;
use crate::task::{JoinHandle, Start, Task, TaskError, inherited_affinity, spawn_with};
use futures::task::AtomicWaker;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};

/// Join counter for `n` children, initialised to `n + 1`.
///
/// Each child decrements it once when it finishes. The awaiting parent
/// decrements it once more after registering its waker, so it cannot miss a
/// wake-up even when every child finished before the parent suspended. The
/// count reaches zero exactly once. A child taking it there wakes the parent;
/// the parent taking it there just returns ready.
#[derive(Debug)]
pub struct WhenAllCounter {
    count: AtomicUsize,
    waker: AtomicWaker,
}

impl WhenAllCounter {
    pub fn new(children: usize) -> Self {
        Self {
            count: AtomicUsize::new(children + 1),
            waker: AtomicWaker::new(),
        }
    }

    /// Records one finished child.
    pub fn notify_complete(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.waker.wake();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    /// Resolves once every child has called [`notify_complete`]. Must be
    /// awaited at most once per counter.
    ///
    /// [`notify_complete`]: WhenAllCounter::notify_complete
    pub fn wait(&self) -> WaitAll<'_> {
        WaitAll {
            counter: self,
            started: false,
        }
    }
}

/// Future returned by [`WhenAllCounter::wait`].
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct WaitAll<'a> {
    counter: &'a WhenAllCounter,
    started: bool,
}

impl Future for WaitAll<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.counter.waker.register(cx.waker());

        // The parent's own decrement never wakes: only children do.
        if !self.started {
            self.started = true;
            if self.counter.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                return Poll::Ready(());
            }
        }

        if self.counter.is_ready() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Forwards a child's completion to the counter, exactly once.
struct ChildSignal {
    counter: Arc<WhenAllCounter>,
    fired: AtomicBool,
}

impl ChildSignal {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.counter.notify_complete();
        }
    }
}

impl Wake for ChildSignal {
    fn wake(self: Arc<Self>) {
        self.fire();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.fire();
    }
}

/// A child of a join, spawned as its own runnable.
struct Child<T> {
    handle: JoinHandle<T>,
    result: Option<Result<T, TaskError>>,
}

impl<T: Send + 'static> Child<T> {
    fn start<F>(future: F, affinity: Option<Arc<dyn Schedule>>, counter: &Arc<WhenAllCounter>) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        // Starts inline on the joiner's thread: a child that completes
        // synchronously never touches a queue.
        let mut handle = spawn_with(future, affinity, Start::Inline);

        let signal = Arc::new(ChildSignal {
            counter: Arc::clone(counter),
            fired: AtomicBool::new(false),
        });
        let waker = Waker::from(Arc::clone(&signal));
        let mut cx = Context::from_waker(&waker);

        let result = match Pin::new(&mut handle).poll(&mut cx) {
            Poll::Ready(result) => {
                signal.fire();
                Some(result)
            }
            Poll::Pending => None,
        };

        Child { handle, result }
    }

    /// Takes the child's result. Only called once the counter is ready.
    fn take(&mut self) -> Result<T, TaskError> {
        if let Some(result) = self.result.take() {
            return result;
        }

        let mut cx = Context::from_waker(Waker::noop());
        match Pin::new(&mut self.handle).poll(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => unreachable!("join counter released before child {} finished", self.handle.id()),
        }
    }
}

/// Runs every future in `futures` concurrently and resolves once all of them
/// have finished, in any order.
///
/// "Ready" means "all done", not "all succeeded": each child's outcome is
/// reported separately, a panicking child as `Err(TaskError)`, in input order.
/// An empty input is ready on the first poll.
///
/// Children inherit the affinity of the task awaiting the join and start
/// inline on its thread, so they run in parallel from their first
/// `schedule()` hop onwards.
pub fn when_all_ready<I>(futures: I) -> Task<Vec<Result<<I::Item as Future>::Output, TaskError>>>
where
    I: IntoIterator,
    I::Item: Future + Send + 'static,
    <I::Item as Future>::Output: Send + 'static,
{
    let futures = futures.into_iter().collect::<Vec<_>>();

    Task::new(async move {
        let counter = Arc::new(WhenAllCounter::new(futures.len()));
        let affinity = inherited_affinity();

        let mut children = futures
            .into_iter()
            .map(|future| Child::start(future, affinity.clone(), &counter))
            .collect::<Vec<_>>();

        counter.wait().await;

        children.iter_mut().map(Child::take).collect()
    })
}

/// Heterogeneous joins over tuples of futures.
pub trait WhenAllReadyTuple {
    type Output;

    fn when_all_ready(self) -> Task<Self::Output>;
}

/// Joins a tuple of up to six futures with different output types. See
/// [`when_all_ready`].
pub fn when_all_ready_tuple<T: WhenAllReadyTuple>(futures: T) -> Task<T::Output> {
    futures.when_all_ready()
}

macro_rules! impl_when_all_ready_tuple {
    ($n:expr; $($F:ident $idx:tt),+) => {
        impl<$($F),+> WhenAllReadyTuple for ($($F,)+)
        where
            $(
                $F: Future + Send + 'static,
                <$F as Future>::Output: Send + 'static,
            )+
        {
            type Output = ($(Result<<$F as Future>::Output, TaskError>,)+);

            fn when_all_ready(self) -> Task<Self::Output> {
                Task::new(async move {
                    let counter = Arc::new(WhenAllCounter::new($n));
                    let affinity = inherited_affinity();

                    let mut children = ($(Child::start(self.$idx, affinity.clone(), &counter),)+);

                    counter.wait().await;

                    ($(children.$idx.take(),)+)
                })
            }
        }
    };
}

impl_when_all_ready_tuple!(1; A 0);
impl_when_all_ready_tuple!(2; A 0, B 1);
impl_when_all_ready_tuple!(3; A 0, B 1, C 2);
impl_when_all_ready_tuple!(4; A 0, B 1, C 2, D 3);
impl_when_all_ready_tuple!(5; A 0, B 1, C 2, D 3, E 4);
impl_when_all_ready_tuple!(6; A 0, B 1, C 2, D 3, E 4, F 5);
