/// A single-threaded cooperative discrete-event executor over a virtual
/// clock. Tasks are plain futures; the only suspension points are
/// [`Kernel::timeout`] and [`Resource::acquire`], both of which park the
/// running task and hand control back to the event loop. Wake-ups scheduled
/// for the same virtual instant fire in enqueue order, so a run is fully
/// deterministic for a given input.
use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
    time::Duration,
};

/// Virtual time since simulation start.
pub type SimTime = Duration;

type TaskId = u64;

struct TimerEntry {
    at: SimTime,
    seq: u64,
    task: TaskId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, BinaryHeap is a max-heap. Ties break by enqueue order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct KernelInner {
    now: SimTime,
    next_task: TaskId,
    timer_seq: u64,
    current: Option<TaskId>,
    ready: VecDeque<TaskId>,
    timers: BinaryHeap<TimerEntry>,
    tasks: HashMap<TaskId, Pin<Box<dyn Future<Output = ()>>>>,
}

#[derive(Clone)]
pub struct Kernel {
    inner: Rc<RefCell<KernelInner>>,
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            inner: Rc::new(RefCell::new(KernelInner {
                now: SimTime::ZERO,
                next_task: 0,
                timer_seq: 0,
                current: None,
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                tasks: HashMap::new(),
            })),
        }
    }

    pub fn now(&self) -> SimTime {
        self.inner.borrow().now
    }

    /// Suspends the calling task until `now() >= now_at_call + d`.
    pub fn timeout(&self, d: Duration) -> Timeout {
        Timeout {
            kernel: self.clone(),
            deadline: self.now() + d,
            armed: false,
        }
    }

    /// Registers a task to run concurrently under cooperative scheduling.
    /// The task is first polled when control returns to the event loop.
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_task;
        inner.next_task += 1;
        inner.tasks.insert(id, Box::pin(task));
        inner.ready.push_back(id);
    }

    /// A FIFO semaphore-like queue backed by this kernel.
    pub fn resource(&self, capacity: usize) -> Resource {
        assert!(capacity > 0, "resource capacity must be positive");
        Resource {
            kernel: self.clone(),
            inner: Rc::new(RefCell::new(ResourceInner {
                capacity,
                in_use: 0,
                next_waiter: 0,
                waiters: VecDeque::new(),
                granted: Vec::new(),
            })),
        }
    }

    /// Processes scheduled wake-ups until none remain or the clock reaches
    /// `until`. Pending work is left intact, a later `run` resumes it.
    pub fn run(&self, until: Option<SimTime>) {
        loop {
            loop {
                let next = self.inner.borrow_mut().ready.pop_front();
                match next {
                    Some(task) => self.poll_task(task),
                    None => break,
                }
            }
            let mut inner = self.inner.borrow_mut();
            match inner.timers.pop() {
                None => break,
                Some(entry) => {
                    if let Some(limit) = until {
                        if entry.at > limit {
                            inner.timers.push(entry);
                            inner.now = inner.now.max(limit);
                            break;
                        }
                    }
                    inner.now = inner.now.max(entry.at);
                    let task = entry.task;
                    inner.ready.push_back(task);
                }
            }
        }
    }

    fn current_task(&self) -> TaskId {
        self.inner
            .borrow()
            .current
            .expect("suspension primitive used outside a running simulation task")
    }

    fn arm_timer(&self, at: SimTime, task: TaskId) {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.timer_seq;
        inner.timer_seq += 1;
        inner.timers.push(TimerEntry { at, seq, task });
    }

    fn make_ready(&self, task: TaskId) {
        self.inner.borrow_mut().ready.push_back(task);
    }

    fn poll_task(&self, task: TaskId) {
        let mut fut = match self.inner.borrow_mut().tasks.remove(&task) {
            Some(fut) => fut,
            // Already completed; a stale wake-up is harmless.
            None => return,
        };
        self.inner.borrow_mut().current = Some(task);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = fut.as_mut().poll(&mut cx);
        let mut inner = self.inner.borrow_mut();
        inner.current = None;
        if poll.is_pending() {
            inner.tasks.insert(task, fut);
        }
    }
}

// The executor never relies on wakers; suspension primitives register the
// running task directly. A no-op waker satisfies the Future contract.
fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

pub struct Timeout {
    kernel: Kernel,
    deadline: SimTime,
    armed: bool,
}

impl Future for Timeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.kernel.now() >= self.deadline {
            return Poll::Ready(());
        }
        if !self.armed {
            let task = self.kernel.current_task();
            let deadline = self.deadline;
            self.kernel.arm_timer(deadline, task);
            self.armed = true;
        }
        Poll::Pending
    }
}

struct ResourceInner {
    capacity: usize,
    in_use: usize,
    next_waiter: u64,
    waiters: VecDeque<(u64, TaskId)>,
    // Permits handed directly to the head waiter on release so a later
    // arrival cannot barge in front of it.
    granted: Vec<(u64, TaskId)>,
}

impl ResourceInner {
    fn release_one(&mut self, kernel: &Kernel) {
        if let Some((waiter, task)) = self.waiters.pop_front() {
            self.granted.push((waiter, task));
            kernel.make_ready(task);
        } else {
            self.in_use -= 1;
        }
    }
}

/// FIFO resource queue. `acquire` suspends until a permit is free; the
/// returned guard releases it on scope exit, on every path.
#[derive(Clone)]
pub struct Resource {
    kernel: Kernel,
    inner: Rc<RefCell<ResourceInner>>,
}

impl Resource {
    pub fn acquire(&self) -> Acquire {
        Acquire {
            res: self.clone(),
            waiter: None,
            done: false,
        }
    }
}

pub struct Acquire {
    res: Resource,
    waiter: Option<u64>,
    done: bool,
}

impl Future for Acquire {
    type Output = ResourceGuard;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<ResourceGuard> {
        let me = self.get_mut();
        let mut state = me.res.inner.borrow_mut();
        if let Some(waiter) = me.waiter {
            return match state.granted.iter().position(|g| g.0 == waiter) {
                Some(pos) => {
                    state.granted.remove(pos);
                    drop(state);
                    me.done = true;
                    Poll::Ready(ResourceGuard {
                        res: me.res.clone(),
                    })
                }
                None => Poll::Pending,
            };
        }
        if state.in_use < state.capacity {
            state.in_use += 1;
            drop(state);
            me.done = true;
            return Poll::Ready(ResourceGuard {
                res: me.res.clone(),
            });
        }
        let task = me.res.kernel.current_task();
        let waiter = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back((waiter, task));
        me.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        // A waiter abandoned mid-queue must not strand its slot, and a
        // handed-off permit that was never picked up must move on.
        if self.done {
            return;
        }
        if let Some(waiter) = self.waiter {
            let mut state = self.res.inner.borrow_mut();
            if let Some(pos) = state.granted.iter().position(|g| g.0 == waiter) {
                state.granted.remove(pos);
                state.release_one(&self.res.kernel);
            } else {
                state.waiters.retain(|w| w.0 != waiter);
            }
        }
    }
}

pub struct ResourceGuard {
    res: Resource,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.res.inner.borrow_mut().release_one(&self.res.kernel);
    }
}
