//! The epoll iteration engine shared by the mainline and real-time threads.
//!
//! Each loop owns three descriptors: the epoll instance itself, an eventfd
//! used as a coalescing cross-thread wake-up, and a periodic timerfd that is
//! the stack's time base. One iteration is `wait()` → collaborator
//! inspection → `finish_iteration()`; the Δt snapshot and the wake-up source
//! fields are only valid inside that window.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::debug;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use ferrocan_common::CoError;

use crate::clock;

/// Cloneable handle that wakes a blocked [`EventLoop::wait`] from any thread.
///
/// Writes into the loop's eventfd accumulate a counter; however many triggers
/// land between two waits, the loop wakes exactly once and drains them all.
#[derive(Clone)]
pub struct WakeupHandle {
    fd: Arc<OwnedFd>,
}

impl WakeupHandle {
    /// Signal the owning event loop. Never blocks.
    pub fn trigger(&self) {
        let val: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&val as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            debug!("wakeup write failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Shared fd-registration view of an event loop's epoll instance.
///
/// The CAN driver and the gateway register their descriptors through this;
/// it stays valid from any thread for the lifetime of the loop.
#[derive(Clone)]
pub struct FdRegistry {
    epoll: Arc<Epoll>,
}

impl FdRegistry {
    /// Watch `fd` for level-triggered read readiness.
    pub fn add(&self, fd: BorrowedFd<'_>) -> Result<(), CoError> {
        let data = fd.as_raw_fd() as u64;
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, data))
            .map_err(|e| CoError::syscall("epoll_ctl(add)", e.into()))
    }

    /// Watch `fd` for one read-readiness event, then disarm until re-armed.
    pub fn add_oneshot(&self, fd: BorrowedFd<'_>) -> Result<(), CoError> {
        let data = fd.as_raw_fd() as u64;
        self.epoll
            .add(
                fd,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT, data),
            )
            .map_err(|e| CoError::syscall("epoll_ctl(add oneshot)", e.into()))
    }

    /// Re-arm a one-shot watch after its event was handled.
    pub fn rearm_oneshot(&self, fd: BorrowedFd<'_>) -> Result<(), CoError> {
        let data = fd.as_raw_fd() as u64;
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT, data);
        self.epoll
            .modify(fd, &mut ev)
            .map_err(|e| CoError::syscall("epoll_ctl(mod)", e.into()))
    }

    /// Stop watching `fd`. Must be called before the fd is closed.
    pub fn delete(&self, fd: BorrowedFd<'_>) -> Result<(), CoError> {
        self.epoll
            .delete(fd)
            .map_err(|e| CoError::syscall("epoll_ctl(del)", e.into()))
    }
}

/// One epoll/eventfd/timerfd multiplexing loop.
pub struct EventLoop {
    epoll: Arc<Epoll>,
    wake_fd: Arc<OwnedFd>,
    timer: TimerFd,
    interval_us: u32,
    previous_time_us: u64,
    time_difference_us: u32,
    timer_next_us: u32,
    timer_event: bool,
    new_event: bool,
    pending: EpollEvent,
}

fn new_eventfd() -> Result<OwnedFd, CoError> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(CoError::last_os_error("eventfd"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Drain the u64 counter of an eventfd or timerfd. Short reads on an already
/// drained descriptor are expected and only logged.
fn drain_counter(fd: RawFd, what: &str) {
    let mut val: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            (&mut val as *mut u64).cast(),
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            debug!("read({what}): {err}");
        }
    }
}

impl EventLoop {
    /// Provision the three descriptors and arm the periodic timer.
    ///
    /// The first expiration is set one nanosecond out so the very first
    /// iteration fires immediately; after that the period is `interval_us`.
    pub fn new(interval_us: u32) -> Result<Self, CoError> {
        let epoll = Arc::new(
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
                .map_err(|e| CoError::syscall("epoll_create", e.into()))?,
        );

        let wake_fd = Arc::new(new_eventfd()?);
        epoll
            .add(
                wake_fd.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, wake_fd.as_raw_fd() as u64),
            )
            .map_err(|e| CoError::syscall("epoll_ctl(event_fd)", e.into()))?;

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| CoError::syscall("timerfd_create", e.into()))?;
        timer
            .set(
                Expiration::IntervalDelayed(
                    TimeSpec::new(0, 1),
                    clock::us_to_timespec(interval_us as u64),
                ),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|e| CoError::syscall("timerfd_settime", e.into()))?;
        epoll
            .add(
                timer.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, timer.as_fd().as_raw_fd() as u64),
            )
            .map_err(|e| CoError::syscall("epoll_ctl(timer_fd)", e.into()))?;

        Ok(Self {
            epoll,
            wake_fd,
            timer,
            interval_us,
            previous_time_us: clock::now_us(),
            time_difference_us: 0,
            timer_next_us: interval_us,
            timer_event: false,
            new_event: false,
            pending: EpollEvent::empty(),
        })
    }

    /// The configured periodic interval in microseconds.
    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// A cloneable cross-thread wake-up handle for this loop.
    pub fn wakeup_handle(&self) -> WakeupHandle {
        WakeupHandle {
            fd: Arc::clone(&self.wake_fd),
        }
    }

    /// Shared fd-registration view for collaborators (driver, gateway).
    pub fn registry(&self) -> FdRegistry {
        FdRegistry {
            epoll: Arc::clone(&self.epoll),
        }
    }

    /// Block until exactly one descriptor is ready and populate the
    /// iteration snapshot.
    ///
    /// After this returns: [`time_difference_us`](Self::time_difference_us)
    /// holds Δt since the previous return, [`timer_event`](Self::timer_event)
    /// tells whether the periodic timer fired, and
    /// [`pending_event`](Self::pending_event) exposes any event that belongs
    /// to a collaborator descriptor.
    pub fn wait(&mut self) {
        let mut events = [EpollEvent::empty()];
        let ready = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => {
                debug!("epoll_wait: {e}");
                0
            }
        };

        self.new_event = false;
        self.timer_event = false;

        let now = clock::now_us();
        self.time_difference_us = now.wrapping_sub(self.previous_time_us) as u32;
        self.previous_time_us = now;
        // collaborators may lower this during the iteration
        self.timer_next_us = self.interval_us;

        if ready != 1 {
            return;
        }
        let ev = events[0];
        self.pending = ev;
        let fd = ev.data() as RawFd;

        if ev.events().contains(EpollFlags::EPOLLIN) && fd == self.wake_fd.as_raw_fd() {
            drain_counter(fd, "event_fd");
        } else if ev.events().contains(EpollFlags::EPOLLIN) && fd == self.timer.as_fd().as_raw_fd()
        {
            drain_counter(fd, "timer_fd");
            self.timer_event = true;
        } else {
            self.new_event = true;
        }
    }

    /// Δt between the two most recent [`wait`](Self::wait) returns.
    pub fn time_difference_us(&self) -> u32 {
        self.time_difference_us
    }

    /// True iff the current wake-up came from the periodic timer.
    pub fn timer_event(&self) -> bool {
        self.timer_event
    }

    /// The event pending collaborator inspection, if any.
    pub fn pending_event(&self) -> Option<&EpollEvent> {
        self.new_event.then_some(&self.pending)
    }

    /// Mark the pending event as handled.
    pub fn consume_event(&mut self) {
        self.new_event = false;
    }

    /// Request the next periodic wake-up earlier than the full interval.
    /// Only ever shortens the pending request.
    pub fn lower_timer_next(&mut self, us: u32) {
        if us < self.timer_next_us {
            self.timer_next_us = us;
        }
    }

    /// Currently requested time until the next timer wake-up.
    pub fn timer_next_us(&self) -> u32 {
        self.timer_next_us
    }

    /// End the iteration: log an unconsumed event, and re-arm the timer once
    /// with a shortened expiration iff a collaborator requested one.
    ///
    /// The periodic *interval* is never altered; after one accelerated tick
    /// the timer snaps back to the configured period.
    pub fn finish_iteration(&mut self) {
        if self.new_event {
            debug!(
                "unconsumed epoll event: events={:?} fd={}",
                self.pending.events(),
                self.pending.data()
            );
            self.new_event = false;
        }

        if self.timer_next_us < self.interval_us {
            // one extra microsecond so the expiration can never be zero
            let value_us = self.timer_next_us as u64 + 1;
            let res = self.timer.set(
                Expiration::IntervalDelayed(
                    clock::us_to_timespec(value_us),
                    clock::us_to_timespec(self.interval_us as u64),
                ),
                TimerSetTimeFlags::empty(),
            );
            if let Err(e) = res {
                debug!("timerfd_settime: {e}");
            }
        }
    }
}
