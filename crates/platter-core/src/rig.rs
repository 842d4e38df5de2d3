//! Event-loop integration
//!
//! The core does not own a poll loop. The host ("rig") owns one [`PollSlot`]
//! per track, asks each track to arm it via [`Track::poll_register`], runs
//! `poll(2)` (or equivalent) over the armed descriptors, writes the kernel's
//! readiness back with [`PollSlot::set_revents`], and then calls
//! [`Track::handle`]. Starting an import from another thread interrupts the
//! host through the injected [`Rig`] capability so registrations are
//! refreshed.
//!
//! [`Track::poll_register`]: crate::track::Track::poll_register
//! [`Track::handle`]: crate::track::Track::handle

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI16, AtomicI32, Ordering};

const VACANT: RawFd = -1;

/// One externally owned descriptor slot in the host poll loop.
///
/// The fields mirror `struct pollfd`: a descriptor, an interest mask and a
/// readiness mask. They are atomics because the track probes readiness
/// without taking its lock; the slot itself carries no data, so relaxed
/// ordering is enough.
pub struct PollSlot {
    fd: AtomicI32,
    events: AtomicI16,
    revents: AtomicI16,
}

impl PollSlot {
    /// A vacant slot, registered with no track.
    pub fn new() -> Self {
        Self {
            fd: AtomicI32::new(VACANT),
            events: AtomicI16::new(0),
            revents: AtomicI16::new(0),
        }
    }

    /// Descriptor to poll, if the slot is armed.
    pub fn fd(&self) -> Option<RawFd> {
        match self.fd.load(Ordering::Relaxed) {
            VACANT => None,
            fd => Some(fd),
        }
    }

    /// Interest mask for the host's `poll(2)` call.
    pub fn events(&self) -> i16 {
        self.events.load(Ordering::Relaxed)
    }

    /// Readiness mask last written by the host.
    pub fn revents(&self) -> i16 {
        self.revents.load(Ordering::Relaxed)
    }

    /// Record the readiness `poll(2)` reported for this descriptor.
    pub fn set_revents(&self, revents: i16) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn arm(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Relaxed);
        self.events.store(libc::POLLIN, Ordering::Relaxed);
        self.revents.store(0, Ordering::Relaxed);
    }
}

impl Default for PollSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Wake-up capability injected into each track.
///
/// [`Track::import`](crate::track::Track::import) calls [`awaken`] after a
/// new importer starts so the host leaves its poll wait and re-registers
/// every track's descriptor.
///
/// [`awaken`]: Rig::awaken
pub trait Rig: Send + Sync {
    /// Interrupt the host poll loop.
    fn awaken(&self);
}

/// A flume channel works as a wake-up line for message-driven hosts.
impl Rig for flume::Sender<()> {
    fn awaken(&self) {
        // Drop-if-full: one pending wake is enough.
        let _ = self.try_send(());
    }
}
