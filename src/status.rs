//! Drive status bits and the millisecond countdown timers.
//!
//! Both are shared between the foreground driver and a periodic tick
//! (normally a 1 kHz timer interrupt). Every field is a single atomic, so a
//! `DriveState` can live in a `static` and be ticked from interrupt context
//! while the driver holds a shared reference to it.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::spi::backend::Socket;

/// Disk status bits, FatFs numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveStatus(u8);

bitflags::bitflags! {
    impl DriveStatus: u8 {
        const NOT_INITIALIZED = 0x01;
        const NO_CARD         = 0x02;
        const WRITE_PROTECTED = 0x04;
    }
}

/// The two independent countdown timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Data token wait and initialization negotiation
    Transfer,
    /// Card ready wait
    Ready,
}

/// Status bits and timers shared by the driver and the periodic tick
#[derive(Debug)]
pub struct DriveState {
    status: AtomicU8,
    transfer: AtomicU32,
    ready: AtomicU32,
}

impl Default for DriveState {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveState {
    /// Not initialized, timers expired
    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(DriveStatus::NOT_INITIALIZED.bits()),
            transfer: AtomicU32::new(0),
            ready: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> DriveStatus {
        DriveStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, flags: DriveStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, flags: DriveStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn counter(&self, timer: Timer) -> &AtomicU32 {
        match timer {
            Timer::Transfer => &self.transfer,
            Timer::Ready => &self.ready,
        }
    }

    /// Start a countdown of `ms` ticks
    pub fn arm(&self, timer: Timer, ms: u32) {
        self.counter(timer).store(ms, Ordering::Release);
    }

    /// Ticks left on a timer
    pub fn remaining(&self, timer: Timer) -> u32 {
        self.counter(timer).load(Ordering::Acquire)
    }

    pub fn expired(&self, timer: Timer) -> bool {
        self.remaining(timer) == 0
    }

    /// Periodic tick: count both timers down (stopping at zero) and refresh
    /// the socket bits.
    ///
    /// A missing card forces `NOT_INITIALIZED`; an inserted card only clears
    /// `NO_CARD`, so it still has to be initialized explicitly.
    pub fn tick<S: Socket + ?Sized>(&self, socket: &mut S) {
        for counter in [&self.transfer, &self.ready] {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }

        if socket.write_protected() {
            self.set(DriveStatus::WRITE_PROTECTED);
        } else {
            self.clear(DriveStatus::WRITE_PROTECTED);
        }

        if socket.card_present() {
            self.clear(DriveStatus::NO_CARD);
        } else {
            self.set(DriveStatus::NO_CARD | DriveStatus::NOT_INITIALIZED);
        }
    }
}
