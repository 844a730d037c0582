// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interrupt sources of a PCI function, as seen by a driver thread waiting on them.

use std::fmt::Debug;
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::debug;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum WaitError {
    /// Timed out waiting for an interrupt
    TimedOut,
    /// Interrupt wait was cancelled
    Cancelled,
    /// No interrupt source is configured
    NotConfigured,
    /// Interrupt key {0} is not valid
    InvalidKey(u32),
    /// Interrupt wait failed: {0}
    Io(#[from] io::Error),
}

/// Wait/acknowledge primitive over the interrupt vectors of one device.
///
/// Keys are vector indexes: legacy interrupts always report key 0, MSI-X reports the index of the
/// vector that fired.
pub trait InterruptPort: Debug + Send + Sync {
    /// Blocks until a vector fires, the timeout expires or the wait is cancelled. `None` waits
    /// without a timeout.
    fn wait(&self, timeout: Option<Duration>) -> Result<u32, WaitError>;
    /// Acknowledges the interrupt identified by `key`, re-arming the vector.
    fn ack(&self, key: u32) -> Result<(), WaitError>;
    /// Wakes any thread blocked in `wait`; every later wait reports `Cancelled`.
    fn cancel(&self) -> Result<(), WaitError>;
    /// Number of vectors behind this port.
    fn vectors(&self) -> u32;
}

// Epoll data used to tag the cancellation eventfd.
const CANCEL_KEY: u64 = u64::MAX;

/// `InterruptPort` backed by one `EventFd` per vector.
///
/// The eventfds are handed to whatever delivers the interrupts (VFIO irq sets, uio, or a test) via
/// `notifier`. A vector stays pending until it is acknowledged.
#[derive(Debug)]
pub struct EventFdInterruptPort {
    vectors: Vec<EventFd>,
    cancel_evt: EventFd,
    epoll: Epoll,
}

impl EventFdInterruptPort {
    pub fn new(num_vectors: u32) -> io::Result<Self> {
        let epoll = Epoll::new()?;
        let mut vectors = Vec::new();
        for key in 0..num_vectors {
            let evt = EventFd::new(libc::EFD_NONBLOCK)?;
            epoll.ctl(
                ControlOperation::Add,
                evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, u64::from(key)),
            )?;
            vectors.push(evt);
        }
        let cancel_evt = EventFd::new(libc::EFD_NONBLOCK)?;
        epoll.ctl(
            ControlOperation::Add,
            cancel_evt.as_raw_fd(),
            EpollEvent::new(EventSet::IN, CANCEL_KEY),
        )?;

        Ok(EventFdInterruptPort {
            vectors,
            cancel_evt,
            epoll,
        })
    }

    /// The eventfd signalled when vector `key` fires.
    pub fn notifier(&self, key: u32) -> Option<&EventFd> {
        self.vectors.get(usize::try_from(key).ok()?)
    }

    /// Signals vector `key`.
    pub fn trigger(&self, key: u32) -> Result<(), WaitError> {
        self.notifier(key)
            .ok_or(WaitError::InvalidKey(key))?
            .write(1)
            .map_err(WaitError::Io)
    }
}

impl InterruptPort for EventFdInterruptPort {
    fn wait(&self, timeout: Option<Duration>) -> Result<u32, WaitError> {
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        let mut events = vec![EpollEvent::default(); self.vectors.len() + 1];
        let num_events = loop {
            match self.epoll.wait(timeout_ms, &mut events[..]) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(WaitError::Io(err)),
            }
        };
        if num_events == 0 {
            return Err(WaitError::TimedOut);
        }

        let ready = &events[..num_events];
        if ready.iter().any(|event| event.data() == CANCEL_KEY) {
            return Err(WaitError::Cancelled);
        }
        // Lowest pending vector first, so config changes are not starved by queue traffic.
        let key = ready
            .iter()
            .map(EpollEvent::data)
            .min()
            .ok_or(WaitError::TimedOut)?;
        u32::try_from(key).map_err(|_| WaitError::InvalidKey(u32::MAX))
    }

    fn ack(&self, key: u32) -> Result<(), WaitError> {
        let evt = self.notifier(key).ok_or(WaitError::InvalidKey(key))?;
        match evt.read() {
            Ok(count) => {
                debug!("interrupt {key} acked after {count} signal(s)");
                Ok(())
            }
            // Nothing pending, the vector is already re-armed.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(WaitError::Io(err)),
        }
    }

    fn cancel(&self) -> Result<(), WaitError> {
        self.cancel_evt.write(1).map_err(WaitError::Io)
    }

    fn vectors(&self) -> u32 {
        // The vector count was built from a u32.
        u32::try_from(self.vectors.len()).unwrap_or(u32::MAX)
    }
}
