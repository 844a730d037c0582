// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::io;

/// Port I/O accessor used by legacy backends.
///
/// Handed to each backend at construction, so tests can substitute a port space.
pub trait LegacyIo: Debug + Send + Sync {
    fn inb(&self, port: u16) -> io::Result<u8>;
    fn inw(&self, port: u16) -> io::Result<u16>;
    fn inl(&self, port: u16) -> io::Result<u32>;
    fn outb(&self, port: u16, value: u8) -> io::Result<()>;
    fn outw(&self, port: u16, value: u16) -> io::Result<()>;
    fn outl(&self, port: u16, value: u32) -> io::Result<()>;
}

/// Direct port I/O from user space.
#[derive(Debug)]
pub struct PortIo {
    _priv: (),
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::asm;
    use std::io;

    use super::{LegacyIo, PortIo};

    impl PortIo {
        /// Raises the I/O privilege level of the calling process so every thread can access
        /// ports. Requires `CAP_SYS_RAWIO`.
        pub fn new() -> io::Result<Self> {
            // SAFETY: iopl only changes the privilege level of the current process.
            let ret = unsafe { libc::iopl(3) };
            if ret < 0 {
                return Err(vmm_sys_util::errno::Error::last().into());
            }
            Ok(PortIo { _priv: () })
        }
    }

    impl LegacyIo for PortIo {
        fn inb(&self, port: u16) -> io::Result<u8> {
            let value: u8;
            // SAFETY: I/O privilege was granted in `new`; the port belongs to an I/O BAR enabled
            // by the bus.
            unsafe { asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack)) };
            Ok(value)
        }

        fn inw(&self, port: u16) -> io::Result<u16> {
            let value: u16;
            // SAFETY: as for `inb`.
            unsafe { asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack)) };
            Ok(value)
        }

        fn inl(&self, port: u16) -> io::Result<u32> {
            let value: u32;
            // SAFETY: as for `inb`.
            unsafe {
                asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack))
            };
            Ok(value)
        }

        fn outb(&self, port: u16, value: u8) -> io::Result<()> {
            // SAFETY: as for `inb`.
            unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack)) };
            Ok(())
        }

        fn outw(&self, port: u16, value: u16) -> io::Result<()> {
            // SAFETY: as for `inb`.
            unsafe { asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack)) };
            Ok(())
        }

        fn outl(&self, port: u16, value: u32) -> io::Result<()> {
            // SAFETY: as for `inb`.
            unsafe {
                asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack))
            };
            Ok(())
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod unsupported {
    use std::io;

    use super::{LegacyIo, PortIo};

    fn unsupported<T>() -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "port I/O is not available on this architecture",
        ))
    }

    impl PortIo {
        pub fn new() -> io::Result<Self> {
            unsupported()
        }
    }

    impl LegacyIo for PortIo {
        fn inb(&self, _port: u16) -> io::Result<u8> {
            unsupported()
        }

        fn inw(&self, _port: u16) -> io::Result<u16> {
            unsupported()
        }

        fn inl(&self, _port: u16) -> io::Result<u32> {
            unsupported()
        }

        fn outb(&self, _port: u16, _value: u8) -> io::Result<()> {
            unsupported()
        }

        fn outw(&self, _port: u16, _value: u16) -> io::Result<()> {
            unsupported()
        }

        fn outl(&self, _port: u16, _value: u32) -> io::Result<()> {
            unsupported()
        }
    }
}
