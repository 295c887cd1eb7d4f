//! The Linux epoll backend of the [Poller](super::Poller) contract.
//!
//! One epoll instance plus one eventfd for cross-thread interrupts. Registrations live in a
//! [Slab]; the epoll user data packs the slab slot together with a generation counter so an
//! event raised for a slot that was freed and reused inside the same wait can never be
//! delivered against the wrong registration.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::socket::{getsockopt, sockopt};
use slab::Slab;
use tracing::trace;

use super::Interrupter;
use crate::error::{Error, Result};
use crate::io::{IoAction, IoMonitor, IoToken, Readiness};

const EVENT_CAPACITY: usize = 1024;
const INTERRUPT_DATA: u64 = u64::MAX;

struct Ctx {
    fd: RawFd,
    monitor: Arc<dyn IoMonitor>,
    gen: u64,
    read: bool,
    write: bool,
}

struct EventFdInterrupter {
    efd: Arc<EventFd>,
}

impl Interrupter for EventFdInterrupter {
    fn interrupt_wait(&self) {
        // Saturating the counter is harmless; the parked wait only needs it non-zero.
        let _ = self.efd.arm();
    }
}

pub struct EpollPoller {
    epoll: Epoll,
    efd: Arc<EventFd>,
    ctxs: Slab<Ctx>,
    gen: u64,
    buf: Vec<EpollEvent>,
}

fn pack(slot: usize, gen: u64) -> u64 {
    ((gen & 0xFFFF_FFFF) << 32) | (slot as u64 & 0xFFFF_FFFF)
}

fn unpack(data: u64) -> (usize, u64) {
    ((data & 0xFFFF_FFFF) as usize, data >> 32)
}

impl EpollPoller {
    pub fn new() -> Result<EpollPoller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let efd = Arc::new(EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )?);
        epoll.add(
            efd.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, INTERRUPT_DATA),
        )?;
        Ok(EpollPoller {
            epoll,
            efd,
            ctxs: Slab::with_capacity(64),
            gen: 0,
            buf: vec![EpollEvent::empty(); EVENT_CAPACITY],
        })
    }

    fn interest(ctx: &Ctx) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if ctx.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if ctx.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn update_interest(&self, ctx: &Ctx, slot: usize) -> Result<()> {
        let mut ev = EpollEvent::new(Self::interest(ctx), pack(slot, ctx.gen));
        let bfd = unsafe { BorrowedFd::borrow_raw(ctx.fd) };
        self.epoll.modify(bfd, &mut ev)?;
        Ok(())
    }

    fn drain_interrupt(&self) {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.efd.as_raw_fd(), &mut buf);
    }

    fn socket_error(fd: RawFd) -> Error {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        match getsockopt(&bfd, sockopt::SocketError) {
            Ok(0) | Err(_) => Error::Os(Errno::EIO),
            Ok(raw) => Error::Os(Errno::from_raw(raw)),
        }
    }
}

impl super::Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        waiting: &AtomicBool,
        events: &mut Vec<Readiness>,
    ) -> Result<()> {
        let timeout = match timeout {
            Some(d) => EpollTimeout::try_from(d).unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };

        let n = match self.epoll.wait(&mut self.buf, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => {
                waiting.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        waiting.store(false, Ordering::SeqCst);

        for ev in &self.buf[..n] {
            let data = ev.data();
            if data == INTERRUPT_DATA {
                self.drain_interrupt();
                continue;
            }

            let (slot, gen) = unpack(data);
            let ctx = match self.ctxs.get(slot) {
                // Stale slot generation; the registration was replaced mid-wait.
                Some(ctx) if (ctx.gen & 0xFFFF_FFFF) == gen => ctx,
                _ => continue,
            };

            let flags = ev.events();
            let failed = flags.contains(EpollFlags::EPOLLERR);
            let hup = flags.contains(EpollFlags::EPOLLHUP);
            let status = if failed {
                Err(Self::socket_error(ctx.fd))
            } else {
                Ok(())
            };

            // Error and hangup conditions are fanned out to whichever halves are watched, so
            // the monitor observes them even without a matching interest bit.
            let readable = flags.contains(EpollFlags::EPOLLIN) || ((failed || hup) && ctx.read);
            let mut writable =
                flags.contains(EpollFlags::EPOLLOUT) || ((failed || hup) && ctx.write);
            let readable = readable || (!writable && (failed || hup));
            if readable && writable && failed {
                // One error delivery is enough; prefer the read half, the close path follows.
                writable = false;
            }

            events.push(Readiness {
                token: IoToken::new(slot, ctx.gen),
                monitor: ctx.monitor.clone(),
                readable,
                writable,
                status,
            });
        }
        Ok(())
    }

    fn interrupter(&self) -> Arc<dyn Interrupter> {
        Arc::new(EventFdInterrupter {
            efd: self.efd.clone(),
        })
    }

    fn io_begin(&mut self, fd: RawFd, monitor: Arc<dyn IoMonitor>) -> Option<IoToken> {
        self.gen += 1;
        let gen = self.gen;
        let slot = self.ctxs.insert(Ctx {
            fd,
            monitor,
            gen,
            read: false,
            write: false,
        });

        let ev = EpollEvent::new(EpollFlags::empty(), pack(slot, gen));
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self.epoll.add(bfd, ev) {
            trace!(fd, errno = ?e, "epoll add rejected");
            self.ctxs.remove(slot);
            return None;
        }
        trace!(fd, slot, "io_begin");
        Some(IoToken::new(slot, gen))
    }

    fn io_do(&mut self, action: IoAction, token: IoToken) -> Result<()> {
        let ctx = match self.ctxs.get_mut(token.slot) {
            Some(ctx) if ctx.gen == token.gen => ctx,
            _ => return Err(Error::InvalidState),
        };

        match action {
            IoAction::Read => ctx.read = true,
            IoAction::EndRead => ctx.read = false,
            IoAction::Write => ctx.write = true,
            IoAction::EndWrite => ctx.write = false,
            // Broadcast by the loop through monitors(), never forwarded here.
            IoAction::NotifyTerminating => return Ok(()),
        }

        let slot = token.slot;
        let ctx = &self.ctxs[slot];
        self.update_interest(ctx, slot)
    }

    fn io_end(&mut self, token: IoToken) -> bool {
        let live = matches!(self.ctxs.get(token.slot), Some(ctx) if ctx.gen == token.gen);
        if !live {
            return false;
        }
        let ctx = self.ctxs.remove(token.slot);
        let bfd = unsafe { BorrowedFd::borrow_raw(ctx.fd) };
        if let Err(e) = self.epoll.delete(bfd) {
            trace!(fd = ctx.fd, errno = ?e, "epoll delete failed");
        }
        trace!(fd = ctx.fd, slot = token.slot, "io_end");
        true
    }

    fn monitors(&self) -> Vec<(IoToken, Arc<dyn IoMonitor>)> {
        self.ctxs
            .iter()
            .map(|(slot, ctx)| (IoToken::new(slot, ctx.gen), ctx.monitor.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.ctxs.len()
    }
}
