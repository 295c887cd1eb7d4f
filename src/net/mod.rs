//! Networking on top of the event loop runtime: the socket channel state machine and the
//! dial/listen entry points that assemble channels onto a loop group.
//!
//! [dial] and [listen_on] are the intended way in. Both pick a loop from the group, build a
//! [SocketChannel] there, and hand back a promise for the finished channel; the `initializer`
//! runs on the channel's own loop right before it goes connected and is where callbacks like
//! [SocketChannel::set_on_read] belong. For a listener the initializer runs once per accepted
//! channel instead, and each accepted channel is dispatched to the group's next loop in
//! rotation.

pub mod channel;
pub mod state;
pub(crate) mod sys;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::group::EventLoopGroup;
use crate::promise::Promise;

pub use channel::{ChannelPromise, IoEventFn, SocketChannel};
pub use state::{ChannelFlags, Connectivity};
pub use sys::ConnectStart;

/// Default cap on queued outbound bytes before writes are rejected with `WriteBlocked`.
pub const DEFAULT_SND_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Dgram,
}

/// Per-channel configuration carried into [dial] and [listen_on]; listeners pass it on to
/// every channel they accept.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub kind: SockKind,
    /// Outbound bytes per second, zero for unlimited.
    pub bandwidth_limit: usize,
    /// Attempt the drain inline on `write()` instead of waiting for write readiness.
    pub fast_write: bool,
    /// Cap on queued outbound bytes; see [DEFAULT_SND_CAP].
    pub snd_cap: usize,
    /// Listen backlog for stream listeners.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            kind: SockKind::Stream,
            bandwidth_limit: 0,
            fast_write: true,
            snd_cap: DEFAULT_SND_CAP,
            backlog: 128,
        }
    }
}

/// Runs on a freshly assembled channel, on its own loop, right before it goes connected.
/// Returning an error abandons the channel.
pub type ChannelInitializer = Arc<dyn Fn(&Arc<SocketChannel>) -> Result<()> + Send + Sync>;

/// Resolves with the ready channel once a dial or listen completes.
pub type ChannelFuture = Arc<Promise<Result<Arc<SocketChannel>>>>;

/// Connect to `addr` on a loop picked from `group`.
pub fn dial(
    group: &Arc<EventLoopGroup>,
    addr: SocketAddr,
    cfg: SocketConfig,
    initializer: ChannelInitializer,
) -> ChannelFuture {
    let p: ChannelFuture = Arc::new(Promise::new());
    let l = group.next();
    let l2 = l.clone();
    let p2 = p.clone();
    l.execute(Box::new(move || {
        let ch = match SocketChannel::open(l2.clone(), &addr, &cfg) {
            Ok(ch) => ch,
            Err(e) => {
                p2.set(Err(e));
                return;
            }
        };
        let dialp: ChannelPromise = Arc::new(Promise::new());
        let chr = ch.clone();
        dialp.if_done(move |rt| match rt {
            Ok(()) => p2.set(Ok(chr.clone())),
            Err(e) => p2.set(Err(*e)),
        });
        ch.do_dial(addr, initializer, dialp);
    }));
    p
}

/// Bind `addr` and start serving on a loop picked from `group`. For stream sockets the
/// resolved channel is the listener and `initializer` runs per accepted channel; for datagram
/// sockets it is the bound endpoint itself and `initializer` runs on it once.
pub fn listen_on(
    group: &Arc<EventLoopGroup>,
    addr: SocketAddr,
    cfg: SocketConfig,
    initializer: ChannelInitializer,
) -> ChannelFuture {
    let p: ChannelFuture = Arc::new(Promise::new());
    let l = group.next();
    let l2 = l.clone();
    let p2 = p.clone();
    let group2 = group.clone();
    l.execute(Box::new(move || {
        let ch = match SocketChannel::open(l2.clone(), &addr, &cfg) {
            Ok(ch) => ch,
            Err(e) => {
                p2.set(Err(e));
                return;
            }
        };
        let listenp: ChannelPromise = Arc::new(Promise::new());
        let chr = ch.clone();
        listenp.if_done(move |rt| match rt {
            Ok(()) => p2.set(Ok(chr.clone())),
            Err(e) => p2.set(Err(*e)),
        });
        ch.do_listen_on(addr, cfg, initializer, group2, listenp);
    }));
    p
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::promise::Promise;

    fn group(n: usize) -> Arc<EventLoopGroup> {
        EventLoopGroup::builder()
            .size(n)
            .name_prefix("netloop-net-test")
            .create()
            .unwrap()
    }

    /// An initializer that collects inbound bytes and fulfils `done` once `expect` arrived.
    fn collector(expect: usize, done: Arc<Promise<Vec<u8>>>) -> ChannelInitializer {
        Arc::new(move |ch: &Arc<SocketChannel>| {
            let acc = Arc::new(Mutex::new(Vec::new()));
            let done = done.clone();
            ch.set_on_read(move |_ch, data| {
                let mut acc = acc.lock().unwrap();
                acc.extend_from_slice(data);
                if acc.len() >= expect && !done.is_done() {
                    done.set(acc.clone());
                }
            });
            Ok(())
        })
    }

    #[test]
    fn tcp_echo_roundtrip() {
        let g = group(2);
        {
            let echo: ChannelInitializer = Arc::new(|ch: &Arc<SocketChannel>| {
                ch.set_on_read(|ch, data| {
                    ch.write(data.to_vec());
                });
                Ok(())
            });
            let listener = listen_on(
                &g,
                "127.0.0.1:0".parse().unwrap(),
                SocketConfig::default(),
                echo,
            )
            .wait()
            .unwrap();
            let addr = listener.local_addr().unwrap();

            let msg = b"ping over the loop".to_vec();
            let echoed = Arc::new(Promise::new());
            let client = dial(
                &g,
                addr,
                SocketConfig::default(),
                collector(msg.len(), echoed.clone()),
            )
            .wait()
            .unwrap();

            assert_eq!(client.write(msg.clone()).wait(), Ok(()));
            assert_eq!(echoed.wait(), msg);

            client.close().wait().unwrap();
            listener.close().wait().unwrap();
        }
        g.stop();
    }

    #[test]
    fn udp_echo_roundtrip() {
        let g = group(2);
        {
            let cfg = SocketConfig {
                kind: SockKind::Dgram,
                ..SocketConfig::default()
            };
            let echo: ChannelInitializer = Arc::new(|ch: &Arc<SocketChannel>| {
                ch.set_on_read_from(|ch, data, from| {
                    ch.write_to(data.to_vec(), from);
                });
                Ok(())
            });
            let server = listen_on(&g, "127.0.0.1:0".parse().unwrap(), cfg.clone(), echo)
                .wait()
                .unwrap();
            let addr = server.local_addr().unwrap();

            let msg = b"dgram ping".to_vec();
            let echoed: Arc<Promise<Vec<u8>>> = Arc::new(Promise::new());
            let e2 = echoed.clone();
            let init: ChannelInitializer = Arc::new(move |ch: &Arc<SocketChannel>| {
                let e2 = e2.clone();
                ch.set_on_read(move |_ch, data| {
                    if !e2.is_done() {
                        e2.set(data.to_vec());
                    }
                });
                Ok(())
            });
            let client = dial(&g, addr, cfg, init).wait().unwrap();

            assert_eq!(client.write(msg.clone()).wait(), Ok(()));
            assert_eq!(echoed.wait(), msg);

            client.close().wait().unwrap();
            server.close().wait().unwrap();
        }
        g.stop();
    }

    #[test]
    fn dial_to_a_dead_port_fails() {
        let g = group(1);
        {
            // Bind an ephemeral port, then free it; nothing listens there afterwards.
            let dead = {
                let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                l.local_addr().unwrap()
            };
            let init: ChannelInitializer = Arc::new(|_| Ok(()));
            let rt = dial(&g, dead, SocketConfig::default(), init).wait();
            let err = match rt {
                Ok(_) => panic!("dial to a dead port unexpectedly succeeded"),
                Err(e) => e,
            };
            assert!(err.is_os(), "expected an OS level connect failure: {err}");
        }
        g.stop();
    }

    #[test]
    fn accepted_channels_fan_out_over_the_group() {
        let g = group(2);
        {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let s2 = seen.clone();
            let init: ChannelInitializer = Arc::new(move |ch: &Arc<SocketChannel>| {
                s2.lock()
                    .unwrap()
                    .push(Arc::as_ptr(ch.event_loop()) as usize);
                Ok(())
            });
            let listener = listen_on(
                &g,
                "127.0.0.1:0".parse().unwrap(),
                SocketConfig::default(),
                init,
            )
            .wait()
            .unwrap();
            let addr = listener.local_addr().unwrap();

            let noop: ChannelInitializer = Arc::new(|_| Ok(()));
            let mut clients = Vec::new();
            for _ in 0..4 {
                clients.push(
                    dial(&g, addr, SocketConfig::default(), noop.clone())
                        .wait()
                        .unwrap(),
                );
            }

            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            while seen.lock().unwrap().len() < 4 {
                assert!(std::time::Instant::now() < deadline, "accepts never arrived");
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            let seen = seen.lock().unwrap();
            let distinct: std::collections::HashSet<usize> = seen.iter().copied().collect();
            assert!(distinct.len() >= 2, "accepts all landed on one loop");

            for c in &clients {
                let _ = c.close().wait();
            }
            listener.close().wait().unwrap();
        }
        g.stop();
    }
}
