//! # netloop
//!
//! A thread-per-loop networking runtime for linux. Each [EventLoop] owns one OS thread, one
//! poller instance (epoll by default, pluggable behind the [poller::Poller] trait), a task
//! queue and a timer broker; an [EventLoopGroup] pools loops and deals them out round-robin.
//! Sockets are driven by readiness as [net::SocketChannel]s pinned to a single loop, and every
//! asynchronous operation reports through a [Promise] rather than a future, so the runtime has
//! no executor and no wakers - just loops, channels and completions.
//!
//! At a high level a simple TCP echo server works as you would expect:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use netloop::net::{self, ChannelInitializer, SocketChannel, SocketConfig};
//! use netloop::EventLoopGroup;
//!
//! fn main() -> netloop::Result<()> {
//!     let group = EventLoopGroup::builder().size(4).create()?;
//!
//!     // The initializer runs once per accepted channel, on that channel's own loop, right
//!     // before it goes connected.
//!     let echo: ChannelInitializer = Arc::new(|ch: &Arc<SocketChannel>| {
//!         ch.set_on_read(|ch, data| {
//!             ch.write(data.to_vec());
//!         });
//!         Ok(())
//!     });
//!
//!     let listener = net::listen_on(
//!         &group,
//!         "[::]:9091".parse().unwrap(),
//!         SocketConfig::default(),
//!         echo,
//!     )
//!     .wait()?;
//!     println!("Listening on: {}", listener.local_addr()?);
//!
//!     // ... serve until told otherwise, then tear everything down in order.
//!     drop(listener);
//!     group.stop();
//!     Ok(())
//! }
//! ```
//!
//! Similarly here is an example TCP client interacting with the above server:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use netloop::net::{self, ChannelInitializer, SocketChannel, SocketConfig};
//! use netloop::EventLoopGroup;
//!
//! fn main() -> netloop::Result<()> {
//!     let group = EventLoopGroup::builder().size(1).create()?;
//!
//!     let init: ChannelInitializer = Arc::new(|ch: &Arc<SocketChannel>| {
//!         ch.set_on_read(|_ch, data| {
//!             println!("Server response: {}", String::from_utf8_lossy(data));
//!         });
//!         Ok(())
//!     });
//!
//!     let client = net::dial(
//!         &group,
//!         "[::1]:9091".parse().unwrap(),
//!         SocketConfig::default(),
//!         init,
//!     )
//!     .wait()?;
//!
//!     client.write(&b"Hello from client!"[..]).wait()?;
//!
//!     let _ = client.close().wait();
//!     drop(client);
//!     group.stop();
//!     Ok(())
//! }
//! ```
//!
//! Writes are queued whole and drained in order against the socket; the queue is capped, an
//! optional token bucket paces it, and each write's promise resolves exactly once - including
//! when the owning loop shuts down underneath the channel.

pub mod error;
pub mod event_loop;
pub mod group;
pub mod io;
pub mod net;
pub mod poller;
pub mod promise;
pub mod timer;

pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopState, Task};
pub use group::{EventLoopGroup, EventLoopGroupBuilder};
pub use promise::Promise;
pub use timer::Timer;
