use std::sync::Arc;

use netloop::{
    net::{self, ChannelInitializer, SockKind, SocketChannel, SocketConfig},
    EventLoopGroup,
};

fn main() {
    tracing_subscriber::fmt::init();

    let group = EventLoopGroup::builder()
        .size(1)
        .name_prefix("udp-echo")
        .create()
        .expect("Failed to start the event loop group.");

    let cfg = SocketConfig {
        kind: SockKind::Dgram,
        ..SocketConfig::default()
    };

    // A bound datagram endpoint has no accept phase; every datagram lands here directly.
    let echo: ChannelInitializer = Arc::new(|ch: &Arc<SocketChannel>| {
        ch.set_on_read_from(|ch, data, from| {
            println!("Datagram from {}: {}", from, String::from_utf8_lossy(data));
            ch.write_to(data.to_vec(), from);
        });
        Ok(())
    });

    let server = net::listen_on(&group, "[::]:9092".parse().unwrap(), cfg, echo)
        .wait()
        .expect("Failed to configure the datagram endpoint.");

    println!("Serving datagrams on: {}", server.local_addr().unwrap());

    drop(server);
    group.wait();
}
