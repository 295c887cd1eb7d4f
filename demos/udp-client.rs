use std::sync::Arc;

use netloop::{
    net::{self, ChannelInitializer, SockKind, SocketChannel, SocketConfig},
    EventLoopGroup, Promise,
};

fn main() -> netloop::Result<()> {
    let group = EventLoopGroup::builder()
        .size(1)
        .name_prefix("udp-client")
        .create()?;

    let cfg = SocketConfig {
        kind: SockKind::Dgram,
        ..SocketConfig::default()
    };

    let response: Arc<Promise<Vec<u8>>> = Arc::new(Promise::new());
    let r = response.clone();
    let init: ChannelInitializer = Arc::new(move |ch: &Arc<SocketChannel>| {
        let r = r.clone();
        ch.set_on_read(move |_ch, data| {
            if !r.is_done() {
                r.set(data.to_vec());
            }
        });
        Ok(())
    });

    // A datagram dial connects the socket so plain write() reaches the server.
    let client = net::dial(&group, "[::1]:9092".parse().unwrap(), cfg, init).wait()?;

    client.write(&b"Hello over UDP!"[..]).wait()?;

    let buf = response.wait();
    println!("Server response: {}", String::from_utf8_lossy(&buf));

    let _ = client.close().wait();
    drop(client);
    group.stop();
    Ok(())
}
