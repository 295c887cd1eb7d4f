use std::sync::Arc;

use netloop::{
    net::{self, ChannelInitializer, SocketChannel, SocketConfig},
    EventLoopGroup,
};

fn main() {
    tracing_subscriber::fmt::init();

    // First we need a pool of event loops to run everything on.
    let group = EventLoopGroup::builder()
        .name_prefix("echo")
        .create()
        .expect("Failed to start the event loop group.");

    // The initializer runs once per accepted channel, on that channel's own loop, so every
    // connection comes up with its echo behavior already wired.
    let echo: ChannelInitializer = Arc::new(|ch: &Arc<SocketChannel>| {
        println!("Got connection from: {}", ch.peer_addr()?);
        ch.set_on_read(|ch, data| {
            println!("Client request: {}", String::from_utf8_lossy(data));
            ch.write(data.to_vec());
        });
        ch.set_on_closed(|ch| println!("Connection done: {:?}", ch.peer_addr()));
        Ok(())
    });

    let listener = net::listen_on(
        &group,
        "[::]:9091".parse().unwrap(),
        SocketConfig::default(),
        echo,
    )
    .wait()
    .expect("Failed to configure listener.");

    println!("Listening on: {}", listener.local_addr().unwrap());

    // The group outlives every channel still registered on it; with the listener alive this
    // serves until the process is killed.
    drop(listener);
    group.wait();
}
