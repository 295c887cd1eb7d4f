use std::sync::Arc;

use netloop::{
    net::{self, ChannelInitializer, SocketChannel, SocketConfig},
    EventLoopGroup, Promise,
};

fn main() -> netloop::Result<()> {
    println!("Connecting to remote server.");

    let group = EventLoopGroup::builder()
        .size(1)
        .name_prefix("client")
        .create()?;

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

    let client = net::dial(
        &group,
        "[::1]:9091".parse().unwrap(),
        SocketConfig::default(),
        init,
    )
    .wait()?;

    println!(
        "Connected to remote peer {}, local address: {}",
        client.peer_addr()?,
        client.local_addr()?,
    );

    // Send some data to the remote host.
    client.write(&b"Hello from client!"[..]).wait()?;

    // Now read back anything the server sent and then exit.
    let buf = response.wait();
    println!("Server response: {}", String::from_utf8_lossy(&buf));

    let _ = client.close().wait();
    drop(client);
    group.stop();
    Ok(())
}
