//! Proxy - a server and a client that only meet at a relay.
//!
//! The server registers at the relay under a routing uuid; the client dials
//! the relay with the same uuid. Requests and responses look exactly like
//! the direct case.
//!
//! ```text
//! RUST_LOG=ioservice=debug cargo run --example proxy
//! ```

use std::time::Duration;

use ioservice::{
    ClientBuilder, Encoding, Package, ProxyRelay, ResponseResult, ServerBuilder, ServerEvent,
    State,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let relay = ProxyRelay::bind("127.0.0.1:0".parse()?).await?;
    let routing = Uuid::new_v4();
    println!("relay on {}, routing uuid {}", relay.local_addr(), routing);

    let (server, mut events) = ServerBuilder::new()
        .via_proxy(relay.local_addr(), routing)
        .build();
    server.listen().await?;
    if server
        .wait_for_proxy_connection(Some(Duration::from_secs(5)))
        .await
        != State::Connected
    {
        return Err("server could not register at the relay".into());
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::PackageReceived { handle, package } = event {
                let mut reply = Package::create_instance(package.package_type() + 1, 1);
                reply.make_direct_response(&package);
                if reply.fill_buffer(0, Encoding::Raw, b"relayed pong").is_ok() {
                    server.send_package(&handle, reply);
                }
            }
        }
    });

    let (client, _client_events) = ClientBuilder::new()
        .via_proxy(relay.local_addr(), routing)
        .build()?;
    client.connect_client(Some(Duration::from_secs(5)))?;
    let state = client.wait_for_connection(None).await;
    println!("client state: {:?}", state);

    let mut request = Package::create_instance(200, 1);
    request.fill_buffer(0, Encoding::Raw, b"ping")?;
    let job = client.send_package(request);
    match job.wait_for_response(Some(Duration::from_secs(2))).await {
        ResponseResult::Success => {
            let response = job.take_response();
            let body = &response.packages[0].get_buffer(0)?.data;
            println!("response: {}", String::from_utf8_lossy(body));
        }
        other => println!("no response: {:?}", other),
    }

    client.disconnect_client().await;
    relay.shutdown();
    Ok(())
}
