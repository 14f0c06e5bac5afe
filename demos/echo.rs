//! Echo - simple request/response example.
//!
//! This example demonstrates:
//! - Starting a server and reacting to its events
//! - Connecting a client and sending a typed request
//! - Answering with a direct response and awaiting it on the job
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo
//! ```

use std::time::Duration;

use ioservice::{
    ClientBuilder, Encoding, Package, ResponseResult, ServerBuilder, ServerEvent,
};
use serde::{Deserialize, Serialize};

const ECHO_REQUEST: u32 = 100;
const ECHO_RESPONSE: u32 = 101;

/// Input structure for the echo request.
#[derive(Serialize, Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo response.
#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (server, mut events) = ServerBuilder::new()
        .listen_on("127.0.0.1:0".parse()?)
        .build();
    let addr = server.listen().await?;
    println!("server listening on {}", addr);

    let responder = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientConnected { handle, sender_type } => {
                    println!("client {} connected ({:?})", handle, sender_type);
                }
                ServerEvent::PackageReceived { handle, package }
                    if package.package_type() == ECHO_REQUEST =>
                {
                    let input: EchoInput = match package.get_buffer_as(0) {
                        Ok(input) => input,
                        Err(e) => {
                            eprintln!("bad request: {}", e);
                            continue;
                        }
                    };
                    let mut reply = Package::create_instance(ECHO_RESPONSE, 1);
                    reply.make_direct_response(&package);
                    let filled = reply.fill_buffer_as(
                        0,
                        Encoding::MsgPack,
                        &EchoOutput {
                            echo: input.message,
                        },
                    );
                    if filled.is_ok() {
                        server.send_package(&handle, reply);
                    }
                }
                ServerEvent::ClientDisconnected { handle } => {
                    println!("client {} disconnected", handle);
                    break;
                }
                _ => {}
            }
        }
    });

    let (client, _client_events) = ClientBuilder::new().direct(addr).build()?;
    let handle = client.connect(Some(Duration::from_secs(5))).await?;
    println!("client connected as {}", handle);

    for message in ["hello", "world"] {
        let mut request = Package::create_instance(ECHO_REQUEST, 1);
        request.fill_buffer_as(
            0,
            Encoding::MsgPack,
            &EchoInput {
                message: message.to_string(),
            },
        )?;

        let job = client.send_package_with_retry(request).await;
        if job.wait_for_response(Some(Duration::from_secs(2))).await == ResponseResult::Success {
            let response = job.take_response();
            for package in response.packages {
                let output: EchoOutput = package.get_buffer_as(0)?;
                println!("echo: {}", output.echo);
            }
        } else {
            println!("no response for {:?}", message);
        }
    }

    client.disconnect_client().await;
    responder.await?;
    Ok(())
}
