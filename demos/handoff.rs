//! Hand-off - give a freshly spawned child process its own connection.
//!
//! The parent asks its server for a detached client socket and spawns this
//! same binary with it. The child recovers the socket, handshakes over it
//! and sends one request.
//!
//! ```text
//! RUST_LOG=debug cargo run --example handoff
//! ```

use std::process::Command;
use std::time::Duration;

use ioservice::transport::bootstrap;
use ioservice::{
    ClientBuilder, Encoding, Package, ResponseResult, SenderType, ServerBuilder, ServerEvent,
};

const CHILD_ARG: &str = "child";
const HELLO_TYPE: u32 = 42;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if std::env::args().any(|arg| arg == CHILD_ARG) {
        child().await
    } else {
        parent().await
    }
}

async fn parent() -> Result<(), Box<dyn std::error::Error>> {
    let (server, mut events) = ServerBuilder::new().build();
    let bundle = server.create_detached_client_socket().await?;

    let mut command = Command::new(std::env::current_exe()?);
    command.arg(CHILD_ARG);
    let mut hand_off = bootstrap::spawn_with_socket(command, &bundle)?;
    println!("spawned child {}", hand_off.child.id());

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::ClientConnected {
                handle,
                sender_type,
            } => {
                println!("child connected as {} ({:?})", handle, sender_type);
                hand_off.release_source();
            }
            ServerEvent::PackageReceived { handle, package } => {
                println!(
                    "child says: {}",
                    String::from_utf8_lossy(&package.get_buffer(0)?.data)
                );
                let mut reply = Package::create_instance(HELLO_TYPE + 1, 0);
                reply.make_direct_response(&package);
                server.send_package(&handle, reply);
            }
            ServerEvent::ClientDisconnected { handle } => {
                println!("child {} went away", handle);
                break;
            }
            _ => {}
        }
    }

    let status = hand_off.child.wait()?;
    println!("child exited with {}", status);
    Ok(())
}

async fn child() -> Result<(), Box<dyn std::error::Error>> {
    let socket = bootstrap::inherited_client_socket()?;
    let (client, _events) = ClientBuilder::new()
        .from_socket(socket)
        .sender_type(SenderType::Vm)
        .build()?;
    client.connect(Some(Duration::from_secs(5))).await?;

    let mut hello = Package::create_instance(HELLO_TYPE, 1);
    hello.fill_buffer(
        0,
        Encoding::Raw,
        format!("hello from pid {}", std::process::id()).as_bytes(),
    )?;
    let job = client.send_package(hello);
    if job.wait_for_response(Some(Duration::from_secs(2))).await != ResponseResult::Success {
        return Err("parent did not answer".into());
    }

    client.disconnect_client().await;
    Ok(())
}
