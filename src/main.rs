/***********************************************************
 *
 *      sockpoint - Socket endpoint demo CLI.
 *          Run a TCP echo server, poke it with a TCP
 *          client, exchange UDP datagrams, or list the
 *          local interfaces the resolver sees.
 *
 ***********************************************************/

use std::time::Duration;

use clap::{Parser, Subcommand};

use sockpoint::{
    best_local_address, enumerate_local_addresses, Endpoint, Received, SocketKind,
};

#[derive(Parser)]
#[command(name = "sockpoint", about = "Socket endpoint demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// TCP echo server: echoes every client message back to its sender
    Serve {
        #[arg(short, long, default_value_t = 8999)]
        port: u16,
    },
    /// Connect to a TCP server, send one message, print the reply
    Send {
        #[arg(short, long, default_value = "127.0.0.1")]
        target: String,
        #[arg(short, long, default_value_t = 8999)]
        port: u16,
        #[arg(short, long, default_value = "hello from sockpoint")]
        message: String,
    },
    /// Send a UDP datagram and wait briefly for an answer
    Udp {
        #[arg(short, long, default_value = "127.0.0.1")]
        target: String,
        #[arg(short, long, default_value_t = 8999)]
        port: u16,
        #[arg(short, long, default_value = "hello from sockpoint")]
        message: String,
    },
    /// List local IPv4 interface addresses
    Interfaces {
        /// Destination to pick the best local interface for
        #[arg(short, long, default_value = "")]
        destination: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => serve(port).await?,
        Command::Send {
            target,
            port,
            message,
        } => send(&target, port, &message).await?,
        Command::Udp {
            target,
            port,
            message,
        } => udp(&target, port, &message).await?,
        Command::Interfaces { destination } => {
            for ip in enumerate_local_addresses() {
                println!("{}", ip);
            }
            if !destination.is_empty() {
                match best_local_address(&destination) {
                    Some(ip) => println!("best local interface for {}: {}", destination, ip),
                    None => println!("no local interface matches {}", destination),
                }
            }
        }
    }

    Ok(())
}

async fn serve(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let server = Endpoint::new(SocketKind::TcpServer);
    server.create(port, "").await?;
    println!("echo server on port {}, Ctrl-C to stop", port);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ready = server.wait_for_client_data(Duration::from_millis(500)) => {
                if !ready {
                    continue;
                }
                while let Some(msg) = server.take_latest_message().await {
                    println!(
                        "{}: {} bytes: {}",
                        msg.client,
                        msg.payload.len(),
                        String::from_utf8_lossy(&msg.payload)
                    );
                    if server.unicast_send(msg.client, &msg.payload).await.is_err() {
                        println!(
                            "echo to {} failed ({} consecutive failures)",
                            msg.client,
                            server.failed_send_count(msg.client).await
                        );
                    }
                }
            }
        }
    }

    server.destroy().await;
    Ok(())
}

async fn send(target: &str, port: u16, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = Endpoint::new(SocketKind::TcpClient);
    client.create(port, target).await?;
    client.send(message.as_bytes()).await?;

    let readiness = client.wait_for_socket(Duration::from_secs(2)).await?;
    if readiness.readable {
        if let Received::Data { payload, .. } = client.receive().await? {
            println!("reply: {}", String::from_utf8_lossy(&payload));
        }
    } else {
        println!("no reply within 2s");
    }

    client.destroy().await;
    Ok(())
}

async fn udp(target: &str, port: u16, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let socket = Endpoint::new(SocketKind::UdpClient);
    socket.create(0, "").await?;
    socket.udp_send(target, port, message.as_bytes()).await?;

    let readiness = socket.wait_for_socket(Duration::from_secs(2)).await?;
    if readiness.readable {
        if let Received::Data { payload, sender } = socket.receive().await? {
            println!(
                "reply from {:?}: {}",
                sender,
                String::from_utf8_lossy(&payload)
            );
        }
    } else {
        println!("no reply within 2s");
    }

    socket.destroy().await;
    Ok(())
}
