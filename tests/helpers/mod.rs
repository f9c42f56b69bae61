pub mod test_utils {
    use std::time::{Duration, Instant};

    use sockpoint::{Endpoint, SocketKind};
    use tokio::net::TcpStream;

    /// TCP-server endpoint on an ephemeral port.
    pub async fn spawn_server() -> (Endpoint, u16) {
        let server = Endpoint::new(SocketKind::TcpServer);
        server.create(0, "").await.expect("server create failed");
        let port = server
            .local_addr()
            .await
            .expect("server has no bound address")
            .port();
        (server, port)
    }

    pub async fn connect(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("client connect failed")
    }

    /// Polls until the server has accepted `count` connections.
    pub async fn wait_for_connections(server: &Endpoint, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.connection_count().await != count {
            assert!(
                Instant::now() < deadline,
                "server never reached {} connections",
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
