use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::info;

use segaro::{Role, SegaroStream};
use segaro_demos::{ADDRESS, config, demo_binding, init_logging, record};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();
    let socket = TcpStream::connect(ADDRESS).await?;
    let mut stream = SegaroStream::new_in(config(), demo_binding(), Role::Initiator, socket);
    stream.set_request_header(b"echo.example:443");
    info!(address = ADDRESS, "connected to server");

    stream.write_all(&record(0x16, &[0x01; 250])).await?;
    let mut hello = vec![0; 4096];
    let n = stream.read(&mut hello).await?;
    info!(len = n, "received server hello");

    for i in 1..=2 {
        let message = format!("message {}", i);
        stream.write_all(&record(0x17, message.as_bytes())).await?;

        let mut buf = vec![0; 1024];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            info!("server closed connection");
            break;
        }
        info!(echo = %String::from_utf8_lossy(buf.get(5..n).unwrap_or_default()), "echo received");
    }
    stream.inner_stream_mut().shutdown().await?;
    Ok(())
}
