use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tracing::{info, warn};

use segaro::{Role, SegaroStream};
use segaro_demos::{ADDRESS, config, demo_binding, init_logging, record};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();
    let listener = TcpListener::bind(ADDRESS).await?;
    info!(address = ADDRESS, "listening");

    loop {
        let (socket, addr) = listener.accept().await?;
        let mut stream = SegaroStream::new_in(config(), demo_binding(), Role::Responder, socket);
        info!(%addr, "accepted a new client");
        tokio::spawn(async move {
            let mut hello = vec![0; 4096];
            let n = stream.read(&mut hello).await?;
            info!(
                len = n,
                header = %String::from_utf8_lossy(stream.request_header().unwrap_or_default()),
                "received client hello"
            );
            stream.write_all(&record(0x16, &[0x02; 90])).await?;

            loop {
                let mut buf = vec![0; 1024];
                match stream.read(&mut buf).await {
                    Ok(n) if n > 0 => {
                        let message = String::from_utf8_lossy(buf.get(5..n).unwrap_or_default());
                        info!(%message, "received message");
                        stream.write_all(&buf[..n]).await?;
                    }
                    Ok(_) => {
                        stream.inner_stream_mut().shutdown().await?;
                        info!(%addr, "client closed connection");
                        return Ok::<(), std::io::Error>(());
                    }
                    Err(e) => {
                        stream.inner_stream_mut().shutdown().await?;
                        warn!(error = %e, "failed to read from socket");
                        return Err(e);
                    }
                }
            }
        });
    }
}
