//! TCP transport. Each frame is a big-endian `u32` length followed by a bincode body, and every
//! request frame is answered by one response frame on the same connection.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, warn};

use crate::{
    branch::Branch,
    message::{Request, Response},
    task::Spawner,
    transport::Transport,
    BranchId, Directory,
};

const MAX_FRAME_LEN: u32 = 16 << 20;

pub async fn write_frame<W, M>(stream: &mut W, message: &M) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let buf = bincode::serialize(message)?;
    stream.write_u32(buf.len().try_into()?).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one frame. `None` if the remote closed the connection at a frame boundary.
pub async fn read_frame<R, M>(stream: &mut R) -> crate::Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        crate::bail!("frame length {len} exceeds limit")
    }
    let mut buf = vec![0; len as _];
    stream.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}

type Connection = BufStream<TcpStream>;

/// Directory-addressed client side. Idle connections are pooled per branch; a connection is
/// checked out for exactly one request/response exchange, so an exchange that is abandoned
/// midway never leaves a half-read response for the next caller.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    directory: Arc<Directory>,
    idle: Arc<Mutex<HashMap<BranchId, Vec<Connection>>>>,
}

impl TcpTransport {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            idle: Default::default(),
        }
    }

    async fn connect(&self, destination: BranchId) -> crate::Result<Connection> {
        let addr = self.directory.branch_addr(destination)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| crate::err!("connect to branch {destination} at {addr}: {err}"))?;
        stream.set_nodelay(true)?;
        Ok(BufStream::new(stream))
    }

    fn check_out(&self, destination: BranchId) -> Option<Connection> {
        self.idle.lock().unwrap().get_mut(&destination)?.pop()
    }

    fn check_in(&self, destination: BranchId, connection: Connection) {
        self.idle
            .lock()
            .unwrap()
            .entry(destination)
            .or_default()
            .push(connection)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn deliver(&self, destination: BranchId, request: Request) -> crate::Result<Response> {
        let mut connection = match self.check_out(destination) {
            Some(connection) => connection,
            None => self.connect(destination).await?,
        };
        write_frame(&mut connection, &request).await?;
        let Some(response) = read_frame(&mut connection).await? else {
            crate::bail!("branch {destination} closed connection before responding")
        };
        self.check_in(destination, connection);
        Ok(response)
    }
}

/// Accepts connections for `branch` until the listener fails or its supervisor shuts down.
pub async fn serve<T: Transport>(
    listener: TcpListener,
    branch: Arc<Branch<T>>,
    spawner: Spawner,
) -> crate::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let branch = branch.clone();
        let name = format!("branch {} connection from {remote}", branch.id());
        spawner.spawn(name, async move {
            if let Err(err) = serve_connection(BufStream::new(stream), &branch).await {
                // the peer sees the connection drop, which fails its pending call
                warn!(branch = branch.id(), %remote, "connection closed: {err:#}")
            }
            Ok(())
        });
    }
}

async fn serve_connection<T: Transport>(
    mut connection: Connection,
    branch: &Branch<T>,
) -> crate::Result<()> {
    while let Some(request) = read_frame::<_, Request>(&mut connection).await? {
        let response = branch.handle(request).await?;
        write_frame(&mut connection, &response).await?
    }
    debug!(branch = branch.id(), "connection closed by remote");
    Ok(())
}

/// Binds a listener on an ephemeral port of `ip`, returning it with the address it got.
pub async fn bind_ephemeral(ip: std::net::IpAddr) -> crate::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(SocketAddr::new(ip, 0)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::message::{Operation, Source};

    #[tokio::test]
    async fn frames_split_on_length_prefix() -> crate::Result<()> {
        let (mut client, mut server) = duplex(1024);
        let request = Request {
            operation: Operation::Deposit,
            source: Source::Customer,
            id: 1,
            amount: 50,
            clock: 3,
            last_write_id: 0,
            last_write_branch_id: 0,
            write_set: Vec::new(),
        };
        write_frame(&mut client, &request).await?;
        write_frame(&mut client, &request.propagation(2, 1, 4)).await?;
        drop(client);
        assert_eq!(read_frame::<_, Request>(&mut server).await?, Some(request.clone()));
        let propagation = read_frame::<_, Request>(&mut server).await?.unwrap();
        assert_eq!(propagation.source, Source::Branch);
        assert_eq!(propagation.last_write_branch_id, 2);
        assert_eq!(read_frame::<_, Request>(&mut server).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        assert!(read_frame::<_, Request>(&mut server).await.is_err());
    }
}
