//! Network provider abstraction.
//!
//! The cluster layer never touches sockets directly. It asks a
//! [`NetworkProvider`] to bind and connect, which lets the same code run
//! over real TCP ([`TokioNetworkProvider`]) or over in-process pipes
//! ([`MemoryNetworkProvider`]) in tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

use crate::types::NetworkAddress;

/// Provider trait for creating network connections and listeners.
///
/// Connections are driven from a multi-threaded Tokio runtime, so streams
/// must be `Send`.
#[async_trait]
pub trait NetworkProvider: Clone + Send + Sync + 'static {
    /// The stream type for this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// The listener type for this provider.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;

    /// Create a listener bound to the given address.
    ///
    /// Binding port 0 picks a free port; read it back with
    /// [`TcpListenerTrait::local_addr`].
    async fn bind(&self, addr: &NetworkAddress) -> io::Result<Self::TcpListener>;

    /// Connect to a remote address.
    async fn connect(&self, addr: &NetworkAddress) -> io::Result<Self::TcpStream>;
}

/// Trait for listeners that can accept connections.
#[async_trait]
pub trait TcpListenerTrait: Send + Sync {
    /// The stream type that this listener produces.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept a single incoming connection.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<NetworkAddress>;
}

/// Real Tokio networking implementation.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &NetworkAddress) -> io::Result<Self::TcpListener> {
        let listener = tokio::net::TcpListener::bind(std::net::SocketAddr::from(*addr)).await?;
        Ok(TokioTcpListener { inner: listener })
    }

    async fn connect(&self, addr: &NetworkAddress) -> io::Result<Self::TcpStream> {
        let stream = tokio::net::TcpStream::connect(std::net::SocketAddr::from(*addr)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Wrapper for Tokio TcpListener to implement our trait.
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<NetworkAddress> {
        Ok(self.inner.local_addr()?.into())
    }
}

/// Size of the in-memory pipe buffer per direction.
const MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

/// First port handed out when binding port 0 on the in-memory network.
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

type PendingConnection = (DuplexStream, String);

#[derive(Debug)]
struct MemoryNetworkState {
    listeners: HashMap<NetworkAddress, mpsc::UnboundedSender<PendingConnection>>,
    next_port: u16,
    next_connection: u64,
}

/// In-process network made of Tokio duplex pipes.
///
/// All clones share one address space. Dropping a listener unregisters its
/// address; dropping either end of a pipe closes the other end, which is how
/// tests simulate a node crash.
#[derive(Debug, Clone)]
pub struct MemoryNetworkProvider {
    state: Arc<Mutex<MemoryNetworkState>>,
}

impl Default for MemoryNetworkProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetworkProvider {
    /// Create an empty in-memory network.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryNetworkState {
                listeners: HashMap::new(),
                next_port: FIRST_EPHEMERAL_PORT,
                next_connection: 0,
            })),
        }
    }

    /// Whether something is listening on `addr`.
    pub fn is_listening(&self, addr: &NetworkAddress) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.listeners.contains_key(addr)
    }
}

#[async_trait]
impl NetworkProvider for MemoryNetworkProvider {
    type TcpStream = DuplexStream;
    type TcpListener = MemoryListener;

    async fn bind(&self, addr: &NetworkAddress) -> io::Result<Self::TcpListener> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut local = *addr;
        if local.port == 0 {
            while state
                .listeners
                .contains_key(&NetworkAddress::new(local.ip, state.next_port))
            {
                state.next_port = state.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
            }
            local.port = state.next_port;
            state.next_port = state.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        }
        if state.listeners.contains_key(&local) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{local} already bound"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(local, tx);
        Ok(MemoryListener {
            address: local,
            incoming: tokio::sync::Mutex::new(rx),
            state: Arc::clone(&self.state),
        })
    }

    async fn connect(&self, addr: &NetworkAddress) -> io::Result<Self::TcpStream> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let listener = state.listeners.get(addr).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listens on {addr}"))
        })?;
        state.next_connection += 1;
        let remote_name = format!("memory-{}", state.next_connection);
        drop(state);

        let (client, server) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        listener
            .send((server, remote_name))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(client)
    }
}

/// Listener half of the in-memory network.
#[derive(Debug)]
pub struct MemoryListener {
    address: NetworkAddress,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingConnection>>,
    state: Arc<Mutex<MemoryNetworkState>>,
}

#[async_trait]
impl TcpListenerTrait for MemoryListener {
    type TcpStream = DuplexStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }

    fn local_addr(&self) -> io::Result<NetworkAddress> {
        Ok(self.address)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.listeners.remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_connect_and_echo() {
        let network = MemoryNetworkProvider::new();
        let listener = network
            .bind(&NetworkAddress::localhost(0))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        assert!(addr.port >= FIRST_EPHEMERAL_PORT);

        let mut client = network.connect(&addr).await.expect("connect");
        let (mut server, _) = listener.accept().await.expect("accept");

        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_memory_connect_refused_after_drop() {
        let network = MemoryNetworkProvider::new();
        let addr = NetworkAddress::localhost(7000);
        let listener = network.bind(&addr).await.expect("bind");
        assert!(network.is_listening(&addr));
        drop(listener);

        let err = network.connect(&addr).await.expect_err("must refuse");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_memory_double_bind() {
        let network = MemoryNetworkProvider::new();
        let addr = NetworkAddress::localhost(7001);
        let _listener = network.bind(&addr).await.expect("bind");
        let err = network.bind(&addr).await.expect_err("second bind");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_memory_peer_drop_is_eof() {
        let network = MemoryNetworkProvider::new();
        let listener = network
            .bind(&NetworkAddress::localhost(0))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = network.connect(&addr).await.expect("connect");
        let (mut server, _) = listener.accept().await.expect("accept");

        drop(client);
        let mut buf = [0u8; 1];
        let read = server.read(&mut buf).await.expect("read");
        assert_eq!(read, 0);
    }
}
