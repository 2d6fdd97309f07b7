use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, BufStream, ReadBuf},
  net::TcpStream,
};

/// Buffered transport for one server connection.
///
/// The resolved addresses are kept so the stream can be duplicated for a
/// side-channel query connection while the main one is dumping.
#[derive(Debug)]
pub struct Stream {
  inner: BufStream<TcpStream>,
  addrs: Vec<SocketAddr>,
}

impl Stream {
  pub async fn connect_tcp(addrs: impl Into<Vec<SocketAddr>>) -> io::Result<Self> {
    let addrs = addrs.into();
    let inner = TcpStream::connect(addrs.as_slice()).await.map(BufStream::new)?;
    Ok(Self { inner, addrs })
  }

  pub async fn duplicate(&self) -> io::Result<Self> {
    Self::connect_tcp(self.addrs.clone()).await
  }
}

impl AsyncRead for Stream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Stream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
