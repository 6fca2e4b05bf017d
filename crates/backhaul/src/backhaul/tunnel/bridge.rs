//! The bridge: a bidirectional byte pump between an external connection and
//! a tunnel stream, fed from a process-wide pool of 32 KiB copy buffers.

use std::{
    io,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, OnceLock},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const BUFFER_SIZE: usize = 32 * 1024;

/// Elastic LIFO free-list of copy buffers. No capacity bound: idle buffers
/// accumulate to the high-water mark of concurrent bridges.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock")
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());
        PooledBuffer {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        self.free.lock().expect("buffer pool lock").push(buf);
    }

    pub fn idle(&self) -> usize {
        self.free.lock().expect("buffer pool lock").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

pub fn shared_pool() -> &'static Arc<BufferPool> {
    static POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(BufferPool::new()))
}

/// A leased buffer; returns to its pool on drop.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer present")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer present")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Pump bytes both ways until each direction hits EOF or errors, then shut
/// both writers down. Each direction owns one pooled buffer for its
/// lifetime.
pub async fn forward<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let up = tokio::spawn(async move {
        if let Err(err) = copy_pooled(&mut read_a, &mut write_b).await {
            tracing::debug!(err = %err, "bridge: copy interrupted");
        }
        let _ = write_b.shutdown().await;
    });
    let down = tokio::spawn(async move {
        if let Err(err) = copy_pooled(&mut read_b, &mut write_a).await {
            tracing::debug!(err = %err, "bridge: copy interrupted");
        }
        let _ = write_a.shutdown().await;
    });

    let _ = tokio::join!(up, down);
}

async fn copy_pooled<R, W>(r: &mut R, w: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = shared_pool().get();
    let mut written = 0u64;
    loop {
        let n = r.read(&mut buf[..]).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    w.flush().await?;
    Ok(written)
}
