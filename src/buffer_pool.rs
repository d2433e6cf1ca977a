use tokio::sync::Mutex;

/// Relay read buffer size; one buffer per live session direction
pub const BUFFER_SIZE: usize = 8_192;

const MAX_POOL_SIZE: usize = 100;

/// Pool of relay read buffers backed by an async-aware mutex.
///
/// Sessions come and go quickly on a busy proxy; reusing buffers keeps
/// the per-connection allocation churn down without any unsafe tricks.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a new buffer pool
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a buffer from the pool or allocate a fresh one
    pub async fn get_buffer(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        pool.pop().unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    /// Return a buffer to the pool for reuse
    pub async fn return_buffer(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < BUFFER_SIZE {
            return;
        }

        // Zero the buffer on return to avoid leaking data between sessions
        buffer.clear();
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of pooled buffers currently available
    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// Convenience function to get a buffer from the global pool
pub async fn get_buffer() -> Vec<u8> {
    pool().get_buffer().await
}

/// Convenience function to return a buffer to the global pool
pub async fn return_buffer(buffer: Vec<u8>) {
    pool().return_buffer(buffer).await;
}
