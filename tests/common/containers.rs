// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use cascade_replication::resilience::RetryConfig;
use cascade_replication::{RedisQueue, RedisQueueConfig};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams and Lua).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis server hosting queues under a per-test key prefix.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
    pub prefix: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli, prefix: &str) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self {
            container,
            url,
            prefix: prefix.to_string(),
        }
    }

    /// A fresh queue client; several may share the server.
    pub async fn queue(&self) -> RedisQueue {
        let config = RedisQueueConfig::new(self.url.clone())
            .with_prefix(self.prefix.clone())
            .with_retry(RetryConfig::testing());
        RedisQueue::connect(config).await.expect("connect to Redis")
    }

    /// Number of entries in a queue's ticked event stream.
    pub async fn event_stream_len(&self, queue: &str) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.xlen(format!("{}:{}:events", self.prefix, queue)).await
    }
}
