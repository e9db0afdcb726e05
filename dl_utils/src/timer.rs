use async_trait::async_trait;
use mockall::automock;
use std::time::{Duration, Instant};

/// Time abstraction for better testing.
#[automock]
#[async_trait]
pub trait AsyncTimer {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

pub struct SysTimer;

#[async_trait]
impl AsyncTimer for SysTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
