//! Transport plugin contract (§6)
//!
//! The transport *implementation* is out of scope for this crate; only
//! the trait boundary is owned here, plus an in-memory mock used by
//! tests (§9.2).

use super::hello::HelloMessage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    WouldBlock,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendNowTest {
    Yes,
    No,
    Error,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// 0 means streaming / no MTU.
    fn mtu(&self) -> u16;
    /// Lower is preferred.
    fn cost(&self) -> u32;
    async fn send(&self, session: usize, bytes: &[u8], important: bool) -> SendResult;
    async fn send_now_test(&self, session: usize, size: usize, important: bool) -> SendNowTest;
    async fn connect(&self, hello: &HelloMessage, may_reuse: bool) -> Option<usize>;
    async fn associate(&self, session: usize, token: u64);
    async fn disconnect(&self, session: usize, token: u64);
    fn create_hello(&self) -> HelloMessage;
    fn verify_hello(&self, hello: &HelloMessage) -> bool;
}

/// In-memory transport for tests: bytes handed to `send` are pushed
/// onto a queue the test harness can drain with `drain_sent`.
pub struct MockTransport {
    mtu: u16,
    cost: u32,
    sent: Arc<Mutex<VecDeque<(usize, Vec<u8>)>>>,
    fail_would_block: Arc<Mutex<bool>>,
    hello: HelloMessage,
}

impl MockTransport {
    pub fn new(mtu: u16, hello: HelloMessage) -> Self {
        Self {
            mtu,
            cost: 1,
            sent: Arc::new(Mutex::new(VecDeque::new())),
            fail_would_block: Arc::new(Mutex::new(false)),
            hello,
        }
    }

    pub async fn set_would_block(&self, value: bool) {
        *self.fail_would_block.lock().await = value;
    }

    pub async fn drain_sent(&self) -> Vec<(usize, Vec<u8>)> {
        self.sent.lock().await.drain(..).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    async fn send(&self, session: usize, bytes: &[u8], _important: bool) -> SendResult {
        if *self.fail_would_block.lock().await {
            return SendResult::WouldBlock;
        }
        self.sent.lock().await.push_back((session, bytes.to_vec()));
        SendResult::Ok
    }

    async fn send_now_test(&self, _session: usize, _size: usize, _important: bool) -> SendNowTest {
        if *self.fail_would_block.lock().await {
            SendNowTest::No
        } else {
            SendNowTest::Yes
        }
    }

    async fn connect(&self, _hello: &HelloMessage, _may_reuse: bool) -> Option<usize> {
        Some(0)
    }

    async fn associate(&self, _session: usize, _token: u64) {}

    async fn disconnect(&self, _session: usize, _token: u64) {}

    fn create_hello(&self) -> HelloMessage {
        self.hello.clone()
    }

    fn verify_hello(&self, hello: &HelloMessage) -> bool {
        hello.expires_at > 0
    }
}
