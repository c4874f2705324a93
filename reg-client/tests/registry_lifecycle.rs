//! End-to-end exercise of the facade against an in-process fake driver:
//! open -> register -> disconnect/reconnect -> subscribe -> close.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reg_client::core::{
    AbstractRegistry, ClusterEventKind, RegistryDriver, RegistryError,
};
use reg_client::primitives::{RegistryUrl, UrlKey};

struct FakeDriver {
    /// The first `do_connect` call fails once, exercising the connect-retry
    /// ladder before `open()` ultimately succeeds.
    fail_first_connect: AtomicBool,
    connects: AtomicUsize,
    registers: AtomicUsize,
    subscribes: AtomicUsize,
}

impl FakeDriver {
    fn new() -> Self {
        Self {
            fail_first_connect: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            registers: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RegistryDriver for FakeDriver {
    async fn do_connect(&self) -> Result<(), RegistryError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_first_connect.swap(false, Ordering::SeqCst) {
            return Err(RegistryError::retryable("simulated transport drop"));
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn do_register(&self, _key: &UrlKey) -> Result<(), RegistryError> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_deregister(&self, _key: &UrlKey) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn do_subscribe_cluster(&self, _key: &UrlKey) -> Result<(), RegistryError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_subscribe_config(&self, _key: &UrlKey) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn do_unsubscribe_cluster(&self, _key: &UrlKey) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn do_unsubscribe_config(&self, _key: &UrlKey) -> Result<(), RegistryError> {
        Ok(())
    }
}

fn url() -> RegistryUrl {
    RegistryUrl::builder("rpc", "svc")
        .path("svc")
        .parameter("taskRetryInterval", "20")
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn open_register_reconnect_subscribe_close() {
    let driver = Arc::new(FakeDriver::new());
    let registry = Arc::new(AbstractRegistry::new(url(), driver.clone(), None).unwrap());

    registry.open().await.unwrap();
    assert!(registry.is_open());
    // The first connect attempt failed; open() only resolved once the
    // reconnect loop retried and succeeded.
    assert_eq!(driver.connects.load(Ordering::SeqCst), 2);

    let resolved = registry.register(url()).await.unwrap();
    assert_eq!(resolved, url());
    assert_eq!(driver.registers.load(Ordering::SeqCst), 1);

    let received: Arc<parking_lot::Mutex<Vec<ClusterEventKind>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();
    registry.subscribe_cluster(&url(), Arc::new(move |event| sink.lock().push(event)));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(driver.subscribes.load(Ordering::SeqCst), 1);

    registry.close().await.unwrap();
    assert!(!registry.is_open());
}

#[tokio::test(flavor = "multi_thread")]
async fn reopen_after_close_builds_fresh_controller() {
    let driver = Arc::new(FakeDriver::new());
    let registry = Arc::new(AbstractRegistry::new(url(), driver.clone(), None).unwrap());

    registry.open().await.unwrap();
    registry.close().await.unwrap();
    registry.open().await.unwrap();
    assert!(registry.is_open());
    assert_eq!(driver.connects.load(Ordering::SeqCst), 2);

    registry.close().await.unwrap();
}
