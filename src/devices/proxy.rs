use super::driver::{BlindHandle, BlindState, DeviceDriver, DriverError};
use super::{DeviceError, DeviceRegistry};
use crate::config::DriverConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySettings {
    /// Upper bound for one driver call, including the wait for its device
    pub call_timeout: Duration,
    /// Driver calls allowed to run at once across all devices
    pub workers: usize,
}

impl From<&DriverConfig> for ProxySettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.timeout_secs),
            workers: config.workers,
        }
    }
}

/// Async facade over a blocking [`DeviceDriver`]
///
/// Driver calls run on tokio's blocking pool, at most `workers` at a time.
/// Calls to the same address are serialized: the per-address lock travels
/// into the blocking closure, so a call that timed out on our side still
/// keeps its device busy until the driver actually returns.
pub struct DeviceProxy {
    driver: Arc<dyn DeviceDriver>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    workers: Arc<Semaphore>,
    call_timeout: Duration,
}

impl DeviceProxy {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        registry: &DeviceRegistry,
        settings: ProxySettings,
    ) -> Self {
        let locks = registry
            .all()
            .iter()
            .map(|device| (device.address.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            driver,
            locks,
            workers: Arc::new(Semaphore::new(settings.workers.max(1))),
            call_timeout: settings.call_timeout,
        }
    }

    pub async fn read_state(&self, address: &str) -> Result<BlindState, DeviceError> {
        let state = self.call(address, |handle| handle.read_state()).await?;
        if state.position > 100 {
            return Err(DeviceError::Unreachable {
                address: address.to_string(),
                reason: format!("implausible position {}", state.position),
            });
        }
        Ok(state)
    }

    pub async fn set_position(&self, address: &str, percent: u8) -> Result<(), DeviceError> {
        if percent > 100 {
            return Err(DeviceError::InvalidPosition(percent));
        }
        self.call(address, move |handle| handle.set_position(percent))
            .await
    }

    async fn call<T, F>(&self, address: &str, op: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn BlindHandle) -> Result<T, DriverError> + Send + 'static,
    {
        let unreachable = |reason: String| DeviceError::Unreachable {
            address: address.to_string(),
            reason,
        };

        let lock = self
            .locks
            .get(address)
            .cloned()
            .ok_or_else(|| unreachable("address is not registered".to_string()))?;

        let driver = Arc::clone(&self.driver);
        let workers = Arc::clone(&self.workers);
        let owned_address = address.to_string();

        let attempt = async move {
            let guard = lock.lock_owned().await;
            let permit = workers
                .acquire_owned()
                .await
                .map_err(|_| DriverError::Io("driver worker pool closed".to_string()))?;

            let task = tokio::task::spawn_blocking(move || {
                let _guard = guard;
                let _permit = permit;
                let mut handle = driver.search(&owned_address)?;
                op(handle.as_mut())
            });
            task.await
                .map_err(|e| DriverError::Io(format!("driver call panicked: {e}")))?
        };

        match time::timeout(self.call_timeout, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(DriverError::OutOfRange(percent))) => Err(DeviceError::InvalidPosition(percent)),
            Ok(Err(e)) => {
                debug!(%address, error = %e, "Driver call failed");
                Err(unreachable(e.to_string()))
            }
            Err(_) => {
                warn!(%address, timeout = ?self.call_timeout, "Driver call timed out");
                Err(unreachable(format!(
                    "no answer within {:?}",
                    self.call_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::driver::SimulatedDriver;
    use crate::devices::test_blind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_config(&[
            test_blind("window1", "AA:01", "Living Room"),
            test_blind("window2", "AA:02", "Bedroom"),
        ])
        .unwrap()
    }

    fn settings() -> ProxySettings {
        ProxySettings {
            call_timeout: Duration::from_secs(5),
            workers: 4,
        }
    }

    #[tokio::test]
    async fn reads_and_moves_through_the_driver() {
        let driver = SimulatedDriver::new();
        driver.add_blind("AA:01", 42);
        let proxy = DeviceProxy::new(Arc::new(driver.clone()), &registry(), settings());

        assert_eq!(
            proxy.read_state("AA:01").await,
            Ok(BlindState { position: 42 })
        );
        proxy.set_position("AA:01", 100).await.unwrap();
        assert_eq!(driver.position("AA:01"), Some(100));
    }

    #[tokio::test]
    async fn unreachable_device_is_normalized() {
        let driver = SimulatedDriver::new();
        driver.add_blind("AA:01", 42);
        driver.set_reachable("AA:01", false);
        let proxy = DeviceProxy::new(Arc::new(driver), &registry(), settings());

        assert!(matches!(
            proxy.read_state("AA:01").await,
            Err(DeviceError::Unreachable { address, .. }) if address == "AA:01"
        ));
        // registered but missing from the driver
        assert!(matches!(
            proxy.read_state("AA:02").await,
            Err(DeviceError::Unreachable { .. })
        ));
        // not registered at all
        assert!(matches!(
            proxy.read_state("FF:FF").await,
            Err(DeviceError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn positions_above_100_never_reach_the_driver() {
        let driver = SimulatedDriver::new();
        driver.add_blind("AA:01", 0);
        let proxy = DeviceProxy::new(Arc::new(driver.clone()), &registry(), settings());

        assert_eq!(
            proxy.set_position("AA:01", 101).await,
            Err(DeviceError::InvalidPosition(101))
        );
        assert!(driver.commands().is_empty());
    }

    /// Blocks inside the driver for a while and tracks overlapping calls
    struct SlowDriver {
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct SlowHandle {
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl DeviceDriver for SlowDriver {
        fn search(&self, _address: &str) -> Result<Box<dyn BlindHandle>, DriverError> {
            Ok(Box::new(SlowHandle {
                delay: self.delay,
                active: Arc::clone(&self.active),
                peak: Arc::clone(&self.peak),
            }))
        }
    }

    impl BlindHandle for SlowHandle {
        fn read_state(&mut self) -> Result<BlindState, DriverError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(BlindState { position: 7 })
        }

        fn set_position(&mut self, _percent: u8) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn slow_proxy(delay: Duration, timeout: Duration) -> (DeviceProxy, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let driver = SlowDriver {
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let proxy = DeviceProxy::new(
            Arc::new(driver),
            &registry(),
            ProxySettings {
                call_timeout: timeout,
                workers: 4,
            },
        );
        (proxy, peak)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_address_calls_are_serialized() {
        let (proxy, peak) = slow_proxy(Duration::from_millis(50), Duration::from_secs(5));

        let (a, b, c) = tokio::join!(
            proxy.read_state("AA:01"),
            proxy.read_state("AA:01"),
            proxy.read_state("AA:01"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_addresses_run_in_parallel() {
        let (proxy, peak) = slow_proxy(Duration::from_millis(200), Duration::from_secs(5));

        let (a, b) = tokio::join!(proxy.read_state("AA:01"), proxy.read_state("AA:02"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_driver_counts_as_unreachable() {
        let (proxy, _) = slow_proxy(Duration::from_millis(300), Duration::from_millis(50));

        assert!(matches!(
            proxy.read_state("AA:01").await,
            Err(DeviceError::Unreachable { reason, .. }) if reason.starts_with("no answer")
        ));
    }
}
