//! Driver context and public API
//!
//! [`CdcDriver`] is the installed-or-not context every operation goes
//! through. Installing spawns the dispatch thread and registers with the host
//! layer; devices are then created against the driver and addressed by their
//! [`DeviceHandle`]. Reads and writes only touch the device pipes and never
//! wait for the dispatch task.

use crate::config::{DeviceConfig, DriverConfig};
use crate::device::{Device, DeviceHandle, DeviceState, LinkState};
use crate::error::{Error, Result};
use crate::placement::Placement;
use crate::registry::Registry;
use crate::worker::{Command, DispatchTask};
use common::{DeviceArrival, UsbHost, create_host_channel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Dispatch thread bookkeeping
struct TaskHandle {
    join: Option<JoinHandle<()>>,
    exited: Receiver<()>,
    shutdown_sent: bool,
}

/// Everything that exists only while the driver is installed
struct Installed {
    host: Arc<dyn UsbHost>,
    /// The host layer was installed by us and is uninstalled by us
    owns_host: bool,
    registry: Arc<Mutex<Registry>>,
    commands: async_channel::Sender<Command>,
    dispatch_thread: ThreadId,
    task: Mutex<TaskHandle>,
    /// Cleared while uninstall is tearing down
    accepting: AtomicBool,
    uninstall_timeout: Duration,
}

impl Installed {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device(&self, handle: DeviceHandle) -> Result<Arc<Device>> {
        self.lock().device(handle)
    }

    fn on_dispatch_thread(&self) -> bool {
        std::thread::current().id() == self.dispatch_thread
    }

    /// Queue a Service command unless one is already queued for the device
    fn request_service(&self, device: &Device) {
        if device.request_service()
            && self
                .commands
                .try_send(Command::Service(device.handle))
                .is_err()
        {
            device.clear_service_request();
        }
    }
}

/// USB host CDC byte-stream driver
///
/// ```no_run
/// use std::sync::Arc;
/// use usbh_cdc::{CdcDriver, DeviceConfig, DriverConfig, RusbHost};
///
/// let driver = CdcDriver::new();
/// driver.install(DriverConfig::default(), Arc::new(RusbHost::new()?))?;
/// let handle = driver.create(DeviceConfig::any(0))?;
/// driver.write_bytes(handle, b"AT\r\n")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct CdcDriver {
    inner: RwLock<Option<Arc<Installed>>>,
}

static GLOBAL: OnceLock<CdcDriver> = OnceLock::new();

impl CdcDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide driver instance
    pub fn global() -> &'static CdcDriver {
        GLOBAL.get_or_init(CdcDriver::new)
    }

    fn installed(&self) -> Result<Arc<Installed>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::NotInstalled)
    }

    pub fn is_installed(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Start the driver on top of `host`
    pub fn install(&self, config: DriverConfig, host: Arc<dyn UsbHost>) -> Result<()> {
        config.validate()?;
        let placement = Placement::resolve(&config)?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.is_some() {
            return Err(Error::AlreadyInstalled);
        }

        let owns_host = !config.skip_host_init;
        if owns_host {
            host.install()?;
        }

        let installed = match start(&config, placement, host.clone(), owns_host) {
            Ok(installed) => installed,
            Err(e) => {
                if owns_host && let Err(err) = host.uninstall() {
                    warn!("Failed to uninstall host layer: {}", err);
                }
                return Err(e);
            }
        };

        info!(
            "Driver installed (task {:?}, stack {} bytes, priority {}, core {:?})",
            config.task_name, config.task_stack_size, config.task_priority, config.task_core_id
        );
        *inner = Some(installed);
        Ok(())
    }

    /// Stop the driver; every device must have been deleted
    ///
    /// On [`Error::Timeout`] the driver stays installed but refuses new
    /// devices; calling `uninstall` again waits for the dispatch task again.
    pub fn uninstall(&self) -> Result<()> {
        let installed = self.installed()?;
        if installed.on_dispatch_thread() {
            return Err(Error::InvalidState(
                "uninstall called from a driver callback".to_string(),
            ));
        }

        {
            let registry = installed.lock();
            if !registry.is_empty() {
                return Err(Error::InvalidState(format!(
                    "{} devices are still registered",
                    registry.len()
                )));
            }
            installed.accepting.store(false, Ordering::SeqCst);
        }

        let mut task = installed.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.join.is_none() {
            // Another uninstall finished first
            return Err(Error::NotInstalled);
        }
        if !task.shutdown_sent {
            if installed.commands.try_send(Command::Shutdown).is_err() {
                debug!("Dispatch task already gone");
            }
            task.shutdown_sent = true;
        }

        match task.exited.recv_timeout(installed.uninstall_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Dispatch task did not stop within {:?}",
                    installed.uninstall_timeout
                );
                return Err(Error::Timeout);
            }
        }

        if let Some(join) = task.join.take()
            && join.join().is_err()
        {
            error!("Dispatch thread panicked");
        }
        drop(task);

        if let Err(e) = installed.host.deregister_client() {
            warn!("Failed to deregister host client: {}", e);
        }
        if installed.owns_host
            && let Err(e) = installed.host.uninstall()
        {
            warn!("Failed to uninstall host layer: {}", e);
        }

        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
        info!("Driver uninstalled");
        Ok(())
    }

    /// Register a device; it connects once a matching physical device is present
    pub fn create(&self, config: DeviceConfig) -> Result<DeviceHandle> {
        let installed = self.installed()?;
        config.validate()?;

        let device = {
            let mut registry = installed.lock();
            if !installed.accepting.load(Ordering::SeqCst) {
                return Err(Error::NotInstalled);
            }
            registry.insert(&config)?
        };
        let handle = device.handle;

        if installed.commands.try_send(Command::Probe(handle)).is_err() {
            installed.lock().remove(handle);
            return Err(Error::Unavailable(
                "dispatch task is not running".to_string(),
            ));
        }

        info!("Created device {} for {}", handle, device.identity);
        Ok(handle)
    }

    /// Tear a device down and wait until its transfers have drained
    ///
    /// Blocks the calling thread. No disconnect callback fires for a deleted device.
    pub fn delete(&self, handle: DeviceHandle) -> Result<()> {
        let installed = self.installed()?;
        if installed.on_dispatch_thread() {
            return Err(Error::InvalidState(
                "delete called from a driver callback".to_string(),
            ));
        }

        let (device, previous) = {
            let registry = installed.lock();
            let device = registry.device(handle)?;
            let previous = device.state();
            if previous == DeviceState::Closing {
                return Err(Error::InvalidState(format!(
                    "device {} is already being deleted",
                    handle
                )));
            }
            device.set_state(DeviceState::Closing);
            (device, previous)
        };

        let (done_tx, done_rx) = sync_channel(1);
        let queued = installed.commands.try_send(Command::Delete {
            handle,
            done: done_tx,
        });
        if queued.is_err() {
            // Nothing will ever finish this delete; leave the device as it was
            device.transition(DeviceState::Closing, previous);
            return Err(Error::Unavailable("dispatch task is not running".to_string()));
        }

        done_rx
            .recv()
            .map_err(|_| Error::Unavailable("dispatch task stopped during delete".to_string()))?;
        debug!("Device {} delete complete", handle);
        Ok(())
    }

    /// Queue bytes for transmission; returns how many fit into the TX pipe
    pub fn write_bytes(&self, handle: DeviceHandle, data: &[u8]) -> Result<usize> {
        let installed = self.installed()?;
        let device = installed.device(handle)?;
        require_connected(&device)?;

        let written = device.tx.push(data);
        if written > 0 {
            installed.request_service(&device);
        }
        trace!("Device {} write {}/{} bytes", handle, written, data.len());
        Ok(written)
    }

    /// Take up to `buf.len()` received bytes without waiting
    pub fn read_bytes(&self, handle: DeviceHandle, buf: &mut [u8]) -> Result<usize> {
        let installed = self.installed()?;
        let device = installed.device(handle)?;
        require_connected(&device)?;

        let read = device.rx.pop(buf);
        if read > 0 {
            installed.request_service(&device);
        }
        Ok(read)
    }

    /// Like [`CdcDriver::read_bytes`], waiting up to `timeout` for data
    ///
    /// Returns 0 if nothing arrived in time.
    pub fn read_bytes_timeout(
        &self,
        handle: DeviceHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let installed = self.installed()?;
        let device = installed.device(handle)?;
        require_connected(&device)?;

        if !device.rx.wait_readable(timeout) {
            return Ok(0);
        }
        require_connected(&device)?;

        let read = device.rx.pop(buf);
        if read > 0 {
            installed.request_service(&device);
        }
        Ok(read)
    }

    /// Discard received bytes
    pub fn flush_rx(&self, handle: DeviceHandle) -> Result<()> {
        let installed = self.installed()?;
        let device = installed.device(handle)?;
        device.rx.flush();
        if device.is_connected() {
            installed.request_service(&device);
        }
        Ok(())
    }

    /// Discard bytes not yet handed to the host layer
    pub fn flush_tx(&self, handle: DeviceHandle) -> Result<()> {
        self.installed()?.device(handle)?.tx.flush();
        Ok(())
    }

    /// Bytes waiting in the RX pipe
    pub fn rx_buffer_size(&self, handle: DeviceHandle) -> Result<usize> {
        Ok(self.installed()?.device(handle)?.rx.available_bytes())
    }

    /// Free space in the TX pipe
    pub fn tx_free_space(&self, handle: DeviceHandle) -> Result<usize> {
        Ok(self.installed()?.device(handle)?.tx.free_space())
    }

    pub fn get_state(&self, handle: DeviceHandle) -> Result<LinkState> {
        self.state(handle).map(LinkState::from)
    }

    pub fn state(&self, handle: DeviceHandle) -> Result<DeviceState> {
        Ok(self.installed()?.device(handle)?.state())
    }

    /// Descriptor snapshot of the physical device a handle is connected to
    pub fn device_info(&self, handle: DeviceHandle) -> Result<Option<DeviceArrival>> {
        Ok(self.installed()?.device(handle)?.info())
    }

    /// Registered devices
    pub fn devices(&self) -> Result<Vec<DeviceHandle>> {
        Ok(self.installed()?.lock().handles())
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.installed()?.lock().len())
    }

    /// Physical devices the host layer reported, in arrival order
    pub fn present_devices(&self) -> Result<Vec<DeviceArrival>> {
        Ok(self.installed()?.lock().physical().to_vec())
    }
}

fn require_connected(device: &Device) -> Result<()> {
    match device.state() {
        DeviceState::Connected => Ok(()),
        state => Err(Error::InvalidState(format!(
            "device {} is {:?}",
            device.handle, state
        ))),
    }
}

/// Spawn the dispatch thread and register with the host layer
fn start(
    config: &DriverConfig,
    placement: Placement,
    host: Arc<dyn UsbHost>,
    owns_host: bool,
) -> Result<Arc<Installed>> {
    let registry = Arc::new(Mutex::new(Registry::new()));
    let (events_tx, events_rx) = create_host_channel(config.event_queue_depth);
    let (commands_tx, commands_rx) = async_channel::unbounded();
    let (started_tx, started_rx) = sync_channel::<std::result::Result<(), String>>(1);
    let (exited_tx, exited_rx) = sync_channel::<()>(1);

    let task = DispatchTask::new(
        host.clone(),
        registry.clone(),
        (events_tx.clone(), events_rx),
        commands_rx,
        config.new_device_callback.clone(),
    );

    let join = std::thread::Builder::new()
        .name(config.task_name.clone())
        .stack_size(config.task_stack_size)
        .spawn(move || {
            if let Err(e) = placement.apply() {
                let _ = started_tx.send(Err(e));
                return;
            }
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = started_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let _ = started_tx.send(Ok(()));
            runtime.block_on(task.run());
            let _ = exited_tx.send(());
        })
        .map_err(|e| Error::Unavailable(format!("failed to spawn dispatch thread: {}", e)))?;

    let dispatch_thread = join.thread().id();
    let stop = |join: JoinHandle<()>| {
        let _ = commands_tx.try_send(Command::Shutdown);
        if join.join().is_err() {
            error!("Dispatch thread panicked");
        }
    };

    match started_rx.recv_timeout(config.startup_timeout) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stop(join);
            return Err(Error::Unavailable(format!(
                "failed to start dispatch task: {}",
                e
            )));
        }
        Err(RecvTimeoutError::Disconnected) => {
            stop(join);
            return Err(Error::Unavailable("dispatch thread exited".to_string()));
        }
        Err(RecvTimeoutError::Timeout) => {
            // The thread is left to exit on its own once it sees Shutdown
            let _ = commands_tx.try_send(Command::Shutdown);
            return Err(Error::Timeout);
        }
    }

    if let Err(e) = host.register_client(events_tx) {
        stop(join);
        return Err(e.into());
    }

    Ok(Arc::new(Installed {
        host,
        owns_host,
        registry,
        commands: commands_tx,
        dispatch_thread,
        task: Mutex::new(TaskHandle {
            join: Some(join),
            exited: exited_rx,
            shutdown_sent: false,
        }),
        accepting: AtomicBool::new(true),
        uninstall_timeout: config.uninstall_timeout,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use common::test_utils::MockHost;

    #[test]
    fn test_operations_require_install() {
        let driver = CdcDriver::new();
        let handle = DeviceHandle {
            index: 0,
            generation: 1,
        };

        assert!(!driver.is_installed());
        assert!(matches!(driver.uninstall(), Err(Error::NotInstalled)));
        assert!(matches!(
            driver.create(DeviceConfig::any(0)),
            Err(Error::NotInstalled)
        ));
        assert_eq!(
            driver.write_bytes(handle, b"x").unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert!(driver.delete(handle).is_err());
    }

    #[test]
    fn test_install_validates_config() {
        let driver = CdcDriver::new();
        let host = MockHost::new();
        let config = DriverConfig {
            event_queue_depth: 0,
            ..Default::default()
        };

        assert_eq!(
            driver
                .install(config, Arc::new(host.clone()))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(host.install_calls(), 0);
    }

    #[test]
    fn test_install_uninstall() {
        let driver = CdcDriver::new();
        let host = MockHost::new();

        driver
            .install(DriverConfig::default(), Arc::new(host.clone()))
            .unwrap();
        assert!(driver.is_installed());
        assert!(host.is_installed());
        assert!(host.is_registered());
        assert!(matches!(
            driver.install(DriverConfig::default(), Arc::new(host.clone())),
            Err(Error::AlreadyInstalled)
        ));

        driver.uninstall().unwrap();
        assert!(!driver.is_installed());
        assert!(!host.is_installed());
        assert!(!host.is_registered());
    }

    #[test]
    fn test_install_unwinds_on_register_failure() {
        let driver = CdcDriver::new();
        let host = MockHost::new();
        host.set_fail_register(true);

        let err = driver
            .install(DriverConfig::default(), Arc::new(host.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::Host(_)));
        assert!(!driver.is_installed());
        assert_eq!(host.uninstall_calls(), 1);
        assert!(!host.is_installed());
    }

    #[test]
    fn test_skip_host_init() {
        let driver = CdcDriver::new();
        let host = MockHost::new();
        let config = DriverConfig {
            skip_host_init: true,
            ..Default::default()
        };

        driver.install(config, Arc::new(host.clone())).unwrap();
        assert_eq!(host.install_calls(), 0);
        driver.uninstall().unwrap();
        assert_eq!(host.uninstall_calls(), 0);
    }

    #[test]
    fn test_create_checks_install_before_config() {
        let driver = CdcDriver::new();
        let half_wildcard = DeviceConfig::new(0x1234, 0, 0);
        assert_eq!(
            driver.create(half_wildcard).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_failed_delete_leaves_device_deletable() {
        let driver = CdcDriver::new();
        let host = MockHost::new();
        driver
            .install(DriverConfig::default(), Arc::new(host.clone()))
            .unwrap();
        let handle = driver.create(DeviceConfig::any(0)).unwrap();

        // Dispatch task stops taking commands
        let installed = driver.installed().unwrap();
        installed.commands.close();

        for _ in 0..2 {
            assert!(matches!(driver.delete(handle), Err(Error::Unavailable(_))));
            assert_eq!(driver.state(handle).unwrap(), DeviceState::Created);
        }

        installed.lock().remove(handle);
        driver.uninstall().unwrap();
    }

    #[tokio::test]
    async fn test_delete_inside_runtime() {
        let driver = CdcDriver::new();
        let host = MockHost::new();
        driver
            .install(DriverConfig::default(), Arc::new(host.clone()))
            .unwrap();

        let handle = driver.create(DeviceConfig::any(0)).unwrap();
        driver.delete(handle).unwrap();
        driver.uninstall().unwrap();
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(CdcDriver::global(), CdcDriver::global()));
    }
}
