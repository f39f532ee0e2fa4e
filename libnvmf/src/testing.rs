//! In-memory stand-ins for the host: a fabric that creates controllers on
//! connect, a mount table, and a fixed volume source.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::error::{CsiError, NvmfError};
use crate::fabric::{ATTR_HOST_NQN, ATTR_SUBSYS_NQN, CTRL_DELETE, FabricHost, NS_UUID};
use crate::mount::Mounter;
use crate::registry::{ProvisionedVolume, VolumeSource};
use crate::types::Transport;

/// Discovery log in `nvme discover -o json` shape for tcp targets.
pub(crate) fn discovery_log(records: &[(&str, &str, &str)]) -> String {
    let records: Vec<serde_json::Value> = records
        .iter()
        .map(|(nqn, addr, port)| {
            serde_json::json!({
                "trtype": "tcp",
                "adrfam": "ipv4",
                "subtype": "nvme subsystem",
                "subnqn": nqn,
                "traddr": addr,
                "trsvcid": port,
            })
        })
        .collect();
    serde_json::json!({ "records": records }).to_string()
}

fn io_error(kind: std::io::ErrorKind, msg: &str) -> std::io::Error {
    std::io::Error::new(kind, msg.to_owned())
}

#[derive(Debug, Clone)]
struct FakeController {
    subsys_nqn: String,
    host_nqn: Option<String>,
    namespace: String,
    ns_attrs: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeHostState {
    discovery: HashMap<(String, String), String>,
    discover_calls: usize,
    controllers: BTreeMap<String, FakeController>,
    next_instance: usize,
    namespace_uuids: HashMap<String, String>,
    withheld: HashSet<String>,
    unreachable: HashSet<String>,
    failing_deletes: HashSet<String>,
    connects: Vec<String>,
    deleted: Vec<String>,
    control_writes: Vec<(String, String, String)>,
}

/// Fabric whose connects create controllers immediately.  Namespace uuids
/// are fixed per NQN; the tracking root is a private temp directory.
pub(crate) struct FakeHost {
    state: Mutex<FakeHostState>,
    tracking: TempDir,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeHostState::default()),
            tracking: tempfile::tempdir().expect("tracking tempdir"),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeHostState> {
        self.state.lock().expect("fake host state")
    }

    pub(crate) fn set_discovery(&self, addr: &str, port: &str, log: String) {
        self.state()
            .discovery
            .insert((addr.to_owned(), port.to_owned()), log);
    }

    pub(crate) fn discover_calls(&self) -> usize {
        self.state().discover_calls
    }

    /// Connects to `addr` fail.
    pub(crate) fn set_unreachable(&self, addr: &str) {
        self.state().unreachable.insert(addr.to_owned());
    }

    /// Namespaces of `nqn` never report an identifier.
    pub(crate) fn withhold_namespace(&self, nqn: &str) {
        self.state().withheld.insert(nqn.to_owned());
    }

    /// Teardown of `nqn` controllers fails.
    pub(crate) fn fail_deletes(&self, nqn: &str) {
        self.state().failing_deletes.insert(nqn.to_owned());
    }

    fn uuid_for(state: &mut FakeHostState, nqn: &str) -> String {
        state
            .namespace_uuids
            .entry(nqn.to_owned())
            .or_insert_with(|| uuid::Uuid::new_v4().hyphenated().to_string())
            .clone()
    }

    fn insert_controller(
        state: &mut FakeHostState,
        nqn: &str,
        host_nqn: Option<&str>,
        ns_attrs: HashMap<String, String>,
    ) -> String {
        let name = format!("nvme{}", state.next_instance);
        state.next_instance += 1;
        state.controllers.insert(
            name.clone(),
            FakeController {
                subsys_nqn: nqn.to_owned(),
                host_nqn: host_nqn.map(str::to_owned),
                namespace: format!("{name}n1"),
                ns_attrs,
            },
        );
        name
    }

    /// Add a live controller with an empty namespace.
    pub(crate) fn add_controller(&self, nqn: &str, host_nqn: Option<&str>) -> String {
        Self::insert_controller(&mut self.state(), nqn, host_nqn, HashMap::new())
    }

    pub(crate) fn set_namespace_attr(&self, controller: &str, attr: &str, value: &str) {
        if let Some(ctrl) = self.state().controllers.get_mut(controller) {
            ctrl.ns_attrs.insert(attr.to_owned(), value.to_owned());
        }
    }

    /// Uuid handed out to namespaces of `nqn`, once one was connected.
    pub(crate) fn namespace_uuid_of(&self, nqn: &str) -> Option<String> {
        self.state().namespace_uuids.get(nqn).cloned()
    }

    pub(crate) fn device_path(&self, uuid: &str) -> PathBuf {
        PathBuf::from(format!("/dev/disk/by-id/nvme-uuid.{uuid}"))
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub(crate) fn control_writes(&self) -> Vec<(String, String, String)> {
        self.state().control_writes.clone()
    }

    pub(crate) fn controllers_for(&self, nqn: &str) -> usize {
        self.state()
            .controllers
            .values()
            .filter(|c| c.subsys_nqn == nqn)
            .count()
    }
}

#[async_trait]
impl FabricHost for FakeHost {
    async fn discover(
        &self,
        _transport: Transport,
        address: &str,
        port: &str,
    ) -> Result<String, NvmfError> {
        let mut state = self.state();
        state.discover_calls += 1;
        state
            .discovery
            .get(&(address.to_owned(), port.to_owned()))
            .cloned()
            .ok_or_else(|| NvmfError::Discovery(format!("{address}:{port} refused")))
    }

    async fn submit_connect(&self, directive: &str) -> Result<(), NvmfError> {
        let fields: HashMap<&str, &str> = directive
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .collect();
        let mut state = self.state();
        state.connects.push(directive.to_owned());

        let addr = fields.get("traddr").copied().unwrap_or_default();
        if state.unreachable.contains(addr) {
            return Err(NvmfError::io(
                "write /dev/nvme-fabrics",
                io_error(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }
        let nqn = fields.get("nqn").copied().unwrap_or_default();
        let host_nqn = fields.get("hostnqn").copied().filter(|h| !h.is_empty());

        let mut ns_attrs = HashMap::new();
        if !state.withheld.contains(nqn) {
            ns_attrs.insert(NS_UUID.to_owned(), Self::uuid_for(&mut state, nqn));
        }
        Self::insert_controller(&mut state, nqn, host_nqn, ns_attrs);
        Ok(())
    }

    async fn controllers(&self) -> Result<Vec<String>, NvmfError> {
        Ok(self.state().controllers.keys().cloned().collect())
    }

    async fn read_controller_attr(
        &self,
        controller: &str,
        attr: &str,
    ) -> Result<Option<String>, NvmfError> {
        let state = self.state();
        let Some(ctrl) = state.controllers.get(controller) else {
            return Ok(None);
        };
        Ok(match attr {
            ATTR_SUBSYS_NQN => Some(ctrl.subsys_nqn.clone()),
            ATTR_HOST_NQN => ctrl.host_nqn.clone(),
            _ => None,
        })
    }

    async fn write_controller_control(
        &self,
        controller: &str,
        attr: &str,
        value: &str,
    ) -> Result<(), NvmfError> {
        let mut state = self.state();
        let Some(ctrl) = state.controllers.get(controller).cloned() else {
            return Err(NvmfError::io(
                format!("open {controller}/{attr}"),
                io_error(std::io::ErrorKind::NotFound, "no such controller"),
            ));
        };
        state.control_writes.push((
            controller.to_owned(),
            attr.to_owned(),
            value.to_owned(),
        ));
        if attr == CTRL_DELETE {
            if state.failing_deletes.contains(&ctrl.subsys_nqn) {
                return Err(NvmfError::io(
                    format!("write {controller}/{attr}"),
                    io_error(std::io::ErrorKind::ResourceBusy, "device busy"),
                ));
            }
            state.controllers.remove(controller);
            state.deleted.push(controller.to_owned());
        }
        Ok(())
    }

    async fn namespaces(&self, controller: &str) -> Result<Vec<String>, NvmfError> {
        Ok(self
            .state()
            .controllers
            .get(controller)
            .map(|c| vec![c.namespace.clone()])
            .unwrap_or_default())
    }

    async fn read_namespace_attr(
        &self,
        controller: &str,
        namespace: &str,
        attr: &str,
    ) -> Result<Option<String>, NvmfError> {
        Ok(self
            .state()
            .controllers
            .get(controller)
            .filter(|c| c.namespace == namespace)
            .and_then(|c| c.ns_attrs.get(attr).cloned()))
    }

    async fn device_link(&self, uuid: &str) -> Option<PathBuf> {
        Some(self.device_path(uuid))
    }

    fn tracking_root(&self) -> &Path {
        self.tracking.path()
    }
}

/// One recorded mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountRecord {
    pub source: PathBuf,
    pub fs_type: Option<String>,
    pub options: Vec<String>,
    pub formatted: bool,
}

#[derive(Debug, Default)]
struct FakeMounterState {
    mounts: HashMap<PathBuf, MountRecord>,
    fail_mounts: bool,
    unmounts: usize,
}

/// Mount table kept in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeMounter {
    state: Mutex<FakeMounterState>,
}

impl FakeMounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeMounterState> {
        self.state.lock().expect("fake mounter state")
    }

    pub(crate) fn fail_mounts(&self) {
        self.state().fail_mounts = true;
    }

    pub(crate) fn mount_at(&self, target: &Path) -> Option<MountRecord> {
        self.state().mounts.get(target).cloned()
    }

    pub(crate) fn mount_count(&self) -> usize {
        self.state().mounts.len()
    }

    pub(crate) fn unmounts(&self) -> usize {
        self.state().unmounts
    }

    fn record(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
        formatted: bool,
    ) -> Result<(), CsiError> {
        let mut state = self.state();
        if state.fail_mounts {
            return Err(CsiError::mount_failed(target, "injected failure"));
        }
        state.mounts.insert(
            target.to_owned(),
            MountRecord {
                source: source.to_owned(),
                fs_type: fs_type.map(str::to_owned),
                options: options.to_vec(),
                formatted,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let fs = if fs_type.is_empty() { "ext4" } else { fs_type };
        self.record(device, target, Some(fs), options, true)
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.record(source, target, fs_type, options, false)
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        let mut state = self.state();
        state.unmounts += 1;
        state
            .mounts
            .remove(target)
            .map(|_| ())
            .ok_or_else(|| CsiError::unmount_failed(target, "not mounted"))
    }

    async fn is_mount_point(&self, path: &Path) -> bool {
        self.state().mounts.contains_key(path)
    }
}

#[derive(Debug, Default)]
struct StaticSourceInner {
    volumes: Vec<ProvisionedVolume>,
    calls: AtomicUsize,
    fail_next: Mutex<bool>,
}

/// Volume source returning a fixed list.
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticSource {
    inner: Arc<StaticSourceInner>,
}

impl StaticSource {
    pub(crate) fn new(volumes: Vec<ProvisionedVolume>) -> Self {
        Self {
            inner: Arc::new(StaticSourceInner {
                volumes,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self) {
        *self.inner.fail_next.lock().expect("fail flag") = true;
    }
}

#[async_trait]
impl VolumeSource for StaticSource {
    async fn list_provisioned_volumes(
        &self,
        _driver_name: &str,
    ) -> Result<Vec<ProvisionedVolume>, NvmfError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let fail = std::mem::take(&mut *self.inner.fail_next.lock().expect("fail flag"));
        if fail {
            return Err(NvmfError::Source("injected failure".to_owned()));
        }
        Ok(self.inner.volumes.clone())
    }
}
