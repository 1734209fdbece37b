//! The broker: module registry, asynchronous calls, and the broker tree.
//!
//! A [`Broker`] is a cheap handle onto shared state. Everything the broker hands to other
//! threads (tasks, listener, heartbeat, call contexts, proxies) holds a [`BrokerHandle`]
//! instead, so the broker shuts down when the last `Broker` is dropped.

pub mod config;
mod heartbeat;
pub mod tree;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::context::CallContext;
use crate::module::Module;
use crate::net::{Reply, Request, RequestHandler, Server, TcpTransport, Transport};
use crate::pool::{Job, Task, ThreadPool};
use crate::proxy::{Proxy, Route};
use crate::task_monitor::TaskMonitor;
use crate::value::{TypeTag, Value};
use crate::{BrokerError, Result, TaskId};

pub use crate::pool::ShutdownMode;
pub use config::{BrokerConfig, BrokerFlags, DiscoveryConfig, HeartbeatConfig};
use heartbeat::Heartbeat;
pub use tree::{ChildBroker, ConnectionInfo, ModuleInfo};

/// Bound on discovery, registration and other control requests.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the goodbye messages sent while shutting down.
const NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);

/// Non-owning reference to a broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle(Weak<BrokerInner>);

impl BrokerHandle {
    pub fn upgrade(&self) -> Result<Broker> {
        self.0.upgrade().map(|inner| Broker { inner }).ok_or(BrokerError::Shutdown)
    }
}

struct Parent {
    endpoint: SocketAddr,
    connection: ConnectionInfo,
}

pub(crate) struct BrokerInner {
    config: BrokerConfig,
    port: AtomicU64,
    modules: RwLock<HashMap<String, Arc<Module>>>,
    next_module_id: AtomicU64,
    next_task_id: AtomicU64,
    routes: RwLock<HashMap<String, Route>>,
    children: RwLock<HashMap<String, ChildBroker>>,
    parent: Mutex<Option<Parent>>,
    pool: Option<ThreadPool>,
    monitor: TaskMonitor,
    transport: Arc<dyn Transport>,
    server: Mutex<Option<Server>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    shutting_down: AtomicBool,
}

/// Shared handle onto a running broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerService(BrokerHandle);

impl RequestHandler for BrokerService {
    fn handle(&self, request: Request) -> Reply {
        match self.0.upgrade() {
            Ok(broker) => broker.handle_request(request),
            Err(e) => Reply::error(&e),
        }
    }
}

impl Broker {
    /// Starts a broker with the default TCP transport.
    pub fn init(config: BrokerConfig) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.connect_timeout()));
        Self::with_transport(config, transport)
    }

    /// In-process broker: no listener, parent or heartbeat.
    pub fn local(name: &str) -> Result<Self> {
        Self::init(BrokerConfig::local(name))
    }

    pub fn with_transport(config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let pool = if config.flags.light {
            None
        } else {
            Some(ThreadPool::new(config.pool.clone())?)
        };
        let parent = config.parent_addr()?.map(|endpoint| Parent {
            endpoint,
            connection: ConnectionInfo::default(),
        });
        let inner = Arc::new(BrokerInner {
            port: AtomicU64::new(config.port as u64),
            modules: RwLock::new(HashMap::new()),
            next_module_id: AtomicU64::new(0),
            next_task_id: AtomicU64::new(0),
            routes: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
            parent: Mutex::new(parent),
            pool,
            monitor: TaskMonitor::new(),
            transport,
            server: Mutex::new(None),
            heartbeat: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            config,
        });
        let broker = Broker { inner };

        if !broker.inner.config.flags.noserver {
            let service = Arc::new(BrokerService(broker.handle()));
            let server = Server::bind(broker.inner.config.bind_addr()?, service)?;
            broker
                .inner
                .port
                .store(server.local_addr().port() as u64, Ordering::Release);
            *broker.inner.server.lock() = Some(server);
        }

        if let Some(endpoint) = broker.parent_endpoint() {
            let request = Request::RegisterBroker { info: broker.info() };
            if let Err(e) = broker
                .inner
                .transport
                .request(endpoint, &request, Some(CONTROL_TIMEOUT))
                .and_then(Reply::into_ack)
            {
                error!("Cannot register with parent broker {}: {}", endpoint, e);
                broker.inner.parent.lock().take();
                broker.shutdown(ShutdownMode::Kill);
                return Err(e);
            }
            info!("Registered with parent broker {}", endpoint);
        }

        let heartbeat = &broker.inner.config.heartbeat;
        if heartbeat.enabled && !(broker.inner.config.flags.noserver && broker.parent_endpoint().is_none()) {
            let hb = Heartbeat::start(broker.handle(), heartbeat.interval())?;
            *broker.inner.heartbeat.lock() = Some(hb);
        }

        info!(
            "Broker {} started on {}:{} (flags {:#x})",
            broker.name(),
            broker.inner.config.ip,
            broker.port(),
            broker.inner.config.flags.mask()
        );
        Ok(broker)
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle(Arc::downgrade(&self.inner))
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Bound port; 0 when not listening.
    pub fn port(&self) -> u16 {
        if self.inner.config.flags.noserver {
            return 0;
        }
        self.inner.port.load(Ordering::Acquire) as u16
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.inner.server.lock().as_ref().map(Server::local_addr)
    }

    /// Discovery snapshot of this broker.
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.name().to_string(),
            ip: self.inner.config.ip.clone(),
            port: self.port(),
            process_id: std::process::id(),
            is_broker: true,
            module_id: 0,
        }
    }

    pub fn pool(&self) -> Option<&ThreadPool> {
        self.inner.pool.as_ref()
    }

    pub fn task_monitor(&self) -> &TaskMonitor {
        &self.inner.monitor
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn parent_endpoint(&self) -> Option<SocketAddr> {
        self.inner.parent.lock().as_ref().map(|p| p.endpoint)
    }

    // ---- modules ----

    /// Registers `module` and assigns its ID.
    pub fn register_module(&self, module: Module) -> Result<Arc<Module>> {
        if self.is_shutting_down() {
            return Err(BrokerError::Shutdown);
        }
        let mut modules = self.inner.modules.write();
        if modules.contains_key(module.name()) || module.name() == self.name() {
            return Err(BrokerError::DuplicateModule(module.name().to_string()));
        }
        let id = self.inner.next_module_id.fetch_add(1, Ordering::AcqRel) + 1;
        module.set_id(id);
        let module = Arc::new(module);
        modules.insert(module.name().to_string(), module.clone());
        drop(modules);
        // a remote route cached under this name is shadowed from now on
        self.inner.routes.write().remove(module.name());
        info!("Module {} registered with id {}", module.name(), id);
        Ok(module)
    }

    /// Removes a module. Tasks already holding it finish; new calls fail.
    pub fn unregister_module(&self, name: &str) -> Result<()> {
        let module = self
            .inner
            .modules
            .write()
            .remove(name)
            .ok_or_else(|| BrokerError::ModuleUnreachable(format!("module {} is not registered", name)))?;
        module.set_closing();
        self.inner.routes.write().remove(name);
        info!("Module {} unregistered", name);
        Ok(())
    }

    /// Locally registered module.
    pub fn module(&self, name: &str) -> Option<Arc<Module>> {
        self.inner.modules.read().get(name).cloned()
    }

    /// True when `name` is registered on this broker.
    pub fn is_module_present(&self, name: &str) -> bool {
        self.module(name).is_some_and(|m| !m.is_closing())
    }

    fn local_module(&self, name: &str) -> Result<Arc<Module>> {
        self.module(name)
            .ok_or_else(|| BrokerError::ModuleUnreachable(format!("module {} is not registered here", name)))
    }

    // ---- proxies ----

    /// Proxy to `name`, local or found through discovery. Routes are cached.
    pub fn proxy(&self, name: &str) -> Result<Proxy> {
        let cached = self.inner.routes.read().get(name).cloned();
        if let Some(route) = cached {
            if route.is_alive() {
                return Ok(Proxy::with_route(name, route, Some(self.handle())));
            }
            self.inner.routes.write().remove(name);
        }

        let route = match self.module(name) {
            Some(module) => Route::Local(Arc::downgrade(&module)),
            None => {
                let info = self.get_module_by_name(name)?;
                if info.is_broker {
                    return Err(BrokerError::ModuleUnreachable(format!("{} is a broker", name)));
                }
                Route::Remote(info)
            }
        };
        debug!("Route to {} cached: {:?}", name, route);
        self.inner.routes.write().insert(name.to_string(), route.clone());
        Ok(Proxy::with_route(name, route, Some(self.handle())))
    }

    pub fn remove_proxy(&self, name: &str) -> bool {
        self.inner.routes.write().remove(name).is_some()
    }

    pub fn remove_all_proxies(&self) {
        self.inner.routes.write().clear();
    }

    fn purge_routes_to(&self, endpoint: SocketAddr) {
        self.inner.routes.write().retain(|name, route| match route {
            Route::Remote(info) if info.endpoint() == Some(endpoint) => {
                debug!("Route to {} purged", name);
                false
            }
            _ => true,
        });
    }

    // ---- discovery ----

    /// Snapshot of a local module, or of this broker.
    pub fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        if name == self.name() {
            return Some(self.info());
        }
        let module = self.module(name)?;
        Some(ModuleInfo {
            name: module.name().to_string(),
            is_broker: false,
            module_id: module.id(),
            ..self.info()
        })
    }

    /// Local lookup, then discovery through the tree as configured.
    pub fn get_module_by_name(&self, name: &str) -> Result<ModuleInfo> {
        let discovery = self.inner.config.discovery;
        self.explore_module(name, discovery.search_up, discovery.search_down, None)?
            .ok_or_else(|| BrokerError::ModuleUnreachable(format!("module {} not found", name)))
    }

    /// Searches this broker, then its children (`search_down`), then its parent (`search_up`).
    /// `dont_look_into` names a child already searched by the caller.
    pub fn explore_module(
        &self,
        name: &str,
        search_up: bool,
        search_down: bool,
        dont_look_into: Option<&str>,
    ) -> Result<Option<ModuleInfo>> {
        if let Some(info) = self.module_info(name) {
            return Ok(Some(info));
        }

        if search_down {
            let children: Vec<ModuleInfo> = self
                .inner
                .children
                .read()
                .values()
                .filter(|c| c.connection.reachable && Some(c.info.name.as_str()) != dont_look_into)
                .map(|c| c.info.clone())
                .collect();
            for child in children {
                if child.name == name {
                    return Ok(Some(child));
                }
                let Some(endpoint) = child.endpoint() else {
                    continue;
                };
                let request = Request::Explore {
                    name: name.to_string(),
                    search_up: false,
                    search_down: true,
                    dont_look_into: None,
                };
                match self
                    .inner
                    .transport
                    .request(endpoint, &request, Some(CONTROL_TIMEOUT))
                    .and_then(Reply::into_info)
                {
                    Ok(Some(info)) => return Ok(Some(info)),
                    Ok(None) => {}
                    Err(e) => warn!("Discovery in child {} failed: {}", child.name, e),
                }
            }
        }

        if search_up {
            if let Some(endpoint) = self.parent_endpoint() {
                let request = Request::Explore {
                    name: name.to_string(),
                    search_up: true,
                    search_down: true,
                    dont_look_into: Some(self.name().to_string()),
                };
                return self
                    .inner
                    .transport
                    .request(endpoint, &request, Some(CONTROL_TIMEOUT))
                    .and_then(Reply::into_info);
            }
        }
        Ok(None)
    }

    /// Local modules, sorted by name.
    pub fn module_list(&self) -> Vec<ModuleInfo> {
        let mut names: Vec<String> = self.inner.modules.read().keys().cloned().collect();
        names.sort();
        names.iter().filter_map(|n| self.module_info(n)).collect()
    }

    /// This broker and its direct children.
    pub fn broker_list(&self) -> Vec<ModuleInfo> {
        let mut list = vec![self.info()];
        let mut children: Vec<ModuleInfo> =
            self.inner.children.read().values().map(|c| c.info.clone()).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        list.extend(children);
        list
    }

    /// Modules of this broker and of every reachable broker below it.
    pub fn global_module_list(&self) -> Vec<ModuleInfo> {
        let mut list = self.module_list();
        let children: Vec<ModuleInfo> = self
            .inner
            .children
            .read()
            .values()
            .filter(|c| c.connection.reachable)
            .map(|c| c.info.clone())
            .collect();
        for child in children {
            let Some(endpoint) = child.endpoint() else {
                continue;
            };
            match self
                .inner
                .transport
                .request(endpoint, &Request::GetGlobalModuleList, Some(CONTROL_TIMEOUT))
                .and_then(Reply::into_infos)
            {
                Ok(infos) => list.extend(infos),
                Err(e) => warn!("Cannot list modules of child {}: {}", child.name, e),
            }
        }
        list
    }

    // ---- calls ----

    /// Synchronous call on a local module; `None` for void methods.
    pub fn method_call(&self, module: &str, method: &str, params: &Value) -> Result<Option<Value>> {
        let target = self.local_module(module)?;
        let (_, descriptor) = target.lookup(method)?;
        let ctx = CallContext::sync(module, method, Some(self.handle()));
        let value = target.execute(method, &ctx, params)?;
        Ok((descriptor.return_tag != TypeTag::Void).then_some(value))
    }

    /// Runs a local method asynchronously. Lookup and arity errors are returned here;
    /// the task is monitored before any worker can see it.
    pub fn pcall(&self, module: &str, method: &str, params: Value) -> Result<TaskId> {
        if self.is_shutting_down() {
            return Err(BrokerError::Shutdown);
        }
        let target = self.local_module(module)?;
        if target.is_closing() {
            return Err(BrokerError::ModuleUnreachable(format!("module {} is closing", module)));
        }
        let (_, descriptor) = target.lookup(method)?;
        let given = match &params {
            Value::Invalid => 0,
            Value::Array(items) => items.len(),
            other => {
                return Err(BrokerError::TypeMismatch(format!(
                    "parameters must be an array, found {}",
                    other.kind()
                )))
            }
        };
        if given != descriptor.arity() {
            return Err(BrokerError::ArityMismatch(format!(
                "{}.{} takes {} parameters, {} given",
                module,
                method,
                descriptor.arity(),
                given
            )));
        }

        let id = TaskId(self.inner.next_task_id.fetch_add(1, Ordering::AcqRel) + 1);
        let (section, cancel) = self.inner.monitor.add(id, module, method);
        let ctx = CallContext::task(module, method, id, cancel, Some(self.handle()));
        let method_name = method.to_string();
        let job: Job = Box::new(move |worker: Option<usize>| {
            section.set_thread(worker);
            match target.execute(&method_name, &ctx, &params) {
                Ok(_) => debug!("Task {} ({}.{}) done", id, target.name(), method_name),
                Err(BrokerError::StopRequested(_)) => {
                    info!("Task {} ({}.{}) stopped", id, target.name(), method_name)
                }
                Err(e) => warn!("Task {} ({}.{}) failed: {}", id, target.name(), method_name, e),
            }
            drop(section);
        });

        match &self.inner.pool {
            Some(pool) => {
                pool.enqueue(Task::new(id, format!("{}.{}", module, method), job))?;
            }
            None => {
                thread::Builder::new()
                    .name(format!("alcommon-task-{}", id.0))
                    .spawn(move || job(None))?;
            }
        }
        debug!("Task {} queued for {}.{}", id, module, method);
        Ok(id)
    }

    /// Waits for a task; true on timeout. `timeout_ms == 0` waits forever.
    pub fn wait(&self, id: TaskId, timeout_ms: u64) -> bool {
        self.inner.monitor.wait(id, timeout_ms)
    }

    pub fn wait_method(&self, method: &str, timeout_ms: u64) -> bool {
        self.inner.monitor.wait_method(method, timeout_ms)
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.inner.monitor.is_running(id)
    }

    pub fn is_method_running(&self, method: &str) -> bool {
        self.inner.monitor.is_method_running(method)
    }

    /// Requests a cooperative stop and calls the module's `stop(int)` hook if bound.
    pub fn stop_task(&self, id: TaskId) -> bool {
        match self.inner.monitor.request_stop(id) {
            Some(module) => {
                self.notify_stop(&module, id);
                true
            }
            None => false,
        }
    }

    /// Stops every in-flight task of `method`; returns how many were flagged.
    pub fn stop_method(&self, method: &str) -> usize {
        let stopped = self.inner.monitor.request_stop_method(method);
        for (id, module) in &stopped {
            self.notify_stop(module, *id);
        }
        stopped.len()
    }

    fn notify_stop(&self, module: &str, id: TaskId) {
        if let Some(target) = self.module(module) {
            let ctx = CallContext::sync(module, crate::module::STOP_METHOD, Some(self.handle()));
            match stop_hook_arg(id) {
                Some(task) => target.notify_stop(&ctx, task),
                None => debug!("Task {} does not fit the stop hook of {}", id, module),
            }
        }
    }

    // ---- tree ----

    /// Adds or refreshes a child broker.
    pub fn register_child(&self, info: ModuleInfo) -> Result<()> {
        if !info.is_broker {
            return Err(BrokerError::Internal(format!("{} is not a broker", info.name)));
        }
        if info.name == self.name() {
            return Err(BrokerError::DuplicateModule(info.name));
        }
        info!("Child broker registered: {}", info);
        self.inner
            .children
            .write()
            .insert(info.name.clone(), ChildBroker::new(info));
        Ok(())
    }

    pub fn unregister_child(&self, name: &str) -> bool {
        let Some(child) = self.inner.children.write().remove(name) else {
            return false;
        };
        if let Some(endpoint) = child.info.endpoint() {
            self.purge_routes_to(endpoint);
        }
        info!("Child broker {} unregistered", name);
        true
    }

    pub fn children(&self) -> Vec<ChildBroker> {
        self.inner.children.read().values().cloned().collect()
    }

    pub fn is_child_reachable(&self, name: &str) -> Option<bool> {
        self.inner.children.read().get(name).map(|c| c.connection.reachable)
    }

    fn ping(&self, endpoint: SocketAddr) -> Result<Duration> {
        let start = Instant::now();
        let request = Request::Ping {
            from: self.name().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.inner
            .transport
            .request(endpoint, &request, Some(self.inner.config.heartbeat.timeout()))
            .and_then(Reply::into_ack)?;
        Ok(start.elapsed())
    }

    /// Pings every child and the parent once.
    pub fn check_heartbeat(&self) {
        if self.is_shutting_down() {
            return;
        }
        let max_retries = self.inner.config.heartbeat.max_retries;
        let children: Vec<(String, Option<SocketAddr>)> = self
            .inner
            .children
            .read()
            .values()
            .map(|c| (c.info.name.clone(), c.info.endpoint()))
            .collect();
        for (name, endpoint) in children {
            let result = endpoint
                .ok_or_else(|| BrokerError::Config(format!("child {} has no valid endpoint", name)))
                .and_then(|ep| self.ping(ep));
            let mut map = self.inner.children.write();
            let Some(child) = map.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(rtt) => {
                    if child.connection.record_success(rtt) {
                        info!("Child broker {} is reachable again", name);
                    }
                }
                Err(e) => {
                    debug!("Ping to child {} failed: {}", name, e);
                    if child.connection.record_failure(max_retries) {
                        warn!("Child broker {} unreachable after {} pings", name, max_retries);
                        drop(map);
                        if let Some(ep) = endpoint {
                            self.purge_routes_to(ep);
                        }
                    }
                }
            }
        }

        let Some(endpoint) = self.parent_endpoint() else {
            return;
        };
        let result = self.ping(endpoint);
        let lost = {
            let mut parent = self.inner.parent.lock();
            let Some(parent) = parent.as_mut() else {
                return;
            };
            match result {
                Ok(rtt) => {
                    parent.connection.record_success(rtt);
                    false
                }
                Err(e) => {
                    debug!("Ping to parent failed: {}", e);
                    parent.connection.record_failure(max_retries)
                }
            }
        };
        if lost {
            self.purge_routes_to(endpoint);
            if self.inner.config.flags.keepalive {
                warn!("Parent broker {} unreachable, keeping alive", endpoint);
            } else {
                error!("Parent broker {} unreachable, shutting down", endpoint);
                self.shutdown(ShutdownMode::Kill);
            }
        }
    }

    fn on_parent_exit(&self, name: &str) {
        let endpoint = self.inner.parent.lock().take().map(|p| p.endpoint);
        if let Some(ep) = endpoint {
            self.purge_routes_to(ep);
        }
        if self.inner.config.flags.keepalive {
            warn!("Parent broker {} exited, keeping alive", name);
            return;
        }
        warn!("Parent broker {} exited, shutting down", name);
        // the reply to the parent is written by the current thread after this returns
        let broker = self.clone();
        if let Err(e) = thread::Builder::new()
            .name("alcommon-shutdown".into())
            .spawn(move || broker.shutdown(ShutdownMode::Kill))
        {
            error!("Cannot spawn shutdown thread: {}", e);
        }
    }

    /// Stops the broker. Idempotent.
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.inner.shutdown(mode);
    }

    // ---- inbound requests ----

    /// Serves one request from a peer broker.
    pub fn handle_request(&self, request: Request) -> Reply {
        debug!("Broker {} serving {}", self.name(), request.label());
        let result = match request {
            Request::Call { module, method, params } => {
                self.method_call(&module, &method, &params).map(|value| Reply::Value {
                    has_result: value.is_some(),
                    value: value.unwrap_or_default(),
                })
            }
            Request::PCall { module, method, params } => {
                self.pcall(&module, &method, params).map(Reply::Task)
            }
            Request::Wait { task, timeout_ms } => Ok(Reply::Bool(self.wait(task, timeout_ms))),
            Request::WaitMethod { method, timeout_ms } => {
                Ok(Reply::Bool(self.wait_method(&method, timeout_ms)))
            }
            Request::IsRunning { task } => Ok(Reply::Bool(self.is_running(task))),
            Request::IsMethodRunning { method } => Ok(Reply::Bool(self.is_method_running(&method))),
            Request::Stop { task } => Ok(Reply::Bool(self.stop_task(task))),
            Request::StopMethod { method } => Ok(Reply::Bool(self.stop_method(&method) > 0)),
            Request::Explore {
                name,
                search_up,
                search_down,
                dont_look_into,
            } => self
                .explore_module(&name, search_up, search_down, dont_look_into.as_deref())
                .map(Reply::Info),
            Request::GetModuleList => Ok(Reply::Infos(self.module_list())),
            Request::GetBrokerList => Ok(Reply::Infos(self.broker_list())),
            Request::GetGlobalModuleList => Ok(Reply::Infos(self.global_module_list())),
            Request::MethodList { module } => {
                self.local_module(&module).map(|m| Reply::Strings(m.method_list()))
            }
            Request::MethodHelp { module, method } => self
                .local_module(&module)
                .and_then(|m| m.method_help(&method))
                .map(Reply::Descriptor),
            Request::ModuleHelp { module } => self.local_module(&module).map(|m| Reply::Value {
                has_result: true,
                value: m.module_help(),
            }),
            Request::ModuleVersion { module } => self.local_module(&module).map(|m| Reply::Value {
                has_result: true,
                value: Value::from(m.version()),
            }),
            Request::InnerTest { module } => self.local_module(&module).map(|m| Reply::Bool(m.inner_test())),
            Request::RegisterBroker { info } => self.register_child(info).map(|_| Reply::Ack),
            Request::UnregisterBroker { name } => {
                self.unregister_child(&name);
                Ok(Reply::Ack)
            }
            Request::ParentExit { name } => {
                self.on_parent_exit(&name);
                Ok(Reply::Ack)
            }
            Request::Ping { timestamp, .. } => Ok(Reply::Pong { timestamp }),
        };
        result.unwrap_or_else(|e| Reply::error(&e))
    }
}

impl BrokerInner {
    fn shutdown(&self, mode: ShutdownMode) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Broker {} shutting down ({:?})", self.config.name, mode);

        let children: Vec<ModuleInfo> = self.children.write().drain().map(|(_, c)| c.info).collect();
        for child in children {
            if let Some(endpoint) = child.endpoint() {
                let request = Request::ParentExit {
                    name: self.config.name.clone(),
                };
                if let Err(e) = self.transport.request(endpoint, &request, Some(NOTIFY_TIMEOUT)) {
                    debug!("Cannot notify child {}: {}", child.name, e);
                }
            }
        }
        let parent = self.parent.lock().take();
        if let Some(parent) = parent {
            let request = Request::UnregisterBroker {
                name: self.config.name.clone(),
            };
            if let Err(e) = self.transport.request(parent.endpoint, &request, Some(NOTIFY_TIMEOUT)) {
                debug!("Cannot notify parent {}: {}", parent.endpoint, e);
            }
        }

        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }

        if mode == ShutdownMode::Kill {
            for entry in self.monitor.task_list() {
                self.monitor.request_stop(entry.id);
            }
        }
        if let Some(pool) = &self.pool {
            pool.shutdown(mode);
        }

        let modules: Vec<Arc<Module>> = self.modules.write().drain().map(|(_, m)| m).collect();
        for module in modules {
            module.set_closing();
        }
        self.routes.write().clear();

        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop();
        }
        info!("Broker {} down", self.config.name);
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Kill);
    }
}

/// The `stop(int)` hook takes an Int; ids past `i32::MAX` are not forwarded.
fn stop_hook_arg(id: TaskId) -> Option<i32> {
    i32::try_from(id.0).ok()
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.name())
            .field("port", &self.port())
            .field("modules", &self.inner.modules.read().len())
            .field("children", &self.inner.children.read().len())
            .field("tasks", &self.inner.monitor.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn local(name: &str) -> Broker {
        let mut config = BrokerConfig::local(name);
        config.pool = PoolConfig {
            initial_threads: 2,
            max_threads: 4,
            monitor_interval_ms: 0,
            ..PoolConfig::default()
        };
        Broker::init(config).unwrap()
    }

    fn echo() -> Module {
        let module = Module::new("Echo");
        module.method("echo").bind(|x: i32| x).unwrap();
        module.method("nothing").bind(|| ()).unwrap();
        module
    }

    #[test]
    fn test_register_and_call() {
        let broker = local("main");
        let module = broker.register_module(echo()).unwrap();
        assert_eq!(module.id(), 1);
        assert!(matches!(broker.register_module(echo()), Err(BrokerError::DuplicateModule(_))));

        let out = broker.method_call("Echo", "echo", &Value::from_slice(&[7])).unwrap();
        assert_eq!(out, Some(Value::Int(7)));
        let void = broker.method_call("Echo", "nothing", &Value::array()).unwrap();
        assert_eq!(void, None);
        assert!(broker.method_call("Nope", "echo", &Value::array()).is_err());
    }

    #[test]
    fn test_pcall_validates_synchronously() {
        let broker = local("main");
        broker.register_module(echo()).unwrap();
        assert!(matches!(
            broker.pcall("Echo", "missing", Value::array()),
            Err(BrokerError::MethodNotFound(_))
        ));
        assert!(matches!(
            broker.pcall("Echo", "echo", Value::from_slice(&[1, 2])),
            Err(BrokerError::ArityMismatch(_))
        ));
        let id = broker.pcall("Echo", "echo", Value::from_slice(&[1])).unwrap();
        assert!(!broker.wait(id, 2000));
        assert!(!broker.is_running(id));
    }

    #[test]
    fn test_unregister_invalidates_proxy() {
        let broker = local("main");
        broker.register_module(echo()).unwrap();
        let proxy = broker.proxy("Echo").unwrap();
        assert!(proxy.is_local());
        broker.unregister_module("Echo").unwrap();
        assert!(proxy.call::<i32, _>("echo", (1,)).is_err());
        assert!(broker.proxy("Echo").is_err());
    }

    #[test]
    fn test_module_info_and_lists() {
        let broker = local("main");
        broker.register_module(echo()).unwrap();
        let info = broker.module_info("Echo").unwrap();
        assert!(!info.is_broker);
        assert_eq!(info.process_id, std::process::id());
        assert!(broker.module_info("main").unwrap().is_broker);
        assert_eq!(broker.module_list().len(), 1);
        assert_eq!(broker.broker_list().len(), 1);
        assert_eq!(broker.global_module_list().len(), 1);
        assert!(broker.is_module_present("Echo"));
        assert!(!broker.is_module_present("Other"));
        broker.unregister_module("Echo").unwrap();
        assert!(!broker.is_module_present("Echo"));
        assert!(matches!(
            broker.get_module_by_name("Other"),
            Err(BrokerError::ModuleUnreachable(_))
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let broker = local("main");
        let module = broker.register_module(echo()).unwrap();
        broker.shutdown(ShutdownMode::Drain);
        broker.shutdown(ShutdownMode::Kill);
        assert!(module.is_closing());
        assert!(matches!(broker.register_module(Module::new("Late")), Err(BrokerError::Shutdown)));
        assert!(broker.pcall("Echo", "echo", Value::from_slice(&[1])).is_err());
    }

    #[test]
    fn test_stop_hook_arg_does_not_truncate() {
        assert_eq!(stop_hook_arg(TaskId(7)), Some(7));
        assert_eq!(stop_hook_arg(TaskId(i32::MAX as u64)), Some(i32::MAX));
        assert_eq!(stop_hook_arg(TaskId(i32::MAX as u64 + 1)), None);
        assert_eq!(stop_hook_arg(TaskId(u64::MAX)), None);
    }

    #[test]
    fn test_handle_does_not_keep_broker_alive() {
        let broker = local("main");
        let handle = broker.handle();
        assert!(handle.upgrade().is_ok());
        drop(broker);
        assert!(matches!(handle.upgrade(), Err(BrokerError::Shutdown)));
    }
}
