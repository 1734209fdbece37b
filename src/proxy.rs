//! Client-side handle onto a module, local or remote.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::debug;

use crate::broker::{Broker, BrokerHandle, ModuleInfo};
use crate::context::CallContext;
use crate::functor::{invoke_native, Args, ReturnValue};
use crate::module::{MethodDescriptor, Module};
use crate::net::{Reply, Request};
use crate::value::{TypeTag, Value};
use crate::{BrokerError, Result, TaskId};

/// Slack added to a remote wait so the peer's own timeout answers first.
const WAIT_MARGIN: Duration = Duration::from_secs(2);

/// Where a proxy sends its calls.
#[derive(Debug, Clone)]
pub(crate) enum Route {
    Local(Weak<Module>),
    Remote(ModuleInfo),
}

impl Route {
    pub(crate) fn is_alive(&self) -> bool {
        match self {
            Route::Local(module) => module.upgrade().is_some_and(|m| !m.is_closing()),
            Route::Remote(_) => true,
        }
    }
}

/// Calls methods of one module by name.
///
/// ```no_run
/// # use alcommon::{Broker, Module};
/// let broker = Broker::local("main")?;
/// let echo = Module::new("Echo");
/// echo.method("echo").bind(|x: i32| x)?;
/// broker.register_module(echo)?;
///
/// let proxy = broker.proxy("Echo")?;
/// assert_eq!(proxy.call::<i32, _>("echo", (5,))?, 5);
/// # Ok::<(), alcommon::BrokerError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Proxy {
    name: String,
    route: Route,
    broker: Option<BrokerHandle>,
}

impl Proxy {
    pub(crate) fn with_route(name: &str, route: Route, broker: Option<BrokerHandle>) -> Self {
        Self {
            name: name.to_string(),
            route,
            broker,
        }
    }

    /// Proxy onto a module without going through a broker. `pcall` and friends need a
    /// broker and fail on such a proxy.
    pub fn local(module: &Arc<Module>) -> Self {
        Self::with_route(module.name(), Route::Local(Arc::downgrade(module)), None)
    }

    /// Proxy onto a module hosted by the broker described in `info`.
    pub fn remote(info: ModuleInfo, broker: &Broker) -> Self {
        let name = info.name.clone();
        Self::with_route(&name, Route::Remote(info), Some(broker.handle()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_local(&self) -> bool {
        matches!(self.route, Route::Local(_))
    }

    fn broker(&self) -> Result<Broker> {
        self.broker
            .as_ref()
            .ok_or_else(|| BrokerError::Internal(format!("proxy to {} has no broker", self.name)))?
            .upgrade()
    }

    fn module(&self, module: &Weak<Module>) -> Result<Arc<Module>> {
        module
            .upgrade()
            .filter(|m| !m.is_closing())
            .ok_or_else(|| BrokerError::ModuleUnreachable(format!("module {} is gone", self.name)))
    }

    fn context(&self, method: &str) -> CallContext {
        CallContext::sync(&self.name, method, self.broker.clone())
    }

    /// Round trip to the hosting broker. A lost connection drops the cached route.
    fn remote_request(&self, info: &ModuleInfo, request: Request, timeout: Option<Duration>) -> Result<Reply> {
        let broker = self.broker()?;
        let endpoint = info.endpoint().ok_or_else(|| {
            BrokerError::ModuleUnreachable(format!("{} has no valid endpoint {}:{}", self.name, info.ip, info.port))
        })?;
        let result = broker
            .transport()
            .request(endpoint, &request, timeout)
            .and_then(Reply::into_result);
        if let Err(BrokerError::ConnectionLost(msg)) = &result {
            debug!("Dropping route to {}: {}", self.name, msg);
            broker.remove_proxy(&self.name);
        }
        result
    }

    fn call_timeout(&self) -> Option<Duration> {
        self.broker().ok().and_then(|b| b.config().call_timeout())
    }

    /// Typed call: `proxy.call::<i32, _>("add", (1, 2))`.
    ///
    /// Locally the argument and return types are checked against the method's descriptor
    /// before anything runs, and the native closure is called directly when its signature
    /// is exactly `A -> R`.
    pub fn call<R: ReturnValue, A: Args>(&self, method: &str, args: A) -> Result<R> {
        match &self.route {
            Route::Local(module) => {
                let module = self.module(module)?;
                let (functor, descriptor) = module.lookup(method)?;
                descriptor.check_signature(&A::tags(), R::TAG)?;
                let ctx = self.context(method);
                match invoke_native::<A, R>(functor.as_ref(), &ctx, args) {
                    Ok(result) => result,
                    Err(args) => {
                        let value = module.execute(method, &ctx, &args.into_params())?;
                        R::from_return((descriptor.return_tag != TypeTag::Void).then_some(value))
                    }
                }
            }
            Route::Remote(info) => {
                let request = Request::Call {
                    module: self.name.clone(),
                    method: method.to_string(),
                    params: args.into_params(),
                };
                let value = self.remote_request(info, request, self.call_timeout())?.into_value()?;
                R::from_return(value)
            }
        }
    }

    /// Call ignoring any result.
    pub fn call_void<A: Args>(&self, method: &str, args: A) -> Result<()> {
        self.call::<(), A>(method, args)
    }

    /// Dynamic call with a parameter array; `None` for void methods.
    pub fn call_value(&self, method: &str, params: Value) -> Result<Option<Value>> {
        match &self.route {
            Route::Local(module) => {
                let module = self.module(module)?;
                let (_, descriptor) = module.lookup(method)?;
                let value = module.execute(method, &self.context(method), &params)?;
                Ok((descriptor.return_tag != TypeTag::Void).then_some(value))
            }
            Route::Remote(info) => {
                let request = Request::Call {
                    module: self.name.clone(),
                    method: method.to_string(),
                    params,
                };
                self.remote_request(info, request, self.call_timeout())?.into_value()
            }
        }
    }

    /// Starts `method` on the broker's pool and returns at once.
    pub fn pcall<A: Args>(&self, method: &str, args: A) -> Result<TaskId> {
        if let Route::Local(module) = &self.route {
            let module = self.module(module)?;
            let (_, descriptor) = module.lookup(method)?;
            descriptor.check_signature(&A::tags(), TypeTag::Void)?;
        }
        self.pcall_value(method, args.into_params())
    }

    pub fn pcall_value(&self, method: &str, params: Value) -> Result<TaskId> {
        match &self.route {
            Route::Local(_) => self.broker()?.pcall(&self.name, method, params),
            Route::Remote(info) => {
                let request = Request::PCall {
                    module: self.name.clone(),
                    method: method.to_string(),
                    params,
                };
                self.remote_request(info, request, self.call_timeout())?.into_task()
            }
        }
    }

    /// Waits for a task started by this proxy; true on timeout, `timeout_ms == 0` waits forever.
    pub fn wait(&self, id: TaskId, timeout_ms: u64) -> Result<bool> {
        match &self.route {
            Route::Local(_) => Ok(self.broker()?.wait(id, timeout_ms)),
            Route::Remote(info) => self
                .remote_request(info, Request::Wait { task: id, timeout_ms }, wait_timeout(timeout_ms))?
                .into_bool(),
        }
    }

    pub fn wait_method(&self, method: &str, timeout_ms: u64) -> Result<bool> {
        match &self.route {
            Route::Local(_) => Ok(self.broker()?.wait_method(method, timeout_ms)),
            Route::Remote(info) => {
                let request = Request::WaitMethod {
                    method: method.to_string(),
                    timeout_ms,
                };
                self.remote_request(info, request, wait_timeout(timeout_ms))?.into_bool()
            }
        }
    }

    pub fn is_running(&self, id: TaskId) -> Result<bool> {
        match &self.route {
            Route::Local(_) => Ok(self.broker()?.is_running(id)),
            Route::Remote(info) => self
                .remote_request(info, Request::IsRunning { task: id }, self.call_timeout())?
                .into_bool(),
        }
    }

    pub fn is_method_running(&self, method: &str) -> Result<bool> {
        match &self.route {
            Route::Local(_) => Ok(self.broker()?.is_method_running(method)),
            Route::Remote(info) => {
                let request = Request::IsMethodRunning {
                    method: method.to_string(),
                };
                self.remote_request(info, request, self.call_timeout())?.into_bool()
            }
        }
    }

    /// Requests a cooperative stop of task `id`; false if it is not running.
    pub fn stop(&self, id: TaskId) -> Result<bool> {
        match &self.route {
            Route::Local(_) => Ok(self.broker()?.stop_task(id)),
            Route::Remote(info) => self
                .remote_request(info, Request::Stop { task: id }, self.call_timeout())?
                .into_bool(),
        }
    }

    /// Stops every running task of `method`; true if any was running.
    pub fn stop_method(&self, method: &str) -> Result<bool> {
        match &self.route {
            Route::Local(_) => Ok(self.broker()?.stop_method(method) > 0),
            Route::Remote(info) => {
                let request = Request::StopMethod {
                    method: method.to_string(),
                };
                self.remote_request(info, request, self.call_timeout())?.into_bool()
            }
        }
    }

    pub fn method_list(&self) -> Result<Vec<String>> {
        match &self.route {
            Route::Local(module) => Ok(self.module(module)?.method_list()),
            Route::Remote(info) => {
                let request = Request::MethodList {
                    module: self.name.clone(),
                };
                self.remote_request(info, request, self.call_timeout())?.into_strings()
            }
        }
    }

    pub fn method_help(&self, method: &str) -> Result<MethodDescriptor> {
        match &self.route {
            Route::Local(module) => self.module(module)?.method_help(method),
            Route::Remote(info) => {
                let request = Request::MethodHelp {
                    module: self.name.clone(),
                    method: method.to_string(),
                };
                self.remote_request(info, request, self.call_timeout())?.into_descriptor()
            }
        }
    }

    pub fn module_help(&self) -> Result<Value> {
        match &self.route {
            Route::Local(module) => Ok(self.module(module)?.module_help()),
            Route::Remote(info) => {
                let request = Request::ModuleHelp {
                    module: self.name.clone(),
                };
                let help = self.remote_request(info, request, self.call_timeout())?.into_value()?;
                Ok(help.unwrap_or_default())
            }
        }
    }

    pub fn version(&self) -> Result<String> {
        match &self.route {
            Route::Local(module) => Ok(self.module(module)?.version()),
            Route::Remote(info) => {
                let request = Request::ModuleVersion {
                    module: self.name.clone(),
                };
                let version = self
                    .remote_request(info, request, self.call_timeout())?
                    .into_value()?
                    .unwrap_or_default();
                Ok(version.as_str()?.to_string())
            }
        }
    }

    /// Runs the module's self-test where it lives.
    pub fn inner_test(&self) -> Result<bool> {
        match &self.route {
            Route::Local(module) => Ok(self.module(module)?.inner_test()),
            Route::Remote(info) => {
                let request = Request::InnerTest {
                    module: self.name.clone(),
                };
                self.remote_request(info, request, self.call_timeout())?.into_bool()
            }
        }
    }

    pub fn module_info(&self) -> Result<ModuleInfo> {
        match &self.route {
            Route::Local(module) => {
                let module = self.module(module)?;
                if let Ok(broker) = self.broker() {
                    if let Some(info) = broker.module_info(module.name()) {
                        return Ok(info);
                    }
                }
                Ok(ModuleInfo {
                    name: module.name().to_string(),
                    ip: String::new(),
                    port: 0,
                    process_id: std::process::id(),
                    is_broker: false,
                    module_id: module.id(),
                })
            }
            Route::Remote(info) => Ok(info.clone()),
        }
    }
}

fn wait_timeout(timeout_ms: u64) -> Option<Duration> {
    (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms) + WAIT_MARGIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn math() -> Arc<Module> {
        let module = Module::new("Math");
        module.method("add").bind(|a: i32, b: i32| a + b).unwrap();
        module.method("scale").bind(|v: Vec<f32>, k: f32| v.into_iter().map(|x| x * k).collect::<Vec<f32>>()).unwrap();
        module.method("reset").bind(|| ()).unwrap();
        Arc::new(module)
    }

    #[test]
    fn test_typed_local_call() {
        let module = math();
        let proxy = Proxy::local(&module);
        assert!(proxy.is_local());
        assert_eq!(proxy.call::<i32, _>("add", (2, 3)).unwrap(), 5);
        let scaled: Vec<f32> = proxy.call("scale", (vec![1.0f32, 2.0], 2.0f32)).unwrap();
        approx::assert_relative_eq!(scaled[1], 4.0);
        proxy.call_void("add", (1, 1)).unwrap();
    }

    #[test]
    fn test_signature_errors_are_synchronous() {
        let module = math();
        let proxy = Proxy::local(&module);
        assert!(matches!(proxy.call::<i32, _>("add", (1,)), Err(BrokerError::ArityMismatch(_))));
        assert!(matches!(
            proxy.call::<i32, _>("add", (1, 2, 3)),
            Err(BrokerError::ArityMismatch(_))
        ));
        assert!(matches!(
            proxy.call::<i32, _>("add", (1, "x".to_string())),
            Err(BrokerError::TypeMismatch(_))
        ));
        assert!(matches!(proxy.call::<i32, _>("reset", ()), Err(BrokerError::TypeMismatch(_))));
        assert!(matches!(proxy.call::<i32, _>("nope", ()), Err(BrokerError::MethodNotFound(_))));
    }

    #[test]
    fn test_marshalled_fallback() {
        let module = math();
        let proxy = Proxy::local(&module);
        // i64 arguments do not match the native closure, so the call goes through Values
        assert_eq!(proxy.call::<i32, _>("add", (2i64, 3i64)).unwrap(), 5);
        let dynamic = proxy.call::<Value, _>("add", (Value::Int(1), Value::Int(1))).unwrap();
        assert_eq!(dynamic, Value::Int(2));
        assert_eq!(proxy.call_value("reset", Value::array()).unwrap(), None);
    }

    #[test]
    fn test_dropped_module_is_unreachable() {
        let module = math();
        let proxy = Proxy::local(&module);
        drop(module);
        assert!(matches!(proxy.call::<i32, _>("add", (1, 2)), Err(BrokerError::ModuleUnreachable(_))));
    }

    #[test]
    fn test_pcall_needs_broker() {
        let module = math();
        let proxy = Proxy::local(&module);
        assert!(proxy.pcall("add", (1, 2)).is_err());
        assert_eq!(proxy.method_list().unwrap(), vec!["add", "reset", "scale"]);
        assert_eq!(proxy.method_help("add").unwrap().arity(), 2);
        assert_eq!(proxy.module_info().unwrap().name, "Math");
    }

    #[test]
    fn test_version_and_inner_test() {
        let module = math();
        module.set_version("2.0");
        let proxy = Proxy::local(&module);
        assert_eq!(proxy.version().unwrap(), "2.0");
        assert!(!proxy.inner_test().unwrap());
        module.set_inner_test(|| true);
        assert!(proxy.inner_test().unwrap());
    }
}
