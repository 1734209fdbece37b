//! Module: a named registry of bound methods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::functor::{ContextMethod, Functor, Method, MAX_ARITY};
use crate::value::{TypeTag, Value};
use crate::{BrokerError, Result};

/// Name of the optional method called when a stop is requested for one of the
/// module's tasks.
pub const STOP_METHOD: &str = "stop";

/// Parameter metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub tag: TypeTag,
    pub doc: String,
}

/// Metadata of one bound method, fixed at bind time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub module: String,
    pub description: String,
    pub params: Vec<ParamDescriptor>,
    pub return_tag: TypeTag,
    pub return_doc: String,
    /// `(language, snippet)` usage examples.
    #[serde(default)]
    pub examples: Vec<(String, String)>,
}

impl MethodDescriptor {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn param_tags(&self) -> Vec<TypeTag> {
        self.params.iter().map(|p| p.tag).collect()
    }

    /// Help as a value:
    /// `[name, description, [[param, type, doc]...], [return type, doc], [[language, example]...]]`.
    pub fn to_value(&self) -> Value {
        let params = self
            .params
            .iter()
            .map(|p| {
                Value::from(vec![
                    Value::from(p.name.as_str()),
                    Value::from(p.tag.to_string()),
                    Value::from(p.doc.as_str()),
                ])
            })
            .collect::<Value>();
        Value::from(vec![
            Value::from(self.name.as_str()),
            Value::from(self.description.as_str()),
            params,
            Value::from(vec![
                Value::from(self.return_tag.to_string()),
                Value::from(self.return_doc.as_str()),
            ]),
            examples_value(&self.examples),
        ])
    }

    /// Checks a caller's argument and return tags against this descriptor.
    pub fn check_signature(&self, args: &[TypeTag], ret: TypeTag) -> Result<()> {
        if args.len() != self.arity() {
            return Err(BrokerError::ArityMismatch(format!(
                "{}.{} takes {} parameters, {} given",
                self.module,
                self.name,
                self.arity(),
                args.len()
            )));
        }
        for (i, (declared, given)) in self.params.iter().zip(args).enumerate() {
            if !TypeTag::accepts(declared.tag, *given) {
                return Err(BrokerError::TypeMismatch(format!(
                    "{}.{} parameter #{} is of type {} instead of {}",
                    self.module,
                    self.name,
                    i + 1,
                    given,
                    declared.tag
                )));
            }
        }
        let ret_ok = match (self.return_tag, ret) {
            (_, TypeTag::Void) => true,
            (TypeTag::Void, _) => false,
            (_, TypeTag::Value) => true,
            (declared, requested) => TypeTag::accepts(declared, requested),
        };
        if !ret_ok {
            return Err(BrokerError::TypeMismatch(format!(
                "{}.{} returns {}, {} was requested",
                self.module, self.name, self.return_tag, ret
            )));
        }
        Ok(())
    }
}

fn examples_value(examples: &[(String, String)]) -> Value {
    examples
        .iter()
        .map(|(language, text)| Value::from(vec![Value::from(language.as_str()), Value::from(text.as_str())]))
        .collect()
}

type InnerTest = Arc<dyn Fn() -> bool + Send + Sync>;

struct BoundEntry {
    functor: Arc<dyn Functor>,
    descriptor: Arc<MethodDescriptor>,
}

#[derive(Default)]
struct Synchronizer {
    generation: Mutex<u64>,
    cond: Condvar,
}

/// A named collection of bound methods.
pub struct Module {
    name: String,
    description: RwLock<String>,
    version: RwLock<String>,
    examples: RwLock<Vec<(String, String)>>,
    inner_test: RwLock<Option<InnerTest>>,
    id: AtomicU64,
    methods: RwLock<HashMap<String, BoundEntry>>,
    synchronizers: RwLock<HashMap<String, Arc<Synchronizer>>>,
    closing: AtomicBool,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: RwLock::new(String::new()),
            version: RwLock::new(env!("CARGO_PKG_VERSION").to_string()),
            examples: RwLock::new(Vec::new()),
            inner_test: RwLock::new(None),
            id: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
            synchronizers: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric ID assigned by the broker at registration, 0 before.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    pub fn set_description(&self, text: impl Into<String>) {
        *self.description.write() = text.into();
    }

    pub fn description(&self) -> String {
        self.description.read().clone()
    }

    /// Defaults to the crate version.
    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    pub fn set_version(&self, version: impl Into<String>) {
        *self.version.write() = version.into();
    }

    /// Adds a module-level usage example in `language`.
    pub fn add_module_example(&self, language: &str, example: &str) {
        self.examples.write().push((language.to_string(), example.to_string()));
    }

    pub fn module_examples(&self) -> Vec<(String, String)> {
        self.examples.read().clone()
    }

    /// Installs the self-test run by [`Module::inner_test`].
    pub fn set_inner_test(&self, test: impl Fn() -> bool + Send + Sync + 'static) {
        *self.inner_test.write() = Some(Arc::new(test));
    }

    /// Runs the module's self-test; false when none is installed.
    pub fn inner_test(&self) -> bool {
        let test = self.inner_test.read().clone();
        match test {
            Some(test) => test(),
            None => false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
        for sync in self.synchronizers.read().values() {
            // waiters check the flag under this lock before parking
            let _generation = sync.generation.lock();
            sync.cond.notify_all();
        }
    }

    /// Starts binding a method: `module.method("echo").param("x", "value").bind(f)`.
    pub fn method(&self, name: &str) -> MethodBuilder<'_> {
        MethodBuilder {
            module: self,
            name: name.to_string(),
            description: String::new(),
            params: Vec::new(),
            return_doc: String::new(),
            examples: Vec::new(),
        }
    }

    fn bind_functor(&self, builder: MethodBuilder<'_>, functor: Arc<dyn Functor>) -> Result<()> {
        let tags = functor.param_tags();
        if tags.len() > MAX_ARITY {
            return Err(BrokerError::ArityMismatch(format!(
                "{} parameters exceed the maximum of {}",
                tags.len(),
                MAX_ARITY
            )));
        }
        if builder.params.len() > tags.len() {
            return Err(BrokerError::ArityMismatch(format!(
                "{} documents {} parameters but takes {}",
                builder.name,
                builder.params.len(),
                tags.len()
            )));
        }
        let params = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| {
                let (name, doc) = builder
                    .params
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| (format!("arg{}", i + 1), String::new()));
                ParamDescriptor { name, tag: *tag, doc }
            })
            .collect();
        let descriptor = MethodDescriptor {
            name: builder.name.clone(),
            module: self.name.clone(),
            description: builder.description,
            params,
            return_tag: functor.return_tag(),
            return_doc: builder.return_doc,
            examples: builder.examples,
        };

        let mut methods = self.methods.write();
        if methods.contains_key(&builder.name) {
            return Err(BrokerError::DuplicateMethod(format!("{}.{}", self.name, builder.name)));
        }
        debug!("Module {} bound {}/{}", self.name, builder.name, descriptor.arity());
        methods.insert(
            builder.name,
            BoundEntry {
                functor,
                descriptor: Arc::new(descriptor),
            },
        );
        Ok(())
    }

    /// Looks up a method's functor and descriptor.
    pub fn lookup(&self, name: &str) -> Result<(Arc<dyn Functor>, Arc<MethodDescriptor>)> {
        self.methods
            .read()
            .get(name)
            .map(|e| (e.functor.clone(), e.descriptor.clone()))
            .ok_or_else(|| BrokerError::MethodNotFound(format!("{}.{}", self.name, name)))
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Generic dispatch by name with a `Value` parameter array.
    pub fn execute(&self, name: &str, ctx: &CallContext, params: &Value) -> Result<Value> {
        if self.is_closing() {
            return Err(BrokerError::ModuleUnreachable(format!("module {} is closing", self.name)));
        }
        let (functor, _) = self.lookup(name)?;
        functor.call(ctx, params)
    }

    /// Sorted method names.
    pub fn method_list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn method_help(&self, name: &str) -> Result<MethodDescriptor> {
        self.lookup(name).map(|(_, d)| (*d).clone())
    }

    /// `[name, description, [method help...], version, [[language, example]...]]`.
    pub fn module_help(&self) -> Value {
        let methods = self
            .method_list()
            .iter()
            .filter_map(|m| self.method_help(m).ok())
            .map(|d| d.to_value())
            .collect::<Value>();
        Value::from(vec![
            Value::from(self.name.as_str()),
            Value::from(self.description()),
            methods,
            Value::from(self.version()),
            examples_value(&self.module_examples()),
        ])
    }

    /// Calls the module's `stop(int)` method if it has one.
    pub(crate) fn notify_stop(&self, ctx: &CallContext, task: i32) {
        let Ok((functor, descriptor)) = self.lookup(STOP_METHOD) else {
            return;
        };
        if descriptor.param_tags() != [TypeTag::Int] {
            debug!("Module {} has a stop method with another signature", self.name);
            return;
        }
        if let Err(e) = functor.call(ctx, &Value::from(vec![Value::Int(task)])) {
            warn!("Module {} stop({}) failed: {}", self.name, task, e);
        }
    }

    pub fn add_synchronizer(&self, name: &str) {
        self.synchronizers
            .write()
            .entry(name.to_string())
            .or_default();
    }

    fn synchronizer(&self, name: &str) -> Result<Arc<Synchronizer>> {
        self.synchronizers.read().get(name).cloned().ok_or_else(|| {
            BrokerError::Internal(format!("module {} has no synchronizer '{}'", self.name, name))
        })
    }

    /// Blocks until another method signals `name`.
    pub fn wait_synchronizer(&self, name: &str) -> Result<()> {
        let sync = self.synchronizer(name)?;
        let mut generation = sync.generation.lock();
        let seen = *generation;
        while *generation == seen {
            if self.is_closing() {
                return Err(BrokerError::ModuleUnreachable(format!("module {} is closing", self.name)));
            }
            sync.cond.wait(&mut generation);
        }
        Ok(())
    }

    /// Like [`Module::wait_synchronizer`]; returns `true` when the wait timed out.
    pub fn wait_synchronizer_timeout(&self, name: &str, timeout: Duration) -> Result<bool> {
        let sync = self.synchronizer(name)?;
        let mut generation = sync.generation.lock();
        let seen = *generation;
        while *generation == seen {
            if self.is_closing() {
                return Err(BrokerError::ModuleUnreachable(format!("module {} is closing", self.name)));
            }
            if sync.cond.wait_for(&mut generation, timeout).timed_out() {
                return Ok(*generation == seen);
            }
        }
        Ok(false)
    }

    /// Wakes every waiter of `name`.
    pub fn signal_synchronizer(&self, name: &str) -> Result<()> {
        let sync = self.synchronizer(name)?;
        *sync.generation.lock() += 1;
        sync.cond.notify_all();
        Ok(())
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("methods", &self.method_list())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Fluent method binding, see [`Module::method`].
pub struct MethodBuilder<'a> {
    module: &'a Module,
    name: String,
    description: String,
    params: Vec<(String, String)>,
    return_doc: String,
    examples: Vec<(String, String)>,
}

impl<'a> MethodBuilder<'a> {
    pub fn doc(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn param(mut self, name: &str, doc: &str) -> Self {
        self.params.push((name.to_string(), doc.to_string()));
        self
    }

    pub fn returns(mut self, doc: &str) -> Self {
        self.return_doc = doc.to_string();
        self
    }

    /// Attaches a usage example written in `language`.
    pub fn example(mut self, language: &str, text: &str) -> Self {
        self.examples.push((language.to_string(), text.to_string()));
        self
    }

    pub fn bind<A, R>(self, f: impl Method<A, R>) -> Result<()> {
        let module = self.module;
        module.bind_functor(self, f.into_functor())
    }

    pub fn bind_with_context<A, R>(self, f: impl ContextMethod<A, R>) -> Result<()> {
        let module = self.module;
        module.bind_functor(self, f.into_functor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn echo_module() -> Module {
        let module = Module::new("Echo");
        module
            .method("echo")
            .doc("returns its argument")
            .param("x", "value to echo")
            .returns("x")
            .bind(|x: i32| x)
            .unwrap();
        module.method("add").bind(|a: i32, b: i32| a + b).unwrap();
        module
    }

    #[test]
    fn test_execute_and_lookup() {
        let module = echo_module();
        let ctx = CallContext::detached("Echo", "echo");
        assert_eq!(module.execute("echo", &ctx, &Value::from_slice(&[5])).unwrap(), Value::Int(5));
        assert!(matches!(
            module.execute("nope", &ctx, &Value::array()),
            Err(BrokerError::MethodNotFound(_))
        ));
        assert!(matches!(
            module.execute("add", &ctx, &Value::from_slice(&[1, 2, 3])),
            Err(BrokerError::ArityMismatch(_))
        ));
        assert_eq!(module.method_list(), vec!["add".to_string(), "echo".to_string()]);
    }

    #[test]
    fn test_duplicate_bind_fails() {
        let module = echo_module();
        let err = module.method("echo").bind(|x: i32| x + 1).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateMethod(_)));
    }

    #[test]
    fn test_help() {
        let module = echo_module();
        let help = module.method_help("echo").unwrap();
        assert_eq!(help.params[0].name, "x");
        assert_eq!(help.params[0].tag, TypeTag::Int);
        assert_eq!(help.return_tag, TypeTag::Int);
        let add = module.method_help("add").unwrap();
        assert_eq!(add.params[1].name, "arg2");
        assert_eq!(help.to_value()[0], Value::from("echo"));
    }

    #[test]
    fn test_signature_check() {
        let module = echo_module();
        let desc = module.method_help("echo").unwrap();
        assert!(desc.check_signature(&[TypeTag::Int], TypeTag::Int).is_ok());
        assert!(desc.check_signature(&[TypeTag::Int], TypeTag::Void).is_ok());
        assert!(matches!(
            desc.check_signature(&[TypeTag::Float], TypeTag::Int),
            Err(BrokerError::TypeMismatch(_))
        ));
        assert!(matches!(
            desc.check_signature(&[], TypeTag::Int),
            Err(BrokerError::ArityMismatch(_))
        ));
        assert!(desc.check_signature(&[TypeTag::Int], TypeTag::String).is_err());
    }

    #[test]
    fn test_closing_module_rejects_calls() {
        let module = echo_module();
        module.set_closing();
        let ctx = CallContext::detached("Echo", "echo");
        assert!(matches!(
            module.execute("echo", &ctx, &Value::from_slice(&[1])),
            Err(BrokerError::ModuleUnreachable(_))
        ));
    }

    #[test]
    fn test_synchronizer_wakes_waiter() {
        let module = Arc::new(Module::new("Sync"));
        module.add_synchronizer("ready");
        let waiter = {
            let module = module.clone();
            thread::spawn(move || module.wait_synchronizer_timeout("ready", Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        module.signal_synchronizer("ready").unwrap();
        assert!(!waiter.join().unwrap().unwrap());
        assert!(module.wait_synchronizer_timeout("ready", Duration::from_millis(10)).unwrap());
        assert!(module.signal_synchronizer("missing").is_err());
    }

    #[test]
    fn test_closing_wakes_every_synchronizer_waiter() {
        for _ in 0..500 {
            let module = Arc::new(Module::new("Sync"));
            module.add_synchronizer("s");
            let waiter = {
                let module = module.clone();
                thread::spawn(move || module.wait_synchronizer("s"))
            };
            module.set_closing();
            let (tx, rx) = crossbeam_channel::bounded(1);
            thread::spawn(move || {
                let _ = tx.send(waiter.join());
            });
            let result = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("waiter missed the closing wakeup")
                .unwrap();
            assert!(matches!(result, Err(BrokerError::ModuleUnreachable(_))));
        }
    }

    #[test]
    fn test_version_examples_and_inner_test() {
        let module = Module::new("Doc");
        assert_eq!(module.version(), env!("CARGO_PKG_VERSION"));
        assert!(!module.inner_test());

        module.set_version("1.2");
        module.set_inner_test(|| true);
        module.add_module_example("rust", "proxy.call::<i32, _>(\"twice\", (2,))");
        module
            .method("twice")
            .example("text", "twice(2) == 4")
            .bind(|x: i32| x * 2)
            .unwrap();
        assert!(module.inner_test());

        let help = module.method_help("twice").unwrap();
        assert_eq!(help.examples, vec![("text".to_string(), "twice(2) == 4".to_string())]);
        assert_eq!(help.to_value()[4][0][1], Value::from("twice(2) == 4"));

        let module_help = module.module_help();
        assert_eq!(module_help[3], Value::from("1.2"));
        assert_eq!(module_help[4][0][0], Value::from("rust"));
    }
}
