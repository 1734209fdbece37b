use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alcommon::broker::HeartbeatConfig;
use alcommon::{
    Broker, BrokerConfig, BrokerError, BrokerFlags, CallContext, Module, PoolConfig, Result, ShutdownMode,
    Value,
};

fn small_pool() -> PoolConfig {
    PoolConfig {
        initial_threads: 2,
        max_threads: 4,
        monitor_interval_ms: 0,
        ..PoolConfig::default()
    }
}

fn local_broker(name: &str) -> Broker {
    let mut config = BrokerConfig::local(name);
    config.pool = small_pool();
    Broker::init(config).unwrap()
}

fn server_config(name: &str) -> BrokerConfig {
    BrokerConfig {
        name: name.to_string(),
        port: 0,
        pool: small_pool(),
        heartbeat: HeartbeatConfig {
            enabled: false,
            ..HeartbeatConfig::default()
        },
        ..BrokerConfig::default()
    }
}

fn echo_module(calls: Arc<AtomicUsize>) -> Module {
    let module = Module::new("Echo");
    module.set_description("echoes integers");
    module
        .method("echo")
        .doc("returns x")
        .param("x", "any integer")
        .returns("x")
        .bind(move |x: i32| {
            calls.fetch_add(1, Ordering::SeqCst);
            x
        })
        .unwrap();
    module.method("ping").bind(|| ()).unwrap();
    module
        .method("fail")
        .bind(|| -> Result<i32> { Err(BrokerError::Internal("always fails".into())) })
        .unwrap();
    module
}

#[test]
fn test_echo_call_and_pcall() {
    env_logger::try_init().ok();
    let broker = local_broker("main");
    let calls = Arc::new(AtomicUsize::new(0));
    broker.register_module(echo_module(calls.clone())).unwrap();

    let proxy = broker.proxy("Echo").unwrap();
    assert_eq!(proxy.call::<i32, _>("echo", (5,)).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let task = proxy.pcall("echo", (5,)).unwrap();
    assert!(!proxy.wait(task, 1000).unwrap());
    assert!(!proxy.is_running(task).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    broker.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_pcall_wait_never_times_out_for_fast_tasks() {
    env_logger::try_init().ok();
    let broker = local_broker("main");
    let calls = Arc::new(AtomicUsize::new(0));
    broker.register_module(echo_module(calls.clone())).unwrap();
    let proxy = broker.proxy("Echo").unwrap();

    let tasks: Vec<_> = (0..50).map(|i| proxy.pcall("echo", (i,)).unwrap()).collect();
    for task in tasks {
        assert!(!proxy.wait(task, 2000).unwrap());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 50);
    assert!(!proxy.wait_method("echo", 100).unwrap());
    assert!(broker.task_monitor().is_empty());
}

#[test]
fn test_stop_ends_polling_task() {
    env_logger::try_init().ok();
    let broker = local_broker("main");
    let iterations = Arc::new(AtomicUsize::new(0));
    let stopped_with = Arc::new(AtomicI32::new(-1));

    let module = Module::new("Poller");
    {
        let iterations = iterations.clone();
        module
            .method("poll")
            .bind_with_context(move |ctx: &CallContext| -> Result<()> {
                loop {
                    ctx.check_stop()?;
                    iterations.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .unwrap();
    }
    {
        let stopped_with = stopped_with.clone();
        module
            .method("stop")
            .bind(move |task: i32| stopped_with.store(task, Ordering::SeqCst))
            .unwrap();
    }
    broker.register_module(module).unwrap();

    let proxy = broker.proxy("Poller").unwrap();
    let task = proxy.pcall("poll", ()).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(proxy.is_running(task).unwrap());
    assert!(proxy.is_method_running("poll").unwrap());

    assert!(proxy.stop(task).unwrap());
    assert!(!proxy.wait(task, 1000).unwrap());
    assert!(!proxy.is_running(task).unwrap());
    assert!(iterations.load(Ordering::SeqCst) > 0);
    assert_eq!(stopped_with.load(Ordering::SeqCst) as u64, task.0);
    assert!(!proxy.stop(task).unwrap());
}

#[test]
fn test_light_broker_runs_pcall_on_own_thread() {
    let mut config = BrokerConfig::local("light");
    config.flags = BrokerFlags::from_mask(BrokerFlags::LIGHT | BrokerFlags::NOSERVER);
    let broker = Broker::init(config).unwrap();
    assert!(broker.pool().is_none());

    let calls = Arc::new(AtomicUsize::new(0));
    broker.register_module(echo_module(calls.clone())).unwrap();
    let proxy = broker.proxy("Echo").unwrap();
    let task = proxy.pcall("echo", (1,)).unwrap();
    assert!(!proxy.wait(task, 1000).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_module_can_reach_broker_from_context() {
    let broker = local_broker("main");
    broker
        .register_module(echo_module(Arc::new(AtomicUsize::new(0))))
        .unwrap();

    let relay = Module::new("Relay");
    relay
        .method("relay")
        .bind_with_context(|ctx: &CallContext, x: i32| -> Result<i32> {
            let echo = ctx.broker()?.proxy("Echo")?;
            echo.call::<i32, _>("echo", (x * 2,))
        })
        .unwrap();
    broker.register_module(relay).unwrap();

    let proxy = broker.proxy("Relay").unwrap();
    assert_eq!(proxy.call::<i32, _>("relay", (21,)).unwrap(), 42);
}

#[test]
fn test_remote_calls_and_error_kinds() {
    env_logger::try_init().ok();
    let host = Broker::init(server_config("host")).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    host.register_module(echo_module(calls.clone())).unwrap();

    let mut config = server_config("client");
    config.parent = host.endpoint().map(|e| e.to_string());
    config.flags.keepalive = true;
    let client = Broker::init(config).unwrap();

    let proxy = client.proxy("Echo").unwrap();
    assert!(!proxy.is_local());
    assert_eq!(proxy.module_info().unwrap().port, host.port());

    assert_eq!(proxy.call::<i32, _>("echo", (5,)).unwrap(), 5);
    let dynamic = proxy.call_value("echo", Value::from_slice(&[8])).unwrap();
    assert_eq!(dynamic, Some(Value::Int(8)));
    proxy.call_void("ping", ()).unwrap();

    assert!(matches!(
        proxy.call::<i32, _>("missing", ()),
        Err(BrokerError::MethodNotFound(_))
    ));
    assert!(matches!(
        proxy.call::<i32, _>("echo", (1, 2)),
        Err(BrokerError::ArityMismatch(_))
    ));
    assert!(matches!(
        proxy.call::<i32, _>("ping", ()),
        Err(BrokerError::TypeMismatch(_))
    ));
    assert!(matches!(
        proxy.call::<i32, _>("fail", ()),
        Err(BrokerError::Internal(_))
    ));

    let task = proxy.pcall("echo", (3,)).unwrap();
    assert!(!proxy.wait(task, 1000).unwrap());
    assert!(!proxy.is_running(task).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert_eq!(proxy.method_list().unwrap(), vec!["echo", "fail", "ping"]);
    let help = proxy.method_help("echo").unwrap();
    assert_eq!(help.params[0].name, "x");
    assert_eq!(proxy.module_help().unwrap()[1], Value::from("echoes integers"));
    assert_eq!(proxy.version().unwrap(), env!("CARGO_PKG_VERSION"));
    assert!(!proxy.inner_test().unwrap());

    host.shutdown(ShutdownMode::Drain);
    let err = proxy.call::<i32, _>("echo", (1,)).unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionLost(_)), "got {:?}", err);
    // the route is gone and the parent with it
    assert!(client.proxy("Echo").is_err());
    assert!(!client.is_shutting_down());
    client.shutdown(ShutdownMode::Drain);
}
