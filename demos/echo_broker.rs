//! Starts a broker serving an `Echo` module.
//!
//! ```text
//! cargo run --example echo_broker                 # defaults, listens on 127.0.0.1:9559
//! cargo run --example echo_broker -- broker.json  # config file
//! ```
//!
//! A second instance configured with `"parent": "127.0.0.1:9559"` and `"port": 0` finds
//! `Echo` through its parent and calls it once.

use std::thread;
use std::time::Duration;

use alcommon::{Broker, BrokerConfig, CallContext, Module, Result};
use log::{error, info};

fn echo_module() -> Result<Module> {
    let module = Module::new("Echo");
    module.set_description("echo demo");
    module
        .method("echo")
        .doc("returns its argument")
        .param("x", "integer to echo")
        .returns("x")
        .bind(|x: i32| x)?;
    module
        .method("countdown")
        .doc("counts down once per second until stopped")
        .param("from", "start value")
        .bind_with_context(|ctx: &CallContext, from: i32| -> Result<()> {
            for n in (0..=from).rev() {
                ctx.check_stop()?;
                info!("{} {}", ctx.task_id().map(|t| t.to_string()).unwrap_or_default(), n);
                thread::sleep(Duration::from_secs(1));
            }
            Ok(())
        })?;
    Ok(module)
}

fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => BrokerConfig::from_json_file(path)?,
        None => BrokerConfig::default(),
    };
    let is_child = config.parent.is_some();
    let broker = Broker::init(config)?;

    if is_child {
        let echo = broker.proxy("Echo")?;
        info!("Echo found at {}", echo.module_info()?);
        info!("echo(5) = {}", echo.call::<i32, _>("echo", (5,))?);
        let task = echo.pcall("countdown", (3,))?;
        echo.wait(task, 0)?;
        broker.shutdown(alcommon::ShutdownMode::Drain);
        return Ok(());
    }

    broker.register_module(echo_module()?)?;
    info!("Serving Echo on port {}", broker.port());
    loop {
        thread::sleep(Duration::from_secs(5));
        if broker.is_shutting_down() {
            return Ok(());
        }
        if let Some(pool) = broker.pool() {
            info!(
                "{} threads, {} busy, {} queued, {} tasks monitored",
                pool.thread_count(),
                pool.used_threads(),
                pool.queued_tasks(),
                broker.task_monitor().len()
            );
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}
