//! The main thread’s event loop.
//!
//! The main loop has little to do: it watches for signals and runs the
//! periodic statistics log plus whatever plugins register with it. It is a
//! single-threaded runtime driving a [`LocalSet`], so tasks spawned onto it
//! need not be `Send`.

use std::future::Future;
use std::io;

use tokio::runtime::{EnterGuard, Runtime};
use tokio::task::{JoinHandle, LocalSet};
use tracing::trace;

//------------ MainLoop ------------------------------------------------------

pub struct MainLoop {
    runtime: Runtime,
    tasks: LocalSet,

    /// The number of events registered so far.
    events: usize,
}

impl MainLoop {
    pub fn new() -> Result<Self, io::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        Ok(MainLoop {
            runtime,
            tasks: LocalSet::new(),
            events: 0,
        })
    }

    /// Returns the number of events registered with the loop.
    pub fn events(&self) -> usize {
        self.events
    }

    /// Registers an event, i.e., a task run while the loop is running.
    pub fn spawn<F>(&mut self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        trace!("Registering main loop event '{name}'");
        self.events += 1;
        self.tasks.spawn_local(task)
    }

    /// Enters the runtime context.
    ///
    /// Needed to create I/O and timer resources, such as signal streams,
    /// outside of a task.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.runtime.enter()
    }

    /// Runs the loop until `main` completes.
    ///
    /// Registered events are driven alongside `main` and are dropped
    /// together with the loop.
    pub fn run<F: Future>(&self, main: F) -> F::Output {
        self.tasks.block_on(&self.runtime, main)
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn spawned_events_run_with_main() {
        let mut main_loop = MainLoop::new().unwrap();
        assert_eq!(main_loop.events(), 0);

        let ticks = Rc::new(Cell::new(0));
        let counter = ticks.clone();
        main_loop.spawn("ticker", async move {
            loop {
                counter.set(counter.get() + 1);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        assert_eq!(main_loop.events(), 1);

        let res = main_loop.run(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            7
        });
        assert_eq!(res, 7);
        assert!(ticks.get() > 1);
    }
}
