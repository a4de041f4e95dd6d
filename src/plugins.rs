//! Hooks for extending the server.
//!
//! A [`Plugin`] is called at fixed points of the startup sequence. A
//! [`Monitor`] gets to register its events with the main loop before
//! anybody else does.

use tracing::debug;

use crate::error::Error;
use crate::server::mainloop::MainLoop;

//------------ Plugin --------------------------------------------------------

/// A server extension.
///
/// All hooks default to doing nothing. They are called in order of
/// registration and a failing hook aborts startup.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Called once the configuration is complete.
    ///
    /// `num_dns_threads` is the number of listener threads that will be
    /// started.
    fn full_config(&mut self, num_dns_threads: usize) -> Result<(), Error> {
        let _ = num_dns_threads;
        Ok(())
    }

    /// Called in the daemon process right after going to the background.
    fn post_daemonize(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called for the last time with the original privileges.
    fn pre_privdrop(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called right before the sockets are acquired.
    fn pre_run(&mut self, main_loop: &mut MainLoop) -> Result<(), Error> {
        let _ = main_loop;
        Ok(())
    }
}

//------------ Monitor -------------------------------------------------------

/// Something watching over the server from the main loop.
pub trait Monitor {
    fn name(&self) -> &str;

    fn start(&mut self, main_loop: &mut MainLoop) -> Result<(), Error>;
}

//------------ Plugins -------------------------------------------------------

#[derive(Default)]
pub struct Plugins {
    plugins: Vec<Box<dyn Plugin>>,
    monitors: Vec<Box<dyn Monitor>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.push(Box::new(plugin))
    }

    pub fn add_monitor(&mut self, monitor: impl Monitor + 'static) {
        self.monitors.push(Box::new(monitor))
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty() && self.monitors.is_empty()
    }

    pub fn full_config(&mut self, num_dns_threads: usize) -> Result<(), Error> {
        for plugin in &mut self.plugins {
            debug!("Plugin '{}': full config", plugin.name());
            plugin.full_config(num_dns_threads)?;
        }
        Ok(())
    }

    pub fn post_daemonize(&mut self) -> Result<(), Error> {
        for plugin in &mut self.plugins {
            debug!("Plugin '{}': post daemonize", plugin.name());
            plugin.post_daemonize()?;
        }
        Ok(())
    }

    pub fn pre_privdrop(&mut self) -> Result<(), Error> {
        for plugin in &mut self.plugins {
            debug!("Plugin '{}': pre privdrop", plugin.name());
            plugin.pre_privdrop()?;
        }
        Ok(())
    }

    pub fn pre_run(&mut self, main_loop: &mut MainLoop) -> Result<(), Error> {
        for plugin in &mut self.plugins {
            debug!("Plugin '{}': pre run", plugin.name());
            plugin.pre_run(main_loop)?;
        }
        Ok(())
    }

    /// Starts all monitors.
    ///
    /// This has to happen while nothing else is registered with the loop.
    pub fn start_monitors(
        &mut self,
        main_loop: &mut MainLoop,
    ) -> Result<(), Error> {
        if main_loop.events() != 0 {
            return Err(Error::Startup(format!(
                "monitoring must start before other events, \
                 but {} are registered",
                main_loop.events()
            )));
        }
        for monitor in &mut self.monitors {
            debug!("Starting monitor '{}'", monitor.name());
            monitor.start(main_loop)?;
        }
        Ok(())
    }
}

//============ Testing =======================================================
