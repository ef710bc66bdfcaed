//! Tokio driver for the GUESS engine.
//!
//! [`GuessService`] owns an [`Engine`] behind a mutex, runs its timers on a
//! tokio interval and hands query completions back over oneshot channels.
//! Inbound traffic is fed to it by whoever owns the UDP socket.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::constants::GUESS_TIMER_RESOLUTION;
use crate::guess::{
    Engine, GuessError, Muid, Pong, QueryCallback, QueryHandle, QueryOutcome, QueryStatus,
    SendOutcome, SendTag,
};
use crate::time::{Clock, Timestamp};

/// Clock following tokio time, so a paused runtime also pauses the engine.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
    base: Timestamp,
}

impl TokioClock {
    /// A clock reading `base` now.
    pub fn new(base: Timestamp) -> Self {
        Self {
            origin: Instant::now(),
            base,
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.base + self.origin.elapsed()
    }
}

/// A started query and the channel its outcome arrives on.
#[derive(Debug)]
pub struct QueryTicket {
    pub handle: QueryHandle,
    pub muid: Muid,
    pub outcome: oneshot::Receiver<QueryOutcome>,
}

pub struct GuessService {
    engine: Arc<Mutex<Engine>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl GuessService {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            driver: Mutex::new(None),
        }
    }

    /// Spawns the task running the engine timers. Calling it again while
    /// the driver runs does nothing.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        *driver = Some(tokio::spawn(async move {
            let mut ticks = interval(GUESS_TIMER_RESOLUTION);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                engine.lock().run_timers();
            }
        }));
        debug!("GUESS service driver started");
    }

    /// Starts a query for `text`. The outcome is delivered once the query
    /// ends, unless it is cancelled silently.
    pub fn create_query(&self, text: &str, media_type: u32) -> Result<QueryTicket, GuessError> {
        let muid = Muid::generate();
        let (tx, rx) = oneshot::channel();
        let callback: QueryCallback = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        let handle = self
            .engine
            .lock()
            .create_query(text, muid, media_type, Some(callback))?;
        Ok(QueryTicket {
            handle,
            muid,
            outcome: rx,
        })
    }

    /// Cancels a query. With `notify` unset its outcome channel is closed
    /// without a value.
    pub fn cancel_query(&self, handle: QueryHandle, notify: bool) -> bool {
        self.engine.lock().cancel_query(handle, notify)
    }

    pub fn end_on_starvation(&self, handle: QueryHandle) -> Result<(), GuessError> {
        self.engine.lock().end_on_starvation(handle)
    }

    /// Delivers an inbound pong. Returns false when it answers none of our
    /// RPCs.
    pub fn handle_pong(&self, pong: &Pong) -> bool {
        self.engine.lock().handle_rpc_reply(pong)
    }

    pub fn handle_introduction_ping(
        &self,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<(), GuessError> {
        self.engine.lock().handle_introduction_ping(from, payload)
    }

    pub fn host_discovered(&self, host: SocketAddr) {
        self.engine.lock().host_discovered(host);
    }

    pub fn send_outcome(&self, tag: SendTag, outcome: SendOutcome) {
        self.engine.lock().send_outcome(tag, outcome);
    }

    pub fn report_received_results(&self, muid: &Muid, count: u32) -> bool {
        self.engine.lock().report_received_results(muid, count)
    }

    pub fn report_kept_results(&self, muid: &Muid, count: u32) -> bool {
        self.engine.lock().report_kept_results(muid, count)
    }

    pub fn query_status(&self, handle: QueryHandle) -> Option<QueryStatus> {
        self.engine.lock().query_status(handle)
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        f(&mut self.engine.lock())
    }

    /// Stops the driver and ends every running query.
    pub fn shutdown(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.engine.lock().shutdown();
        info!("GUESS service stopped");
    }
}

impl Drop for GuessService {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}
