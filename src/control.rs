//! The control loop: a single `Broker` struct owning every mutable
//! resource, driven by `tokio::select!` over four timers, listener
//! readability, and lifecycle signals.
//!
//! Grounded on `broker/mod.rs`'s reconnect-on-timeout shape, generalized
//! from a thread-per-connection PTY relay to a single cooperative event
//! loop owned by one explicit struct instead of process-wide globals.

use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::Config;
use crate::error::BrokerError;
use crate::lifecycle::LifecycleEvent;
use crate::listener::Listener;
use crate::metrics::Metrics;
use crate::queue::Queue;
use crate::upstream::Upstream;

const T_MAIN: Duration = Duration::from_secs(10);
const T_DRAIN: Duration = Duration::from_millis(200);
const T_LISTENER: Duration = Duration::from_secs(2);
const T_RECONNECT: Duration = Duration::from_secs(5);

pub struct Broker {
    config: Config,
    config_path: PathBuf,
    queue: Queue,
    listener: Listener,
    upstream: Upstream,
    spool_path: PathBuf,
    start_time: SystemTime,
    metrics: Metrics,
    fake: bool,
}

impl Broker {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        listener: Listener,
        upstream: Upstream,
        fake: bool,
    ) -> Self {
        let spool_path = config.buffer.clone();
        let mut queue = Queue::new();
        queue.set_capacity(config.queue_capacity, config.queue_drop_policy);
        Self {
            config,
            config_path,
            queue,
            listener,
            upstream,
            spool_path,
            start_time: SystemTime::now(),
            metrics: Metrics::new(Instant::now()),
            fake,
        }
    }

    /// Restore the spool into the queue and immediately persist it back —
    /// this both validates the spool is readable and re-establishes a
    /// fresh snapshot under the new process.
    pub fn restore_spool(&mut self) {
        match crate::spool::load(&self.spool_path) {
            Ok(records) => {
                let restored = records.len();
                self.queue = Queue::from_records(records);
                self.queue
                    .set_capacity(self.config.queue_capacity, self.config.queue_drop_policy);
                if restored > 0 {
                    log::info!("restored {restored} record(s) from spool");
                }
            }
            Err(e) => log::warn!("spool restore failed: {e}"),
        }
        self.snapshot_spool();
    }

    fn snapshot_spool(&mut self) {
        if let Err(e) = crate::spool::save(&self.spool_path, &self.queue.snapshot()) {
            log::warn!("spool snapshot failed: {e}");
        }
    }

    /// Drain the queue while upstream is connected: pop head, send, count;
    /// on failure, push back to the head and stop.
    async fn drain(&mut self) {
        while self.upstream.state() == crate::upstream::State::Connected {
            let Some(record) = self.queue.pop_head() else {
                break;
            };
            let frame = crate::envelope::encode_upstream(&record);
            match self.upstream.send(&frame).await {
                Ok(()) => self.metrics.record_sent(frame.len()),
                Err(e) => {
                    log::warn!("upstream send failed, re-queuing: {e}");
                    self.queue.push_head(record);
                    break;
                }
            }
        }
    }

    async fn reconnect_if_down(&mut self) {
        match self.upstream.state() {
            crate::upstream::State::Unknown => self.upstream.connect().await,
            crate::upstream::State::Error => {
                self.upstream.reset_after_error();
            }
            _ => {}
        }
    }

    fn check_listener(&mut self) -> Result<(), BrokerError> {
        if self.listener.check() {
            return Ok(());
        }
        log::warn!("listener integrity check failed; rebinding");
        let rebound = Listener::bind(self.listener.path(), self.config.perms)?;
        self.listener = rebound;
        Ok(())
    }

    async fn send_keepalive_if_connected(&mut self) {
        if self.upstream.state() == crate::upstream::State::Connected {
            if let Err(e) = self.upstream.send_keepalive().await {
                log::warn!("keep-alive failed: {e}");
            }
        }
    }

    fn report_metrics(&mut self) {
        let (read, sent) = self.metrics.report(Instant::now());
        log::debug!(
            "throughput: read {{count={}, bytes={}}}, sent {{count={}, bytes={}}}",
            read.count,
            read.bytes,
            sent.count,
            sent.bytes
        );
    }

    async fn on_datagram(&mut self, record: Vec<u8>) {
        self.metrics.record_read(record.len());
        if self.fake {
            if let Ok(text) = String::from_utf8(record) {
                println!("{text}");
            }
            return;
        }
        if self.upstream.state() == crate::upstream::State::Connected {
            let frame = crate::envelope::encode_upstream(&record);
            if let Err(e) = self.upstream.send(&frame).await {
                log::warn!("direct send failed, enqueuing: {e}");
                self.queue.push_tail(record);
            } else {
                self.metrics.record_sent(frame.len());
            }
        } else {
            self.queue.push_tail(record);
        }
    }

    /// Run the event loop until a shutdown signal (or lifecycle error)
    /// ends it. Returns once the shutdown sequence has completed.
    pub async fn run(mut self, mut signals: crate::lifecycle::SignalListener) {
        let mut t_main = interval(T_MAIN);
        let mut t_drain = interval(T_DRAIN);
        let mut t_listener = interval(T_LISTENER);
        let mut t_reconnect = interval(T_RECONNECT);
        for t in [&mut t_main, &mut t_drain, &mut t_listener, &mut t_reconnect] {
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        crate::selflog::emit(&mut self.queue, "info", "broker started");

        loop {
            tokio::select! {
                _ = t_main.tick() => {
                    self.snapshot_spool();
                    self.drain().await;
                    if let Err(e) = self.check_listener() {
                        log::error!("listener rebind failed: {e}");
                    }
                    self.reconnect_if_down().await;
                    self.send_keepalive_if_connected().await;
                    self.report_metrics();
                }
                _ = t_drain.tick() => {
                    self.drain().await;
                }
                _ = t_listener.tick() => {
                    if let Err(e) = self.check_listener() {
                        log::error!("listener rebind failed: {e}");
                    }
                }
                _ = t_reconnect.tick() => {
                    self.reconnect_if_down().await;
                }
                result = self.listener.recv() => {
                    match result {
                        Ok(Some(record)) => self.on_datagram(record).await,
                        Ok(None) => {}
                        Err(e) => log::warn!("intake framing error: {e}"),
                    }
                }
                event = signals.next_event() => {
                    match event {
                        LifecycleEvent::Shutdown => {
                            self.shutdown().await;
                            break;
                        }
                        LifecycleEvent::RestartUpstream => {
                            self.upstream.graceful_shutdown().await;
                        }
                        LifecycleEvent::Reload => {
                            self.reload_config();
                        }
                        LifecycleEvent::WriteStatus => {
                            self.write_status();
                        }
                    }
                }
            }
        }
    }

    fn reload_config(&mut self) {
        match Config::load(&self.config_path) {
            Ok(new_config) => {
                log::info!("configuration reloaded");
                self.queue
                    .set_capacity(new_config.queue_capacity, new_config.queue_drop_policy);
                self.config = new_config;
            }
            Err(e) => log::error!("config reload failed, retaining previous config: {e}"),
        }
    }

    fn write_status(&mut self) {
        let status = crate::status::Status::new(
            self.queue.len(),
            self.start_time,
            self.listener.path(),
            Some(self.listener.signature()),
            self.upstream.hostport(),
            self.upstream.state(),
        );
        if let Err(e) = crate::status::write(&self.config.status, &status) {
            log::warn!("status write failed: {e}");
        }
    }

    /// Consumes the broker: flushes what it can, then unlinks the intake
    /// socket file so nothing is left listening at `self.listener.path()`.
    async fn shutdown(mut self) {
        log::info!("shutting down");
        crate::selflog::emit(&mut self.queue, "info", "broker shutting down");
        self.snapshot_spool();
        self.drain().await;
        self.upstream.graceful_shutdown().await;
        self.listener.close_and_unlink();
    }
}
