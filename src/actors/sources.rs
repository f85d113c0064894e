//! Lamp bank actor
//!
//! Calibration lamps are powered through PDU outlets. Switching is
//! confirmed by polling `read status o<NN> simple` until the outlet reports
//! the requested state, and batches are all-or-nothing: when one lamp of a
//! switch-on batch does not come on, every lamp already switched in that
//! batch is switched back off before the failure is returned.
//!
//! Warm-up dwells and illumination sequences run on the actor, so the
//! mailbox stays blocked while they last. [`SourcesHandle::abort`] reaches
//! them through a cancellation token instead.

use super::{reply_error, StateCell};
use crate::adapters::LineTransport;
use crate::config::{LampConfig, SourcesConfig};
use crate::error::{DcbError, DcbResult};
use crate::fsm::{Activity, DeviceKind, DeviceState, Event, Lifecycle};
use crate::hardware::{Limits, LineDriver};
use crate::sink::{text_keyword, CommandSink};
use crate::status::{LampPower, LampRecord, LampStatus};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type LampRecords = BTreeMap<String, LampRecord>;

/// Shared slot holding the token of the operation currently running.
#[derive(Debug, Clone, Default)]
struct AbortSlot(Arc<Mutex<CancellationToken>>);

impl AbortSlot {
    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a fresh token for a new operation.
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lock() = token.clone();
        token
    }

    fn cancel(&self) {
        self.lock().cancel();
    }
}

/// Warm-up still owed before the requested lamps are usable.
///
/// The warm-up time is the longest configured warm-up of the requested
/// lamps, replaced by `override_secs` when given, or zero with `force`. The
/// dwell is the largest `warmup - time already on` over the requested lamps,
/// or over the lamps already on when none are requested, never negative.
pub fn warmup_remaining(
    lamps: &BTreeMap<String, LampConfig>,
    records: &LampRecords,
    requested: &[String],
    override_secs: Option<f64>,
    force: bool,
    now: Instant,
) -> Duration {
    let configured = requested
        .iter()
        .filter_map(|name| lamps.get(name))
        .map(|lamp| lamp.warmup_secs)
        .fold(0.0, f64::max);
    let warmup = if force {
        0.0
    } else {
        override_secs.unwrap_or(configured)
    };

    let elapsed = |name: &str| {
        records
            .get(name)
            .map(|r| r.elapsed(now).as_secs_f64())
            .unwrap_or(0.0)
    };
    let remaining = if requested.is_empty() {
        records
            .iter()
            .filter(|(_, r)| r.is_on())
            .map(|(name, _)| warmup - elapsed(name))
            .fold(0.0, f64::max)
    } else {
        requested
            .iter()
            .map(|name| warmup - elapsed(name))
            .fold(0.0, f64::max)
    };

    Duration::try_from_secs_f64(remaining).unwrap_or(Duration::ZERO)
}

/// Turn requested on-durations into an ordered switch-off queue.
///
/// Lamps sharing a duration form one group. Each entry's dwell is measured
/// from the previous group's switch-off.
pub fn sequence_queue(prepared: &[(String, Duration)]) -> VecDeque<(Duration, Vec<String>)> {
    let mut by_duration: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
    for (lamp, on_for) in prepared {
        by_duration.entry(*on_for).or_default().push(lamp.clone());
    }

    let mut previous = Duration::ZERO;
    by_duration
        .into_iter()
        .map(|(on_for, group)| {
            let dwell = on_for.saturating_sub(previous);
            previous = on_for;
            (dwell, group)
        })
        .collect()
}

async fn wait_or_abort(dwell: Duration, token: &CancellationToken, what: &str) -> DcbResult<()> {
    tokio::select! {
        _ = token.cancelled() => Err(DcbError::UserAborted(what.to_string())),
        _ = tokio::time::sleep(dwell) => Ok(()),
    }
}

/// Lamp bank state readable without going through the mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcesSnapshot {
    /// FSM state
    pub state: DeviceState,
    /// Every configured lamp
    pub lamps: Vec<LampStatus>,
}

/// PDU lamp bank actor
pub struct Sources {
    config: SourcesConfig,
    driver: LineDriver,
    state: StateCell,
    lamps: watch::Sender<LampRecords>,
    prepared: Vec<(String, Duration)>,
    abort: AbortSlot,
}

impl Sources {
    /// Actor state; every lamp starts unknown.
    pub fn new(config: SourcesConfig, transport: Box<dyn LineTransport>) -> Self {
        let records = config
            .lamps
            .keys()
            .map(|name| (name.clone(), LampRecord::default()))
            .collect();
        let (lamps, _rx) = watch::channel(records);
        Self {
            config,
            driver: LineDriver::new(transport),
            state: StateCell::new(DeviceKind::Sources),
            lamps,
            prepared: Vec::new(),
            abort: AbortSlot::default(),
        }
    }

    fn validate(&self, names: &[String]) -> DcbResult<()> {
        for name in names {
            if !self.config.lamps.contains_key(name) {
                return Err(DcbError::precondition(format!(
                    "unknown lamp: {name}, valid: {}",
                    self.lamp_names().join(",")
                )));
            }
        }
        Ok(())
    }

    fn lamp_names(&self) -> Vec<String> {
        self.config.lamps.keys().cloned().collect()
    }

    fn outlet(&self, lamp: &str) -> DcbResult<String> {
        self.config
            .lamps
            .get(lamp)
            .map(|l| l.outlet.clone())
            .ok_or_else(|| DcbError::precondition(format!("unknown lamp: {lamp}")))
    }

    fn set_record(&self, lamp: &str, record: LampRecord) {
        self.lamps.send_modify(|records| {
            records.insert(lamp.to_string(), record);
        });
    }

    fn lamp_statuses(&self, names: &[String]) -> Vec<LampStatus> {
        let now = Instant::now();
        let records = self.lamps.borrow();
        names
            .iter()
            .filter_map(|name| {
                records
                    .get(name)
                    .map(|record| LampStatus::from_record(name, record, now))
            })
            .collect()
    }

    fn emit_lamps(&self, names: &[String], sink: &dyn CommandSink) {
        for status in self.lamp_statuses(names) {
            sink.inform(&status.keyword());
        }
    }

    async fn command(&mut self, command: &str) -> DcbResult<String> {
        let limits = Limits::new(
            self.config.command_timeout(),
            self.config.command_timeout(),
            self.config.max_iterations,
        );
        self.driver.query(command, limits).await
    }

    /// Poll an outlet until it reports `desired` or `timeout` runs out.
    async fn spin_until(
        &mut self,
        lamp: &str,
        desired: LampPower,
        timeout: Duration,
        sink: &dyn CommandSink,
    ) -> DcbResult<bool> {
        let outlet = self.outlet(lamp)?;
        let start = Instant::now();
        loop {
            let reply = self
                .command(&format!("read status o{outlet} simple"))
                .await?;
            sink.debug(&text_keyword(&format!("{lamp}={reply}")));
            if LampPower::parse(&reply) == Some(desired) {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                break;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }

        sink.warn(&text_keyword(&format!(
            "FAILED to switch {lamp} to {desired} within {:.2} seconds",
            start.elapsed().as_secs_f64()
        )));
        Ok(false)
    }

    /// Settled outlet state, waiting out a `pending` reply.
    async fn read_power(&mut self, lamp: &str) -> DcbResult<LampPower> {
        let outlet = self.outlet(lamp)?;
        let start = Instant::now();
        loop {
            let reply = self
                .command(&format!("read status o{outlet} simple"))
                .await?;
            if let Some(power) = LampPower::parse(&reply) {
                return Ok(power);
            }
            if reply.trim() != "pending" || start.elapsed() >= self.config.switch_off_timeout() {
                warn!("{}: unexpected outlet status '{}'", lamp, reply);
                return Ok(LampPower::Unknown);
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn refresh(&mut self, names: &[String]) -> DcbResult<()> {
        for name in names {
            let power = self.read_power(name).await?;
            self.lamps.send_modify(|records| {
                records.entry(name.clone()).or_default().observe(power);
            });
        }
        Ok(())
    }

    /// Switch lamps on one by one, rolling the whole batch back on failure.
    async fn switch_on_batch(&mut self, lamps: &[String], sink: &dyn CommandSink) -> DcbResult<()> {
        let mut switched: Vec<String> = Vec::with_capacity(lamps.len());

        for lamp in lamps {
            let outlet = self.outlet(lamp)?;
            sink.debug(&text_keyword(&format!(
                "actually switching on outlet for {lamp}"
            )));
            self.set_record(lamp, LampRecord::switched_on(Instant::now()));
            switched.push(lamp.clone());

            let confirmed = match self.command(&format!("sw o{outlet} on imme")).await {
                Ok(_) => {
                    let timeout = self.config.switch_on_timeout();
                    self.spin_until(lamp, LampPower::On, timeout, sink).await
                }
                Err(e) => Err(e),
            };
            let original = match confirmed {
                Ok(true) => continue,
                Ok(false) => None,
                Err(e) => Some(e),
            };

            let rolled_back = match self.switch_off_lamps(&switched, sink).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("rollback after {} failed: {}", lamp, e);
                    false
                }
            };
            warn!("{} did not switch on, batch rolled back: {}", lamp, rolled_back);

            return Err(match original {
                Some(e) => {
                    sink.warn(&text_keyword(&format!(
                        "all lamps switched back off: {rolled_back}"
                    )));
                    e
                }
                None => DcbError::LampSwitch {
                    lamp: lamp.clone(),
                    desired: LampPower::On.to_string(),
                    rolled_back,
                },
            });
        }
        Ok(())
    }

    /// Send every switch-off first, then confirm each outlet.
    async fn switch_off_lamps(&mut self, lamps: &[String], sink: &dyn CommandSink) -> DcbResult<()> {
        for lamp in lamps {
            let outlet = self.outlet(lamp)?;
            sink.debug(&text_keyword(&format!(
                "actually switching off outlet for {lamp}"
            )));
            self.command(&format!("sw o{outlet} off imme")).await?;
        }

        let timeout = self.config.switch_off_timeout();
        for lamp in lamps {
            sink.debug(&text_keyword(&format!("checking outlet for {lamp}")));
            if !self.spin_until(lamp, LampPower::Off, timeout, sink).await? {
                return Err(DcbError::LampSwitch {
                    lamp: lamp.clone(),
                    desired: LampPower::Off.to_string(),
                    rolled_back: false,
                });
            }
            self.set_record(lamp, LampRecord::switched_off());
        }
        debug!("switched off {:?}", lamps);
        Ok(())
    }

    async fn connect(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        self.driver.close().await?;
        self.driver.connect().await?;

        // Lamps found on keep no timestamp and report zero elapsed time.
        let names = self.lamp_names();
        if let Err(e) = self.refresh(&names).await {
            let _ = self.driver.close().await;
            return Err(e);
        }

        self.state.apply(Event::Connect)?;
        sink.inform(&text_keyword(&format!(
            "sources connected to {}",
            self.driver.describe()
        )));
        Ok(())
    }

    async fn disconnect(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        self.state.apply(Event::Disconnect)?;
        self.driver.close().await?;
        sink.inform(&text_keyword("sources disconnected"));
        Ok(())
    }

    async fn switch_on(&mut self, msg: SwitchOn) -> DcbResult<()> {
        let sink = msg.sink.as_ref();
        self.validate(&msg.lamps)?;
        if let Some(secs) = msg.warmup_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(DcbError::precondition(format!(
                    "warm-up time must be a non-negative number, got {secs}"
                )));
            }
        }

        let dwell = warmup_remaining(
            &self.config.lamps,
            &self.lamps.borrow(),
            &msg.lamps,
            msg.warmup_secs,
            msg.force,
            Instant::now(),
        );

        self.state.apply(Event::Start(Activity::Warming))?;
        let token = self.abort.arm();
        let result = self.drive_switch_on(&msg.lamps, dwell, &token, sink).await;
        let result = self.state.settle(result);

        let shown = if msg.lamps.is_empty() {
            self.lamp_names()
        } else {
            msg.lamps
        };
        self.emit_lamps(&shown, sink);
        result
    }

    async fn drive_switch_on(
        &mut self,
        lamps: &[String],
        dwell: Duration,
        token: &CancellationToken,
        sink: &dyn CommandSink,
    ) -> DcbResult<()> {
        let off: Vec<String> = {
            let records = self.lamps.borrow();
            lamps
                .iter()
                .filter(|name| !records.get(*name).is_some_and(LampRecord::is_on))
                .cloned()
                .collect()
        };
        self.switch_on_batch(&off, sink).await?;

        if !dwell.is_zero() {
            info!("warming up for {:.1}s", dwell.as_secs_f64());
            sink.inform(&text_keyword(&format!(
                "warming up for {:.1} seconds",
                dwell.as_secs_f64()
            )));
            wait_or_abort(dwell, token, "sources warmup").await?;
        }
        Ok(())
    }

    async fn switch_off(&mut self, lamps: Vec<String>, sink: &dyn CommandSink) -> DcbResult<()> {
        if lamps.is_empty() {
            return Err(DcbError::precondition("no lamp to switch off"));
        }
        self.validate(&lamps)?;

        self.state.apply(Event::Start(Activity::Switching))?;
        let result = self.switch_off_lamps(&lamps, sink).await;
        let result = self.state.settle(result);
        self.emit_lamps(&lamps, sink);
        result
    }

    fn prepare(&mut self, sequence: Vec<(String, f64)>, sink: &dyn CommandSink) -> DcbResult<()> {
        let names: Vec<String> = sequence.iter().map(|(name, _)| name.clone()).collect();
        self.validate(&names)?;

        let mut prepared = Vec::with_capacity(sequence.len());
        for (lamp, secs) in sequence {
            if prepared.iter().any(|(l, _): &(String, Duration)| *l == lamp) {
                return Err(DcbError::precondition(format!("{lamp} given twice")));
            }
            let on_for = Duration::try_from_secs_f64(secs).map_err(|_| {
                DcbError::precondition(format!("{lamp}: invalid on-time {secs}"))
            })?;
            prepared.push((lamp, on_for));
        }

        let summary = prepared
            .iter()
            .map(|(lamp, on_for)| format!("{lamp}={:.1}", on_for.as_secs_f64()))
            .collect::<Vec<_>>()
            .join(",");
        sink.inform(&text_keyword(&format!("illumination prepared: {summary}")));
        self.prepared = prepared;
        Ok(())
    }

    async fn go(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        if self.prepared.is_empty() {
            return Err(DcbError::precondition("no illumination sequence prepared"));
        }

        self.state.apply(Event::Start(Activity::Warming))?;
        let prepared = std::mem::take(&mut self.prepared);
        let token = self.abort.arm();
        let result = self.drive_sequence(&prepared, &token, sink).await;
        let result = self.state.settle(result);

        let names: Vec<String> = prepared.into_iter().map(|(lamp, _)| lamp).collect();
        self.emit_lamps(&names, sink);
        result
    }

    async fn drive_sequence(
        &mut self,
        prepared: &[(String, Duration)],
        token: &CancellationToken,
        sink: &dyn CommandSink,
    ) -> DcbResult<()> {
        let mut remaining: Vec<String> = prepared.iter().map(|(lamp, _)| lamp.clone()).collect();
        self.switch_on_batch(&remaining, sink).await?;

        for (dwell, group) in sequence_queue(prepared) {
            if let Err(e) = wait_or_abort(dwell, token, "illumination").await {
                sink.warn(&text_keyword(&format!(
                    "illumination aborted, switching off {}",
                    remaining.join(",")
                )));
                self.switch_off_lamps(&remaining, sink).await?;
                return Err(e);
            }
            self.switch_off_lamps(&group, sink).await?;
            remaining.retain(|lamp| !group.contains(lamp));
        }
        Ok(())
    }

    async fn status(&mut self, lamps: Vec<String>, sink: &dyn CommandSink) -> DcbResult<SourcesSnapshot> {
        self.validate(&lamps)?;
        let names = if lamps.is_empty() {
            self.lamp_names()
        } else {
            lamps
        };

        let state = self.state.current();
        sink.inform(&state.keyword(DeviceKind::Sources));
        sink.inform(&format!("sourcesMode={}", self.config.mode.as_str()));

        if state.lifecycle == Lifecycle::Online && state.hard_fault().is_none() {
            if let Err(e) = self.refresh(&names).await {
                warn!("sources status read failed: {}", e);
                sink.warn(&text_keyword(&format!("outlet read failed: {e}")));
            }
        }

        self.emit_lamps(&names, sink);
        Ok(SourcesSnapshot {
            state,
            lamps: self.lamp_statuses(&names),
        })
    }

    async fn shutdown(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        let state = self.state.current();
        if state.lifecycle != Lifecycle::Online {
            return Ok(());
        }

        let names = self.lamp_names();
        self.state.apply(Event::Start(Activity::Switching))?;
        let result = self.switch_off_lamps(&names, sink).await;
        let result = self.state.settle(result);
        self.emit_lamps(&names, sink);
        result
    }
}

impl Actor for Sources {
    type Args = Self;
    type Error = DcbError;

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(
            "sources actor starting ({} mode, {} lamps, {})",
            args.config.mode.as_str(),
            args.config.lamps.len(),
            args.driver.describe()
        );
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!("sources actor stopping");
        self.abort.cancel();
        if let Err(e) = self.driver.close().await {
            warn!("sources close failed: {}", e);
        }
        Ok(())
    }
}

// ============================================================================
// Kameo Message Types
// ============================================================================

/// Open the connection and read every outlet
pub struct Connect {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Connect> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.connect(msg.sink.as_ref()).await
    }
}

/// Close the connection
pub struct Disconnect {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Disconnect> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(
        &mut self,
        msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.disconnect(msg.sink.as_ref()).await
    }
}

/// Switch lamps on and wait out their warm-up
pub struct SwitchOn {
    /// Lamp names
    pub lamps: Vec<String>,
    /// Replaces the configured warm-up time
    pub warmup_secs: Option<f64>,
    /// Skip the warm-up entirely
    pub force: bool,
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<SwitchOn> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: SwitchOn, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.switch_on(msg).await
    }
}

/// Switch lamps off
pub struct SwitchOff {
    /// Lamp names
    pub lamps: Vec<String>,
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<SwitchOff> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(
        &mut self,
        msg: SwitchOff,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.switch_off(msg.lamps, msg.sink.as_ref()).await
    }
}

/// Record an illumination sequence: lamp name and on-time in seconds
pub struct Prepare {
    /// Lamps in command order with their on-times
    pub sequence: Vec<(String, f64)>,
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Prepare> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: Prepare, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.prepare(msg.sequence, msg.sink.as_ref())
    }
}

/// Run the prepared illumination sequence
pub struct Go {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Go> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: Go, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.go(msg.sink.as_ref()).await
    }
}

/// Poll outlets and report lamp keywords; empty means every lamp
pub struct Status {
    /// Lamp names
    pub lamps: Vec<String>,
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Status> for Sources {
    type Reply = DcbResult<SourcesSnapshot>;

    async fn handle(&mut self, msg: Status, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.status(msg.lamps, msg.sink.as_ref()).await
    }
}

/// Switch every lamp off
pub struct Shutdown {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Shutdown> for Sources {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: Shutdown, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.shutdown(msg.sink.as_ref()).await
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Client side of a running lamp bank actor.
#[derive(Clone)]
pub struct SourcesHandle {
    actor: ActorRef<Sources>,
    state: watch::Receiver<DeviceState>,
    lamps: watch::Receiver<LampRecords>,
    abort: AbortSlot,
}

impl SourcesHandle {
    /// Spawn the actor. The PDU is not contacted until [`connect`](Self::connect).
    pub fn spawn(config: SourcesConfig, transport: Box<dyn LineTransport>) -> Self {
        let actor = Sources::new(config, transport);
        let state = actor.state.subscribe();
        let lamps = actor.lamps.subscribe();
        let abort = actor.abort.clone();
        Self {
            actor: Sources::spawn(actor),
            state,
            lamps,
            abort,
        }
    }

    /// Open the connection; see [`Connect`].
    pub async fn connect(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(Connect { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Close the connection.
    pub async fn disconnect(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(Disconnect { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Switch lamps on; returns once the warm-up has elapsed or was aborted.
    pub async fn switch_on(
        &self,
        lamps: Vec<String>,
        warmup_secs: Option<f64>,
        force: bool,
        sink: Arc<dyn CommandSink>,
    ) -> DcbResult<()> {
        self.actor
            .ask(SwitchOn {
                lamps,
                warmup_secs,
                force,
                sink,
            })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Switch `lamps` off.
    pub async fn switch_off(&self, lamps: Vec<String>, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(SwitchOff { lamps, sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Store an illumination sequence for [`Self::go`].
    pub async fn prepare(
        &self,
        sequence: Vec<(String, f64)>,
        sink: Arc<dyn CommandSink>,
    ) -> DcbResult<()> {
        self.actor
            .ask(Prepare { sequence, sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Run the prepared sequence.
    pub async fn go(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(Go { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Poll outlets and report lamp keywords.
    pub async fn status(
        &self,
        lamps: Vec<String>,
        sink: Arc<dyn CommandSink>,
    ) -> DcbResult<SourcesSnapshot> {
        self.actor
            .ask(Status { lamps, sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Cut short a running warm-up or illumination sequence.
    ///
    /// Returns immediately; the operation being aborted reports
    /// [`DcbError::UserAborted`] to its own caller. Lamps stay as they are.
    pub fn abort(&self) {
        info!("sources abort requested");
        self.abort.cancel();
    }

    /// Abort, then switch every lamp off.
    pub async fn shutdown(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.abort();
        self.actor
            .ask(Shutdown { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::Sources, e))
    }

    /// Current FSM state.
    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    /// FSM state and in-memory lamp records, without waiting on the mailbox.
    pub fn snapshot(&self) -> SourcesSnapshot {
        let now = Instant::now();
        let lamps = self
            .lamps
            .borrow()
            .iter()
            .map(|(name, record)| LampStatus::from_record(name, record, now))
            .collect();
        SourcesSnapshot {
            state: self.state(),
            lamps,
        }
    }

    /// Underlying actor reference.
    pub fn actor_ref(&self) -> &ActorRef<Sources> {
        &self.actor
    }

    /// Stop the actor and wait for it to release the transport.
    pub async fn stop(&self) {
        self.abort.cancel();
        self.actor.kill();
        self.actor.wait_for_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lamps() -> BTreeMap<String, LampConfig> {
        SourcesConfig::default().lamps
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_warmup_is_longest_requested() {
        let records = LampRecords::new();
        let now = Instant::now();
        let dwell = warmup_remaining(&lamps(), &records, &names(&["neon", "halogen"]), None, false, now);
        assert_eq!(dwell, Duration::from_secs(60));
    }

    #[test]
    fn test_override_and_force() {
        let records = LampRecords::new();
        let now = Instant::now();
        let requested = names(&["neon"]);
        assert_eq!(
            warmup_remaining(&lamps(), &records, &requested, Some(3.5), false, now),
            Duration::from_millis(3500)
        );
        assert_eq!(
            warmup_remaining(&lamps(), &records, &requested, Some(3.5), true, now),
            Duration::ZERO
        );
    }

    #[test]
    fn test_elapsed_time_is_deducted() {
        let now = Instant::now();
        let mut records = LampRecords::new();
        records.insert(
            "argon".to_string(),
            LampRecord::switched_on(now - Duration::from_secs(10)),
        );
        let dwell = warmup_remaining(&lamps(), &records, &names(&["argon"]), None, false, now);
        assert_eq!(dwell, Duration::from_secs(5));

        // Already warm: floored at zero.
        records.insert(
            "argon".to_string(),
            LampRecord::switched_on(now - Duration::from_secs(100)),
        );
        let dwell = warmup_remaining(&lamps(), &records, &names(&["argon"]), None, false, now);
        assert_eq!(dwell, Duration::ZERO);
    }

    #[test]
    fn test_no_request_warms_lamps_already_on() {
        let now = Instant::now();
        let mut records = LampRecords::new();
        records.insert(
            "krypton".to_string(),
            LampRecord::switched_on(now - Duration::from_secs(4)),
        );
        records.insert("hgar".to_string(), LampRecord::switched_off());

        let dwell = warmup_remaining(&lamps(), &records, &[], Some(10.0), false, now);
        assert_eq!(dwell, Duration::from_secs(6));
        // No override and nothing requested: nothing to wait for.
        assert_eq!(
            warmup_remaining(&lamps(), &records, &[], None, false, now),
            Duration::ZERO
        );
    }

    #[test]
    fn test_sequence_queue_groups_and_orders() {
        let prepared = vec![
            ("neon".to_string(), Duration::from_secs(30)),
            ("argon".to_string(), Duration::from_secs(10)),
            ("hgar".to_string(), Duration::from_secs(30)),
        ];
        let queue: Vec<_> = sequence_queue(&prepared).into_iter().collect();
        assert_eq!(
            queue,
            vec![
                (Duration::from_secs(10), names(&["argon"])),
                (Duration::from_secs(20), names(&["neon", "hgar"])),
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_slot_reaches_armed_token() {
        let slot = AbortSlot::default();
        let token = slot.arm();
        let handle = slot.clone();

        let waiter = tokio::spawn(async move {
            wait_or_abort(Duration::from_secs(30), &token, "sources warmup").await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DcbError::UserAborted(_))));
    }
}
