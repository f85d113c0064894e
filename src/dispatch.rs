//! Text command dispatcher
//!
//! Parses one command line, runs it against the controllers and closes the
//! reply with `finish` or `fail` on the sink. Arguments are bare words or
//! `key=value` pairs, lists are comma separated:
//!
//! ```text
//! ping
//! status [all]
//! monitor controllers=<controller,...> period=<s>
//! filterwheel status|connect|disconnect|zero
//! filterwheel init [linewheel|qthwheel]
//! filterwheel move <wheel> <slot|hole>
//! sources status [lamp ...]
//! sources connect|disconnect|abort|go|stop
//! sources on=<lamp,...> [warmingTime=<s>] [force]
//! sources off=<lamp,...>
//! sources prepare <lamp>=<s> ...
//! declareMasks [install=<mask>] [collIds=<id,...>] [coll<N>=<mask> ...]
//! declareBundles [install=<color,...>] [collIds=<id,...>] [coll<N>=<color> ...]
//! config fibers=<color,...>
//! ```

use crate::actors::{FilterWheelHandle, MoveTarget, SourcesHandle};
use crate::collimators::{Collimators, COLLIMATOR_COUNT};
use crate::error::{DcbError, DcbResult};
use crate::fsm::DeviceKind;
use crate::monitor::Monitors;
use crate::sink::{text_keyword, CommandSink};
use crate::status::Wheel;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Controllers that can be named in `monitor`.
pub const CONTROLLERS: [&str; 2] = ["filterwheel", "sources"];

/// Arguments after the command verb.
#[derive(Debug, Default, PartialEq)]
struct Args {
    words: Vec<String>,
    /// `key=value` pairs in command order, repeats included.
    pairs: Vec<(String, String)>,
}

impl Args {
    fn parse<'a>(tokens: impl Iterator<Item = &'a str>) -> Self {
        let mut args = Args::default();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) => args.pairs.push((key.to_string(), value.to_string())),
                None => args.words.push(token.to_string()),
            }
        }
        args
    }

    /// Value of `key`; the last one wins when it is repeated.
    fn get(&self, key: &str) -> Option<&String> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|value| split_list(value))
    }

    fn flag(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> DcbResult<T> {
    value
        .parse()
        .map_err(|_| DcbError::precondition(format!("{key}: not a number: {value}")))
}

/// A parsed command.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Liveness check
    Ping,
    /// Actor status; `all` also runs every controller's full status
    Status {
        /// Query the devices as well
        all: bool,
    },
    /// Start, retime or stop periodic status of some controllers
    Monitor {
        /// Controller names as given, known or not
        controllers: Vec<String>,
        /// Seconds between polls, 0 stops
        period: u64,
    },
    /// Filter-wheel status with live ADC readings
    FilterwheelStatus,
    /// Open the filter-wheel connection
    FilterwheelConnect,
    /// Close the filter-wheel connection
    FilterwheelDisconnect,
    /// Calibrate the listed wheels in order
    FilterwheelInit(Vec<Wheel>),
    /// Move one wheel
    FilterwheelMove {
        /// Wheel to move
        wheel: Wheel,
        /// Slot or hole label
        target: MoveTarget,
    },
    /// Zero the ADC offsets
    FilterwheelZero,
    /// Lamp status; empty means every lamp
    SourcesStatus(Vec<String>),
    /// Open the PDU connection
    SourcesConnect,
    /// Close the PDU connection
    SourcesDisconnect,
    /// Switch lamps on and warm them up
    SourcesOn {
        /// Lamps to switch on
        lamps: Vec<String>,
        /// Warm-up override, seconds
        warmup_secs: Option<f64>,
        /// Warm up again even if already warm
        force: bool,
    },
    /// Switch lamps off
    SourcesOff(Vec<String>),
    /// Cut a running warm-up or illumination short
    SourcesAbort,
    /// Store an illumination sequence, lamp and seconds
    SourcesPrepare(Vec<(String, f64)>),
    /// Run the prepared sequence
    SourcesGo,
    /// Switch every lamp off
    SourcesStop,
    /// Collimator id and mask
    DeclareMasks(Vec<(u8, String)>),
    /// Collimator id and fiber bundle color
    DeclareBundles {
        /// Assignments to apply
        updates: Vec<(u8, String)>,
        /// Clear unnamed collimators first
        reset: bool,
    },
}

impl Command {
    /// Parse one command line.
    pub fn parse(line: &str) -> DcbResult<Self> {
        let mut tokens = line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| DcbError::precondition("empty command"))?;

        match verb {
            "ping" => Ok(Command::Ping),
            "status" => {
                let args = Args::parse(tokens);
                Ok(Command::Status {
                    all: args.flag("all"),
                })
            }
            "monitor" => Self::parse_monitor(Args::parse(tokens)),
            "filterwheel" => Self::parse_filterwheel(tokens),
            "sources" => Self::parse_sources(tokens),
            "declareMasks" => Self::parse_masks(Args::parse(tokens)),
            "declareBundles" => Self::parse_bundles(Args::parse(tokens)),
            "config" => {
                let args = Args::parse(tokens);
                let fibers = args
                    .list("fibers")
                    .ok_or_else(|| DcbError::precondition("config: fibers=<color,...> required"))?;
                Ok(Command::DeclareBundles {
                    updates: numbered(fibers)?,
                    reset: true,
                })
            }
            other => Err(DcbError::precondition(format!("unknown command: {other}"))),
        }
    }

    fn parse_monitor(args: Args) -> DcbResult<Self> {
        let controllers = args
            .list("controllers")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DcbError::precondition("monitor: controllers=<controller,...> required"))?;
        let period = args
            .get("period")
            .ok_or_else(|| DcbError::precondition("monitor: period=<seconds> required"))?;
        Ok(Command::Monitor {
            controllers,
            period: parse_number("period", period)?,
        })
    }

    fn parse_filterwheel<'a>(mut tokens: impl Iterator<Item = &'a str>) -> DcbResult<Self> {
        match tokens.next() {
            Some("status") | None => Ok(Command::FilterwheelStatus),
            Some("connect") => Ok(Command::FilterwheelConnect),
            Some("disconnect") => Ok(Command::FilterwheelDisconnect),
            Some("zero") => Ok(Command::FilterwheelZero),
            Some("init") => match tokens.next() {
                Some(wheel) => Ok(Command::FilterwheelInit(vec![wheel.parse()?])),
                None => Ok(Command::FilterwheelInit(Wheel::ALL.to_vec())),
            },
            Some("move") => {
                let wheel = tokens
                    .next()
                    .ok_or_else(|| DcbError::precondition("move: wheel required"))?
                    .parse()?;
                let target = tokens
                    .next()
                    .ok_or_else(|| DcbError::precondition("move: position required"))?;
                let target = target
                    .parse::<MoveTarget>()
                    .unwrap_or_else(|never| match never {});
                Ok(Command::FilterwheelMove { wheel, target })
            }
            Some(other) => Err(DcbError::precondition(format!(
                "unknown filterwheel command: {other}"
            ))),
        }
    }

    fn parse_sources<'a>(tokens: impl Iterator<Item = &'a str>) -> DcbResult<Self> {
        let args = Args::parse(tokens);
        let verb = args.words.first().map(String::as_str);

        match verb {
            Some("status") => Ok(Command::SourcesStatus(args.words[1..].to_vec())),
            Some("connect") => Ok(Command::SourcesConnect),
            Some("disconnect") => Ok(Command::SourcesDisconnect),
            Some("abort") => Ok(Command::SourcesAbort),
            Some("go") => Ok(Command::SourcesGo),
            Some("stop") => Ok(Command::SourcesStop),
            Some("prepare") => {
                let mut sequence = Vec::with_capacity(args.pairs.len());
                for (lamp, secs) in &args.pairs {
                    sequence.push((lamp.clone(), parse_number(lamp, secs)?));
                }
                if sequence.is_empty() {
                    return Err(DcbError::precondition("prepare: <lamp>=<seconds> required"));
                }
                Ok(Command::SourcesPrepare(sequence))
            }
            Some(other) if other != "force" => Err(DcbError::precondition(format!(
                "unknown sources command: {other}"
            ))),
            _ => {
                if let Some(lamps) = args.list("off") {
                    return Ok(Command::SourcesOff(lamps));
                }
                let warmup_secs = args
                    .get("warmingTime")
                    .map(|v| parse_number("warmingTime", v))
                    .transpose()?;
                Ok(Command::SourcesOn {
                    lamps: args.list("on").unwrap_or_default(),
                    warmup_secs,
                    force: args.flag("force"),
                })
            }
        }
    }

    fn parse_masks(args: Args) -> DcbResult<Self> {
        let mut updates = Vec::new();
        if let Some(mask) = args.get("install") {
            for id in collimator_ids(&args)? {
                updates.push((id, mask.clone()));
            }
        }
        updates.extend(per_collimator(&args)?);
        Ok(Command::DeclareMasks(updates))
    }

    fn parse_bundles(args: Args) -> DcbResult<Self> {
        let mut updates = Vec::new();
        if let Some(install) = args.list("install") {
            match args.list("collIds") {
                Some(_) => {
                    let ids = collimator_ids(&args)?;
                    if ids.len() != install.len() {
                        return Err(DcbError::precondition(
                            "install and collIds must have the same length",
                        ));
                    }
                    updates.extend(ids.into_iter().zip(install));
                }
                None => updates.extend(numbered(install)?),
            }
        }
        updates.extend(per_collimator(&args)?);
        Ok(Command::DeclareBundles {
            updates,
            reset: false,
        })
    }
}

/// `collIds=` ids, or every collimator.
fn collimator_ids(args: &Args) -> DcbResult<Vec<u8>> {
    match args.list("collIds") {
        Some(ids) => ids.iter().map(|id| parse_number("collIds", id)).collect(),
        None => Ok((1..=COLLIMATOR_COUNT as u8).collect()),
    }
}

/// `coll<N>=<value>` pairs.
fn per_collimator(args: &Args) -> DcbResult<Vec<(u8, String)>> {
    let mut updates = Vec::new();
    for (key, value) in &args.pairs {
        if let Some(id) = key.strip_prefix("coll").filter(|id| !id.is_empty() && *key != "collIds") {
            updates.push((parse_number(key, id)?, value.clone()));
        }
    }
    Ok(updates)
}

/// Values assigned to collimators 1, 2, ... in order.
fn numbered(values: Vec<String>) -> DcbResult<Vec<(u8, String)>> {
    if values.len() > COLLIMATOR_COUNT {
        return Err(DcbError::precondition(format!(
            "at most {COLLIMATOR_COUNT} bundles"
        )));
    }
    Ok((1u8..).zip(values).collect())
}

/// Routes parsed commands to the controllers.
#[derive(Clone)]
pub struct Dispatcher {
    filterwheel: FilterWheelHandle,
    sources: SourcesHandle,
    collimators: Collimators,
    monitors: Monitors,
}

impl Dispatcher {
    /// Dispatcher over the two controllers and the collimator records.
    pub fn new(
        filterwheel: FilterWheelHandle,
        sources: SourcesHandle,
        collimators: Collimators,
    ) -> Self {
        Self {
            filterwheel,
            sources,
            collimators,
            monitors: Monitors::new(),
        }
    }

    /// Filter-wheel controller handle.
    pub fn filterwheel(&self) -> &FilterWheelHandle {
        &self.filterwheel
    }

    /// Lamp controller handle.
    pub fn sources(&self) -> &SourcesHandle {
        &self.sources
    }

    /// Running status monitors.
    pub fn monitors(&self) -> &Monitors {
        &self.monitors
    }

    /// Set the status monitor of each named controller.
    ///
    /// Unknown names are warned about and skipped. Polls report on `sink`.
    fn monitor(
        &self,
        controllers: &[String],
        period: u64,
        sink: &Arc<dyn CommandSink>,
    ) -> DcbResult<()> {
        let period = Duration::from_secs(period);
        let mut found = false;
        for name in controllers {
            match name.as_str() {
                "filterwheel" => {
                    let wheel = self.filterwheel.clone();
                    let sink = Arc::clone(sink);
                    self.monitors.set(name, period, move || {
                        let wheel = wheel.clone();
                        let sink = Arc::clone(&sink);
                        async move {
                            if let Err(e) = wheel.status(sink).await {
                                warn!("filterwheel monitor: {}", e);
                            }
                        }
                    });
                }
                "sources" => {
                    let sources = self.sources.clone();
                    let sink = Arc::clone(sink);
                    self.monitors.set(name, period, move || {
                        let sources = sources.clone();
                        let sink = Arc::clone(&sink);
                        async move {
                            if let Err(e) = sources.status(Vec::new(), sink).await {
                                warn!("sources monitor: {}", e);
                            }
                        }
                    });
                }
                other => {
                    sink.warn(&text_keyword(&format!(
                        "not starting monitor for {other}: unknown controller"
                    )));
                    continue;
                }
            }
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(DcbError::precondition("no controllers found"))
        }
    }

    /// Parse and run one command line, closing the reply on `sink`.
    pub async fn dispatch(&self, line: &str, sink: Arc<dyn CommandSink>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        info!("command: {}", line);

        let outcome = match Command::parse(line) {
            Ok(command) => self.execute(command, Arc::clone(&sink)).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(text) => sink.finish(&text),
            Err(e) => {
                warn!("'{}' failed: {}", line, e);
                sink.fail(&text_keyword(&e.to_string()));
            }
        }
    }

    /// Run a command; the returned text closes the reply.
    pub async fn execute(&self, command: Command, sink: Arc<dyn CommandSink>) -> DcbResult<String> {
        match command {
            Command::Ping => Ok(text_keyword("Present and (probably) well")),
            Command::Status { all } => {
                sink.inform(&text_keyword("Present!"));
                sink.inform(&self.monitors.keyword());
                if all {
                    self.filterwheel.status(Arc::clone(&sink)).await?;
                    self.sources.status(Vec::new(), Arc::clone(&sink)).await?;
                } else {
                    sink.inform(&self.filterwheel.state().keyword(DeviceKind::FilterWheel));
                    sink.inform(&self.sources.state().keyword(DeviceKind::Sources));
                }
                self.collimators.emit(sink.as_ref()).await;
                Ok(format!("controllers={}", CONTROLLERS.join(",")))
            }
            Command::Monitor {
                controllers,
                period,
            } => {
                self.monitor(&controllers, period, &sink)?;
                Ok(String::new())
            }
            Command::FilterwheelStatus => {
                self.filterwheel.status(sink).await?;
                Ok(String::new())
            }
            Command::FilterwheelConnect => {
                self.filterwheel.connect(sink).await?;
                Ok(String::new())
            }
            Command::FilterwheelDisconnect => {
                self.filterwheel.disconnect(sink).await?;
                Ok(String::new())
            }
            Command::FilterwheelInit(wheels) => {
                for wheel in wheels {
                    self.filterwheel.initialize(wheel, Arc::clone(&sink)).await?;
                }
                Ok(String::new())
            }
            Command::FilterwheelMove { wheel, target } => {
                let status = self.filterwheel.move_to(wheel, target, sink).await?;
                Ok(status.keyword())
            }
            Command::FilterwheelZero => {
                self.filterwheel.zero_adc(sink).await?;
                Ok(text_keyword("ADC offsets calibrated"))
            }
            Command::SourcesStatus(lamps) => {
                self.sources.status(lamps, sink).await?;
                Ok(String::new())
            }
            Command::SourcesConnect => {
                self.sources.connect(sink).await?;
                Ok(String::new())
            }
            Command::SourcesDisconnect => {
                self.sources.disconnect(sink).await?;
                Ok(String::new())
            }
            Command::SourcesOn {
                lamps,
                warmup_secs,
                force,
            } => {
                self.sources.switch_on(lamps, warmup_secs, force, sink).await?;
                Ok(String::new())
            }
            Command::SourcesOff(lamps) => {
                self.sources.switch_off(lamps, sink).await?;
                Ok(String::new())
            }
            Command::SourcesAbort => {
                self.sources.abort();
                Ok(text_keyword("warmup aborted"))
            }
            Command::SourcesPrepare(sequence) => {
                self.sources.prepare(sequence, sink).await?;
                Ok(String::new())
            }
            Command::SourcesGo => {
                self.sources.go(sink).await?;
                Ok(String::new())
            }
            Command::SourcesStop => {
                self.sources.shutdown(sink).await?;
                Ok(String::new())
            }
            Command::DeclareMasks(updates) => {
                self.collimators.declare_masks(&updates).await?;
                self.collimators.emit_config_date(sink.as_ref());
                self.collimators.emit(sink.as_ref()).await;
                Ok(String::new())
            }
            Command::DeclareBundles { updates, reset } => {
                self.collimators.declare_bundles(&updates, reset).await?;
                self.collimators.emit_config_date(sink.as_ref());
                self.collimators.emit(sink.as_ref()).await;
                Ok(String::new())
            }
        }
    }
}
