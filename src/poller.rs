use crate::prelude::*;

use crate::error::{SolarMaxError, SolarMaxResult};
use crate::solarmax::{InverterInfo, NormalizedValue, QueryField, Session, Values};

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;

/// Fields read from every inverter each cycle, in one request.
pub const TELEMETRY_FIELDS: &[QueryField] = &[
    QueryField::PAC,
    QueryField::TKK,
    QueryField::KDY,
    QueryField::KT0,
    QueryField::IDC,
    QueryField::UDC,
    QueryField::IL1,
    QueryField::UL1,
    QueryField::FDAT,
    QueryField::SYS,
];

/// One published production sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// unix seconds
    pub time: i64,
    #[serde(rename = "inv")]
    pub inverter: u8,
    #[serde(rename = "ivmax")]
    pub installed_power: f64,
    #[serde(rename = "tmpr")]
    pub temperature: f64,
    /// UL1 x IL1, W
    pub pac: f64,
    /// pac relative to installed power, %
    pub eac: i64,
    /// UDC x IDC, W
    pub pdc: f64,
    /// pac relative to pdc, %
    pub edc: i64,
    /// kWh today
    pub qdy: f64,
    /// kWh total
    pub qt0: f64,
    /// SYS status code
    pub stat: Option<u64>,

    #[serde(skip)]
    pub model: &'static str,
    #[serde(skip)]
    pub status: String,
    #[serde(skip)]
    pub alarms: Vec<String>,
    /// PAC as the inverter reports it, W
    #[serde(skip)]
    pub reported_pac: f64,
    #[serde(skip)]
    pub ac_voltage: f64,
    #[serde(skip)]
    pub ac_current: f64,
    #[serde(skip)]
    pub dc_voltage: f64,
    #[serde(skip)]
    pub dc_current: f64,
    /// FDAT, the date the total energy counts from
    #[serde(skip)]
    pub since: NaiveDateTime,
}

impl Reading {
    pub fn new(address: u8, info: &InverterInfo, values: &Values) -> SolarMaxResult<Self> {
        use QueryField::*;

        let get = |field: QueryField| {
            values
                .get(&field)
                .and_then(NormalizedValue::as_f64)
                .ok_or(SolarMaxError::MissingField { address, field })
        };

        let since = values
            .get(&FDAT)
            .and_then(NormalizedValue::as_timestamp)
            .ok_or(SolarMaxError::MissingField {
                address,
                field: FDAT,
            })?;

        let (ac_voltage, ac_current) = (get(UL1)?, get(IL1)?);
        let (dc_voltage, dc_current) = (get(UDC)?, get(IDC)?);
        let pac = ac_voltage * ac_current;
        let pdc = dc_voltage * dc_current;

        Ok(Self {
            time: chrono::Utc::now().timestamp(),
            inverter: address,
            installed_power: info.installed_power,
            temperature: get(TKK)?,
            pac: round1(pac),
            eac: percent(pac, info.installed_power),
            pdc: round1(pdc),
            edc: percent(pac, pdc),
            qdy: get(KDY)?,
            qt0: get(KT0)?,
            stat: None,
            model: info.description(),
            status: String::new(),
            alarms: Vec::new(),
            reported_pac: get(PAC)?,
            ac_voltage,
            ac_current,
            dc_voltage,
            dc_current,
            since,
        })
    }

    pub fn log(&self) {
        debug!(
            "inverter {} ({}): {}, {} °C, DC {} V {} A, AC {} V {} A",
            self.inverter,
            self.model,
            self.status,
            self.temperature,
            self.dc_voltage,
            self.dc_current,
            self.ac_voltage,
            self.ac_current
        );
        debug!(
            "inverter {}: AC {:.1} W reported, {:.1} W computed ({}% of {} W); DC {:.1} W ({}%)",
            self.inverter,
            self.reported_pac,
            self.pac,
            self.eac,
            self.installed_power,
            self.pdc,
            self.edc
        );
        debug!(
            "inverter {}: {:.1} kWh today, {:.1} kWh since {}",
            self.inverter,
            self.qdy,
            self.qt0,
            self.since.date()
        );
    }

    pub fn to_message(&self) -> Result<mqtt::Message> {
        Ok(mqtt::Message {
            topic: "production".to_string(),
            retain: false,
            payload: serde_json::to_string(self)?,
        })
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// trunc(n / d * 100), 0 when there is nothing to divide by.
fn percent(n: f64, d: f64) -> i64 {
    if d == 0.0 {
        0
    } else {
        (n / d * 100.0).trunc() as i64
    }
}

/// Outcome of one pass over every gateway.
#[derive(Debug, Default)]
pub struct Cycle {
    /// Readings clean enough to publish, before the `publish: last` filter.
    pub readings: Vec<Reading>,
    /// Inverters that answered the telemetry query.
    pub answered: usize,
    pub expected: usize,
}

impl Cycle {
    pub fn shortfall(&self) -> Option<SolarMaxError> {
        (self.answered < self.expected).then_some(SolarMaxError::CommunicationShortfall {
            read: self.answered,
            expected: self.expected,
        })
    }
}

pub struct Poller {
    config: ConfigWrapper,
    channels: Channels,
    sessions: Vec<Session>,
    commands: broadcast::Receiver<mqtt::ChannelData>,
    shutdown: Option<broadcast::Receiver<()>>,
    stopped: bool,
}

impl Poller {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        let sessions = config.enabled_gateways().iter().map(Session::new).collect();
        let commands = channels.from_mqtt.subscribe();

        Self {
            config,
            channels,
            sessions,
            commands,
            shutdown: None,
            stopped: false,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub async fn start(&mut self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.shutdown = Some(shutdown);
        info!(
            "poller started: {} gateway(s), every {:?}",
            self.sessions.len(),
            self.config.poller().interval()
        );

        for (session, gateway) in self.sessions.iter_mut().zip(self.config.enabled_gateways()) {
            if let Err(e) = session.use_inverters(gateway.inverters().to_vec()).await {
                warn!("{}", e);
            }
        }

        while !self.stopped {
            if let Err(e) = self.run_cycle().await {
                error!("{}", e);
            }
            self.wait().await;
        }

        for session in &mut self.sessions {
            session.close().await;
        }

        info!("poller exiting");
        Ok(())
    }

    /// Sleeps one interval. Returns early, and marks the poller stopped, if
    /// shutdown fires meanwhile.
    async fn wait(&mut self) {
        let interval = self.config.poller().interval();

        match self.shutdown.as_mut() {
            Some(shutdown) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv() => {
                        info!("poller received shutdown signal");
                        self.stopped = true;
                    }
                }
            }
            None => tokio::time::sleep(interval).await,
        }
    }

    /// One pass over every gateway. A shortfall is logged once, at the end,
    /// and does not hold back the readings that did come in.
    pub async fn run_cycle(&mut self) -> Result<Cycle> {
        self.apply_commands().await;

        let mut cycle = Cycle {
            expected: self.config.total_inverters(),
            ..Cycle::default()
        };

        for i in 0..self.sessions.len() {
            let inverters: Vec<(u8, InverterInfo)> = self.sessions[i]
                .inverters()
                .await
                .iter()
                .map(|(address, info)| (address, *info))
                .collect();

            for (address, info) in inverters {
                if self.stopped {
                    return Ok(cycle);
                }

                let values = match self.sessions[i].query(address, TELEMETRY_FIELDS).await {
                    Ok(Some((_, values))) => values,
                    Ok(None) => {
                        info!("communication error with inverter {}, maybe switched off", address);
                        self.wait().await;
                        continue;
                    }
                    Err(e) => {
                        info!("communication error with inverter {}: {}", address, e);
                        self.wait().await;
                        continue;
                    }
                };
                cycle.answered += 1;

                let mut reading = match Reading::new(address, &info, &values) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("inverter {}: {}", address, e);
                        continue;
                    }
                };

                match self.sessions[i].status(address).await {
                    Ok(report) if report.has_alarms() => {
                        error!("inverter {}: {} ({})", address, report.status, report.alarms.join(", "));
                        continue;
                    }
                    Ok(report) => {
                        reading.stat = report.code;
                        reading.status = report.status;
                        reading.alarms = report.alarms;
                    }
                    Err(e) => {
                        warn!("inverter {}: status unavailable: {}", address, e);
                        continue;
                    }
                }

                reading.log();
                cycle.readings.push(reading);
            }
        }

        if let Some(shortfall) = cycle.shortfall() {
            error!("{}", shortfall);
        }

        self.publish_readings(&cycle.readings)?;

        Ok(cycle)
    }

    fn publish_readings(&self, readings: &[Reading]) -> Result<()> {
        let selected: Vec<&Reading> = match self.config.poller().publish() {
            config::PublishMode::All => readings.iter().collect(),
            config::PublishMode::Last => readings.last().into_iter().collect(),
        };

        for reading in selected {
            self.publish(reading.to_message()?);
        }

        Ok(())
    }

    fn publish(&self, message: mqtt::Message) {
        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            debug!("send(to_mqtt) failed - no mqtt listener");
        }
    }

    // commands {{{
    async fn apply_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(mqtt::ChannelData::Message(message)) => self.apply(message).await,
                Ok(mqtt::ChannelData::Shutdown) => {}
                Err(TryRecvError::Lagged(n)) => warn!("{} commands dropped", n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn apply(&mut self, message: mqtt::Message) {
        let command = match message.to_command() {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        let payload = match self.execute(&command).await {
            Ok(()) => "OK",
            Err(e) => {
                error!("{:?} failed: {}", command, e);
                "FAIL"
            }
        };

        self.publish(mqtt::Message {
            topic: command.to_result_topic(),
            retain: false,
            payload: payload.to_string(),
        });
    }

    async fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::WriteSetting(inverter, values) => {
                let session = self
                    .sessions
                    .iter_mut()
                    .find(|s| s.registry().contains_expected(*inverter))
                    .ok_or_else(|| anyhow!("no gateway serves inverter {}", inverter))?;

                if !session.is_connected() {
                    session.connect().await?;
                }

                match session.write_setting(*inverter, values).await? {
                    Some(_) => Ok(()),
                    None => bail!("inverter {} did not acknowledge", inverter),
                }
            }
        }
    } // }}}
}
