use crate::prelude::*;

use crate::error::{SolarMaxError, SolarMaxResult};
use crate::solarmax::field::QueryField;
use crate::solarmax::frame::{self, FrameDecoder, READ_KIND};
use crate::solarmax::model::{AlarmString, InverterType, StatusString};
use crate::solarmax::normalize::{normalize_all, Values};
use crate::solarmax::registry::{InverterInfo, InverterRegistry};

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
    tokio::time::timeout,
    tokio_util::codec::Decoder,
};

const TCP_KEEPALIVE_SECS: u64 = 60;
const RX_BUFFER_SIZE: usize = 256;

const DETECTION_FIELDS: &[QueryField] = &[QueryField::ADR, QueryField::TYP, QueryField::PIN];
const STATUS_FIELDS: &[QueryField] = &[QueryField::SYS, QueryField::SAL];

/// Source address and normalized fields of one answer.
pub type QueryResult = (u8, Values);

// Lifecycle {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    DetectingInverters,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    LinkUp,
    /// connect attempt failed
    LinkFailed,
    /// we closed the socket ourselves
    LinkClosed,
    /// write failed or the peer hung up
    LinkLost,
    DeviceSilent,
    DetectionStarted,
    DetectionFinished { complete: bool, link_up: bool },
}

/// Connection state plus the all-inverters-found flag. Only `next` moves
/// it; a detection pass keeps the state at `DetectingInverters` while the
/// link underneath comes and goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifecycle {
    state: SessionState,
    all_inverters_found: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            all_inverters_found: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn all_inverters_found(&self) -> bool {
        self.all_inverters_found
    }

    pub fn is_detecting(&self) -> bool {
        self.state == SessionState::DetectingInverters
    }

    pub fn next(self, event: Event) -> Self {
        use SessionState::*;

        let unless_detecting = |state| if self.is_detecting() { DetectingInverters } else { state };

        match event {
            Event::LinkUp => Self {
                state: unless_detecting(Connected),
                ..self
            },
            Event::LinkClosed => Self {
                state: unless_detecting(Disconnected),
                ..self
            },
            Event::LinkFailed | Event::LinkLost => Self {
                state: unless_detecting(Disconnected),
                all_inverters_found: false,
            },
            Event::DeviceSilent => Self {
                all_inverters_found: false,
                ..self
            },
            Event::DetectionStarted => Self {
                state: DetectingInverters,
                ..self
            },
            Event::DetectionFinished { complete, link_up } => Self {
                state: if link_up { Connected } else { Disconnected },
                all_inverters_found: complete,
            },
        }
    }
} // }}}

// StatusReport {{{
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub status: String,
    /// raw SYS code, absent when the inverter did not answer
    pub code: Option<u64>,
    pub alarms: Vec<String>,
}

impl StatusReport {
    pub fn offline() -> Self {
        Self {
            status: "Offline".to_string(),
            code: None,
            alarms: vec!["Offline".to_string()],
        }
    }

    pub fn has_alarms(&self) -> bool {
        !self.alarms.is_empty()
    }
} // }}}

/// One TCP line to one gateway, and everything learned through it.
pub struct Session {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    use_tcp_nodelay: bool,
    stream: Option<TcpStream>,
    lifecycle: Lifecycle,
    registry: InverterRegistry,
}

impl Session {
    pub fn new(gateway: &config::Gateway) -> Self {
        Self {
            host: gateway.host().to_owned(),
            port: gateway.port(),
            connect_timeout: gateway.connect_timeout(),
            io_timeout: gateway.read_timeout(),
            use_tcp_nodelay: gateway.use_tcp_nodelay(),
            stream: None,
            lifecycle: Lifecycle::new(),
            registry: InverterRegistry::new(gateway.inverters().to_vec()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn all_inverters_found(&self) -> bool {
        self.lifecycle.all_inverters_found()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The discovered-inverter cache as it stands, without triggering a
    /// detection pass.
    pub fn registry(&self) -> &InverterRegistry {
        &self.registry
    }

    fn transition(&mut self, event: Event) {
        let next = self.lifecycle.next(event);
        if next.state() != self.lifecycle.state() {
            debug!(
                "{}:{} {:?} -> {:?} ({:?})",
                self.host,
                self.port,
                self.lifecycle.state(),
                next.state(),
                event
            );
        }
        self.lifecycle = next;
    }

    // connection {{{
    pub async fn connect(&mut self) -> SolarMaxResult<()> {
        self.close().await;

        debug!("establishing connection to {}:{}...", self.host, self.port);
        match self.open_stream().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.transition(Event::LinkUp);
                info!("connected to {}:{}", self.host, self.port);
                Ok(())
            }
            Err(reason) => {
                warn!("connection to {}:{} failed: {}", self.host, self.port, reason);
                self.transition(Event::LinkFailed);
                Err(SolarMaxError::Connect {
                    host: self.host.clone(),
                    port: self.port,
                    reason,
                })
            }
        }
    }

    async fn open_stream(&self) -> Result<TcpStream, String> {
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("timeout after {:?}", self.connect_timeout)),
        };

        let std_stream = stream.into_std().map_err(|e| e.to_string())?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
        let stream = TcpStream::from_std(std_stream).map_err(|e| e.to_string())?;

        if self.use_tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        Ok(stream)
    }

    /// Releases the socket. Safe to call any number of times; only the
    /// first call after a connect touches the network.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!("closing connection to {}:{}", self.host, self.port);
            if let Err(e) = stream.shutdown().await {
                debug!("shutdown of {}:{} failed: {}", self.host, self.port, e);
            }
        }
        self.transition(Event::LinkClosed);
    }

    fn lose_link(&mut self) {
        self.stream = None;
        self.transition(Event::LinkLost);
    } // }}}

    // wire {{{
    async fn send(&mut self, wire: &str) {
        let io_timeout = self.io_timeout;
        let Some(stream) = self.stream.as_mut() else {
            debug!("{}: not connected, dropping {}", self.host, wire);
            return;
        };

        let result = timeout(io_timeout, stream.write_all(wire.as_bytes())).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("{}: write failed: {}", self.host, e);
                self.lose_link();
            }
            Err(_) => {
                warn!("{}: write timeout after {:?}", self.host, io_timeout);
                self.lose_link();
            }
        }
    }

    /// Reads until a frame terminator arrives or the gateway goes quiet.
    /// `Ok(None)` means not a single byte came back.
    async fn receive(&mut self) -> SolarMaxResult<Option<String>> {
        let io_timeout = self.io_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(RX_BUFFER_SIZE);
        let mut decoder = FrameDecoder::new();
        let mut hung_up = false;

        let answer = loop {
            let result = timeout(io_timeout, stream.read_buf(&mut buf)).await;
            match result {
                Ok(Ok(0)) => {
                    hung_up = true;
                    break None;
                }
                Ok(Ok(_)) => {
                    if let Some(frame) = decoder.decode(&mut buf)? {
                        break Some(frame);
                    }
                }
                Ok(Err(e)) => {
                    warn!("{}: read failed: {}", self.host, e);
                    hung_up = true;
                    break None;
                }
                Err(_) => break None,
            }
        };

        if hung_up {
            self.lose_link();
        }

        // whatever arrived before the line went quiet is handed on, so it
        // fails as a malformed frame rather than looking like silence
        Ok(answer.or_else(|| (!buf.is_empty()).then(|| frame::unmask(&buf))))
    }

    async fn exchange(&mut self, wire: &str) -> SolarMaxResult<Option<String>> {
        debug!("{} => {}", self.host, wire);
        self.send(wire).await;

        let answer = self.receive().await?;
        match &answer {
            Some(a) => debug!("{} <= {}", self.host, a),
            None => debug!("{} <= (nothing)", self.host),
        }

        Ok(answer)
    }

    fn interpret(answer: &str) -> SolarMaxResult<QueryResult> {
        let (address, raw) = frame::decode_response(answer)?;
        Ok((address, normalize_all(&raw)?))
    } // }}}

    // queries {{{
    pub async fn query(
        &mut self,
        address: u8,
        fields: &[QueryField],
    ) -> SolarMaxResult<Option<QueryResult>> {
        self.query_kind(address, fields, READ_KIND).await
    }

    /// Sends one request and returns the decoded answer.
    ///
    /// When the gateway stays silent the session tries to recover first.
    /// Outside a detection pass the inverters are searched again, which
    /// also brings a dropped line back; `Timeout` follows only if the line
    /// was up. During a pass a dropped line is just re-established. Either
    /// way a recovered address is reported as `Ok(None)`.
    pub async fn query_kind(
        &mut self,
        address: u8,
        fields: &[QueryField],
        kind: u16,
    ) -> SolarMaxResult<Option<QueryResult>> {
        let wire = frame::encode_query(address, fields, kind)?;
        self.request(address, &wire).await
    }

    /// The one write the bridge supports: a kind 200 frame of
    /// `FIELD=value` items. Returns the acknowledged values.
    pub async fn write_setting(
        &mut self,
        address: u8,
        values: &[(QueryField, u64)],
    ) -> SolarMaxResult<Option<QueryResult>> {
        let wire = frame::encode_setting(address, values)?;
        info!("inverter {} on {}: writing {:?}", address, self.host, values);
        self.request(address, &wire).await
    }

    async fn request(&mut self, address: u8, wire: &str) -> SolarMaxResult<Option<QueryResult>> {
        match self.exchange(wire).await? {
            Some(answer) => Self::interpret(&answer).map(Some),
            None => self.recover(address).await,
        }
    }

    async fn recover(&mut self, address: u8) -> SolarMaxResult<Option<QueryResult>> {
        let link_up = self.is_connected();
        self.transition(Event::DeviceSilent);

        if self.lifecycle.is_detecting() {
            if !link_up {
                info!(
                    "inverter {} on {} is silent and the line is down, reconnecting",
                    address, self.host
                );
                let _ = self.connect().await;
            }
            return Ok(None);
        }

        info!(
            "inverter {} on {} is silent, searching inverters again",
            address, self.host
        );
        if let Err(e) = self.detect_inverters().await {
            warn!("{}", e);
        }

        if link_up {
            Err(SolarMaxError::Timeout {
                host: self.host.clone(),
                address,
            })
        } else {
            Ok(None)
        }
    }

    pub async fn status(&mut self, address: u8) -> SolarMaxResult<StatusReport> {
        let values = match self.query(address, STATUS_FIELDS).await {
            Ok(Some((_, values))) => values,
            Ok(None) => return Ok(StatusReport::offline()),
            Err(e) if e.is_silence() => return Ok(StatusReport::offline()),
            Err(e) => return Err(e),
        };

        let (code, _) = values
            .get(&QueryField::SYS)
            .and_then(|v| v.as_pair())
            .ok_or(SolarMaxError::MissingField {
                address,
                field: QueryField::SYS,
            })?;
        let mask = values
            .get(&QueryField::SAL)
            .and_then(|v| v.as_u64())
            .ok_or(SolarMaxError::MissingField {
                address,
                field: QueryField::SAL,
            })?;

        Ok(StatusReport {
            status: StatusString::from_value(code).to_string(),
            code: Some(code),
            alarms: AlarmString::from_value(mask)
                .into_iter()
                .map(String::from)
                .collect(),
        })
    } // }}}

    // detection {{{
    pub async fn use_inverters(&mut self, addresses: Vec<u8>) -> SolarMaxResult<()> {
        self.registry.set_expected(addresses);
        self.detect_inverters().await
    }

    /// Returns the discovered inverters, searching first unless the last
    /// pass found all of them.
    pub async fn inverters(&mut self) -> &InverterRegistry {
        if !self.lifecycle.all_inverters_found() {
            if let Err(e) = self.detect_inverters().await {
                warn!("{}", e);
            }
        }
        &self.registry
    }

    pub async fn detect_inverters(&mut self) -> SolarMaxResult<()> {
        if !self.is_connected() {
            let _ = self.connect().await;
        }

        self.transition(Event::DetectionStarted);
        self.registry.clear();

        for address in self.registry.expected().to_vec() {
            debug!("searching for inverter {} on {}", address, self.host);
            match self.probe(address).await {
                Ok(Some((source, values))) => self.register(source, &values),
                Ok(None) => info!("inverter {} not found on {}: no answer", address, self.host),
                Err(e) => info!("inverter {} not found on {}: {}", address, self.host, e),
            }
        }

        let complete = self.registry.is_complete();
        self.transition(Event::DetectionFinished {
            complete,
            link_up: self.is_connected(),
        });

        if complete {
            info!(
                "found all inverters on {}: {:?}",
                self.host,
                self.registry.iter().collect::<Vec<_>>()
            );
        } else {
            warn!("not all inverters found on {}, reconnecting", self.host);
        }

        // the gateway wants a fresh line after a burst of queries
        let _ = self.connect().await;

        if complete {
            Ok(())
        } else {
            Err(SolarMaxError::PartialDetection {
                host: self.host.clone(),
                found: self.registry.len(),
                expected: self.registry.expected().len(),
            })
        }
    }

    async fn probe(&mut self, address: u8) -> SolarMaxResult<Option<QueryResult>> {
        let wire = frame::encode_query(address, DETECTION_FIELDS, READ_KIND)?;
        match self.exchange(&wire).await? {
            Some(answer) => Self::interpret(&answer).map(Some),
            None => {
                let link_up = self.is_connected();
                self.transition(Event::DeviceSilent);
                if !link_up {
                    let _ = self.connect().await;
                }
                Ok(None)
            }
        }
    }

    fn register(&mut self, source: u8, values: &Values) {
        let code = values.get(&QueryField::TYP).and_then(|v| v.as_u64());
        let installed = values.get(&QueryField::PIN).and_then(|v| v.as_f64());

        match (code.and_then(InverterType::from_code), installed) {
            (Some(model), Some(installed_power)) => {
                debug!(
                    "inverter {} on {} is a {} ({} W installed)",
                    source,
                    self.host,
                    model.description(),
                    installed_power
                );
                self.registry.record(
                    source,
                    InverterInfo {
                        model,
                        installed_power,
                    },
                );
            }
            _ => warn!(
                "unknown inverter type {:?} at address {} on {}",
                code, source, self.host
            ),
        }
    } // }}}
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.stream.is_some() {
            debug!("releasing connection to {}:{}", self.host, self.port);
        }
    }
}
