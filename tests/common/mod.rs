#![allow(dead_code)]

pub use solarmax_bridge::prelude::*;
pub use solarmax_bridge::solarmax::{frame, QueryField};

use std::collections::BTreeMap;
use net2::TcpStreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// SimulatedInverter {{{
#[derive(Clone, Debug)]
pub struct SimulatedInverter {
    pub address: u8,
    pub silent: bool,
    pub fields: BTreeMap<QueryField, String>,
}

impl SimulatedInverter {
    /// A SolarMax 3000S, 2000 W installed, feeding 920 W at 230 V.
    pub fn new(address: u8) -> Self {
        use QueryField::*;

        let fields = [
            (ADR, format!("{:X}", address)),
            (TYP, "4E34".to_string()),
            (PIN, "FA0".to_string()),
            (PAC, "730".to_string()),
            (TKK, "29".to_string()),
            (KDY, "20".to_string()),
            (KT0, "2EE0".to_string()),
            (IDC, "FA".to_string()),
            (UDC, "FA0".to_string()),
            (IL1, "190".to_string()),
            (UL1, "8FC".to_string()),
            (FDAT, "7E80C1F,B4B2".to_string()),
            (SYS, "4E24,0".to_string()),
            (SAL, "0".to_string()),
        ]
        .into_iter()
        .collect();

        Self {
            address,
            silent: false,
            fields,
        }
    }

    pub fn with(mut self, field: QueryField, raw: &str) -> Self {
        self.fields.insert(field, raw.to_string());
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
} // }}}

// SimulatedGateway {{{
/// A MaxComm gateway on 127.0.0.1 answering for a set of simulated
/// inverters. Silent or unknown addresses get no answer at all.
#[derive(Clone)]
pub struct SimulatedGateway {
    pub port: u16,
    inverters: Arc<Mutex<BTreeMap<u8, SimulatedInverter>>>,
    writes: Arc<Mutex<Vec<(u8, Vec<(QueryField, String)>)>>>,
    connections: Arc<AtomicUsize>,
    hang_up: Arc<AtomicBool>,
    reset: Arc<Notify>,
}

impl SimulatedGateway {
    pub async fn start(inverters: Vec<SimulatedInverter>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let gateway = Self {
            port,
            inverters: Arc::new(Mutex::new(
                inverters.into_iter().map(|i| (i.address, i)).collect(),
            )),
            writes: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            hang_up: Arc::new(AtomicBool::new(false)),
            reset: Arc::new(Notify::new()),
        };

        let g = gateway.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                g.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(g.clone().serve(socket));
            }
        });

        gateway
    }

    pub fn set_silent(&self, address: u8, silent: bool) {
        if let Some(inverter) = self.inverters.lock().unwrap().get_mut(&address) {
            inverter.silent = silent;
        }
    }

    pub fn writes(&self) -> Vec<(u8, Vec<(QueryField, String)>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// The next request is not answered; the gateway closes the line
    /// instead.
    pub fn hang_up_next(&self) {
        self.hang_up.store(true, Ordering::SeqCst);
    }

    /// Resets every open line right away, with no request pending.
    pub fn reset_connections(&self) {
        self.reset.notify_waiters();
    }

    async fn serve(self, mut socket: TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let read = tokio::select! {
                r = socket.read(&mut chunk) => Some(r),
                _ = self.reset.notified() => None,
            };
            let n = match read {
                Some(Ok(0)) | Some(Err(_)) => return,
                Some(Ok(n)) => n,
                None => {
                    // linger 0 makes the close an RST
                    if let Ok(std_socket) = socket.into_std() {
                        let _ = std_socket.set_linger(Some(Duration::ZERO));
                    }
                    return;
                }
            };
            buf.extend_from_slice(&chunk[..n]);

            while let Some(end) = buf.iter().position(|b| *b == b'}') {
                let raw: Vec<u8> = buf.drain(..=end).collect();
                let wire = String::from_utf8_lossy(&raw).to_string();

                if self.hang_up.swap(false, Ordering::SeqCst) {
                    return;
                }

                if let Some(answer) = self.answer(&wire) {
                    if socket.write_all(answer.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn answer(&self, wire: &str) -> Option<String> {
        let request = frame::decode(wire).ok()?;

        let inverters = self.inverters.lock().unwrap();
        let inverter = inverters.get(&request.address)?;
        if inverter.silent {
            return None;
        }

        let items: Vec<(QueryField, String)> = if request.kind == frame::WRITE_KIND {
            let values: Vec<(QueryField, String)> = request
                .items
                .iter()
                .filter_map(|(f, v)| v.clone().map(|v| (*f, v)))
                .collect();
            self.writes
                .lock()
                .unwrap()
                .push((request.address, values.clone()));
            values
        } else {
            request
                .items
                .iter()
                .filter_map(|(f, _)| inverter.fields.get(f).map(|v| (*f, v.clone())))
                .collect()
        };

        frame::encode_response(request.address, &items, request.kind).ok()
    }
} // }}}

// Factory {{{
pub struct Factory;

impl Factory {
    pub fn gateway(port: u16, inverters: Vec<u8>) -> config::Gateway {
        config::Gateway {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            inverters,
            connect_timeout_ms: Some(500),
            read_timeout_ms: Some(200),
            use_tcp_nodelay: Some(true),
        }
    }

    pub fn config(gateways: Vec<config::Gateway>, publish: config::PublishMode) -> ConfigWrapper {
        ConfigWrapper::from_config(Config {
            device: config::Device {
                uuid: "0x4f2a9c".to_string(),
                origin: "test".to_string(),
                ip: None,
            },
            gateways,
            poller: config::Poller {
                interval_secs: 0.05,
                publish,
            },
            mqtt: config::Mqtt {
                enabled: false,
                host: "localhost".to_string(),
                port: 1883,
                username: None,
                password: None,
                keepalive_secs: None,
                use_tls: false,
                ca_cert: None,
            },
            loglevel: "debug".to_string(),
        })
    }
} // }}}

/// Everything the poller handed to the publisher so far.
pub fn drain_messages(receiver: &mut broadcast::Receiver<mqtt::ChannelData>) -> Vec<mqtt::Message> {
    let mut messages = Vec::new();
    while let Ok(data) = receiver.try_recv() {
        if let mqtt::ChannelData::Message(message) = data {
            messages.push(message);
        }
    }
    messages
}
