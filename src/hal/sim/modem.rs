// Simulated Modem
// Scripted AT command responder on the far end of an in-memory serial link

use std::sync::{Arc, Mutex};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::lock;
use crate::transport::modem::{SimStatus, CTRL_Z};
use crate::transport::ModemControl;

const SERIAL_BUFFER: usize = 4096;
const ESCAPE: u8 = 0x1B;

#[derive(Debug, Clone)]
struct StoredSms {
    index: u16,
    unread: bool,
    sender: String,
    scts: String,
    text: String,
}

struct SimModemState {
    supply: bool,
    powered: bool,
    power_key_low: bool,
    shutting_down: bool,
    responsive: bool,
    echo: bool,
    sim: SimStatus,
    pin: String,
    registration: u8,
    register_after: u32,
    registration_polls: u32,
    signal: u8,
    operator: String,
    pdp_active: bool,
    socket_open: bool,
    silent: Vec<String>,
    rejected: Vec<String>,
    inbox: Vec<StoredSms>,
    next_index: u16,
    outbox: Vec<(String, String)>,
    socket_data: Vec<Vec<u8>>,
    calls: Vec<String>,
    commands: Vec<String>,
}

impl Default for SimModemState {
    fn default() -> Self {
        Self {
            supply: false,
            powered: false,
            power_key_low: false,
            shutting_down: false,
            responsive: true,
            echo: true,
            sim: SimStatus::Ready,
            pin: "1234".to_string(),
            registration: 1,
            register_after: 0,
            registration_polls: 0,
            signal: 20,
            operator: "SimNet".to_string(),
            pdp_active: false,
            socket_open: false,
            silent: Vec::new(),
            rejected: Vec::new(),
            inbox: Vec::new(),
            next_index: 1,
            outbox: Vec::new(),
            socket_data: Vec::new(),
            calls: Vec::new(),
            commands: Vec::new(),
        }
    }
}

/// What the responder writes back for one command line
enum Reply {
    Silent,
    Lines(Vec<String>, &'static str),
    Final(String),
    Prompt(Payload),
}

enum Payload {
    Sms { number: String },
    Socket { len: usize },
}

/// Entry point for spawning a simulated modem
pub struct SimModem;

/// Power, reset and power-key lines of a [`SimModem`]
pub struct SimModemControl {
    shared: Arc<Mutex<SimModemState>>,
    urcs: mpsc::UnboundedSender<String>,
}

/// Test-side control of a [`SimModem`]
#[derive(Clone)]
pub struct SimModemHandle {
    shared: Arc<Mutex<SimModemState>>,
    urcs: mpsc::UnboundedSender<String>,
}

impl SimModem {
    /// Spawn the responder; returns the host end of the serial link. Must run inside a Tokio runtime
    pub fn spawn() -> (DuplexStream, SimModemControl, SimModemHandle) {
        let (host, device) = duplex(SERIAL_BUFFER);
        let shared = Arc::new(Mutex::new(SimModemState::default()));
        let (urc_tx, urc_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_responder(device, shared.clone(), urc_rx));
        (
            host,
            SimModemControl {
                shared: shared.clone(),
                urcs: urc_tx.clone(),
            },
            SimModemHandle {
                shared,
                urcs: urc_tx,
            },
        )
    }
}

impl ModemControl for SimModemControl {
    fn set_power_supply(&mut self, enabled: bool) {
        let mut state = lock(&self.shared);
        state.supply = enabled;
        if !enabled {
            state.powered = false;
        }
    }

    fn set_reset(&mut self, _high: bool) {}

    fn set_power_key(&mut self, high: bool) {
        let mut state = lock(&self.shared);
        if !high {
            state.power_key_low = true;
            return;
        }
        if !std::mem::replace(&mut state.power_key_low, false) || !state.supply {
            return;
        }
        // A full pulse toggles power; after AT+CPOF it only completes the shutdown
        if state.shutting_down {
            state.shutting_down = false;
        } else if state.powered {
            state.powered = false;
        } else {
            boot(&mut state);
            let _ = self.urcs.send("RDY".to_string());
        }
    }
}

fn boot(state: &mut SimModemState) {
    state.powered = true;
    state.echo = true;
    state.registration_polls = 0;
    state.pdp_active = false;
    state.socket_open = false;
    debug!("sim modem booted");
}

impl SimModemHandle {
    pub fn is_powered(&self) -> bool {
        lock(&self.shared).powered
    }

    /// Stop answering anything, as a modem stuck in boot would
    pub fn set_responsive(&self, responsive: bool) {
        lock(&self.shared).responsive = responsive;
    }

    pub fn set_sim(&self, status: SimStatus) {
        lock(&self.shared).sim = status;
    }

    pub fn set_pin(&self, pin: &str) {
        lock(&self.shared).pin = pin.to_string();
    }

    /// Registration code reported once `register_after` polls have passed
    pub fn set_registration(&self, code: u8) {
        lock(&self.shared).registration = code;
    }

    /// Report "searching" for the first `polls` registration queries
    pub fn register_after(&self, polls: u32) {
        lock(&self.shared).register_after = polls;
    }

    pub fn set_signal(&self, quality: u8) {
        lock(&self.shared).signal = quality;
    }

    /// Never answer commands starting with `prefix`
    pub fn silence(&self, prefix: &str) {
        lock(&self.shared).silent.push(prefix.to_string());
    }

    /// Answer commands starting with `prefix` with ERROR
    pub fn reject(&self, prefix: &str) {
        lock(&self.shared).rejected.push(prefix.to_string());
    }

    /// Write an unsolicited line to the host
    pub fn inject(&self, line: &str) -> bool {
        self.urcs.send(line.to_string()).is_ok()
    }

    /// Store an incoming message and announce it with `+CMTI`
    pub fn receive_sms(&self, sender: &str, text: &str) -> u16 {
        let index = {
            let mut state = lock(&self.shared);
            let index = state.next_index;
            state.next_index += 1;
            state.inbox.push(StoredSms {
                index,
                unread: true,
                sender: sender.to_string(),
                scts: "24/05/01,12:30:00+08".to_string(),
                text: text.to_string(),
            });
            index
        };
        self.inject(&format!("+CMTI: \"SM\",{}", index));
        index
    }

    /// Store a message without announcing it
    pub fn store_sms(&self, sender: &str, text: &str, unread: bool) -> u16 {
        let mut state = lock(&self.shared);
        let index = state.next_index;
        state.next_index += 1;
        state.inbox.push(StoredSms {
            index,
            unread,
            sender: sender.to_string(),
            scts: "24/05/01,09:15:00+00".to_string(),
            text: text.to_string(),
        });
        index
    }

    /// Announce an incoming voice call
    pub fn ring(&self, number: &str) {
        self.inject("RING");
        self.inject(&format!("+CLIP: \"{}\",145,\"\",0,\"\",0", number));
    }

    /// Drop off the network and report it unsolicited
    pub fn lose_registration(&self) {
        lock(&self.shared).registration = 0;
        self.inject("+CREG: 0");
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.shared).commands.clone()
    }

    pub fn sent_sms(&self) -> Vec<(String, String)> {
        lock(&self.shared).outbox.clone()
    }

    pub fn socket_data(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).socket_data.clone()
    }

    pub fn dialled(&self) -> Vec<String> {
        lock(&self.shared).calls.clone()
    }

    pub fn stored_sms(&self) -> usize {
        lock(&self.shared).inbox.len()
    }

    pub fn pdp_active(&self) -> bool {
        lock(&self.shared).pdp_active
    }
}

async fn run_responder(
    mut io: DuplexStream,
    shared: Arc<Mutex<SimModemState>>,
    mut urcs: mpsc::UnboundedReceiver<String>,
) {
    let mut input: Vec<u8> = Vec::new();
    let mut payload: Option<(Payload, Vec<u8>)> = None;
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            read = io.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => input.extend_from_slice(&buf[..n]),
            },
            line = urcs.recv() => match line {
                Some(line) => {
                    let live = {
                        let state = lock(&shared);
                        state.powered && state.responsive
                    };
                    if live && io.write_all(format!("\r\n{}\r\n", line).as_bytes()).await.is_err() {
                        break;
                    }
                    continue;
                }
                None => break,
            },
        }

        let output = process_input(&shared, &mut input, &mut payload);
        if !output.is_empty() && io.write_all(&output).await.is_err() {
            break;
        }
    }
    debug!("sim modem responder stopped");
}

/// Consume complete commands and payloads from `input`, returning the bytes to send back
fn process_input(
    shared: &Mutex<SimModemState>,
    input: &mut Vec<u8>,
    payload: &mut Option<(Payload, Vec<u8>)>,
) -> Vec<u8> {
    let mut output = Vec::new();
    loop {
        if let Some((kind, body)) = payload.as_mut() {
            match kind {
                Payload::Sms { number } => {
                    let Some(end) = input.iter().position(|b| *b == CTRL_Z || *b == ESCAPE) else {
                        body.append(input);
                        return output;
                    };
                    let terminator = input[end];
                    body.extend(input.drain(..=end).take(end));
                    let number = number.clone();
                    let text = String::from_utf8_lossy(body).to_string();
                    *payload = None;
                    if terminator == ESCAPE {
                        output.extend_from_slice(b"\r\nOK\r\n");
                        continue;
                    }
                    let mut state = lock(shared);
                    state.outbox.push((number, text));
                    let reference = state.outbox.len();
                    output.extend_from_slice(format!("\r\n+CMGS: {}\r\n\r\nOK\r\n", reference).as_bytes());
                }
                Payload::Socket { len } => {
                    let needed = *len - body.len();
                    let take = needed.min(input.len());
                    body.extend(input.drain(..take));
                    if body.len() < *len {
                        return output;
                    }
                    let len = *len;
                    let data = std::mem::take(body);
                    *payload = None;
                    lock(shared).socket_data.push(data);
                    output.extend_from_slice(format!("\r\n+CIPSEND: 0,{},{}\r\n\r\nOK\r\n", len, len).as_bytes());
                }
            }
            continue;
        }

        let skip = input.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        input.drain(..skip);
        let Some(end) = input.iter().position(|b| *b == b'\r' || *b == b'\n') else {
            return output;
        };
        let raw: Vec<u8> = input.drain(..end).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            continue;
        }

        let mut state = lock(shared);
        if !state.powered || !state.responsive {
            trace!(line = %line, "sim modem ignoring command while unavailable");
            continue;
        }
        state.commands.push(line.clone());
        if state.echo {
            output.extend_from_slice(format!("{}\r\r\n", line).as_bytes());
        }
        match respond(&mut state, &line) {
            Reply::Silent => {}
            Reply::Lines(lines, result) => {
                for l in lines {
                    output.extend_from_slice(format!("\r\n{}\r\n", l).as_bytes());
                }
                output.extend_from_slice(format!("\r\n{}\r\n", result).as_bytes());
            }
            Reply::Final(result) => output.extend_from_slice(format!("\r\n{}\r\n", result).as_bytes()),
            Reply::Prompt(kind) => {
                output.extend_from_slice(b"\r\n> ");
                *payload = Some((kind, Vec::new()));
            }
        }
    }
}

fn ok() -> Reply {
    Reply::Final("OK".to_string())
}

fn error() -> Reply {
    Reply::Final("ERROR".to_string())
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

fn respond(state: &mut SimModemState, line: &str) -> Reply {
    let command = line.to_ascii_uppercase();
    if state.silent.iter().any(|p| command.starts_with(&p.to_ascii_uppercase())) {
        return Reply::Silent;
    }
    if state.rejected.iter().any(|p| command.starts_with(&p.to_ascii_uppercase())) {
        return error();
    }

    match command.as_str() {
        "AT" | "AT+CMEE=2" | "AT+CREG=2" | "AT+CMGF=1" | "ATA" | "ATH" => return ok(),
        "ATE0" => {
            state.echo = false;
            return ok();
        }
        "ATE1" => {
            state.echo = true;
            return ok();
        }
        "AT+CPIN?" => {
            return match state.sim {
                SimStatus::Ready => Reply::Lines(vec!["+CPIN: READY".to_string()], "OK"),
                SimStatus::PinRequired => Reply::Lines(vec!["+CPIN: SIM PIN".to_string()], "OK"),
                SimStatus::PukRequired => Reply::Lines(vec!["+CPIN: SIM PUK".to_string()], "OK"),
                SimStatus::NotInserted => Reply::Final("+CME ERROR: SIM not inserted".to_string()),
                SimStatus::Error => Reply::Final("+CME ERROR: SIM failure".to_string()),
            }
        }
        "AT+CREG?" => {
            state.registration_polls += 1;
            let stat = if state.registration_polls > state.register_after {
                state.registration
            } else {
                2
            };
            return Reply::Lines(vec![format!("+CREG: 2,{},\"1A2B\",\"01C3D4E5\"", stat)], "OK");
        }
        "AT+CSQ" => return Reply::Lines(vec![format!("+CSQ: {},99", state.signal)], "OK"),
        "AT+COPS?" => {
            return Reply::Lines(vec![format!("+COPS: 0,0,\"{}\",7", state.operator)], "OK")
        }
        "AT+CGSN" => return Reply::Lines(vec!["861234567890123".to_string()], "OK"),
        "AT+CICCID" => return Reply::Lines(vec!["+ICCID: 89860012345678901234".to_string()], "OK"),
        "ATI" => {
            return Reply::Lines(
                vec![
                    "Manufacturer: SIMULATED".to_string(),
                    "Model: SIM7600".to_string(),
                    "Revision: 1.0".to_string(),
                ],
                "OK",
            )
        }
        "AT+CGACT=1,1" => {
            state.pdp_active = true;
            return ok();
        }
        "AT+CGACT=0,1" => {
            state.pdp_active = false;
            return ok();
        }
        "AT+NETOPEN" | "AT+NETCLOSE" => return ok(),
        "AT+CIPCLOSE=0" => {
            state.socket_open = false;
            return ok();
        }
        "AT+CPOF" => {
            state.powered = false;
            state.shutting_down = true;
            state.pdp_active = false;
            state.socket_open = false;
            return ok();
        }
        _ => {}
    }

    if command.starts_with("AT+CNMI=") || command.starts_with("AT+CGDCONT=") || command.starts_with("AT+CGAUTH=") {
        return ok();
    }
    if let Some(pin) = command.strip_prefix("AT+CPIN=") {
        if unquote(pin) == state.pin && state.sim == SimStatus::PinRequired {
            state.sim = SimStatus::Ready;
            return ok();
        }
        return Reply::Final("+CME ERROR: incorrect password".to_string());
    }
    if command.starts_with("AT+CIPOPEN=") {
        if !state.pdp_active {
            return error();
        }
        state.socket_open = true;
        return Reply::Lines(vec!["+CIPOPEN: 0,0".to_string()], "OK");
    }
    if let Some(args) = command.strip_prefix("AT+CIPSEND=") {
        let len = args.split(',').nth(1).and_then(|n| n.trim().parse::<usize>().ok());
        return match len {
            Some(len) if state.socket_open && len > 0 => Reply::Prompt(Payload::Socket { len }),
            _ => error(),
        };
    }
    if command.starts_with("AT+CMGS=") {
        // Number keeps its original case
        let number = unquote(&line["AT+CMGS=".len()..]);
        return Reply::Prompt(Payload::Sms { number });
    }
    if let Some(filter) = command.strip_prefix("AT+CMGL=") {
        let filter = unquote(filter);
        let mut lines = Vec::new();
        for sms in state.inbox.iter_mut() {
            let status = if sms.unread { "REC UNREAD" } else { "REC READ" };
            if filter != "ALL" && filter != status {
                continue;
            }
            lines.push(format!(
                "+CMGL: {},\"{}\",\"{}\",\"\",\"{}\"",
                sms.index, status, sms.sender, sms.scts
            ));
            lines.push(sms.text.clone());
            sms.unread = false;
        }
        return Reply::Lines(lines, "OK");
    }
    if let Some(index) = command.strip_prefix("AT+CMGR=") {
        let index: Option<u16> = index.trim().parse().ok();
        let Some(sms) = state.inbox.iter_mut().find(|s| Some(s.index) == index) else {
            return Reply::Final("+CMS ERROR: 321".to_string());
        };
        let status = if sms.unread { "REC UNREAD" } else { "REC READ" };
        let lines = vec![
            format!("+CMGR: \"{}\",\"{}\",\"\",\"{}\"", status, sms.sender, sms.scts),
            sms.text.clone(),
        ];
        sms.unread = false;
        return Reply::Lines(lines, "OK");
    }
    if let Some(index) = command.strip_prefix("AT+CMGD=") {
        let index: Option<u16> = index.trim().parse().ok();
        let before = state.inbox.len();
        state.inbox.retain(|s| Some(s.index) != index);
        return if state.inbox.len() < before {
            ok()
        } else {
            Reply::Final("+CMS ERROR: 321".to_string())
        };
    }
    if command.starts_with("ATD") && command.ends_with(';') {
        let number = line[3..line.len() - 1].to_string();
        if state.registration != 1 && state.registration != 5 {
            return Reply::Final("NO CARRIER".to_string());
        }
        state.calls.push(number);
        return ok();
    }

    trace!(line, "sim modem rejecting unknown command");
    error()
}
