// AT Protocol
// Incremental line tokenizer, response records and parsers for modem replies

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Terminates the text of a two-phase SMS submission
pub const CTRL_Z: u8 = 0x1A;

// ============================================================================
// TOKENIZER
// ============================================================================

/// Terminal result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Error,
    CmeError(String),
    CmsError(String),
    NoCarrier,
    Busy,
    NoAnswer,
    NoDialtone,
}

impl FinalResult {
    fn parse(line: &str) -> Option<Self> {
        match line {
            "OK" => Some(Self::Ok),
            "ERROR" => Some(Self::Error),
            "NO CARRIER" => Some(Self::NoCarrier),
            "BUSY" => Some(Self::Busy),
            "NO ANSWER" => Some(Self::NoAnswer),
            "NO DIALTONE" => Some(Self::NoDialtone),
            _ => {
                if let Some(rest) = line.strip_prefix("+CME ERROR:") {
                    Some(Self::CmeError(rest.trim().to_string()))
                } else {
                    line.strip_prefix("+CMS ERROR:")
                        .map(|rest| Self::CmsError(rest.trim().to_string()))
                }
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Ok => "OK".to_string(),
            Self::Error => "ERROR".to_string(),
            Self::CmeError(detail) => format!("+CME ERROR: {}", detail),
            Self::CmsError(detail) => format!("+CMS ERROR: {}", detail),
            Self::NoCarrier => "NO CARRIER".to_string(),
            Self::Busy => "BUSY".to_string(),
            Self::NoAnswer => "NO ANSWER".to_string(),
            Self::NoDialtone => "NO DIALTONE".to_string(),
        }
    }
}

/// One token read off the serial link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtLine {
    Final(FinalResult),
    /// `> ` data prompt of a two-phase command
    Prompt,
    Text(String),
}

/// Splits a byte stream into CR/LF-delimited lines and data prompts
#[derive(Debug, Default)]
pub struct LineTokenizer {
    buf: Vec<u8>,
}

impl LineTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete token, or None until more bytes arrive
    pub fn next_line(&mut self) -> Option<AtLine> {
        loop {
            // Leading line terminators separate records
            let skip = self
                .buf
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.buf.drain(..skip);

            if self.buf.first() == Some(&b'>') {
                let len = if self.buf.get(1) == Some(&b' ') { 2 } else { 1 };
                self.buf.drain(..len);
                return Some(AtLine::Prompt);
            }

            let end = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r')?;
            let raw: Vec<u8> = self.buf.drain(..end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            return Some(match FinalResult::parse(&line) {
                Some(result) => AtLine::Final(result),
                None => AtLine::Text(line),
            });
        }
    }
}

// ============================================================================
// LINE CLASSIFICATION
// ============================================================================

/// Role of a text line relative to the outstanding command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Echo,
    Response,
    Unsolicited(Urc),
}

/// Unsolicited result codes the dispatcher understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Urc {
    NewMessage { storage: String, index: u16 },
    Ring,
    CallerId { number: String },
    Registration(NetworkRegistration),
    ModemReady,
    Other(String),
}

const URC_PREFIXES: [&str; 7] = ["+CMTI", "+CMT", "+CLIP", "+CREG", "+CGREG", "+CPIN", "+CIPCLOSE"];

/// Decide whether `line` belongs to `command` or is unsolicited
pub fn classify(line: &str, command: Option<&str>) -> LineKind {
    let command = command.map(|c| c.trim());
    if command == Some(line) {
        return LineKind::Echo;
    }

    if line.starts_with('+') {
        let prefix = line.split(':').next().unwrap_or(line);
        let answers_command = command
            .map(|c| c.to_ascii_uppercase().starts_with(&format!("AT{}", prefix)))
            .unwrap_or(false);
        if answers_command {
            return LineKind::Response;
        }
        if URC_PREFIXES.contains(&prefix) {
            return LineKind::Unsolicited(parse_urc(line));
        }
        return if command.is_some() {
            LineKind::Response
        } else {
            LineKind::Unsolicited(Urc::Other(line.to_string()))
        };
    }

    match line {
        "RING" => LineKind::Unsolicited(Urc::Ring),
        "RDY" | "*ATREADY" | "SMS DONE" | "PB DONE" => LineKind::Unsolicited(Urc::ModemReady),
        _ if command.is_some() => LineKind::Response,
        _ => LineKind::Unsolicited(Urc::Other(line.to_string())),
    }
}

fn parse_urc(line: &str) -> Urc {
    if let Some(rest) = line.strip_prefix("+CMTI:") {
        let fields = split_fields(rest);
        if let (Some(storage), Some(index)) = (fields.first(), fields.get(1).and_then(|i| i.parse().ok())) {
            return Urc::NewMessage {
                storage: storage.clone(),
                index,
            };
        }
    } else if let Some(rest) = line.strip_prefix("+CLIP:") {
        if let Some(number) = split_fields(rest).into_iter().next() {
            return Urc::CallerId { number };
        }
    } else if let Some(rest) = line.strip_prefix("+CREG:") {
        // Unsolicited form leads with the status, no mode field
        if let Some(code) = split_fields(rest).first().and_then(|s| s.parse::<u8>().ok()) {
            return Urc::Registration(NetworkRegistration::from_code(code));
        }
    }
    Urc::Other(line.to_string())
}

/// Split a comma-separated field list, honouring quotes
pub fn split_fields(input: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.trim().chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

// ============================================================================
// RESPONSE
// ============================================================================

/// Lines returned for a command together with its terminal result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    pub command: String,
    pub lines: Vec<String>,
    pub result: FinalResult,
}

impl AtResponse {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// First line starting with `prefix`, with the prefix removed
    pub fn field(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }

    /// Turn anything but OK into `CommandRejected`
    pub fn into_ok(self) -> Result<Self, TransportError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(TransportError::CommandRejected {
                command: self.command,
                reason: self.result.describe(),
            })
        }
    }
}

// ============================================================================
// NETWORK TYPES
// ============================================================================

/// Network registration state from `+CREG`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkRegistration {
    NotRegistered,
    RegisteredHome,
    Searching,
    Denied,
    Unknown,
    RegisteredRoaming,
}

impl NetworkRegistration {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NotRegistered,
            1 => Self::RegisteredHome,
            2 => Self::Searching,
            3 => Self::Denied,
            5 => Self::RegisteredRoaming,
            _ => Self::Unknown,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Self::RegisteredHome | Self::RegisteredRoaming)
    }
}

/// Radio access technology from `+COPS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessTechnology {
    Gsm,
    Umts,
    Edge,
    Hsdpa,
    Hsupa,
    Hspa,
    Lte,
    LteCatM1,
    NbIot,
    Unknown,
}

impl AccessTechnology {
    pub fn from_act(act: u8) -> Self {
        match act {
            0 | 1 => Self::Gsm,
            2 => Self::Umts,
            3 => Self::Edge,
            4 => Self::Hsdpa,
            5 => Self::Hsupa,
            6 => Self::Hspa,
            7 => Self::Lte,
            8 => Self::LteCatM1,
            9 => Self::NbIot,
            _ => Self::Unknown,
        }
    }
}

/// SIM state from `+CPIN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimStatus {
    Ready,
    PinRequired,
    PukRequired,
    NotInserted,
    Error,
}

/// Signal report from `+CSQ`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalQuality {
    /// None when the modem reports 99 (not detectable)
    pub rssi_dbm: Option<i16>,
    pub quality: Option<u8>,
    pub bit_error_rate: Option<u8>,
}

/// Operator selection from `+COPS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorInfo {
    pub name: String,
    pub technology: AccessTechnology,
}

// ============================================================================
// PARSERS
// ============================================================================

/// `+CREG: <n>,<stat>[,...]` as returned by `AT+CREG?`
pub fn parse_creg(response: &AtResponse) -> Option<NetworkRegistration> {
    let fields = split_fields(response.field("+CREG:")?);
    let code = match fields.len() {
        1 => fields.first()?,
        _ => fields.get(1)?,
    };
    code.parse().ok().map(NetworkRegistration::from_code)
}

/// `+CSQ: <rssi>,<ber>`
pub fn parse_csq(response: &AtResponse) -> Option<SignalQuality> {
    let fields = split_fields(response.field("+CSQ:")?);
    let raw: u8 = fields.first()?.parse().ok()?;
    let ber: u8 = fields.get(1).and_then(|b| b.parse().ok()).unwrap_or(99);
    let (rssi_dbm, quality) = if raw == 99 || raw > 31 {
        (None, None)
    } else {
        (Some(-113 + 2 * raw as i16), Some(raw))
    };
    Some(SignalQuality {
        rssi_dbm,
        quality,
        bit_error_rate: (ber != 99).then_some(ber),
    })
}

/// `+COPS: <mode>[,<format>,<oper>[,<AcT>]]`
pub fn parse_cops(response: &AtResponse) -> Option<OperatorInfo> {
    let fields = split_fields(response.field("+COPS:")?);
    let name = fields.get(2).filter(|n| !n.is_empty())?.clone();
    let technology = fields
        .get(3)
        .and_then(|act| act.parse().ok())
        .map(AccessTechnology::from_act)
        .unwrap_or(AccessTechnology::Unknown);
    Some(OperatorInfo { name, technology })
}

/// Interpret the reply to `AT+CPIN?`
pub fn parse_cpin(response: &AtResponse) -> SimStatus {
    if let FinalResult::CmeError(detail) = &response.result {
        let detail = detail.to_ascii_lowercase();
        return if detail.contains("not inserted") || detail == "10" {
            SimStatus::NotInserted
        } else {
            SimStatus::Error
        };
    }
    match response.field("+CPIN:") {
        Some("READY") => SimStatus::Ready,
        Some("SIM PIN") => SimStatus::PinRequired,
        Some("SIM PUK") => SimStatus::PukRequired,
        _ => SimStatus::Error,
    }
}

/// Stored text message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub index: u16,
    pub status: String,
    pub sender: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

impl SmsMessage {
    pub fn is_unread(&self) -> bool {
        self.status == "REC UNREAD"
    }
}

/// `+CMGL: <index>,<stat>,<oa>,<alpha>,<scts>` headers, each followed by its text
pub fn parse_cmgl(response: &AtResponse) -> Vec<SmsMessage> {
    let mut messages = Vec::new();
    let mut current: Option<SmsMessage> = None;

    for line in &response.lines {
        if let Some(header) = line.strip_prefix("+CMGL:") {
            if let Some(done) = current.take() {
                messages.push(done);
            }
            let fields = split_fields(header);
            let Some(index) = fields.first().and_then(|i| i.parse().ok()) else {
                continue;
            };
            current = Some(SmsMessage {
                index,
                status: fields.get(1).cloned().unwrap_or_default(),
                sender: fields.get(2).cloned().unwrap_or_default(),
                timestamp: fields.get(4).and_then(|scts| parse_scts(scts)),
                text: String::new(),
            });
        } else if let Some(message) = current.as_mut() {
            append_text(message, line);
        }
    }
    if let Some(done) = current {
        messages.push(done);
    }
    messages
}

/// `+CMGR: <stat>,<oa>,<alpha>,<scts>` followed by the text
pub fn parse_cmgr(response: &AtResponse, index: u16) -> Option<SmsMessage> {
    let mut lines = response.lines.iter();
    let header = lines.find_map(|line| line.strip_prefix("+CMGR:"))?;
    let fields = split_fields(header);

    let mut message = SmsMessage {
        index,
        status: fields.first().cloned().unwrap_or_default(),
        sender: fields.get(1).cloned().unwrap_or_default(),
        timestamp: fields.get(3).and_then(|scts| parse_scts(scts)),
        text: String::new(),
    };
    for line in lines {
        append_text(&mut message, line);
    }
    Some(message)
}

fn append_text(message: &mut SmsMessage, line: &str) {
    if !message.text.is_empty() {
        message.text.push('\n');
    }
    message.text.push_str(line);
}

/// Service-centre timestamp `yy/MM/dd,hh:mm:ss±zz`, zone in quarter hours
pub fn parse_scts(scts: &str) -> Option<DateTime<Utc>> {
    let scts = scts.trim();
    let stamp = scts.get(..17)?;
    let zone = scts.get(17..)?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%y/%m/%d,%H:%M:%S").ok()?;
    let quarters: i32 = if zone.is_empty() { 0 } else { zone.parse().ok()? };
    let offset = FixedOffset::east_opt(quarters * 15 * 60)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}
