// Modem module - THE CELLULAR LINK
// AT command protocol, serial link handling and the cellular transport

mod at;
mod config;
mod driver;
mod link;

pub use at::{
    // Protocol
    classify, split_fields, AtLine, AtResponse, FinalResult, LineKind, LineTokenizer, Urc, CTRL_Z,
    // Parsed reports
    parse_cmgl, parse_cmgr, parse_cops, parse_cpin, parse_creg, parse_csq, parse_scts,
    AccessTechnology, NetworkRegistration, OperatorInfo, SignalQuality, SimStatus, SmsMessage,
};

pub use config::{ApnAuth, ApnConfig, CellularConfig, DataEndpoint, PowerTiming, SocketProtocol};

pub use driver::{
    CallCallback, CellularEventCallback, CellularNetworkInfo, CellularStatus, IncomingCall,
    ModemControl, ModemStats, ModemTransport, SmsCallback, SmsFilter, MAX_CELLULAR_PAYLOAD,
    MAX_SMS_LENGTH,
};

pub use link::AtLink;
