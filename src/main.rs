// commhub CLI
// Wires simulated radio, WiFi and modem hardware into an orchestrator and runs scenarios

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commhub::hal::{SimModem, SimModemHandle, SimRadio, SimRadioHandle, SimWifi, SimWifiHandle};
use commhub::orchestrator::Route;
use commhub::transport::modem::DataEndpoint;
use commhub::transport::{
    AccessPointConfig, Interface, ModemTransport, StationConfig, StationTransport, Transport,
    TransportError, TransportStatus,
};
use commhub::{NetworkConfig, NetworkStack, StackHardware};

/// Failover-capable communication hub running on simulated hardware
#[derive(Parser, Debug)]
#[command(name = "commhub")]
#[command(about = "Radio, WiFi and cellular transports behind one failover-capable interface")]
#[command(version)]
struct Args {
    /// Interface tried first (wifi, cellular, radio)
    #[arg(short, long, default_value = "wifi")]
    preferred: Interface,

    /// Disable automatic failover
    #[arg(long)]
    no_failover: bool,

    /// Network joined by the WiFi station
    #[arg(long, default_value = "FieldNet")]
    ssid: String,

    #[arg(long, default_value = "fieldpass1")]
    password: String,

    /// Leave an interface switched off (repeatable)
    #[arg(long = "disable")]
    disabled: Vec<Interface>,

    /// Also run a soft access point with this SSID
    #[arg(long)]
    ap_ssid: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send messages while links fail underneath
    Demo {
        #[arg(short, long, default_value = "hello from the field")]
        message: String,
    },

    /// List the WiFi networks in range
    Scan,

    /// Send a text message through the modem
    Sms {
        number: String,
        text: String,
    },

    /// Print aggregated statistics after some traffic
    Stats,
}

struct Rig {
    stack: NetworkStack<DuplexStream>,
    radio_hw: SimRadioHandle,
    wifi_hw: SimWifiHandle,
    modem_hw: SimModemHandle,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let rig = bring_up(&args).await?;

    let outcome = match args.command.unwrap_or(Commands::Demo {
        message: "hello from the field".to_string(),
    }) {
        Commands::Demo { message } => cmd_demo(&rig, message.as_bytes()).await,
        Commands::Scan => cmd_scan(&rig).await,
        Commands::Sms { number, text } => cmd_sms(&rig, &number, &text).await,
        Commands::Stats => cmd_stats(&rig).await,
    };

    rig.stack.shutdown().await?;
    outcome?;
    Ok(())
}

async fn bring_up(args: &Args) -> Result<Rig, TransportError> {
    let mut config = NetworkConfig::for_simulation()
        .with_station(StationConfig::new(&args.ssid, &args.password));
    if let Some(ap_ssid) = &args.ap_ssid {
        config = config.with_access_point(AccessPointConfig::new(ap_ssid, "commhub-ap"));
    }
    for interface in &args.disabled {
        config = config.without(*interface);
    }
    config.cellular = config
        .cellular
        .with_data_endpoint(DataEndpoint::udp("203.0.113.10", 5000));
    config.orchestrator = config
        .orchestrator
        .with_preferred(args.preferred)
        .with_auto_failover(!args.no_failover);

    let (radio_chip, radio_hw) = SimRadio::new();
    let (wifi_chip, wifi_hw) = SimWifi::new();
    wifi_hw.add_network(&args.ssid, &args.password, -52, 6, 3);
    wifi_hw.add_network("Cafe-Guest", "", -71, 11, 0);
    let (serial, control, modem_hw) = SimModem::spawn();

    let hardware = StackHardware::new()
        .with_radio(radio_chip)
        .with_wifi(wifi_chip)
        .with_modem(serial, control);
    let stack = NetworkStack::start(&config, hardware).await?;

    stack
        .orchestrator
        .on_connectivity_change(Arc::new(|interface: Interface, status: TransportStatus| {
            println!("  [link] {} -> {}", interface, status);
        }))
        .await?;

    info!(
        interfaces = ?stack.orchestrator.interfaces(),
        active = ?stack.orchestrator.active_interface().await?,
        "hub ready"
    );
    Ok(Rig {
        stack,
        radio_hw,
        wifi_hw,
        modem_hw,
    })
}

impl Rig {
    fn wifi(&self) -> Result<&Arc<StationTransport>, TransportError> {
        self.stack
            .wifi
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("wifi is disabled".to_string()))
    }

    fn modem(&self) -> Result<&Arc<ModemTransport<DuplexStream>>, TransportError> {
        self.stack
            .modem
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("cellular is disabled".to_string()))
    }
}

async fn cmd_demo(rig: &Rig, message: &[u8]) -> Result<(), TransportError> {
    let hub = &rig.stack.orchestrator;

    let via = hub.send(message, Route::Auto).await?;
    println!("sent {} bytes via {}", message.len(), via);

    println!("WiFi uplink starts failing...");
    rig.wifi_hw.set_send_failure(true);
    match hub.send(message, Route::Auto).await {
        Ok(via) => println!("failed over, sent via {}", via),
        Err(e) => println!("send failed: {}", e),
    }

    println!("Cellular network drops...");
    rig.modem_hw.lose_registration();
    tokio::time::sleep(Duration::from_millis(200)).await;
    match hub.send(message, Route::Auto).await {
        Ok(via) => println!("sent via {}", via),
        Err(e) => println!("send failed: {}", e),
    }

    if let Some(radio) = &rig.stack.radio {
        radio.start_receive(None).await?;
        rig.radio_hw.deliver_frame(b"mesh beacon", -97, 6.5);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut buffer = [0u8; 64];
    match hub.receive(&mut buffer).await {
        Some(received) => println!(
            "received {:?} via {}",
            String::from_utf8_lossy(&buffer[..received.len]),
            received.source
        ),
        None => println!("nothing received"),
    }
    println!("active interface: {:?}", hub.active_interface().await?);
    Ok(())
}

async fn cmd_scan(rig: &Rig) -> Result<(), TransportError> {
    let networks = rig.wifi()?.scan_networks().await?;
    println!("{:<24} {:>6} {:>4}  SECURITY", "SSID", "RSSI", "CH");
    for network in networks {
        let ssid = if network.hidden { "<hidden>".to_string() } else { network.ssid };
        println!(
            "{:<24} {:>6} {:>4}  {:?}",
            ssid, network.rssi, network.channel, network.security
        );
    }
    Ok(())
}

async fn cmd_sms(rig: &Rig, number: &str, text: &str) -> Result<(), TransportError> {
    rig.modem()?.send_sms(number, text).await?;
    println!("SMS to {} accepted by the modem", number);
    Ok(())
}

async fn cmd_stats(rig: &Rig) -> Result<(), TransportError> {
    let hub = &rig.stack.orchestrator;
    for i in 0..5u8 {
        hub.send(&[i; 32], Route::Auto).await?;
    }
    if hub.is_interface_enabled(Interface::Radio) {
        hub.send(b"ping", Route::Only(Interface::Radio)).await?;
    }

    let stats = hub.statistics().await?;
    for (name, s) in &stats.per_interface {
        println!(
            "{:<9} sent={:<4} bytes={:<6} errors={:<3} uptime={:?}",
            name, s.messages_sent, s.bytes_sent, s.errors, s.uptime
        );
    }
    println!(
        "total     sent={:<4} bytes={:<6} failovers={} switches={}",
        stats.total.messages_sent,
        stats.total.bytes_sent,
        stats.counters.failovers,
        stats.counters.interface_switches
    );
    println!("snapshot encodes to {} bytes", stats.to_bytes()?.len());
    if let Some(radio) = &rig.stack.radio {
        println!("radio link: {:?}", radio.status());
    }
    Ok(())
}
